//! Log ingestion into the store's WAL.
//!
//! The ingest loop takes one event at a time from the external log and
//! appends every message to the WAL under a key led by the store's arrival
//! sequence, followed by the log timestamp, partition, offset and source key.
//! Rebalance notifications are only logged. A fatal client error or the end
//! of the stream stops ingestion; there is no reconnect here.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::log::{LogConsumer, LogEvent};
use crate::model::LogMessage;
use crate::store::Store;
use crate::telemetry::job::start_ingest_span;

/// Why the ingest loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestExit {
    /// [`Wal::stop`] was called.
    Shutdown,
    /// The log stream ended.
    LogClosed,
    /// The log client reported a fatal error.
    Failed(String),
}

struct Running {
    shutdown: Arc<Notify>,
    handle: JoinHandle<(Box<dyn LogConsumer>, IngestExit)>,
}

/// Write-ahead log fed from the external log.
pub struct Wal {
    name: String,
    store: Arc<Store>,
    running: tokio::sync::Mutex<Option<Running>>,
    last_exit: Mutex<Option<IngestExit>>,
}

impl Wal {
    /// `name` is the cluster name, which is also the topic consumed.
    pub fn new(name: impl Into<String>, store: Arc<Store>) -> Self {
        Self {
            name: name.into(),
            store,
            running: tokio::sync::Mutex::new(None),
            last_exit: Mutex::new(None),
        }
    }

    /// Subscribe `consumer` to the cluster topic and spawn the ingest loop.
    pub async fn start(&self, mut consumer: Box<dyn LogConsumer>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(Error::Other("WAL ingest is already running".to_string()));
        }

        consumer.subscribe(&self.name).await?;
        info!(topic = %self.name, "subscribed to log");

        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(run_ingest(
            Arc::clone(&self.store),
            consumer,
            Arc::clone(&shutdown),
        ));

        *running = Some(Running { shutdown, handle });
        Ok(())
    }

    /// Stop the ingest loop, wait for it to exit, then close the log client.
    ///
    /// Nothing is written to the store after this returns. Safe to call
    /// more than once, or without a prior `start`.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        info!("stopping WAL service");
        running.shutdown.notify_one();

        let (mut consumer, exit) = running
            .handle
            .await
            .map_err(|e| Error::Other(format!("WAL ingest task failed: {e}")))?;
        *self.last_exit.lock() = Some(exit.clone());

        consumer.close().await?;
        info!(?exit, "WAL service stopped");
        Ok(())
    }

    /// Whether the ingest loop is still consuming.
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// How the last stopped ingest loop ended.
    pub fn exit_reason(&self) -> Option<IngestExit> {
        self.last_exit.lock().clone()
    }
}

async fn run_ingest(
    store: Arc<Store>,
    mut consumer: Box<dyn LogConsumer>,
    shutdown: Arc<Notify>,
) -> (Box<dyn LogConsumer>, IngestExit) {
    info!("WAL ingest started");

    let exit = loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.notified() => break IngestExit::Shutdown,
            event = consumer.recv() => event,
        };

        match event {
            None => {
                warn!("log stream ended");
                break IngestExit::LogClosed;
            }
            Some(LogEvent::Assigned(partitions)) => {
                info!(?partitions, "log partitions assigned");
            }
            Some(LogEvent::Revoked(partitions)) => {
                info!(?partitions, "log partitions revoked");
            }
            Some(LogEvent::Message(msg)) => append(&store, &msg),
            Some(LogEvent::Error(e)) => {
                error!(error = %e, "log client error, stopping ingest");
                break IngestExit::Failed(e);
            }
        }
    };

    (consumer, exit)
}

/// Append one message. Failures are logged and the message is dropped.
fn append(store: &Store, msg: &LogMessage) {
    let span = start_ingest_span(msg.partition, msg.offset);
    let _entered = span.enter();

    match store.append_message(msg) {
        Ok(key) => {
            span.record("wal.key", String::from_utf8_lossy(&key).as_ref());
        }
        Err(e) => error!(error = %e, "failed to append message to WAL"),
    }
}
