//! Channel-backed log for tests and single-process runs.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::mpsc;

use super::{LogConsumer, LogEvent, LogProducer};
use crate::error::{Error, Result};
use crate::model::{Job, LogMessage};

/// Producer handle of an in-memory log with a single partition.
///
/// Cloning shares the underlying channel. Dropping every handle closes the
/// log, which ends the consumer's stream.
#[derive(Clone)]
pub struct MemoryLog {
    tx: mpsc::UnboundedSender<LogEvent>,
    next_offset: Arc<AtomicI64>,
    topic: Arc<Mutex<Option<String>>>,
}

/// Consumer end of a [`MemoryLog`].
pub struct MemoryLogConsumer {
    rx: mpsc::UnboundedReceiver<LogEvent>,
    topic: Arc<Mutex<Option<String>>>,
    closed: bool,
}

impl MemoryLog {
    pub fn channel() -> (Self, MemoryLogConsumer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let topic = Arc::new(Mutex::new(None));
        (
            Self {
                tx,
                next_offset: Arc::new(AtomicI64::new(0)),
                topic: Arc::clone(&topic),
            },
            MemoryLogConsumer {
                rx,
                topic,
                closed: false,
            },
        )
    }

    /// Publish a raw message on partition 0, stamped with the current time.
    /// Returns the assigned offset.
    pub fn publish(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<i64> {
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        self.send(LogEvent::Message(LogMessage {
            key: key.into(),
            value: value.into(),
            partition: 0,
            offset,
            timestamp: Some(Utc::now()),
        }))?;
        Ok(offset)
    }

    /// Inject any event, e.g. a rebalance or a fatal error.
    pub fn send(&self, event: LogEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| Error::Log("in-memory log consumer is gone".to_string()))
    }

    /// Topic the consumer subscribed to, if it has.
    pub fn subscribed_topic(&self) -> Option<String> {
        self.topic.lock().clone()
    }
}

#[async_trait]
impl LogProducer for MemoryLog {
    async fn produce(&self, job: &Job) -> Result<()> {
        self.publish(job.workflow.as_bytes(), job.encode()?)?;
        Ok(())
    }
}

#[async_trait]
impl LogConsumer for MemoryLogConsumer {
    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        *self.topic.lock() = Some(topic.to_string());
        Ok(())
    }

    async fn recv(&mut self) -> Option<LogEvent> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.rx.close();
        Ok(())
    }
}
