//! Server: wires the store, the live queues, materialization and WAL
//! ingestion together.
//!
//! Start order is mem store, warm restore from the workflow partitions,
//! materializer, WAL ingest, then the optional visibility reaper. Stop runs
//! the same steps in reverse so nothing writes into a closed store.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::log::LogConsumer;
use crate::materialize::Materializer;
use crate::memstore::MemStore;
use crate::model::Job;
use crate::store::Store;
use crate::wal::Wal;

/// Smallest pause between visibility sweeps.
const MIN_REAP_INTERVAL: Duration = Duration::from_millis(100);

struct Reaper {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// One cluster member.
pub struct Server {
    name: String,
    store: Arc<Store>,
    memstore: Arc<MemStore>,
    materializer: Materializer,
    wal: Wal,
    visibility_timeout: Option<Duration>,
    reaper: Mutex<Option<Reaper>>,
}

impl Server {
    /// Open the store under `config.data_dir` and build the components.
    ///
    /// Failing to open the store is fatal: no server is returned.
    pub fn open(config: &Config) -> Result<Self> {
        let store = Arc::new(Store::open(&config.data_dir, &config.name)?);
        let memstore = Arc::new(MemStore::new(config.queue_capacity));
        let materializer = Materializer::new(
            Arc::clone(&store),
            Arc::clone(&memstore),
            config.initial_state.clone(),
        );
        let wal = Wal::new(config.name.clone(), Arc::clone(&store));

        Ok(Self {
            name: config.name.clone(),
            store,
            memstore,
            materializer,
            wal,
            visibility_timeout: config.visibility_timeout,
            reaper: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn memstore(&self) -> &Arc<MemStore> {
        &self.memstore
    }

    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    /// Bring every component up and start consuming from `consumer`.
    pub async fn start(&self, consumer: Box<dyn LogConsumer>) -> Result<()> {
        if !self.store.is_open() {
            return Err(Error::Closed);
        }

        self.memstore.start();
        self.materializer.restore().await?;
        self.materializer.start()?;
        self.wal.start(consumer).await?;

        if let Some(timeout) = self.visibility_timeout {
            self.start_reaper(timeout)?;
        }

        info!(name = %self.name, "server started");
        Ok(())
    }

    /// Tear everything down in reverse start order. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        self.stop_reaper().await;

        let ingest = self.wal.stop().await;
        self.materializer.stop().await;
        self.memstore.stop();
        self.store.close();

        info!(name = %self.name, "server stopped");
        ingest
    }

    /// Offer a job into `(workflow, state)`. Only the in-memory queue is
    /// touched; durability comes from the log.
    pub async fn offer(&self, workflow: &str, state: &str, job: Job) {
        self.memstore.offer(workflow, state, job).await;
    }

    /// Non-blocking poll of `(workflow, state)`.
    pub fn poll(&self, workflow: &str, state: &str) -> Option<Job> {
        self.memstore.poll(workflow, state)
    }

    /// Finish a job: drop it from its queue and from its workflow partition.
    pub fn complete(&self, workflow: &str, state: &str, job: &Job) -> Result<bool> {
        let removed = self.memstore.remove(workflow, state, job);
        let deleted = self.store.delete_job(workflow, &job.name)?;
        debug!(workflow, state, name = %job.name, removed, deleted, "job completed");
        Ok(removed || deleted)
    }

    /// Move a job into `to`, persisting the new state so a restart restores
    /// it there.
    pub async fn transition(&self, job: Job, to: &str) -> Result<()> {
        let job = job.state(to);
        self.store.put_job(&job)?;

        let workflow = job.workflow.clone();
        self.memstore.offer(&workflow, to, job).await;
        Ok(())
    }

    fn start_reaper(&self, timeout: Duration) -> Result<()> {
        let timeout_chrono = chrono::Duration::from_std(timeout)
            .map_err(|e| Error::Config(format!("visibility timeout out of range: {e}")))?;
        let every = (timeout / 2).max(MIN_REAP_INTERVAL);

        let shutdown = Arc::new(Notify::new());
        let memstore = Arc::clone(&self.memstore);
        let stop = Arc::clone(&shutdown);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = stop.notified() => return,
                    _ = ticker.tick() => {
                        memstore.requeue_expired(timeout_chrono);
                    }
                }
            }
        });

        info!(timeout_secs = timeout.as_secs_f64(), "visibility reaper started");
        *self.reaper.lock() = Some(Reaper { shutdown, handle });
        Ok(())
    }

    async fn stop_reaper(&self) {
        let Some(reaper) = self.reaper.lock().take() else {
            return;
        };
        reaper.shutdown.notify_one();
        if let Err(e) = reaper.handle.await {
            error!(error = %e, "visibility reaper failed");
        }
    }
}
