//! Materialization: WAL → workflow partitions → live queues.
//!
//! Two tasks cooperate. The replayer calls [`Store::read_wal`] whenever the
//! WAL grows; the applier drains the replay channel, writes each job into its
//! workflow partition and offers it into the `(workflow, state)` queue. When
//! a batch's checkpoint marker arrives every record before it has been
//! applied, and only then is the durable checkpoint moved.
//!
//! Applying is idempotent (partition writes overwrite by name, queues
//! dedup), so records replayed twice after a crash are harmless.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::error::{Error, Result};
use crate::memstore::MemStore;
use crate::model::{Job, Replay, WalRecord};
use crate::store::Store;
use crate::telemetry::job::start_materialize_span;

/// Upper bound between replay attempts when no append notification arrives.
const REPLAY_INTERVAL: Duration = Duration::from_secs(1);

struct Tasks {
    replayer: JoinHandle<()>,
    applier: JoinHandle<()>,
}

/// Feeds replayed WAL records into the store partitions and the mem store.
pub struct Materializer {
    store: Arc<Store>,
    memstore: Arc<MemStore>,
    initial_state: String,
    stop_replay: watch::Sender<bool>,
    stop_apply: watch::Sender<bool>,
    tasks: Mutex<Option<Tasks>>,
}

impl Materializer {
    pub fn new(
        store: Arc<Store>,
        memstore: Arc<MemStore>,
        initial_state: impl Into<String>,
    ) -> Self {
        Self {
            store,
            memstore,
            initial_state: initial_state.into(),
            stop_replay: watch::Sender::new(false),
            stop_apply: watch::Sender::new(false),
            tasks: Mutex::new(None),
        }
    }

    /// Re-offer every job held in the workflow partitions.
    ///
    /// Used on startup, before replay resumes from the checkpoint, so the
    /// queues reflect everything materialized before the last shutdown.
    pub async fn restore(&self) -> Result<usize> {
        let mut restored = 0;
        for workflow in self.store.partitions() {
            for job in self.store.jobs(&workflow)? {
                let state = state_for(&job, &self.initial_state);
                self.memstore.offer(&workflow, &state, job).await;
                restored += 1;
            }
        }
        info!(restored, "restored jobs from store");
        Ok(restored)
    }

    /// Spawn the replayer and applier tasks.
    pub fn start(&self) -> Result<()> {
        let rx = self.store.take_replay_receiver().ok_or_else(|| {
            Error::Other("replay channel already taken or store closed".to_string())
        })?;

        self.stop_replay.send_replace(false);
        self.stop_apply.send_replace(false);

        let replayer = tokio::spawn(run_replayer(
            Arc::clone(&self.store),
            self.stop_replay.subscribe(),
        ));
        let applier = tokio::spawn(run_applier(
            Applier::new(
                Arc::clone(&self.store),
                Arc::clone(&self.memstore),
                self.initial_state.clone(),
                self.stop_apply.subscribe(),
            ),
            rx,
            self.stop_apply.subscribe(),
        ));

        *self.tasks.lock() = Some(Tasks { replayer, applier });
        info!("materializer started");
        Ok(())
    }

    /// Stop both tasks and wait for them. Idempotent.
    ///
    /// The replayer stops first; the applier then materializes everything
    /// already in the channel before it exits.
    pub async fn stop(&self) {
        let Some(tasks) = self.tasks.lock().take() else {
            return;
        };

        self.stop_replay.send_replace(true);
        if let Err(e) = tasks.replayer.await {
            error!(error = %e, "WAL replayer failed");
        }

        self.stop_apply.send_replace(true);
        if let Err(e) = tasks.applier.await {
            error!(error = %e, "WAL applier failed");
        }
        info!("materializer stopped");
    }

    /// Apply one record directly, bypassing the replay channel. The durable
    /// checkpoint is not touched.
    pub async fn apply(&self, record: WalRecord) -> Result<()> {
        let mut stopping = self.stop_apply.subscribe();
        apply(
            &self.store,
            &self.memstore,
            &self.initial_state,
            record,
            &mut stopping,
        )
        .await
    }
}

fn state_for(job: &Job, initial_state: &str) -> String {
    job.state
        .clone()
        .unwrap_or_else(|| initial_state.to_string())
}

async fn run_replayer(store: Arc<Store>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => return,
            replayed = store.read_wal() => match replayed {
                Ok(_) => {}
                Err(Error::Closed) => return,
                Err(e) => error!(error = %e, "WAL replay failed"),
            },
        }

        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => return,
            _ = store.wal_appended() => {}
            _ = tokio::time::sleep(REPLAY_INTERVAL) => {}
        }
    }
}

/// Consumer side of the replay channel.
struct Applier {
    store: Arc<Store>,
    memstore: Arc<MemStore>,
    initial_state: String,
    stopping: watch::Receiver<bool>,
    /// Set once a record failed for a reason a retry could fix. The durable
    /// checkpoint stays put from then on, so a restart replays that record.
    held: bool,
}

impl Applier {
    fn new(
        store: Arc<Store>,
        memstore: Arc<MemStore>,
        initial_state: String,
        stopping: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            memstore,
            initial_state,
            stopping,
            held: false,
        }
    }

    async fn handle(&mut self, item: Replay) {
        match item {
            Replay::Record(record) => {
                let result = apply(
                    &self.store,
                    &self.memstore,
                    &self.initial_state,
                    record,
                    &mut self.stopping,
                )
                .await;
                match result {
                    Ok(()) => {}
                    Err(e @ (Error::ReservedPartition(_) | Error::Decode(_))) => {
                        warn!(error = %e, "dropping WAL record that cannot be materialized");
                    }
                    Err(e) => {
                        error!(error = %e, "failed to materialize WAL record, holding checkpoint");
                        self.held = true;
                    }
                }
            }
            Replay::Checkpoint(key) => {
                if self.held {
                    return;
                }
                if let Err(e) = self.store.set_wal_offset(&key) {
                    error!(error = %e, "failed to persist WAL checkpoint");
                    return;
                }
                self.memstore.set_checkpoint(key);
            }
        }
    }
}

async fn run_applier(
    mut applier: Applier,
    mut rx: mpsc::Receiver<Replay>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        // Receiving first drains the channel before shutdown is honored.
        let item = tokio::select! {
            biased;
            item = rx.recv() => match item {
                Some(item) => item,
                None => return,
            },
            _ = shutdown.wait_for(|stop| *stop) => return,
        };

        applier.handle(item).await;
    }
}

/// Write the job into its partition, then offer it.
///
/// Once `stopping` is set a queue offer that would wait is abandoned: the mem
/// store is about to be reset and restore re-offers the job from its
/// partition.
async fn apply(
    store: &Store,
    memstore: &MemStore,
    initial_state: &str,
    record: WalRecord,
    stopping: &mut watch::Receiver<bool>,
) -> Result<()> {
    let WalRecord { key, job } = record;
    let span = start_materialize_span(&job.workflow, &job.name);

    async {
        store.put_job(&job)?;

        let state = state_for(&job, initial_state);
        let workflow = job.workflow.clone();
        tokio::select! {
            biased;
            _ = memstore.offer(&workflow, &state, job) => {
                memstore.set_checkpoint(key);
            }
            _ = stopping.wait_for(|stop| *stop) => {
                debug!(%workflow, %state, "stopping, queue offer left to restore");
            }
        }

        debug!(%workflow, %state, "job materialized");
        Ok::<_, Error>(())
    }
    .instrument(span)
    .await
}
