//! In-memory registry of live job queues.
//!
//! One [`Queue`] per `(workflow, state)` pair, created on first offer, plus
//! the last state each job was offered under. Nothing here is durable; the
//! store is what a restart rebuilds from.

use opentelemetry::KeyValue;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Span, debug, info};

use crate::model::{Job, JobKey};
use crate::queue::Queue;
use crate::telemetry::job::record_state_transition;
use crate::telemetry::metrics;

type QueueId = (String, String);

/// Live job queues, keyed by `(workflow, state)`.
pub struct MemStore {
    capacity: usize,
    queues: RwLock<HashMap<QueueId, Arc<Queue>>>,
    job_states: RwLock<HashMap<JobKey, String>>,
    /// Last WAL key materialized into these queues.
    checkpoint: RwLock<Option<Vec<u8>>>,
}

impl MemStore {
    /// Create an empty registry. Every queue gets `capacity` buffer slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queues: RwLock::new(HashMap::new()),
            job_states: RwLock::new(HashMap::new()),
            checkpoint: RwLock::new(None),
        }
    }

    pub fn start(&self) {
        info!(capacity = self.capacity, "mem store started");
    }

    /// Drop every queue, the job-state map and the checkpoint.
    pub fn stop(&self) {
        self.queues.write().clear();
        self.job_states.write().clear();
        *self.checkpoint.write() = None;
        info!("mem store stopped");
    }

    /// Offer a job into the `(workflow, state)` queue.
    ///
    /// If the job was last offered under another state it is first removed
    /// from that queue, so a job is live in at most one state at a time.
    /// Waits while the target queue is full.
    pub async fn offer(&self, workflow: &str, state: &str, job: Job) {
        let key = job.key();

        {
            let mut states = self.job_states.write();
            let previous = states.insert(key.clone(), state.to_string());
            if let Some(previous) = previous.filter(|p| p != state) {
                if let Some(old) = self.queue(workflow, &previous) {
                    old.remove_key(&key);
                }
                record_state_transition(&Span::current(), &previous, state);
                metrics::job_state_transitions().add(
                    1,
                    &[
                        KeyValue::new("from", previous),
                        KeyValue::new("to", state.to_string()),
                    ],
                );
            }
        }

        let queue = self.queue_or_create(workflow, state);
        queue.offer(job).await;

        // Another offer may have moved the job elsewhere while this one was
        // waiting; its retract could not see this queue yet.
        let states = self.job_states.read();
        if states.get(&key).is_none_or(|current| current != state) {
            queue.remove_key(&key);
            debug!(%key, state, "offer superseded");
        }
        drop(states);

        metrics::queue_operations().add(1, &[KeyValue::new("operation", "offer")]);
    }

    /// Take the next job of `(workflow, state)`, or `None` right away when
    /// that queue does not exist or has nothing deliverable.
    pub fn poll(&self, workflow: &str, state: &str) -> Option<Job> {
        let queue = self.queue(workflow, state)?;
        if queue.is_empty() {
            return None;
        }

        let job = queue.try_poll();
        metrics::queue_operations().add(
            1,
            &[KeyValue::new(
                "operation",
                if job.is_some() { "poll" } else { "poll_empty" },
            )],
        );
        job
    }

    /// Remove a job from the `(workflow, state)` queue and forget its state.
    pub fn remove(&self, workflow: &str, state: &str, job: &Job) -> bool {
        let removed = self
            .queue(workflow, state)
            .is_some_and(|queue| queue.remove(job));

        let key = job.key();
        let mut states = self.job_states.write();
        if states.get(&key).is_some_and(|s| s == state) {
            states.remove(&key);
        }

        metrics::queue_operations().add(1, &[KeyValue::new("operation", "remove")]);
        removed
    }

    /// The queue for `(workflow, state)`, if one was ever offered to.
    pub fn queue(&self, workflow: &str, state: &str) -> Option<Arc<Queue>> {
        self.queues
            .read()
            .get(&(workflow.to_string(), state.to_string()))
            .cloned()
    }

    /// Last state `workflow:name` was offered under.
    pub fn state_of(&self, workflow: &str, name: &str) -> Option<String> {
        self.job_states
            .read()
            .get(&JobKey::new(workflow, name))
            .cloned()
    }

    /// Number of `(workflow, state)` queues created so far.
    pub fn queue_count(&self) -> usize {
        self.queues.read().len()
    }

    /// Sweep every queue for checked-out jobs older than `timeout`.
    pub fn requeue_expired(&self, timeout: chrono::Duration) -> usize {
        let queues: Vec<Arc<Queue>> = self.queues.read().values().cloned().collect();
        let requeued: usize = queues.iter().map(|q| q.requeue_expired(timeout)).sum();
        if requeued > 0 {
            info!(requeued, "returned expired jobs to their queues");
        }
        requeued
    }

    pub fn checkpoint(&self) -> Option<Vec<u8>> {
        self.checkpoint.read().clone()
    }

    pub fn set_checkpoint(&self, key: Vec<u8>) {
        *self.checkpoint.write() = Some(key);
    }

    fn queue_or_create(&self, workflow: &str, state: &str) -> Arc<Queue> {
        let id = (workflow.to_string(), state.to_string());
        if let Some(queue) = self.queues.read().get(&id) {
            return Arc::clone(queue);
        }

        let mut queues = self.queues.write();
        Arc::clone(queues.entry(id).or_insert_with(|| {
            debug!(workflow, state, "creating queue");
            Arc::new(Queue::new(self.capacity))
        }))
    }
}
