//! Deduplicating FIFO queue for a single `(workflow, state)` pair.
//!
//! Jobs are keyed by `workflow:name`. Offering a key that is already
//! resident replaces its payload in place and keeps its position. Polling
//! hands a job out and hides it: the delivered generation is never returned
//! again unless it is re-offered or its visibility timeout is swept.
//!
//! Delivery order lives in a bounded key buffer. Every resident job carries
//! the generation it was queued under, and buffer entries are tagged with it.
//! Removing a job does not shrink the buffer; entries whose generation is no
//! longer resident are skipped when they reach the head, so a job removed and
//! offered again queues behind everything already waiting.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::model::{Job, JobKey};

/// A polled job that has not been removed yet.
#[derive(Debug, Clone)]
struct Hidden {
    at: DateTime<Utc>,
    job: Job,
}

/// A deliverable job and the buffer entry that will deliver it.
#[derive(Debug, Clone)]
struct Resident {
    generation: u64,
    job: Job,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Resident, deliverable jobs.
    jobs: HashMap<JobKey, Resident>,
    /// Checked-out jobs and when they were polled.
    hidden: HashMap<JobKey, Hidden>,
    next_generation: u64,
}

impl QueueState {
    /// Whether `entry` still delivers a resident job.
    fn is_live(&self, entry: &Entry) -> bool {
        self.jobs
            .get(&entry.0)
            .is_some_and(|r| r.generation == entry.1)
    }
}

/// Dedup job queue with hide-on-poll semantics.
#[derive(Debug)]
pub struct Queue {
    state: RwLock<QueueState>,
    pending: KeyBuffer,
}

impl Queue {
    /// Create a queue whose delivery buffer holds at most `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: RwLock::new(QueueState::default()),
            pending: KeyBuffer::new(capacity),
        }
    }

    /// Offer a job. A new key joins the tail; an already resident key only
    /// has its payload replaced.
    ///
    /// Waits while the delivery buffer is full.
    pub async fn offer(&self, job: Job) {
        let key = job.key();

        loop {
            let writable = self.pending.writable.notified();
            tokio::pin!(writable);
            writable.as_mut().enable();

            {
                let mut state = self.state.write();
                if let Some(resident) = state.jobs.get_mut(&key) {
                    resident.job = job;
                    return;
                }
                let generation = state.next_generation;
                if self.pending.try_push((key.clone(), generation)) {
                    state.next_generation += 1;
                    state.jobs.insert(key, Resident { generation, job });
                    return;
                }
            }

            debug!(%key, capacity = self.pending.capacity, "queue full, waiting for a consumer");
            writable.await;
        }
    }

    /// Take the next job in first-offer order and hide it.
    ///
    /// Waits until a deliverable job exists.
    pub async fn poll(&self) -> Job {
        loop {
            let readable = self.pending.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            if let Some(job) = self.try_poll() {
                return job;
            }
            readable.await;
        }
    }

    /// Non-waiting [`poll`](Self::poll): `None` when nothing is deliverable.
    pub fn try_poll(&self) -> Option<Job> {
        let mut state = self.state.write();
        let (key, job) = self.take_next(&mut state)?;
        state.hidden.insert(
            key,
            Hidden {
                at: Utc::now(),
                job: job.clone(),
            },
        );
        Some(job)
    }

    /// Return the head job without removing it.
    ///
    /// Waits until a deliverable job exists.
    pub async fn peek(&self) -> Job {
        loop {
            let readable = self.pending.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            if let Some(job) = self.try_peek() {
                // The head is still there; pass the wakeup on to other waiters.
                self.pending.readable.notify_one();
                return job;
            }
            readable.await;
        }
    }

    /// Non-waiting [`peek`](Self::peek).
    pub fn try_peek(&self) -> Option<Job> {
        let state = self.state.write();
        loop {
            let entry = self.pending.front()?;
            if state.is_live(&entry) {
                return state.jobs.get(&entry.0).map(|r| r.job.clone());
            }
            trace!(key = %entry.0, "dropping stale head");
            self.pending.pop();
        }
    }

    /// Take the head job out of the queue without hiding it.
    ///
    /// Waits until a deliverable job exists.
    pub async fn peek_next(&self) -> Job {
        loop {
            let readable = self.pending.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            let next = {
                let mut state = self.state.write();
                self.take_next(&mut state)
            };
            if let Some((_, job)) = next {
                return job;
            }
            readable.await;
        }
    }

    /// Drop a job from the queue, whether it is waiting or checked out.
    ///
    /// Its buffer entry stays there and is skipped when it reaches the head.
    /// Returns whether anything was removed.
    pub fn remove(&self, job: &Job) -> bool {
        self.remove_key(&job.key())
    }

    /// [`remove`](Self::remove) by key.
    pub fn remove_key(&self, key: &JobKey) -> bool {
        let mut state = self.state.write();
        let resident = state.jobs.remove(key).is_some();
        let hidden = state.hidden.remove(key).is_some();
        resident || hidden
    }

    /// Number of resident jobs.
    pub fn size(&self) -> usize {
        self.state.read().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Number of checked-out jobs.
    pub fn hidden_len(&self) -> usize {
        self.state.read().hidden.len()
    }

    /// When the job was last polled, if it is still checked out.
    pub fn hidden_at(&self, job: &Job) -> Option<DateTime<Utc>> {
        self.state.read().hidden.get(&job.key()).map(|h| h.at)
    }

    /// Keys in the delivery buffer, including stale ones.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn capacity(&self) -> usize {
        self.pending.capacity
    }

    /// Return checked-out jobs polled more than `timeout` ago to the tail.
    pub fn requeue_expired(&self, timeout: chrono::Duration) -> usize {
        self.requeue_hidden_before(Utc::now() - timeout)
    }

    /// Return checked-out jobs polled at or before `cutoff` to the tail.
    ///
    /// Stops early when the delivery buffer fills up; the rest stay hidden
    /// until the next sweep. A key that was re-offered in the meantime keeps
    /// its newer payload.
    pub fn requeue_hidden_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut state = self.state.write();

        let mut expired: Vec<(DateTime<Utc>, JobKey)> = state
            .hidden
            .iter()
            .filter(|(_, h)| h.at <= cutoff)
            .map(|(k, h)| (h.at, k.clone()))
            .collect();
        expired.sort();

        let mut requeued = 0;
        for (_, key) in expired {
            if state.jobs.contains_key(&key) {
                state.hidden.remove(&key);
                continue;
            }
            let generation = state.next_generation;
            if !self.pending.try_push((key.clone(), generation)) {
                break;
            }
            state.next_generation += 1;
            if let Some(hidden) = state.hidden.remove(&key) {
                state.jobs.insert(
                    key,
                    Resident {
                        generation,
                        job: hidden.job,
                    },
                );
                requeued += 1;
            }
        }
        requeued
    }

    /// Pop entries until one is live. Caller holds the write lock, so every
    /// buffer pop is serialized with map updates.
    fn take_next(&self, state: &mut QueueState) -> Option<(JobKey, Job)> {
        while let Some(entry) = self.pending.pop() {
            if state.is_live(&entry) {
                let (key, _) = entry;
                return state.jobs.remove(&key).map(|r| (key, r.job));
            }
            trace!(key = %entry.0, "skipping stale entry");
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Key buffer
// ---------------------------------------------------------------------------

/// A job key and the generation it was queued under.
type Entry = (JobKey, u64);

/// Bounded FIFO of job keys with async wakeups for both ends.
#[derive(Debug)]
struct KeyBuffer {
    keys: Mutex<VecDeque<Entry>>,
    capacity: usize,
    readable: Notify,
    writable: Notify,
}

impl KeyBuffer {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            keys: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    /// Append a key unless the buffer is full.
    fn try_push(&self, entry: Entry) -> bool {
        {
            let mut keys = self.keys.lock();
            if keys.len() >= self.capacity {
                return false;
            }
            keys.push_back(entry);
        }
        self.readable.notify_one();
        true
    }

    fn pop(&self) -> Option<Entry> {
        let entry = self.keys.lock().pop_front();
        if entry.is_some() {
            self.writable.notify_one();
        }
        entry
    }

    fn front(&self) -> Option<Entry> {
        self.keys.lock().front().cloned()
    }

    fn len(&self) -> usize {
        self.keys.lock().len()
    }
}
