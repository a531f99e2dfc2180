//! Core data model.
//!
//! A job is a named unit of work inside a workflow. Its identity is
//! `workflow:name`; that key is what queues deduplicate on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A workflow-scoped unit of work with an opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Logical pipeline this job belongs to. Also names its store partition.
    pub workflow: String,

    /// Unique within the workflow.
    pub name: String,

    /// State the job should be queued under. `None` means the configured
    /// initial state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// Opaque payload. The engine never interprets it.
    #[serde(default)]
    pub data: Vec<u8>,
}

impl Job {
    pub fn new(workflow: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            name: name.into(),
            state: None,
            data: Vec::new(),
        }
    }

    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    /// Dedup identity: `workflow:name`.
    pub fn key(&self) -> JobKey {
        JobKey::new(&self.workflow, &self.name)
    }

    /// Decode a job from its serialized record.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Serialize the job into its record form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

// ---------------------------------------------------------------------------
// Job key
// ---------------------------------------------------------------------------

/// Identity of a job across every queue: `workflow:name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey(String);

impl JobKey {
    pub fn new(workflow: &str, name: &str) -> Self {
        Self(format!("{workflow}:{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Log messages and WAL records
// ---------------------------------------------------------------------------

/// A message delivered by the external log.
#[derive(Debug, Clone)]
pub struct LogMessage {
    /// Source key set by the producer. May be empty.
    pub key: Vec<u8>,
    /// Serialized job.
    pub value: Vec<u8>,
    pub partition: i32,
    pub offset: i64,
    /// Log-assigned timestamp. Falls back to arrival time when absent.
    pub timestamp: Option<DateTime<Utc>>,
}

impl LogMessage {
    /// Ordering key for the WAL table, given the store's next arrival
    /// sequence number.
    ///
    /// Format: `{seq:020}:t:{timestamp_nanos:020}:{partition}:{offset}:{source_key}`.
    /// The sequence leads so byte order is arrival order across every source
    /// key and partition; replay keeps one cursor over the whole table.
    pub fn wal_key(&self, seq: u64) -> Vec<u8> {
        let ts = self.timestamp.unwrap_or_else(Utc::now);
        let nanos = ts.timestamp_nanos_opt().unwrap_or(i64::MAX).max(0);

        let mut key = format!(
            "{seq:020}:t:{nanos:020}:{}:{}:",
            self.partition, self.offset
        )
        .into_bytes();
        key.extend_from_slice(&self.key);
        key
    }
}

/// Arrival sequence encoded at the front of a WAL key written by
/// [`LogMessage::wal_key`].
pub fn wal_key_seq(key: &[u8]) -> Option<u64> {
    let digits = key.get(..20)?;
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// A WAL entry decoded during replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    /// Raw ordering key as stored in the WAL table.
    pub key: Vec<u8>,
    pub job: Job,
}

/// What the replay channel carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replay {
    /// A decoded job to materialize.
    Record(WalRecord),
    /// Every record up to and including this WAL key has been sent. Once the
    /// records before it are materialized the durable checkpoint may move
    /// here.
    Checkpoint(Vec<u8>),
}
