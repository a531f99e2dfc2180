//! External event log seam.
//!
//! The WAL ingests from a partitioned, replicated log. [`LogConsumer`] is
//! all the ingest loop needs from it; [`LogProducer`] publishes jobs onto the
//! cluster topic. [`memory`] backs both with channels; the `kafka` feature
//! adds an `rdkafka` implementation.

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Job, LogMessage};

pub use memory::{MemoryLog, MemoryLogConsumer};

/// Something the log client reports to the ingest loop.
#[derive(Debug, Clone)]
pub enum LogEvent {
    /// Partitions assigned to this consumer.
    Assigned(Vec<i32>),
    /// Partitions taken away from this consumer.
    Revoked(Vec<i32>),
    Message(LogMessage),
    /// Fatal client error. Ingestion stops.
    Error(String),
}

/// Consumer side of the external log.
#[async_trait]
pub trait LogConsumer: Send {
    /// Subscribe to `topic`. Called once before the first `recv`.
    async fn subscribe(&mut self, topic: &str) -> Result<()>;

    /// Next event, or `None` once the log is closed.
    ///
    /// Must be cancel-safe: the ingest loop races it against shutdown.
    async fn recv(&mut self) -> Option<LogEvent>;

    /// Release the connection. Called after the ingest loop has exited.
    async fn close(&mut self) -> Result<()>;
}

/// Producer side of the external log.
#[async_trait]
pub trait LogProducer: Send + Sync {
    /// Publish a serialized job to the cluster topic.
    async fn produce(&self, job: &Job) -> Result<()>;
}
