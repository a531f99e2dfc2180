//! # conductor
//!
//! Durable work-distribution core of a job orchestration cluster.
//!
//! Job events are consumed from an external log into a local write-ahead log
//! (redb), replayed into per-workflow partitions, and served to workers
//! through deduplicating `(workflow, state)` queues with hide-on-poll
//! delivery. OpenTelemetry observability throughout.

pub mod config;
pub mod error;
pub mod log;
pub mod materialize;
pub mod memstore;
pub mod model;
pub mod queue;
pub mod server;
pub mod store;
pub mod telemetry;
pub mod wal;
