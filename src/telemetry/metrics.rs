//! Metric instrument factories for conductor.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without an OTLP endpoint the global provider is a no-op, so recording is
//! always safe.

use opentelemetry::metrics::{Counter, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("conductor")
}

/// Counter: records appended to the WAL table.
pub fn wal_appended() -> Counter<u64> {
    meter()
        .u64_counter("conductor.wal.appended")
        .with_description("Records appended to the WAL")
        .build()
}

/// Counter: WAL records handed to the materialization path during replay.
pub fn wal_replayed() -> Counter<u64> {
    meter()
        .u64_counter("conductor.wal.replayed")
        .with_description("WAL records replayed")
        .build()
}

/// Counter: WAL records skipped because they did not decode.
pub fn wal_decode_errors() -> Counter<u64> {
    meter()
        .u64_counter("conductor.wal.decode_errors")
        .with_description("WAL records that failed to decode")
        .build()
}

/// Counter: workflow partitions created in the store.
pub fn partitions_created() -> Counter<u64> {
    meter()
        .u64_counter("conductor.store.partitions_created")
        .with_description("Workflow partitions created")
        .build()
}

/// Counter: queue-level operations.
/// Labels: `operation` ("offer" | "poll" | "poll_empty" | "remove").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("conductor.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: jobs re-offered under a different state.
/// Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("conductor.job.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}
