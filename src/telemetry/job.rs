//! Span helpers for jobs flowing from the log into the queues.

use tracing::Span;

/// Start a span covering the ingestion of one log message.
///
/// `wal.key` is declared empty and filled once the ordering key is known.
pub fn start_ingest_span(partition: i32, offset: i64) -> Span {
    tracing::debug_span!(
        "wal.ingest",
        "log.partition" = partition,
        "log.offset" = offset,
        "wal.key" = tracing::field::Empty,
    )
}

/// Start a span covering the materialization of one job.
pub fn start_materialize_span(workflow: &str, name: &str) -> Span {
    tracing::debug_span!("job.materialize", "job.workflow" = workflow, "job.name" = name)
}

/// Record a job state transition as an event scoped to `span`.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
