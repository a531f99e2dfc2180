//! Integration tests for telemetry initialization and span helpers.

use conductor::telemetry::{TelemetryConfig, init_telemetry, job, metrics};

fn local_config() -> TelemetryConfig {
    TelemetryConfig {
        endpoint: None,
        service_name: "conductor-test".to_string(),
        default_filter: "debug".to_string(),
    }
}

#[test]
fn telemetry_initializes_once_without_endpoint() {
    // The only global subscriber installed in this test binary.
    let guard = init_telemetry(local_config());
    assert!(guard.is_ok());

    // A second global subscriber is refused, not a panic.
    assert!(init_telemetry(local_config()).is_err());
}

#[test]
fn ingest_span_declares_wal_key() {
    tracing::subscriber::with_default(tracing_subscriber::registry(), || {
        let span = job::start_ingest_span(3, 42);
        let metadata = span.metadata().expect("span should be enabled");
        assert_eq!(metadata.name(), "wal.ingest");
        for field in ["log.partition", "log.offset", "wal.key"] {
            assert!(metadata.fields().field(field).is_some(), "missing {field}");
        }
        span.record("wal.key", "00000000000000000000:t:1:3:42:billing");
    });
}

#[test]
fn materialize_span_names_the_job() {
    tracing::subscriber::with_default(tracing_subscriber::registry(), || {
        let span = job::start_materialize_span("billing", "invoice-7");
        let metadata = span.metadata().expect("span should be enabled");
        assert_eq!(metadata.name(), "job.materialize");
        assert!(metadata.fields().field("job.workflow").is_some());
        assert!(metadata.fields().field("job.name").is_some());
        job::record_state_transition(&span, "pending", "running");
    });
}

#[test]
fn metric_instruments_accept_measurements() {
    metrics::wal_appended().add(1, &[]);
    metrics::wal_replayed().add(3, &[]);
    metrics::wal_decode_errors().add(1, &[]);
    metrics::partitions_created().add(1, &[]);
    metrics::queue_operations().add(1, &[opentelemetry::KeyValue::new("operation", "offer")]);
    metrics::job_state_transitions().add(
        1,
        &[
            opentelemetry::KeyValue::new("from", "pending"),
            opentelemetry::KeyValue::new("to", "done"),
        ],
    );
}
