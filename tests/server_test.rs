//! End-to-end: log → WAL → partitions → queues.

use std::time::Duration;

use conductor::config::Config;
use conductor::log::{LogProducer, MemoryLog};
use conductor::model::Job;
use conductor::server::Server;
use tempfile::TempDir;

fn local_config(dir: &TempDir) -> Config {
    Config::local("cluster", dir.path())
}

/// Poll `(workflow, state)` until a job shows up.
async fn poll_until(server: &Server, workflow: &str, state: &str) -> Job {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(job) = server.poll(workflow, state) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job never became available")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn produced_jobs_reach_their_queue() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::open(&local_config(&dir)).unwrap();
    let (log, consumer) = MemoryLog::channel();
    server.start(Box::new(consumer)).await.unwrap();

    log.produce(&Job::new("billing", "A").data("v1")).await.unwrap();
    log.produce(&Job::new("billing", "B").state("review"))
        .await
        .unwrap();

    let a = poll_until(&server, "billing", "pending").await;
    assert_eq!(a.name, "A");
    assert_eq!(a.data, b"v1");

    let b = poll_until(&server, "billing", "review").await;
    assert_eq!(b.name, "B");

    assert!(server.store().get_job("billing", "A").unwrap().is_some());
    assert!(server.memstore().checkpoint().is_some());

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_restores_unfinished_jobs() {
    let dir = tempfile::tempdir().unwrap();
    {
        let server = Server::open(&local_config(&dir)).unwrap();
        let (log, consumer) = MemoryLog::channel();
        server.start(Box::new(consumer)).await.unwrap();

        log.produce(&Job::new("billing", "A")).await.unwrap();
        log.produce(&Job::new("billing", "B")).await.unwrap();

        let a = poll_until(&server, "billing", "pending").await;
        server.complete("billing", "pending", &a).unwrap();
        poll_until(&server, "billing", "pending").await;

        server.stop().await.unwrap();
    }

    let server = Server::open(&local_config(&dir)).unwrap();
    let (_log, consumer) = MemoryLog::channel();
    server.start(Box::new(consumer)).await.unwrap();

    // A was completed; B was only checked out, so it is delivered again.
    let job = poll_until(&server, "billing", "pending").await;
    assert_eq!(job.name, "B");
    assert!(server.poll("billing", "pending").is_none());

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transition_moves_job_and_persists_state() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::open(&local_config(&dir)).unwrap();
    let (log, consumer) = MemoryLog::channel();
    server.start(Box::new(consumer)).await.unwrap();

    log.produce(&Job::new("billing", "A")).await.unwrap();
    let job = poll_until(&server, "billing", "pending").await;

    server.transition(job, "shipped").await.unwrap();
    assert_eq!(
        server.memstore().state_of("billing", "A").as_deref(),
        Some("shipped")
    );
    assert_eq!(
        server.memstore().queue("billing", "pending").unwrap().hidden_len(),
        0
    );

    let shipped = poll_until(&server, "billing", "shipped").await;
    assert_eq!(shipped.state.as_deref(), Some("shipped"));

    let stored = server.store().get_job("billing", "A").unwrap().unwrap();
    assert_eq!(stored.state.as_deref(), Some("shipped"));

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn visibility_timeout_redelivers_unfinished_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = local_config(&dir);
    config.visibility_timeout = Some(Duration::from_millis(200));

    let server = Server::open(&config).unwrap();
    let (log, consumer) = MemoryLog::channel();
    server.start(Box::new(consumer)).await.unwrap();

    log.produce(&Job::new("billing", "A")).await.unwrap();
    let first = poll_until(&server, "billing", "pending").await;
    assert!(server.poll("billing", "pending").is_none());

    let again = poll_until(&server, "billing", "pending").await;
    assert_eq!(first, again);

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn direct_offer_is_served_without_the_log() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::open(&local_config(&dir)).unwrap();
    let (_log, consumer) = MemoryLog::channel();
    server.start(Box::new(consumer)).await.unwrap();

    server
        .offer("billing", "pending", Job::new("billing", "A"))
        .await;
    assert_eq!(
        server.poll("billing", "pending").map(|j| j.name),
        Some("A".to_string())
    );
    // Offer alone does not persist.
    assert!(server.store().get_job("billing", "A").unwrap().is_none());

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_workflow_is_materialized_whatever_its_name() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::open(&local_config(&dir)).unwrap();
    let (log, consumer) = MemoryLog::channel();
    server.start(Box::new(consumer)).await.unwrap();

    log.produce(&Job::new("zeta", "Z")).await.unwrap();
    assert_eq!(poll_until(&server, "zeta", "pending").await.name, "Z");

    // Produced later, keyed lower.
    log.produce(&Job::new("alpha", "A")).await.unwrap();
    assert_eq!(poll_until(&server, "alpha", "pending").await.name, "A");
    assert!(server.store().get_job("alpha", "A").unwrap().is_some());

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stopping_mid_replay_loses_no_jobs() {
    const TOTAL: usize = 300;
    let workflows = ["gamma", "beta", "alpha"];
    let dir = tempfile::tempdir().unwrap();
    {
        let server = Server::open(&local_config(&dir)).unwrap();
        let (log, consumer) = MemoryLog::channel();
        server.start(Box::new(consumer)).await.unwrap();

        for i in 0..TOTAL {
            let workflow = workflows[i % workflows.len()];
            log.produce(&Job::new(workflow, format!("job-{i}")))
                .await
                .unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.store().wal_len().unwrap() < TOTAL as u64 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("WAL never caught up");

        // Replay is likely still running.
        server.stop().await.unwrap();
        assert_eq!(server.memstore().queue_count(), 0);
    }

    let server = Server::open(&local_config(&dir)).unwrap();
    let (_log, consumer) = MemoryLog::channel();
    server.start(Box::new(consumer)).await.unwrap();

    // Offers follow partition writes, so full queues imply full partitions.
    let queued = |wf: &str| {
        server
            .memstore()
            .queue(wf, "pending")
            .map_or(0, |queue| queue.size())
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while workflows.into_iter().map(queued).sum::<usize>() < TOTAL {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("jobs were lost across the restart");

    for workflow in workflows {
        assert_eq!(queued(workflow), TOTAL / workflows.len());
        assert_eq!(
            server.store().jobs(workflow).unwrap().len(),
            TOTAL / workflows.len()
        );
    }

    server.stop().await.unwrap();
}

#[tokio::test]
async fn stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let server = Server::open(&local_config(&dir)).unwrap();
    let (_log, consumer) = MemoryLog::channel();
    server.start(Box::new(consumer)).await.unwrap();

    server.stop().await.unwrap();
    server.stop().await.unwrap();
    assert!(!server.store().is_open());
    assert_eq!(server.memstore().queue_count(), 0);
}

#[tokio::test]
async fn open_fails_when_store_cannot_be_created() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"x").unwrap();

    assert!(Server::open(&Config::local("cluster", &blocker)).is_err());
}
