use std::sync::Arc;
use std::time::Duration;

use conductor::memstore::MemStore;
use conductor::model::Job;
use tokio::time::timeout;

#[tokio::test]
async fn poll_of_unknown_pair_returns_immediately() {
    let mem = MemStore::new(8);

    let polled = timeout(Duration::from_millis(100), async {
        mem.poll("billing", "pending")
    })
    .await
    .expect("poll must not block");
    assert!(polled.is_none());
    assert_eq!(mem.queue_count(), 0);
}

#[tokio::test]
async fn billing_scenario_returns_latest_payload_once() {
    let mem = MemStore::new(8);

    mem.offer("billing", "pending", Job::new("billing", "A").data("v1"))
        .await;
    mem.offer("billing", "pending", Job::new("billing", "A").data("v2"))
        .await;

    let polled = mem.poll("billing", "pending").expect("job A is queued");
    assert_eq!(polled.name, "A");
    assert_eq!(polled.data, b"v2");

    assert!(mem.poll("billing", "pending").is_none());
}

#[tokio::test]
async fn queues_are_scoped_by_workflow_and_state() {
    let mem = MemStore::new(8);
    mem.offer("billing", "pending", Job::new("billing", "a")).await;
    mem.offer("shipping", "pending", Job::new("shipping", "a")).await;
    mem.offer("billing", "review", Job::new("billing", "b")).await;

    assert_eq!(mem.queue_count(), 3);
    assert!(mem.poll("billing", "done").is_none());
    assert_eq!(
        mem.poll("billing", "review").map(|j| j.name),
        Some("b".to_string())
    );
    assert_eq!(
        mem.poll("shipping", "pending").map(|j| j.workflow),
        Some("shipping".to_string())
    );
}

#[tokio::test]
async fn offer_under_new_state_retracts_the_old_one() {
    let mem = MemStore::new(8);
    let job = Job::new("billing", "A");

    mem.offer("billing", "pending", job.clone()).await;
    assert_eq!(mem.state_of("billing", "A").as_deref(), Some("pending"));

    mem.offer("billing", "running", job.clone()).await;
    assert_eq!(mem.state_of("billing", "A").as_deref(), Some("running"));

    assert!(mem.poll("billing", "pending").is_none());
    assert_eq!(mem.poll("billing", "running"), Some(job));
}

#[tokio::test]
async fn transition_after_poll_clears_the_hidden_copy() {
    let mem = MemStore::new(8);
    let job = Job::new("billing", "A");

    mem.offer("billing", "pending", job.clone()).await;
    assert!(mem.poll("billing", "pending").is_some());

    let pending = mem.queue("billing", "pending").unwrap();
    assert_eq!(pending.hidden_len(), 1);

    mem.offer("billing", "done", job).await;
    assert_eq!(pending.hidden_len(), 0);
}

#[tokio::test]
async fn remove_forgets_the_job() {
    let mem = MemStore::new(8);
    let job = Job::new("billing", "A");
    mem.offer("billing", "pending", job.clone()).await;

    assert!(mem.remove("billing", "pending", &job));
    assert!(mem.state_of("billing", "A").is_none());
    assert!(mem.poll("billing", "pending").is_none());
    assert!(!mem.remove("billing", "pending", &job));
}

#[tokio::test]
async fn requeue_expired_sweeps_every_queue() {
    let mem = MemStore::new(8);
    mem.offer("billing", "pending", Job::new("billing", "a")).await;
    mem.offer("shipping", "pending", Job::new("shipping", "b")).await;
    assert!(mem.poll("billing", "pending").is_some());
    assert!(mem.poll("shipping", "pending").is_some());

    assert_eq!(mem.requeue_expired(chrono::Duration::zero()), 2);
    assert!(mem.poll("billing", "pending").is_some());
    assert!(mem.poll("shipping", "pending").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_offers_share_one_queue() {
    let mem = Arc::new(MemStore::new(64));

    let mut tasks = Vec::new();
    for i in 0..16 {
        let mem = Arc::clone(&mem);
        tasks.push(tokio::spawn(async move {
            mem.offer("billing", "pending", Job::new("billing", format!("job-{i}")))
                .await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(mem.queue_count(), 1);
    assert_eq!(mem.queue("billing", "pending").unwrap().size(), 16);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_offers_under_different_states_leave_one_live_copy() {
    let states = ["pending", "review", "shipped"];

    for round in 0..50 {
        let mem = Arc::new(MemStore::new(16));
        let name = format!("job-{round}");

        let mut tasks = Vec::new();
        for state in states {
            let mem = Arc::clone(&mem);
            let job = Job::new("billing", name.clone()).state(state);
            tasks.push(tokio::spawn(async move {
                mem.offer("billing", state, job).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let holding: Vec<&str> = states
            .into_iter()
            .filter(|state| mem.queue("billing", state).is_some_and(|q| q.size() == 1))
            .collect();
        assert_eq!(holding.len(), 1, "round {round}: live in {holding:?}");
        assert_eq!(mem.state_of("billing", &name).as_deref(), Some(holding[0]));
    }
}

#[tokio::test]
async fn stop_resets_queues_and_states() {
    let mem = MemStore::new(8);
    mem.start();
    mem.offer("billing", "pending", Job::new("billing", "A")).await;
    mem.set_checkpoint(b"billing:t:1".to_vec());

    mem.stop();
    mem.stop();

    assert_eq!(mem.queue_count(), 0);
    assert!(mem.state_of("billing", "A").is_none());
    assert!(mem.checkpoint().is_none());
    assert!(mem.poll("billing", "pending").is_none());
}
