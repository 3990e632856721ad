//! End-to-end job engine scenarios against the public manager API.

use gatehouse_core::GatehouseEvent;
use gatehouse_jobs::{
    Job, JobError, JobManager, JobStatus, Priority, RetryConfig, DEAD_LETTER_QUEUE,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn fast_retry(max_attempts: u32, base_ms: u64) -> RetryConfig {
    RetryConfig {
        base_delay: Duration::from_millis(base_ms),
        max_delay: Duration::from_secs(5),
        max_attempts,
        backoff_factor: 2.0,
        enable_jitter: false,
    }
}

#[tokio::test]
async fn priorities_dispatch_critical_first_with_one_worker() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let events = Arc::new(Mutex::new(Vec::new()));
    let events_clone = Arc::clone(&events);

    // No workers yet: jobs must all be queued before dispatch begins.
    let manager = JobManager::builder()
        .default_workers(0)
        .on_event(move |event| {
            events_clone
                .lock()
                .unwrap()
                .push((event.job().id.clone(), event.event_type()));
        })
        .build()
        .unwrap();

    let order_clone = Arc::clone(&order);
    manager.register_handler_fn("email", move |_ctx, job| {
        let order = Arc::clone(&order_clone);
        async move {
            order.lock().unwrap().push(job.priority);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(serde_json::Value::Null)
        }
    });

    for priority in [Priority::Low, Priority::Critical, Priority::Normal] {
        manager
            .enqueue(Job::builder("email").priority(priority).build())
            .unwrap();
    }
    manager.scale_queue("default", 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(
        order.lock().unwrap().as_slice(),
        &[Priority::Critical, Priority::Normal, Priority::Low]
    );

    // Every job observed queued, started, completed.
    let seen = events.lock().unwrap();
    for job in manager.list_jobs(Some(JobStatus::Completed)) {
        let sequence: Vec<&str> = seen
            .iter()
            .filter(|(id, _)| *id == job.id)
            .map(|(_, kind)| *kind)
            .collect();
        assert_eq!(
            sequence,
            vec!["job.queued", "job.started", "job.completed"],
            "job {}",
            job.id
        );
    }
    manager.stop().await;
}

#[tokio::test]
async fn retries_back_off_then_succeed() {
    let manager = JobManager::builder()
        .default_workers(1)
        .retry(fast_retry(3, 50))
        .build()
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);
    manager.register_handler_fn("flaky", move |_ctx, _job| {
        let calls = Arc::clone(&calls_clone);
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(JobError::handler("transient"))
            } else {
                Ok(serde_json::Value::Null)
            }
        }
    });

    let started = Instant::now();
    let id = manager.enqueue(Job::builder("flaky").build()).unwrap();

    // Poll until the job settles.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(job) = manager.get_job(&id) {
            if job.status.is_terminal() {
                break;
            }
        }
        assert!(Instant::now() < deadline, "job did not settle in time");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Two failures then success: three invocations, backoff 50ms + 100ms.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(started.elapsed() >= Duration::from_millis(150));

    let job = manager.get_job(&id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);
    manager.stop().await;
}

#[tokio::test]
async fn exhausted_jobs_land_in_the_dead_letter_queue() {
    let dead_letter_events = Arc::new(AtomicUsize::new(0));
    let dead_clone = Arc::clone(&dead_letter_events);

    let manager = JobManager::builder()
        .default_workers(1)
        .retry(fast_retry(1, 20))
        .on_dead_letter(move |_job| {
            dead_clone.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    manager.register_handler_fn("doomed", |_ctx, _job| async {
        Err::<serde_json::Value, _>(JobError::handler("connection refused"))
    });

    let id = manager.enqueue(Job::builder("doomed").build()).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let job = manager.get_job(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("connection refused"));

    // Parked in dead_letter, and the event fired exactly once.
    let stats = manager.stats();
    assert_eq!(stats.queue_depths[DEAD_LETTER_QUEUE], 1);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(dead_letter_events.load(Ordering::SeqCst), 1);
    manager.stop().await;
}

#[tokio::test]
async fn queues_scale_pause_and_resume() {
    let manager = JobManager::builder().default_workers(0).build().unwrap();

    manager.scale_queue("custom", 3);
    assert_eq!(manager.active_workers("custom"), 3);

    let stats = manager.worker_stats();
    let custom: Vec<_> = stats.iter().filter(|w| w.queue == "custom").collect();
    assert_eq!(custom.len(), 3);
    assert!(custom
        .iter()
        .all(|w| w.status == gatehouse_jobs::WorkerStatus::Idle));

    manager.pause_queue("custom");
    assert_eq!(manager.active_workers("custom"), 0);

    manager.resume_queue("custom", 1);
    assert_eq!(manager.active_workers("custom"), 1);
    manager.stop().await;
}

#[tokio::test]
async fn cron_entries_enqueue_until_unscheduled() {
    let manager = JobManager::builder().default_workers(1).build().unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let runs_clone = Arc::clone(&runs);
    manager.register_handler_fn("tick", move |_ctx, _job| {
        let runs = Arc::clone(&runs_clone);
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::Value::Null)
        }
    });

    let entry = manager
        .schedule_cron(
            "* * * * * *",
            gatehouse_jobs::CronSpec {
                job_type: "tick".to_string(),
                queue: "default".to_string(),
                payload: gatehouse_jobs::Payload::new(),
            },
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    let fired = runs.load(Ordering::SeqCst);
    assert!(fired >= 1, "cron never fired");

    assert!(manager.unschedule_cron(entry));
    tokio::time::sleep(Duration::from_millis(1500)).await;
    let after = runs.load(Ordering::SeqCst);
    // At most one in-flight firing lands after unscheduling.
    assert!(after <= fired + 1);
    manager.stop().await;
}

#[tokio::test]
async fn invalid_cron_expressions_fail_at_registration() {
    let manager = JobManager::builder().default_workers(0).build().unwrap();
    let err = manager
        .schedule_cron(
            "every tuesday",
            gatehouse_jobs::CronSpec {
                job_type: "tick".to_string(),
                queue: "default".to_string(),
                payload: gatehouse_jobs::Payload::new(),
            },
        )
        .unwrap_err();
    assert!(err.to_string().contains("every tuesday"));
    manager.stop().await;
}
