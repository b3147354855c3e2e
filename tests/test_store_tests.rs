//! End-to-end behavior of the task lifecycle against the in-memory store.

#![cfg(feature = "test")]

use batchwork::{
    BatchworkConfig, BatchworkError, ClaimSelector, TaskOutcome, TaskService, TaskStatus,
    TaskSubmission,
    batch::TaskSet,
    notify::RecordingCallbackSender,
    queue::test::TestStore,
    registry::QueueOptions,
};
use chrono::Duration;
use serde_json::json;
use std::{collections::HashSet, sync::Arc};

fn service() -> (TaskService<TestStore>, RecordingCallbackSender) {
    let sender = RecordingCallbackSender::new();
    let service = TaskService::new(Arc::new(TestStore::new()), Arc::new(sender.clone()));
    (service, sender)
}

fn numbered(count: usize) -> TaskSet {
    (0..count).map(|i| (format!("task-{:05}", i), json!({ "n": i }))).collect()
}

#[tokio::test]
async fn test_concurrent_claims_never_share_a_task() {
    let (service, _) = service();
    let created = service
        .create_queue_and_enqueue("exclusive", QueueOptions::new(), numbered(200))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(task) = service.claim_by_queue(created.queue_id).await.unwrap() {
                claimed.push(task.id);
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "task {} was handed out twice", id);
            total += 1;
        }
    }
    assert_eq!(total, 200);
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed_before_later_tasks() {
    let (service, _) = service();
    let tasks: TaskSet = [("a".to_string(), json!(1)), ("b".to_string(), json!(2))]
        .into_iter()
        .collect();
    let created = service
        .create_queue_and_enqueue("lease", QueueOptions::new().with_expiry_time(100), tasks)
        .await
        .unwrap();

    let first = service.claim_by_queue(created.queue_id).await.unwrap().unwrap();
    assert_eq!(first.task_id, "a");

    // Still leased at 99ms: only b is claimable.
    let clock = service.store().clock().clone();
    clock.advance(Duration::milliseconds(99));
    let b = service.claim_by_queue(created.queue_id).await.unwrap().unwrap();
    assert_eq!(b.task_id, "b");
    assert!(service.claim_by_queue(created.queue_id).await.unwrap().is_none());

    clock.advance(Duration::milliseconds(51));
    let again = service.claim_by_queue(created.queue_id).await.unwrap().unwrap();
    assert_eq!(again.task_id, "a");
    assert_eq!(again.id, first.id);
    assert_eq!(again.attempts, 2);
    assert!(again.expiry_time > clock.now());
}

#[tokio::test]
async fn test_reclaim_returns_expired_task_not_next_one() {
    let (service, _) = service();
    let tasks: TaskSet = [("a".to_string(), json!(1)), ("b".to_string(), json!(2))]
        .into_iter()
        .collect();
    let created = service
        .create_queue_and_enqueue("lease", QueueOptions::new().with_expiry_time(100), tasks)
        .await
        .unwrap();

    let first = service.claim_by_queue(created.queue_id).await.unwrap().unwrap();
    assert_eq!(first.task_id, "a");

    service
        .store()
        .clock()
        .advance(Duration::milliseconds(150));

    let second = service.claim_by_queue(created.queue_id).await.unwrap().unwrap();
    assert_eq!(second.task_id, "a");
}

#[tokio::test]
async fn test_longest_lease_keeps_task_exclusive() {
    let (service, _) = service();
    let options = QueueOptions::new().with_expiry_time(batchwork::registry::MAX_LEASE_MS);
    let created = service
        .create_queue_and_enqueue("lease", options, numbered(1))
        .await
        .unwrap();

    let first = service.claim_by_queue(created.queue_id).await.unwrap().unwrap();
    service
        .store()
        .clock()
        .advance(Duration::milliseconds(1));
    assert!(service.claim_by_queue(created.queue_id).await.unwrap().is_none());
    assert_eq!(service.get_task(first.id).await.unwrap().attempts, 1);
}

#[tokio::test]
async fn test_out_of_range_expiry_time_is_rejected() {
    let (service, _) = service();

    for ms in [u64::MAX, 10_000_000_000_000_000] {
        let err = service
            .create_queue_and_enqueue("lease", QueueOptions::new().with_expiry_time(ms), numbered(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchworkError::InvalidOptions { .. }));
    }
    assert_eq!(service.store().queue_count().await, 0);

    let err = service
        .create_queue("lease", QueueOptions::new().with_expiry_time(u64::MAX))
        .await
        .unwrap_err();
    assert!(matches!(err, BatchworkError::InvalidOptions { .. }));
}

#[tokio::test]
async fn test_ingestion_splits_into_batches_of_one_thousand() {
    let (service, _) = service();
    let created = service
        .create_queue_and_enqueue("bulk", QueueOptions::new(), numbered(2500))
        .await
        .unwrap();

    assert_eq!(created.task_count, 2500);
    assert_eq!(service.store().batch_inserts().await, 3);
    assert_eq!(service.store().task_count().await, 2500);

    let status = service.queue_status(created.queue_id).await.unwrap();
    assert_eq!(status.total_tasks, 2500);
    assert_eq!(status.finished_tasks, 0);
    assert!(!status.complete);
}

#[tokio::test]
async fn test_configured_batch_size_is_used() {
    let sender = RecordingCallbackSender::new();
    let config = BatchworkConfig::new().with_batch_size(100);
    let service = TaskService::with_config(
        Arc::new(TestStore::new()),
        Arc::new(sender),
        &config,
        None,
    );

    let queue_id = service.create_queue("bulk", QueueOptions::new()).await.unwrap();
    let report = service
        .enqueue_with_report(queue_id, numbered(250))
        .await
        .unwrap();

    assert_eq!(report.batch_count, 3);
    assert_eq!(report.batch_size, 100);
    assert_eq!(service.store().task_count().await, 250);
}

#[tokio::test]
async fn test_failed_batch_rolls_back_queue_creation() {
    let (service, _) = service();
    service.store().fail_batch_insert(2).await;

    let err = service
        .create_queue_and_enqueue("bulk", QueueOptions::new(), numbered(2500))
        .await
        .unwrap_err();

    assert!(matches!(err, BatchworkError::Ingestion { .. }));
    assert_eq!(service.store().queue_count().await, 0);
    assert_eq!(service.store().task_count().await, 0);
}

#[tokio::test]
async fn test_all_tasks_completed_yields_all_results() {
    let (service, sender) = service();
    let count = 37;
    let created = service
        .create_queue_and_enqueue("sum", QueueOptions::new(), numbered(count))
        .await
        .unwrap();

    while let Some(task) = service.claim_by_queue(created.queue_id).await.unwrap() {
        assert!(!service.is_queue_complete(created.queue_id).await.unwrap());
        let n = task.params["n"].as_u64().unwrap();
        service
            .submit_result(TaskSubmission::success(task.id, json!(n * n)))
            .await
            .unwrap();
    }

    assert!(service.is_queue_complete(created.queue_id).await.unwrap());
    let results = service.get_results(created.queue_id).await.unwrap();
    assert_eq!(results.len(), count);
    for i in 0..count {
        let key = format!("task-{:05}", i);
        assert_eq!(results[&key], TaskOutcome::Result(json!(i * i)));
    }

    // No callback configured: nothing is sent, but the queue still latches.
    assert!(sender.sent().is_empty());
    let queue = service.get_queue(created.queue_id).await.unwrap();
    assert!(queue.completed_at.is_some());
}

#[tokio::test]
async fn test_params_and_results_round_trip() {
    let (service, _) = service();
    let params = json!({
        "image": "s3://bucket/key.png",
        "sizes": [64, 128, 256],
        "crop": {"x": 0.5, "y": null},
        "label": "naïve ✓",
    });
    let result = json!({
        "thumbnails": [{"size": 64, "bytes": 1024}],
        "warnings": [],
        "ratio": 1.5,
        "done": true,
    });
    let tasks: TaskSet = [("img".to_string(), params.clone())].into_iter().collect();
    let created = service
        .create_queue_and_enqueue("thumbs", QueueOptions::new(), tasks)
        .await
        .unwrap();

    let task = service.claim_by_queue(created.queue_id).await.unwrap().unwrap();
    assert_eq!(task.params, params);

    service
        .submit_result(TaskSubmission::success(task.id, result.clone()))
        .await
        .unwrap();

    let stored = service.get_task(task.id).await.unwrap();
    assert_eq!(stored.params, params);
    assert_eq!(stored.result, Some(TaskOutcome::Result(result.clone())));
    assert_eq!(
        service.get_results(created.queue_id).await.unwrap()["img"],
        TaskOutcome::Result(result)
    );
}

#[tokio::test]
async fn test_resubmission_is_rejected_and_first_result_kept() {
    let (service, _) = service();
    let tasks: TaskSet = [("a".to_string(), json!(1)), ("b".to_string(), json!(2))]
        .into_iter()
        .collect();
    let created = service
        .create_queue_and_enqueue("once", QueueOptions::new(), tasks)
        .await
        .unwrap();

    let task = service.claim_by_queue(created.queue_id).await.unwrap().unwrap();
    service
        .submit_result(TaskSubmission::failure(task.id, json!("boom")))
        .await
        .unwrap();

    let err = service
        .submit_result(TaskSubmission::success(task.id, json!("retry")))
        .await
        .unwrap_err();
    assert!(matches!(err, BatchworkError::TaskAlreadyFinished { id } if id == task.id));

    let stored = service.get_task(task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Error);
    assert_eq!(stored.result, Some(TaskOutcome::Error(json!("boom"))));
}

#[tokio::test]
async fn test_concurrent_completions_send_exactly_one_callback() {
    for round in 0..10 {
        let (service, sender) = service();
        let options = QueueOptions::new().with_callback("http://example/cb");
        let created = service
            .create_queue_and_enqueue("fanout", options, numbered(32))
            .await
            .unwrap();

        let mut claimed = Vec::new();
        while let Some(task) = service.claim_by_queue(created.queue_id).await.unwrap() {
            claimed.push(task);
        }
        assert_eq!(claimed.len(), 32);

        let barrier = Arc::new(tokio::sync::Barrier::new(claimed.len()));
        let handles: Vec<_> = claimed
            .into_iter()
            .map(|task| {
                let service = service.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    service
                        .submit_result(TaskSubmission::success(task.id, task.params))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut latched = 0;
        for handle in handles {
            if handle.await.unwrap().queue_completed {
                latched += 1;
            }
        }

        let sent = sender.sent();
        assert_eq!(latched, 1, "round {}", round);
        assert_eq!(sent.len(), 1, "round {}", round);
        assert_eq!(sent[0].url, "http://example/cb");
        assert_eq!(sent[0].queue_id, created.queue_id);
        assert_eq!(sent[0].payload.results.len(), 32);
        assert_eq!(
            sent[0].payload.results["task-00007"],
            TaskOutcome::Result(json!({ "n": 7 }))
        );
    }
}

#[tokio::test]
async fn test_claim_by_type_spans_queues_of_that_type() {
    let (service, _) = service();
    let first = service
        .create_queue_and_enqueue("resize", QueueOptions::new(), numbered(2))
        .await
        .unwrap();
    let second = service
        .create_queue_and_enqueue("resize", QueueOptions::new(), numbered(2))
        .await
        .unwrap();
    service
        .create_queue_and_enqueue("other", QueueOptions::new(), numbered(5))
        .await
        .unwrap();

    let selector = ClaimSelector::Type("resize".to_string());
    let mut queues = Vec::new();
    while let Some(task) = service.claim_next(&selector).await.unwrap() {
        queues.push(task.queue_id);
    }

    assert_eq!(
        queues,
        vec![first.queue_id, first.queue_id, second.queue_id, second.queue_id]
    );
}

#[tokio::test]
async fn test_unknown_ids_are_reported() {
    let (service, _) = service();

    assert!(matches!(
        service.get_results(404).await.unwrap_err(),
        BatchworkError::QueueNotFound { id: 404 }
    ));
    assert!(matches!(
        service.enqueue(404, numbered(1)).await.unwrap_err(),
        BatchworkError::QueueNotFound { id: 404 }
    ));
    assert!(matches!(
        service
            .submit_result(TaskSubmission::success(404, json!(1)))
            .await
            .unwrap_err(),
        BatchworkError::TaskNotFound { id: 404 }
    ));
    assert!(service.claim_by_queue(404).await.unwrap().is_none());
}
