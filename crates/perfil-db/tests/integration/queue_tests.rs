use std::time::Duration;

use perfil_core::key::CompanyKey;
use perfil_core::queue::{EnqueueOutcome, FailOutcome, QueueConfig, QueueStatus, WorkQueue};
use perfil_db::QueueName;

use crate::integration::common::setup_test_db;

fn key(raw: &str) -> CompanyKey {
    CompanyKey::new(raw).unwrap()
}

#[tokio::test]
async fn enqueue_and_claim_roundtrip() {
    let (db, _container) = setup_test_db().await;
    let queue = db.queue(QueueName::Discovery);

    let outcome = queue.enqueue(&key("12345678")).await.unwrap();
    assert!(outcome.is_enqueued());

    let claimed = queue.claim("worker-1", 1).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].key.as_str(), "12345678");
    assert_eq!(claimed[0].status, QueueStatus::Processing);
    assert_eq!(claimed[0].locked_by.as_deref(), Some("worker-1"));
    assert!(claimed[0].locked_at.is_some());
}

#[tokio::test]
async fn second_enqueue_while_active_is_noop() {
    let (db, _container) = setup_test_db().await;
    let queue = db.queue(QueueName::Discovery);

    assert!(queue.enqueue(&key("12345678")).await.unwrap().is_enqueued());
    assert_eq!(
        queue.enqueue(&key("12345678")).await.unwrap(),
        EnqueueOutcome::AlreadyActive
    );

    // Still exactly one row, also while processing.
    queue.claim("worker-1", 1).await.unwrap();
    assert_eq!(
        queue.enqueue(&key("12345678")).await.unwrap(),
        EnqueueOutcome::AlreadyActive
    );

    let metrics = queue.metrics().await.unwrap();
    assert_eq!(metrics.queued + metrics.processing, 1);
}

#[tokio::test]
async fn enqueue_batch_reports_enqueued_and_skipped() {
    let (db, _container) = setup_test_db().await;
    let queue = db.queue(QueueName::Profile);

    queue.enqueue(&key("11111111")).await.unwrap();

    let result = queue
        .enqueue_batch(&[key("11111111"), key("22222222"), key("33333333")])
        .await
        .unwrap();

    assert_eq!(result.skipped, vec![key("11111111")]);
    assert_eq!(result.enqueued, vec![key("22222222"), key("33333333")]);
}

#[tokio::test]
async fn claim_under_contention_assigns_each_entry_once() {
    let (db, _container) = setup_test_db().await;
    let queue = db.queue(QueueName::Discovery);

    queue.enqueue(&key("11111111")).await.unwrap();
    queue.enqueue(&key("22222222")).await.unwrap();

    // Three workers race for two entries.
    let (a, b, c) = tokio::join!(
        queue.claim("worker-a", 1),
        queue.claim("worker-b", 1),
        queue.claim("worker-c", 1),
    );
    let mut claimed: Vec<_> = [a.unwrap(), b.unwrap(), c.unwrap()]
        .into_iter()
        .flatten()
        .collect();
    claimed.sort_by_key(|e| e.id);

    assert_eq!(claimed.len(), 2);
    assert_ne!(claimed[0].id, claimed[1].id);
}

#[tokio::test]
async fn complete_marks_done_and_clears_lock() {
    let (db, _container) = setup_test_db().await;
    let queue = db.queue(QueueName::Discovery);

    queue.enqueue(&key("12345678")).await.unwrap();
    let entry = queue.claim("worker-1", 1).await.unwrap().remove(0);

    queue.complete(entry.id, "worker-1").await.unwrap();

    let metrics = queue.metrics().await.unwrap();
    assert_eq!(metrics.done, 1);
    assert_eq!(metrics.processing, 0);

    // The key is free again: a fresh enqueue succeeds.
    assert!(queue.enqueue(&key("12345678")).await.unwrap().is_enqueued());
}

#[tokio::test]
async fn fail_or_retry_requeues_with_backoff_until_dead() {
    let (db, _container) = setup_test_db().await;
    let config = QueueConfig {
        max_attempts: 2,
        ..Default::default()
    };
    let db = db.with_queue_config(config);
    let queue = db.queue(QueueName::Profile);

    queue.enqueue(&key("62345678")).await.unwrap();
    let entry = queue.claim("worker-1", 1).await.unwrap().remove(0);

    let outcome = queue
        .fail_or_retry(entry.id, "worker-1", "transport: connection refused")
        .await
        .unwrap();
    let FailOutcome::Retried { next_available_in } = outcome else {
        panic!("first failure should retry, got {outcome:?}");
    };
    // Base 30s ± 10% jitter.
    assert!(next_available_in >= Duration::from_secs(26));
    assert!(next_available_in <= Duration::from_secs(34));

    // Requeued entry is not claimable until available_at passes.
    assert!(queue.claim("worker-2", 1).await.unwrap().is_empty());

    // Force it claimable and burn the last attempt.
    sqlx::query("UPDATE queue_profile SET available_at = NOW() WHERE id = $1")
        .bind(entry.id)
        .execute(db.pool())
        .await
        .unwrap();
    let entry = queue.claim("worker-2", 1).await.unwrap().remove(0);
    assert_eq!(entry.attempts, 1);

    let outcome = queue
        .fail_or_retry(entry.id, "worker-2", "transport: connection refused")
        .await
        .unwrap();
    assert_eq!(outcome, FailOutcome::Dead);

    let metrics = queue.metrics().await.unwrap();
    assert_eq!(metrics.failed, 1);

    // A dead entry releases the active slot.
    assert!(queue.enqueue(&key("62345678")).await.unwrap().is_enqueued());
}

#[tokio::test]
async fn abandoned_lock_is_reclaimed_and_stale_complete_ignored() {
    let (db, _container) = setup_test_db().await;
    let config = QueueConfig {
        visibility_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let db = db.with_queue_config(config);
    let queue = db.queue(QueueName::Discovery);

    queue.enqueue(&key("12345678")).await.unwrap();
    let entry = queue.claim("worker-a", 1).await.unwrap().remove(0);

    // Lock still fresh: nobody else can take it.
    assert!(queue.claim("worker-b", 1).await.unwrap().is_empty());

    // Simulate worker-a dying past the visibility timeout.
    sqlx::query("UPDATE queue_discovery SET locked_at = NOW() - INTERVAL '2 seconds' WHERE id = $1")
        .bind(entry.id)
        .execute(db.pool())
        .await
        .unwrap();

    let reclaimed = queue.claim("worker-b", 1).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, entry.id);
    assert_eq!(reclaimed[0].locked_by.as_deref(), Some("worker-b"));

    // worker-a's late terminal updates are no-ops.
    queue.complete(entry.id, "worker-a").await.unwrap();
    assert_eq!(
        queue
            .fail_or_retry(entry.id, "worker-a", "late failure")
            .await
            .unwrap(),
        FailOutcome::NotOwned
    );

    // worker-b still owns it and finishes normally.
    queue.complete(entry.id, "worker-b").await.unwrap();
    let metrics = queue.metrics().await.unwrap();
    assert_eq!(metrics.done, 1);
}

#[tokio::test]
async fn claim_orders_by_availability_then_id() {
    let (db, _container) = setup_test_db().await;
    let queue = db.queue(QueueName::Discovery);

    queue.enqueue(&key("11111111")).await.unwrap();
    queue.enqueue(&key("22222222")).await.unwrap();
    queue.enqueue(&key("33333333")).await.unwrap();

    let claimed = queue.claim("worker-1", 2).await.unwrap();
    assert_eq!(claimed.len(), 2);
    assert!(claimed[0].id < claimed[1].id);
}

#[tokio::test]
async fn metrics_count_by_status_and_oldest_age() {
    let (db, _container) = setup_test_db().await;
    let queue = db.queue(QueueName::Profile);

    queue.enqueue(&key("11111111")).await.unwrap();
    queue.enqueue(&key("22222222")).await.unwrap();
    queue.claim("worker-1", 1).await.unwrap();

    let metrics = queue.metrics().await.unwrap();
    assert_eq!(metrics.queued, 1);
    assert_eq!(metrics.processing, 1);
    assert_eq!(metrics.done, 0);
    assert_eq!(metrics.failed, 0);
    assert!(metrics.oldest_queued_age_seconds.is_some());
}

#[tokio::test]
async fn queues_are_independent() {
    let (db, _container) = setup_test_db().await;
    let discovery = db.queue(QueueName::Discovery);
    let profile = db.queue(QueueName::Profile);

    discovery.enqueue(&key("12345678")).await.unwrap();

    // Same key is free in the other queue.
    assert!(profile.enqueue(&key("12345678")).await.unwrap().is_enqueued());
    assert_eq!(profile.metrics().await.unwrap().queued, 1);
    assert_eq!(discovery.metrics().await.unwrap().queued, 1);
}
