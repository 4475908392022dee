use claims::*;
use insta::assert_compact_json_snapshot;
use lease_queue::metrics::QueueMetrics;
use lease_queue::{
    Backoff, Client, DisposeError, EnqueueError, EnqueueRequest, FailOutcome, FinalStatus,
    Clock, HistoryFilter, Job, MANUAL_PROCESSOR, ManualClock, MemoryStore, ProducerError,
    Session,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

const LEASE: Duration = Duration::from_secs(30);

fn client() -> (Client<MemoryStore>, ManualClock) {
    let clock = ManualClock::default();
    let client = Client::new(MemoryStore::with_clock(clock.clone()));
    (client, clock)
}

fn queues(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

fn email(payload: &str) -> EnqueueRequest {
    EnqueueRequest::builder()
        .queue_name("email")
        .payload(json!(payload))
        .build()
}

async fn claim(client: &Client<MemoryStore>, owner: &str) -> Option<Job> {
    client
        .claim_next(&queues(&["email"]), owner, LEASE)
        .await
        .unwrap()
}

fn retry_now() -> Backoff {
    Backoff::fixed(Duration::ZERO)
}

#[tokio::test]
async fn enqueue_rejects_malformed_requests() {
    let (client, _) = client();

    let request = EnqueueRequest::builder().queue_name("").build();
    let error = assert_err!(client.enqueue(&request).await);
    assert_matches!(error, EnqueueError::Producer(ProducerError::EmptyQueueName));

    let request = EnqueueRequest::builder()
        .queue_name("email")
        .max_attempts(0)
        .build();
    let error = assert_err!(client.enqueue(&request).await);
    assert_matches!(
        error,
        EnqueueError::Producer(ProducerError::InvalidMaxAttempts(0))
    );

    let stats = assert_ok!(client.queue_stats("email").await);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn new_jobs_start_unleased_with_zero_attempts() {
    let (client, _) = client();

    let enqueued = assert_ok!(client.enqueue(&email("p1")).await);
    assert!(!enqueued.existed);

    let job = assert_some!(assert_ok!(client.job(enqueued.id).await));
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 5);
    assert_none!(job.lease_owner);
    assert_none!(job.lease_until);
    assert_eq!(job.available_at, job.created_at);
}

#[tokio::test]
async fn unique_key_deduplicates_active_jobs() {
    let (client, _) = client();

    let request = EnqueueRequest::builder()
        .queue_name("reports")
        .unique_key("report-42")
        .build();

    let first = assert_ok!(client.enqueue(&request).await);
    assert!(!first.existed);

    let second = assert_ok!(client.enqueue(&request).await);
    assert!(second.existed);
    assert_eq!(second.id, first.id);

    // Keys are scoped to their queue.
    let other_queue = EnqueueRequest::builder()
        .queue_name("email")
        .unique_key("report-42")
        .build();
    let other = assert_ok!(client.enqueue(&other_queue).await);
    assert!(!other.existed);

    let queues = queues(&["reports"]);
    let job = assert_some!(assert_ok!(client.claim_next(&queues, "w1", LEASE).await));
    assert_eq!(job.id, first.id);
    assert_none!(assert_ok!(client.claim_next(&queues, "w2", LEASE).await));

    // Once the job is finished, the key can be used again.
    assert_ok!(client.ack_now(&job, &Value::Null).await);
    let third = assert_ok!(client.enqueue(&request).await);
    assert!(!third.existed);
    assert_ne!(third.id, first.id);
}

#[tokio::test]
async fn deduplicated_enqueues_are_counted_separately() {
    let (client, _) = client();
    let metrics = Arc::new(assert_ok!(QueueMetrics::new()));
    let client = client.with_metrics(metrics.clone());

    let request = EnqueueRequest::builder()
        .queue_name("email")
        .unique_key("welcome-1")
        .build();
    assert_ok!(client.enqueue(&request).await);
    assert_ok!(client.enqueue(&request).await);
    assert_ok!(client.enqueue(&request).await);

    let enqueued = metrics.jobs_enqueued_total.with_label_values(&["email"]);
    assert_eq!(enqueued.get(), 1);
    let deduplicated = metrics.jobs_deduplicated_total.with_label_values(&["email"]);
    assert_eq!(deduplicated.get(), 2);
}

#[tokio::test]
async fn claims_follow_priority_then_availability() {
    let (client, clock) = client();

    let low = EnqueueRequest::builder().queue_name("email").build();
    let low = assert_ok!(client.enqueue(&low).await).id;

    clock.advance(Duration::from_secs(1));
    let high = EnqueueRequest::builder()
        .queue_name("email")
        .priority(10)
        .build();
    let high = assert_ok!(client.enqueue(&high).await).id;

    let delayed = EnqueueRequest::builder()
        .queue_name("email")
        .priority(20)
        .delay(Duration::from_secs(60))
        .build();
    let delayed = assert_ok!(client.enqueue(&delayed).await).id;

    let other_queue = EnqueueRequest::builder()
        .queue_name("sms")
        .priority(100)
        .build();
    assert_ok!(client.enqueue(&other_queue).await);

    assert_eq!(assert_some!(claim(&client, "w1").await).id, high);
    assert_eq!(assert_some!(claim(&client, "w1").await).id, low);
    assert_none!(claim(&client, "w1").await);

    clock.advance(Duration::from_secs(60));
    assert_eq!(assert_some!(claim(&client, "w1").await).id, delayed);
}

#[tokio::test]
async fn equal_priorities_are_claimed_in_availability_order() {
    let (client, clock) = client();

    let late = EnqueueRequest::builder()
        .queue_name("email")
        .delay(Duration::from_secs(10))
        .build();
    let late = assert_ok!(client.enqueue(&late).await).id;
    let early = assert_ok!(client.enqueue(&email("early")).await).id;

    clock.advance(Duration::from_secs(10));
    assert_eq!(assert_some!(claim(&client, "w1").await).id, early);
    assert_eq!(assert_some!(claim(&client, "w1").await).id, late);
}

#[tokio::test]
async fn leased_jobs_cannot_be_claimed_twice() {
    let (client, clock) = client();
    let id = assert_ok!(client.enqueue(&email("p1")).await).id;

    let job = assert_some!(claim(&client, "worker-a").await);
    assert_eq!(job.lease_owner.as_deref(), Some("worker-a"));

    assert_none!(claim(&client, "worker-b").await);
    assert_none!(assert_ok!(client.claim_job(id, "worker-b", LEASE).await));

    // Still held at the very end of the lease.
    clock.advance(LEASE);
    assert_none!(claim(&client, "worker-b").await);

    clock.advance(Duration::from_secs(1));
    let job = assert_some!(claim(&client, "worker-b").await);
    assert_eq!(job.lease_owner.as_deref(), Some("worker-b"));
    assert_eq!(job.attempts, 0);
}

#[tokio::test]
async fn attempts_increase_by_one_per_nack_until_dead_letter() {
    let (client, _) = client();
    let request = EnqueueRequest::builder()
        .queue_name("email")
        .max_attempts(3)
        .build();
    let id = assert_ok!(client.enqueue(&request).await).id;

    for expected in 1..3 {
        let job = assert_some!(claim(&client, "w1").await);
        let outcome = assert_ok!(client.nack_now(&job, &retry_now(), &json!("boom")).await);
        assert_matches!(outcome, FailOutcome::Rescheduled { attempts, .. } if attempts == expected);

        let job = assert_some!(assert_ok!(client.job(id).await));
        assert_eq!(job.attempts, expected);
        assert_some_eq!(job.last_error, json!("boom"));
        assert_none!(job.lease_owner);
    }

    let job = assert_some!(claim(&client, "w1").await);
    let outcome = assert_ok!(client.nack_now(&job, &retry_now(), &json!("final")).await);
    assert_eq!(outcome, FailOutcome::DeadLettered { attempts: 3 });

    assert_none!(assert_ok!(client.job(id).await));
    assert_none!(claim(&client, "w1").await);

    let history = assert_some!(assert_ok!(client.history(id).await));
    assert_eq!(history.status_final, FinalStatus::DeadLetter);
    assert_eq!(history.attempts, 3);
    assert_eq!(history.result_or_error, json!("final"));
    assert_eq!(history.processed_by, "w1");
}

#[tokio::test]
async fn nack_delays_the_next_delivery() {
    let (client, clock) = client();
    let id = assert_ok!(client.enqueue(&email("p1")).await).id;
    let backoff = Backoff::exponential(Duration::from_secs(10), 0.0);

    let job = assert_some!(claim(&client, "w1").await);
    let outcome = assert_ok!(client.nack_now(&job, &backoff, &json!("boom")).await);
    let FailOutcome::Rescheduled { available_at, .. } = outcome else {
        panic!("expected the job to be rescheduled, got {outcome:?}");
    };

    let job = assert_some!(assert_ok!(client.job(id).await));
    assert_eq!(job.available_at, available_at);

    clock.advance(Duration::from_secs(9));
    assert_none!(claim(&client, "w1").await);
    clock.advance(Duration::from_secs(1));
    let job = assert_some!(claim(&client, "w1").await);

    // The second failure doubles the delay.
    assert_ok!(client.nack_now(&job, &backoff, &json!("boom")).await);
    clock.advance(Duration::from_secs(19));
    assert_none!(claim(&client, "w1").await);
    clock.advance(Duration::from_secs(1));
    assert_some!(claim(&client, "w1").await);
}

#[tokio::test]
async fn email_job_fails_twice_then_completes() {
    let (client, _) = client();
    let request = EnqueueRequest::builder()
        .queue_name("email")
        .priority(10)
        .payload(json!("p1"))
        .max_attempts(3)
        .build();
    let id = assert_ok!(client.enqueue(&request).await).id;

    for _ in 0..2 {
        let job = assert_some!(claim(&client, "w1").await);
        assert_ok!(client.nack_now(&job, &retry_now(), &json!("smtp down")).await);
    }

    let job = assert_some!(claim(&client, "w1").await);
    assert_eq!(job.attempts, 2);
    assert_ok!(client.ack_now(&job, &json!({ "sent": true })).await);

    let history = assert_some!(assert_ok!(client.history(id).await));
    assert_eq!(history.status_final, FinalStatus::Completed);
    assert_eq!(history.attempts, 2);
    assert_eq!(history.payload, json!("p1"));
    assert_eq!(history.result_or_error, json!({ "sent": true }));
    assert_none!(assert_ok!(client.job(id).await));
}

#[tokio::test]
async fn duplicate_submission_is_only_claimed_once() {
    let (client, _) = client();
    let request = EnqueueRequest::builder()
        .queue_name("email")
        .unique_key("report-42")
        .build();

    let first = assert_ok!(client.enqueue(&request).await);
    let second = assert_ok!(client.enqueue(&request).await);
    assert!(second.existed);
    assert_eq!(first.id, second.id);

    let job = assert_some!(claim(&client, "w1").await);
    assert_eq!(job.id, first.id);
    assert_none!(claim(&client, "w2").await);
}

#[tokio::test]
async fn crashed_worker_lease_is_recovered() {
    let (client, clock) = client();
    let id = assert_ok!(client.enqueue(&email("p1")).await).id;

    let lease = Duration::from_secs(5);
    let queues = queues(&["email"]);
    assert_some!(assert_ok!(client.claim_next(&queues, "worker-a", lease).await));

    // Worker A crashes without heartbeating or disposing the job.
    clock.advance(Duration::from_secs(4));
    assert_eq!(assert_ok!(client.recover_expired_leases(100).await), 0);

    clock.advance(Duration::from_secs(2));
    assert_eq!(assert_ok!(client.recover_expired_leases(100).await), 1);

    let job = assert_some!(assert_ok!(client.job(id).await));
    assert_eq!(job.attempts, 0);
    assert_none!(job.lease_owner);
    assert_none!(job.lease_until);

    let job = assert_some!(assert_ok!(client.claim_next(&queues, "worker-b", lease).await));
    assert_ok!(client.ack_now(&job, &Value::Null).await);

    let history = assert_some!(assert_ok!(client.history(id).await));
    assert_eq!(history.status_final, FinalStatus::Completed);
    assert_eq!(history.attempts, 0);
}

#[tokio::test]
async fn recovery_respects_the_limit() {
    let (client, clock) = client();
    for _ in 0..3 {
        assert_ok!(client.enqueue(&email("p")).await);
        assert_some!(claim(&client, "w1").await);
    }

    clock.advance(LEASE + Duration::from_secs(1));
    assert_eq!(assert_ok!(client.recover_expired_leases(2).await), 2);
    assert_eq!(assert_ok!(client.recover_expired_leases(2).await), 1);
    assert_eq!(assert_ok!(client.recover_expired_leases(2).await), 0);
}

#[tokio::test]
async fn recovery_without_a_limit_uses_the_default() {
    let (client, clock) = client();
    for _ in 0..3 {
        assert_ok!(client.enqueue(&email("p")).await);
        assert_some!(claim(&client, "w1").await);
    }

    clock.advance(LEASE + Duration::from_secs(1));
    assert_eq!(assert_ok!(client.recover_expired_leases(0).await), 3);
    assert_eq!(assert_ok!(client.recover_expired_leases(-1).await), 0);
}

#[tokio::test]
async fn history_records_the_worker_and_the_first_claim() {
    let (client, clock) = client();
    let id = assert_ok!(client.enqueue(&email("p1")).await).id;
    let enqueued_at = assert_some!(assert_ok!(client.job(id).await)).created_at;

    clock.advance(Duration::from_secs(5));
    let job = assert_some!(claim(&client, "w1").await);
    let first_claim = clock.now();
    assert_some_eq!(job.started_at, first_claim);

    // Neither retries nor lease recovery move the start time.
    assert_ok!(client.nack_now(&job, &retry_now(), &json!("boom")).await);
    clock.advance(Duration::from_secs(5));
    assert_some!(claim(&client, "w1").await);
    clock.advance(LEASE + Duration::from_secs(1));
    assert_eq!(assert_ok!(client.recover_expired_leases(10).await), 1);

    let job = assert_some!(claim(&client, "w2").await);
    assert_some_eq!(job.started_at, first_claim);
    assert_ok!(client.ack_now(&job, &Value::Null).await);

    let history = assert_some!(assert_ok!(client.history(id).await));
    assert_eq!(history.processed_by, "w2");
    assert_eq!(history.created_at, enqueued_at);
    assert_some_eq!(history.started_at, first_claim);
    assert_eq!(history.finished_at, clock.now());
}

#[tokio::test]
async fn enqueue_in_becomes_visible_on_commit() {
    let (client, _) = client();

    let mut session = assert_ok!(client.begin().await);
    let enqueued = assert_ok!(client.enqueue_in(&mut session, &email("p1")).await);
    assert!(!enqueued.existed);

    assert_none!(assert_ok!(client.job(enqueued.id).await));
    assert_none!(claim(&client, "w1").await);

    assert_ok!(session.commit().await);

    let job = assert_some!(claim(&client, "w1").await);
    assert_eq!(job.id, enqueued.id);
    assert_eq!(job.payload, json!("p1"));
}

#[tokio::test]
async fn enqueue_in_is_discarded_on_rollback() {
    let (client, _) = client();
    let request = EnqueueRequest::builder()
        .queue_name("email")
        .unique_key("report-42")
        .build();

    let mut session = assert_ok!(client.begin().await);
    let first = assert_ok!(client.enqueue_in(&mut session, &request).await);
    let second = assert_ok!(client.enqueue_in(&mut session, &request).await);
    assert!(second.existed);
    assert_eq!(first.id, second.id);

    // An enqueue with the same key waits for the session to finish.
    let concurrent = tokio::spawn({
        let client = client.clone();
        let request = request.clone();
        async move { client.enqueue(&request).await }
    });
    tokio::task::yield_now().await;
    assert!(!concurrent.is_finished());

    assert_ok!(session.rollback().await);

    assert_none!(assert_ok!(client.job(first.id).await));
    let enqueued = assert_ok!(assert_ok!(concurrent.await));
    assert!(!enqueued.existed);
    assert_ne!(enqueued.id, first.id);

    let stats = assert_ok!(client.queue_stats("email").await);
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn enqueue_in_deduplicates_against_committed_jobs() {
    let (client, _) = client();
    let request = EnqueueRequest::builder()
        .queue_name("email")
        .unique_key("report-42")
        .build();
    let existing = assert_ok!(client.enqueue(&request).await);

    let mut session = assert_ok!(client.begin().await);
    let enqueued = assert_ok!(client.enqueue_in(&mut session, &request).await);
    assert!(enqueued.existed);
    assert_eq!(enqueued.id, existing.id);
    assert_ok!(session.commit().await);

    let stats = assert_ok!(client.queue_stats("email").await);
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn ack_fails_once_the_lease_was_taken_over() {
    let (client, clock) = client();
    let metrics = Arc::new(assert_ok!(QueueMetrics::new()));
    let client = client.with_metrics(metrics.clone());
    let id = assert_ok!(client.enqueue(&email("p1")).await).id;

    let stale = assert_some!(claim(&client, "worker-a").await);
    clock.advance(LEASE + Duration::from_secs(1));
    let current = assert_some!(claim(&client, "worker-b").await);

    let error = assert_err!(client.ack_now(&stale, &Value::Null).await);
    assert_matches!(error, DisposeError::LeaseConflict { job_id } if job_id == id);

    let error = assert_err!(client.nack_now(&stale, &retry_now(), &Value::Null).await);
    assert!(error.is_lease_conflict());

    assert_ok!(client.ack_now(&current, &Value::Null).await);

    let conflicts = metrics.lease_conflicts_total.with_label_values(&["email"]);
    assert_eq!(conflicts.get(), 2);
    let completed = metrics.jobs_completed_total.with_label_values(&["email"]);
    assert_eq!(completed.get(), 1);
}

#[tokio::test]
async fn expired_lease_cannot_be_disposed_by_its_owner() {
    let (client, clock) = client();
    assert_ok!(client.enqueue(&email("p1")).await);

    let job = assert_some!(claim(&client, "w1").await);
    clock.advance(LEASE + Duration::from_secs(1));

    let error = assert_err!(client.ack_now(&job, &Value::Null).await);
    assert!(error.is_lease_conflict());
}

#[tokio::test]
async fn ack_after_concurrent_dead_letter_is_a_lease_conflict() {
    let (client, _) = client();
    let request = EnqueueRequest::builder()
        .queue_name("email")
        .max_attempts(1)
        .build();
    let id = assert_ok!(client.enqueue(&request).await).id;
    let job = assert_some!(claim(&client, "w1").await);

    let mut nack_session = assert_ok!(client.begin().await);
    let outcome = assert_ok!(
        client
            .nack(&mut nack_session, &job, &retry_now(), &json!("boom"))
            .await
    );
    assert_eq!(outcome, FailOutcome::DeadLettered { attempts: 1 });

    // The ack has to wait for the row lock held by the nack.
    let ack = tokio::spawn({
        let client = client.clone();
        let job = job.clone();
        async move { client.ack_now(&job, &json!("done")).await }
    });
    tokio::task::yield_now().await;

    assert_ok!(nack_session.commit().await);

    let error = assert_err!(assert_ok!(ack.await));
    assert!(error.is_lease_conflict());

    let history = assert_some!(assert_ok!(client.history(id).await));
    assert_eq!(history.status_final, FinalStatus::DeadLetter);
    assert_eq!(history.result_or_error, json!("boom"));
}

#[tokio::test]
async fn second_disposition_in_one_session_is_a_lease_conflict() {
    let (client, _) = client();
    assert_ok!(client.enqueue(&email("p1")).await);
    let job = assert_some!(claim(&client, "w1").await);

    let mut session = assert_ok!(client.begin().await);
    assert_ok!(client.ack(&mut session, &job, &Value::Null).await);

    let error = assert_err!(client.ack(&mut session, &job, &Value::Null).await);
    assert!(error.is_lease_conflict());
    assert_ok!(session.commit().await);
}

#[tokio::test]
async fn rolled_back_ack_leaves_the_job_leased() {
    let (client, clock) = client();
    let id = assert_ok!(client.enqueue(&email("p1")).await).id;
    let job = assert_some!(claim(&client, "w1").await);

    let mut session = assert_ok!(client.begin().await);
    assert_ok!(client.ack(&mut session, &job, &Value::Null).await);
    assert_ok!(session.rollback().await);

    let current = assert_some!(assert_ok!(client.job(id).await));
    assert_eq!(current.lease_owner.as_deref(), Some("w1"));
    assert_none!(assert_ok!(client.history(id).await));

    // A dropped session is rolled back as well.
    let mut session = assert_ok!(client.begin().await);
    assert_ok!(client.nack(&mut session, &job, &retry_now(), &Value::Null).await);
    drop(session);

    let current = assert_some!(assert_ok!(client.job(id).await));
    assert_eq!(current.attempts, 0);

    // The job is redelivered once the lease lapses.
    clock.advance(LEASE + Duration::from_secs(1));
    assert_some!(claim(&client, "w2").await);
}

#[tokio::test]
async fn requeue_from_history_submits_a_fresh_job() {
    let (client, _) = client();
    let request = EnqueueRequest::builder()
        .queue_name("email")
        .priority(3)
        .unique_key("welcome-7")
        .payload(json!({ "user_id": 7 }))
        .max_attempts(1)
        .build();
    let id = assert_ok!(client.enqueue(&request).await).id;

    let job = assert_some!(claim(&client, "w1").await);
    assert_ok!(client.nack_now(&job, &retry_now(), &json!("boom")).await);
    assert_some!(assert_ok!(client.history(id).await));

    let requeued = assert_some!(assert_ok!(client.requeue_from_history(id, Some(4)).await));
    assert!(!requeued.existed);
    assert_ne!(requeued.id, id);

    let job = assert_some!(assert_ok!(client.job(requeued.id).await));
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 4);
    assert_eq!(job.priority, 3);
    assert_eq!(job.unique_key.as_deref(), Some("welcome-7"));
    assert_eq!(job.payload, json!({ "user_id": 7 }));

    // Requeueing twice while the new job is active is deduplicated.
    let again = assert_some!(assert_ok!(client.requeue_from_history(id, None).await));
    assert!(again.existed);
    assert_eq!(again.id, requeued.id);

    assert_none!(assert_ok!(client.requeue_from_history(9999, None).await));
}

#[tokio::test]
async fn remove_only_deletes_unleased_jobs() {
    let (client, _) = client();
    let first = assert_ok!(client.enqueue(&email("p1")).await).id;
    let second = assert_ok!(client.enqueue(&email("p2")).await).id;

    let leased = assert_some!(claim(&client, "w1").await);
    assert_eq!(leased.id, first);

    assert!(!assert_ok!(client.remove(first).await));
    assert!(assert_ok!(client.remove(second).await));
    assert!(!assert_ok!(client.remove(second).await));

    assert_none!(assert_ok!(client.job(second).await));
    assert_none!(assert_ok!(client.history(second).await));
}

#[tokio::test]
async fn manual_dead_letter_revokes_the_lease() {
    let (client, _) = client();
    let id = assert_ok!(client.enqueue(&email("p1")).await).id;
    let job = assert_some!(claim(&client, "w1").await);

    let reason = json!({ "reason": "poison message" });
    assert!(assert_ok!(client.dead_letter(id, &reason).await));
    assert!(!assert_ok!(client.dead_letter(id, &reason).await));

    let error = assert_err!(client.ack_now(&job, &Value::Null).await);
    assert!(error.is_lease_conflict());

    let history = assert_some!(assert_ok!(client.history(id).await));
    assert_eq!(history.status_final, FinalStatus::DeadLetter);
    assert_eq!(history.result_or_error, reason);
    assert_eq!(history.processed_by, MANUAL_PROCESSOR);
    assert_eq!(history.started_at, job.started_at);
}

#[tokio::test]
async fn listings_and_stats() {
    let (client, clock) = client();

    let pending = assert_ok!(client.enqueue(&email("pending")).await).id;
    let leased = assert_ok!(client.enqueue(&email("leased")).await).id;
    let expired = assert_ok!(client.enqueue(&email("expired")).await).id;
    let completed = assert_ok!(client.enqueue(&email("completed")).await).id;
    let dead = assert_ok!(client.enqueue(&email("dead")).await).id;

    let delayed = EnqueueRequest::builder()
        .queue_name("email")
        .delay(Duration::from_secs(3600))
        .build();
    assert_ok!(client.enqueue(&delayed).await);

    let short = Duration::from_secs(5);
    assert_some!(assert_ok!(client.claim_job(expired, "w1", short).await));
    let job = assert_some!(assert_ok!(client.claim_job(completed, "w1", LEASE).await));
    assert_ok!(client.ack_now(&job, &Value::Null).await);
    assert!(assert_ok!(client.dead_letter(dead, &json!("poison")).await));

    clock.advance(Duration::from_secs(10));
    assert_some!(assert_ok!(client.claim_job(leased, "w1", LEASE).await));

    let stats = assert_ok!(client.queue_stats("email").await);
    assert_compact_json_snapshot!(stats, @r#"{"pending": 1, "delayed": 1, "leased": 1, "expired": 1, "completed": 1, "dead_lettered": 1}"#);

    let jobs = assert_ok!(client.list_jobs("email", 10).await);
    assert_eq!(jobs.len(), 4);
    assert!(jobs.iter().any(|job| job.id == pending));

    let jobs = assert_ok!(client.list_jobs("email", 2).await);
    assert_eq!(jobs.len(), 2);

    let filter = HistoryFilter::builder()
        .queue_name("email")
        .status(FinalStatus::DeadLetter)
        .build();
    let rows = assert_ok!(client.list_history(&filter).await);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, dead);

    let rows = assert_ok!(client.list_history(&HistoryFilter::default()).await);
    let ids = rows.iter().map(|row| row.id).collect::<Vec<_>>();
    assert_eq!(ids, vec![dead, completed]);
}
