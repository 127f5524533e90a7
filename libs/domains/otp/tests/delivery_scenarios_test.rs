//! OTP delivery scenarios through the real worker, an in-memory queue and a
//! recording provider.

use domain_otp::{DeliveryConfig, JobValidator, OtpJob, OtpProcessor, OtpQueue, RecordingProvider};
use queue_worker::{
    Delivery, InMemoryTransport, JobProducer, MessageOutcome, QueueJob, QueueTransport,
    QueueWorker, ShutdownHandle, WorkerConfig, REDACTED,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const QUEUE: &str = "notifications";
const DLQ: &str = "notifications:dlq";

struct Harness {
    transport: Arc<InMemoryTransport>,
    provider: Arc<RecordingProvider>,
    worker: Arc<QueueWorker<OtpJob, OtpProcessor<RecordingProvider>, InMemoryTransport>>,
    shutdown: ShutdownHandle,
}

async fn harness(provider: RecordingProvider, config: WorkerConfig) -> Harness {
    let transport = Arc::new(InMemoryTransport::new());
    let provider = Arc::new(provider);
    let processor = OtpProcessor::with_arc_provider(
        provider.clone(),
        DeliveryConfig::new("noreply@example.com"),
    )
    .unwrap()
    .with_validator(JobValidator::new().with_retry_ceiling(config.max_retries));

    let shutdown = ShutdownHandle::new();
    let worker = Arc::new(QueueWorker::new(
        transport.clone(),
        processor,
        config,
        shutdown.clone(),
    ));
    worker.start().await.unwrap();

    Harness {
        transport,
        provider,
        worker,
        shutdown,
    }
}

fn otp_config() -> WorkerConfig {
    WorkerConfig::from_queue_def::<OtpQueue>().with_block_timeout_ms(50)
}

async fn receive_one(transport: &InMemoryTransport) -> Delivery {
    transport
        .receive(QUEUE, 1, Duration::from_millis(50))
        .await
        .unwrap()
        .remove(0)
}

#[tokio::test]
async fn scenario_a_successful_delivery_is_acked() {
    let h = harness(RecordingProvider::new(), otp_config()).await;
    h.transport
        .enqueue_json(QUEUE, &json!({ "email": "User@Example.com", "otp": "482913" }))
        .await;

    let outcome = h.worker.process_delivery(receive_one(&h.transport).await).await;

    assert_eq!(outcome, MessageOutcome::Delivered);
    assert_eq!(h.transport.acked().await.len(), 1);
    assert_eq!(h.worker.scheduler().pending_count().await, 0);

    let sent = h.provider.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "user@example.com");
    assert_eq!(sent[0].from_header(), "\"OTP Service\" <noreply@example.com>");
    assert!(sent[0].html.contains("482913"));
    assert!(sent[0].html.contains("15 minutes"));
}

#[tokio::test(start_paused = true)]
async fn scenario_b_failed_delivery_is_retried_with_backoff() {
    let h = harness(RecordingProvider::failing_first(1), otp_config()).await;
    h.transport
        .enqueue_json(
            QUEUE,
            &json!({ "email": "a@b.co", "otp": "1234", "jobId": "job_b" }),
        )
        .await;

    let outcome = h.worker.process_delivery(receive_one(&h.transport).await).await;

    let MessageOutcome::RetryScheduled {
        next_retry_count,
        delay,
    } = outcome
    else {
        panic!("expected a scheduled retry, got {outcome:?}");
    };
    assert_eq!(next_retry_count, 1);
    assert!(delay >= Duration::from_millis(2000) && delay < Duration::from_millis(2600));
    assert_eq!(h.transport.acked().await.len(), 1);

    // Nothing is re-enqueued before the backoff elapses
    tokio::time::sleep(Duration::from_millis(1999)).await;
    assert!(h.transport.published(QUEUE).await.is_empty());

    tokio::time::sleep(Duration::from_millis(700)).await;
    let published = h.transport.published(QUEUE).await;
    assert_eq!(published.len(), 1);
    assert!(published[0].persistent);

    let retry = published[0].json().unwrap();
    assert_eq!(retry["retryCount"], 1);
    assert_eq!(retry["jobId"], "job_b");
    assert_eq!(retry["email"], "a@b.co");
}

#[tokio::test]
async fn scenario_c_last_attempt_failure_is_abandoned() {
    let h = harness(RecordingProvider::always_failing(), otp_config()).await;
    h.transport
        .enqueue_json(
            QUEUE,
            &json!({ "email": "a@b.co", "otp": "1234", "retryCount": 3, "jobId": "job_c" }),
        )
        .await;

    let outcome = h.worker.process_delivery(receive_one(&h.transport).await).await;

    assert_eq!(outcome, MessageOutcome::RetriesExhausted);
    assert_eq!(h.provider.attempts(), 1);
    assert_eq!(h.transport.acked().await.len(), 1);
    assert_eq!(h.worker.scheduler().pending_count().await, 0);
    assert!(h.transport.published(QUEUE).await.is_empty());

    let dead = h.transport.published(DLQ).await;
    assert_eq!(dead.len(), 1);
    let entry = dead[0].json().unwrap();
    assert_eq!(entry["reason"], "retries_exhausted");
    assert_eq!(entry["job_id"], "job_c");
    assert_eq!(entry["payload"]["email"], "a@b.co");
    assert_eq!(entry["payload"]["otp"], REDACTED);
}

#[tokio::test]
async fn scenario_d_invalid_otp_is_rejected_without_delivery() {
    let h = harness(RecordingProvider::new(), otp_config()).await;
    h.transport
        .enqueue_json(QUEUE, &json!({ "email": "a@b.co", "otp": "12" }))
        .await;

    let outcome = h.worker.process_delivery(receive_one(&h.transport).await).await;

    assert_eq!(outcome, MessageOutcome::Rejected);
    assert_eq!(h.provider.attempts(), 0);
    assert_eq!(h.transport.acked().await.len(), 1);
    assert_eq!(h.worker.scheduler().pending_count().await, 0);
    let entry = h.transport.published(DLQ).await[0].json().unwrap();
    assert_eq!(entry["reason"], "invalid_payload");
    assert_eq!(entry["payload"]["otp"], REDACTED);
}

#[tokio::test]
async fn non_utf8_body_is_rejected_as_malformed() {
    let h = harness(RecordingProvider::new(), otp_config()).await;
    h.transport.enqueue(QUEUE, vec![0xff, 0xfe, 0x00]).await;

    let outcome = h.worker.process_delivery(receive_one(&h.transport).await).await;

    assert_eq!(outcome, MessageOutcome::Rejected);
    assert_eq!(h.provider.attempts(), 0);
    assert_eq!(h.transport.acked().await.len(), 1);
    assert_eq!(
        h.transport.published(DLQ).await[0].json().unwrap()["reason"],
        "invalid_payload"
    );
}

#[tokio::test]
async fn scenario_e_prefetch_one_serializes_deliveries() {
    let provider = RecordingProvider::new().with_delay(Duration::from_millis(40));
    let h = harness(provider, otp_config()).await;
    for otp in ["1111", "2222"] {
        h.transport
            .enqueue_json(QUEUE, &json!({ "email": "a@b.co", "otp": otp }))
            .await;
    }

    let worker = h.worker.clone();
    let run = tokio::spawn(async move { worker.run().await });

    for _ in 0..200 {
        if h.provider.sent_count().await == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    h.shutdown.trigger("test");
    run.await.unwrap().unwrap();

    assert_eq!(h.provider.sent_count().await, 2);
    assert_eq!(h.provider.max_concurrency(), 1);
    assert_eq!(h.transport.max_unacked().await, 1);
}

#[tokio::test]
async fn producer_supplied_retry_count_above_ceiling_is_rejected() {
    let h = harness(RecordingProvider::new(), otp_config()).await;
    h.transport
        .enqueue_json(
            QUEUE,
            &json!({ "email": "a@b.co", "otp": "1234", "retryCount": 50 }),
        )
        .await;

    let outcome = h.worker.process_delivery(receive_one(&h.transport).await).await;

    assert_eq!(outcome, MessageOutcome::Rejected);
    assert_eq!(h.provider.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn flaky_provider_eventually_delivers_through_the_loop() {
    let h = harness(RecordingProvider::failing_first(2), otp_config()).await;
    let producer = JobProducer::new(h.transport.clone(), QUEUE);
    let job = OtpJob::new("a@b.co", "13579").unwrap().with_job_id("job_loop");
    producer.send(&job).await.unwrap();

    let worker = h.worker.clone();
    let run = tokio::spawn(async move { worker.run().await });

    // Retry 1 lands after ~2s, retry 2 after a further ~4s
    tokio::time::sleep(Duration::from_secs(10)).await;
    h.shutdown.trigger("test");
    run.await.unwrap().unwrap();

    assert_eq!(h.provider.attempts(), 3);
    assert_eq!(h.provider.sent_count().await, 1);
    assert_eq!(h.transport.acked().await.len(), 3);

    let retry_counts: Vec<u64> = h
        .transport
        .published(QUEUE)
        .await
        .iter()
        .filter_map(|m| m.json()?["retryCount"].as_u64())
        .collect();
    assert_eq!(retry_counts, vec![0, 1, 2]);
    assert_eq!(job.retry_count(), 0);
}
