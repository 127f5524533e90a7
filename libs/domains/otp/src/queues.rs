//! Queue definitions for OTP delivery.

use queue_worker::QueueDef;

/// The OTP notification queue.
///
/// Issuers publish `OtpJob` JSON here; failed deliveries are re-enqueued to the same
/// queue and terminal failures land in the DLQ.
pub struct OtpQueue;

impl QueueDef for OtpQueue {
    const QUEUE_NAME: &'static str = "notifications";
    const CONSUMER_GROUP: &'static str = "otp_workers";
    const DEAD_LETTER_QUEUE: &'static str = "notifications:dlq";
    const MAX_RETRIES: u32 = 3;
    const BASE_DELAY_MS: u64 = 1000;
    const PREFETCH_COUNT: usize = 1;
}
