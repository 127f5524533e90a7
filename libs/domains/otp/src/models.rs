//! OTP job record and email data.

use crate::error::ValidationError;
use crate::validation::{generate_job_id, normalize_email, normalize_otp};
use chrono::Utc;
use queue_worker::QueueJob;
use serde::Serialize;
use std::fmt;

/// One OTP email to deliver.
///
/// Construct through `OtpJob::new` or `JobValidator::validate`; both apply the same
/// normalization, so every record in circulation is valid. Fields are private and a
/// retry produces a new record.
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtpJob {
    email: String,
    otp: String,
    retry_count: u32,
    job_id: String,
    timestamp: i64,
}

impl OtpJob {
    /// Validate producer input and build a fresh job with `retryCount = 0`.
    pub fn new(email: &str, otp: &str) -> Result<Self, ValidationError> {
        let now = Utc::now().timestamp_millis();
        Ok(Self {
            email: normalize_email(email)?,
            otp: normalize_otp(otp)?,
            retry_count: 0,
            job_id: generate_job_id(now),
            timestamp: now,
        })
    }

    /// Replace the generated correlation id.
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = job_id.into();
        self
    }

    /// Assemble an already-validated record.
    pub(crate) fn from_validated(
        email: String,
        otp: String,
        retry_count: u32,
        job_id: String,
        timestamp: i64,
    ) -> Self {
        Self {
            email,
            otp,
            retry_count,
            job_id,
            timestamp,
        }
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn otp(&self) -> &str {
        &self.otp
    }

    /// Creation or re-enqueue time in unix milliseconds
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// 1-based number of the attempt this record represents
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

// The code itself stays out of logs
impl fmt::Debug for OtpJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtpJob")
            .field("email", &self.email)
            .field("otp", &"[REDACTED]")
            .field("retry_count", &self.retry_count)
            .field("job_id", &self.job_id)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

impl QueueJob for OtpJob {
    const REDACTED_FIELDS: &'static [&'static str] = &["otp"];

    fn job_id(&self) -> &str {
        &self.job_id
    }

    fn retry_count(&self) -> u32 {
        self.retry_count
    }

    fn with_retry(&self) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1),
            timestamp: Utc::now().timestamp_millis(),
            ..self.clone()
        }
    }
}

/// Data the OTP email template is rendered with.
#[derive(Debug, Clone, Serialize)]
pub struct OtpEmailData {
    pub user_name: String,
    pub otp_code: String,
    pub expiry_minutes: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_normalizes_input() {
        let job = OtpJob::new("  User@Example.COM ", " 123456 ").unwrap();

        assert_eq!(job.email(), "user@example.com");
        assert_eq!(job.otp(), "123456");
        assert_eq!(job.retry_count(), 0);
        assert!(job.job_id().starts_with("job_"));
    }

    #[test]
    fn test_new_rejects_invalid_input() {
        assert!(matches!(
            OtpJob::new("not-an-email", "123456"),
            Err(ValidationError::InvalidEmail(_))
        ));
        assert!(matches!(
            OtpJob::new("a@b.co", "12"),
            Err(ValidationError::InvalidOtp(_))
        ));
    }

    #[test]
    fn test_with_retry_keeps_identity() {
        let job = OtpJob::new("a@b.co", "1234").unwrap().with_job_id("job_fixed");
        let retry = job.with_retry();

        assert_eq!(retry.retry_count(), 1);
        assert_eq!(retry.job_id(), "job_fixed");
        assert_eq!(retry.email(), job.email());
        assert_eq!(retry.otp(), job.otp());
        assert!(retry.timestamp() >= job.timestamp());
        assert_eq!(job.retry_count(), 0);
    }

    #[test]
    fn test_serializes_camel_case() {
        let job = OtpJob::from_validated(
            "a@b.co".into(),
            "1234".into(),
            2,
            "job_1".into(),
            1_700_000_000_000,
        );
        let value: serde_json::Value = serde_json::from_slice(&job.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            serde_json::json!({
                "email": "a@b.co",
                "otp": "1234",
                "retryCount": 2,
                "jobId": "job_1",
                "timestamp": 1_700_000_000_000i64,
            })
        );
    }

    #[test]
    fn test_debug_redacts_otp() {
        let job = OtpJob::new("a@b.co", "987654").unwrap();
        let debug = format!("{:?}", job);
        assert!(!debug.contains("987654"));
        assert!(debug.contains("[REDACTED]"));
    }
}
