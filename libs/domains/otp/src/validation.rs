//! Queue payload validation.
//!
//! Turns raw message bytes into an `OtpJob`. Pure: no I/O, no logging.

use crate::error::ValidationError;
use crate::models::OtpJob;
use chrono::Utc;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

static EMAIL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap());

pub const MIN_OTP_LENGTH: usize = 4;
pub const MAX_OTP_LENGTH: usize = 10;

const JOB_ID_SUFFIX_LENGTH: usize = 9;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Trim, lower-case and check an address.
pub fn normalize_email(raw: &str) -> Result<String, ValidationError> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() {
        return Err(ValidationError::InvalidEmail("email is required".into()));
    }
    if !EMAIL_PATTERN.is_match(&email) {
        return Err(ValidationError::InvalidEmail(format!(
            "'{}' is not a valid address",
            email
        )));
    }
    Ok(email)
}

/// Trim and length-check a code. Length counts characters, not bytes.
pub fn normalize_otp(raw: &str) -> Result<String, ValidationError> {
    let otp = raw.trim();
    let length = otp.chars().count();
    if otp.is_empty() {
        return Err(ValidationError::InvalidOtp("otp is required".into()));
    }
    if !(MIN_OTP_LENGTH..=MAX_OTP_LENGTH).contains(&length) {
        return Err(ValidationError::InvalidOtp(format!(
            "must be between {} and {} characters, got {}",
            MIN_OTP_LENGTH, MAX_OTP_LENGTH, length
        )));
    }
    Ok(otp.to_string())
}

/// `job_<unix-ms>_<9 base36 chars>`
pub fn generate_job_id(now_ms: i64) -> String {
    let suffix: String = (0..JOB_ID_SUFFIX_LENGTH)
        .map(|_| BASE36[(rand::random::<u64>() % BASE36.len() as u64) as usize] as char)
        .collect();
    format!("job_{}_{}", now_ms, suffix)
}

/// Validates queue payloads.
///
/// With a retry ceiling set, a producer cannot smuggle in a `retryCount` above
/// what the worker would ever produce itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobValidator {
    retry_ceiling: Option<u32>,
}

impl JobValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_ceiling(mut self, max_retries: u32) -> Self {
        self.retry_ceiling = Some(max_retries);
        self
    }

    pub fn retry_ceiling(&self) -> Option<u32> {
        self.retry_ceiling
    }

    pub fn validate(&self, payload: &[u8]) -> Result<OtpJob, ValidationError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| ValidationError::MalformedPayload(e.to_string()))?;
        let Value::Object(fields) = value else {
            return Err(ValidationError::MalformedPayload(
                "payload must be a JSON object".into(),
            ));
        };

        let email = match fields.get("email") {
            Some(Value::String(raw)) => normalize_email(raw)?,
            _ => {
                return Err(ValidationError::InvalidEmail(
                    "email is required and must be a string".into(),
                ));
            }
        };

        let otp = match fields.get("otp") {
            Some(Value::String(raw)) => normalize_otp(raw)?,
            _ => {
                return Err(ValidationError::InvalidOtp(
                    "otp is required and must be a string".into(),
                ));
            }
        };

        let retry_count = parse_retry_count(fields.get("retryCount"))?;
        if let Some(ceiling) = self.retry_ceiling {
            if retry_count > ceiling {
                return Err(ValidationError::InvalidRetryCount(format!(
                    "{} exceeds the maximum of {}",
                    retry_count, ceiling
                )));
            }
        }

        let now = Utc::now().timestamp_millis();
        let job_id = job_id_field(&fields).unwrap_or_else(|| generate_job_id(now));
        let timestamp = fields
            .get("timestamp")
            .and_then(Value::as_i64)
            .filter(|ts| *ts > 0)
            .unwrap_or(now);

        Ok(OtpJob::from_validated(
            email,
            otp,
            retry_count,
            job_id,
            timestamp,
        ))
    }
}

/// Absent, null and blank mean 0. Numbers and numeric strings must be
/// non-negative integers.
fn parse_retry_count(value: Option<&Value>) -> Result<u32, ValidationError> {
    let invalid = ValidationError::InvalidRetryCount;

    let count = match value {
        None | Some(Value::Null) => return Ok(0),
        Some(Value::Number(n)) => {
            if let Some(count) = n.as_u64() {
                count
            } else {
                match n.as_f64() {
                    Some(f) if f >= 0.0 && f.fract() == 0.0 && f <= u32::MAX as f64 => f as u64,
                    _ => return Err(invalid(format!("{} is not a non-negative integer", n))),
                }
            }
        }
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(0);
            }
            s.parse::<u64>()
                .map_err(|_| invalid(format!("'{}' is not a non-negative integer", s)))?
        }
        Some(other) => {
            return Err(invalid(format!("unsupported type: {}", other)));
        }
    };

    u32::try_from(count).map_err(|_| invalid(format!("{} is out of range", count)))
}

fn job_id_field(fields: &Map<String, Value>) -> Option<String> {
    match fields.get("jobId")? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queue_worker::QueueJob;
    use serde_json::json;

    fn validate(value: Value) -> Result<OtpJob, ValidationError> {
        JobValidator::new().validate(value.to_string().as_bytes())
    }

    #[test]
    fn test_valid_payload_is_normalized() {
        let job = validate(json!({
            "email": " Alice@Example.com ",
            "otp": " 123456 ",
            "jobId": "job_1",
            "timestamp": 1_700_000_000_000i64,
        }))
        .unwrap();

        assert_eq!(job.email(), "alice@example.com");
        assert_eq!(job.otp(), "123456");
        assert_eq!(job.retry_count(), 0);
        assert_eq!(job.job_id(), "job_1");
        assert_eq!(job.timestamp(), 1_700_000_000_000);
    }

    #[test]
    fn test_missing_job_id_is_generated() {
        let job = validate(json!({ "email": "a@b.co", "otp": "1234" })).unwrap();

        let parts: Vec<&str> = job.job_id().splitn(3, '_').collect();
        assert_eq!(parts[0], "job");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2].chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_malformed_payloads() {
        let validator = JobValidator::new();
        assert!(matches!(
            validator.validate(b"not json"),
            Err(ValidationError::MalformedPayload(_))
        ));
        assert!(matches!(
            validator.validate(b"[1,2]"),
            Err(ValidationError::MalformedPayload(_))
        ));
        assert!(matches!(
            validator.validate(b"null"),
            Err(ValidationError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_email_rules() {
        for email in [json!(null), json!(""), json!(42), json!("a@b"), json!("a b@c.d"), json!("@b.co")] {
            assert!(
                matches!(
                    validate(json!({ "email": email, "otp": "1234" })),
                    Err(ValidationError::InvalidEmail(_))
                ),
                "email {email} should be rejected"
            );
        }
        assert!(matches!(
            validate(json!({ "otp": "1234" })),
            Err(ValidationError::InvalidEmail(_))
        ));
    }

    #[test]
    fn test_otp_length_bounds() {
        assert!(validate(json!({ "email": "a@b.co", "otp": "1234" })).is_ok());
        assert!(validate(json!({ "email": "a@b.co", "otp": "1234567890" })).is_ok());

        for otp in [json!("12"), json!("123"), json!("12345678901"), json!("   "), json!(1234)] {
            assert!(
                matches!(
                    validate(json!({ "email": "a@b.co", "otp": otp })),
                    Err(ValidationError::InvalidOtp(_))
                ),
                "otp {otp} should be rejected"
            );
        }
    }

    #[test]
    fn test_retry_count_coercion() {
        let count = |value: Value| {
            validate(json!({ "email": "a@b.co", "otp": "1234", "retryCount": value }))
                .map(|job| job.retry_count())
        };

        assert_eq!(count(json!(2)).unwrap(), 2);
        assert_eq!(count(json!("3")).unwrap(), 3);
        assert_eq!(count(json!(1.0)).unwrap(), 1);
        assert_eq!(count(json!(null)).unwrap(), 0);
        assert_eq!(count(json!("")).unwrap(), 0);

        for bad in [json!(-1), json!(1.5), json!("abc"), json!(true), json!([1]), json!(u64::MAX)] {
            assert!(
                matches!(count(bad.clone()), Err(ValidationError::InvalidRetryCount(_))),
                "retryCount {bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_retry_ceiling() {
        let validator = JobValidator::new().with_retry_ceiling(3);
        let payload = |n: u32| json!({ "email": "a@b.co", "otp": "1234", "retryCount": n }).to_string();

        assert_eq!(validator.validate(payload(3).as_bytes()).unwrap().retry_count(), 3);
        assert!(matches!(
            validator.validate(payload(4).as_bytes()),
            Err(ValidationError::InvalidRetryCount(_))
        ));
    }

    #[test]
    fn test_serialized_job_validates_to_same_record() {
        let job = OtpJob::new("User@Example.com", "654321").unwrap().with_retry();
        let again = JobValidator::new().validate(&job.to_json().unwrap()).unwrap();
        assert_eq!(again, job);
    }
}
