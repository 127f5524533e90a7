//! Error types for the OTP domain.

use core_config::ConfigError;
use queue_worker::HandlerError;
use thiserror::Error;

/// Result type for OTP operations.
pub type OtpResult<T> = Result<T, OtpError>;

/// Why a queue payload could not become an `OtpJob`. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Invalid email: {0}")]
    InvalidEmail(String),

    #[error("Invalid OTP: {0}")]
    InvalidOtp(String),

    #[error("Invalid retryCount: {0}")]
    InvalidRetryCount(String),
}

/// Errors raised by an email provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Failed to build email message: {0}")]
    Message(String),

    #[error("SMTP send failed: {0}")]
    Send(String),

    #[error("Provider configuration error: {0}")]
    Config(String),
}

/// A single delivery attempt that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Provider failed; worth another attempt
    #[error("Email provider error: {0}")]
    Provider(String),

    /// Provider answered but did not accept the message
    #[error("Email not accepted by provider (message_id: {message_id:?})")]
    Rejected { message_id: Option<String> },

    /// Email could not be rendered
    #[error("Template rendering failed: {0}")]
    Template(String),
}

impl DeliveryError {
    /// Provider trouble is transient; a broken template is not something a retry fixes.
    pub fn is_transient(&self) -> bool {
        !matches!(self, DeliveryError::Template(_))
    }
}

impl From<ProviderError> for DeliveryError {
    fn from(err: ProviderError) -> Self {
        DeliveryError::Provider(err.to_string())
    }
}

/// Top-level domain error.
#[derive(Debug, Error)]
pub enum OtpError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Template error: {0}")]
    Template(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<handlebars::TemplateError> for OtpError {
    fn from(err: handlebars::TemplateError) -> Self {
        OtpError::Template(err.to_string())
    }
}

impl From<ValidationError> for HandlerError {
    fn from(err: ValidationError) -> Self {
        HandlerError::invalid(err.to_string())
    }
}

impl From<DeliveryError> for HandlerError {
    fn from(err: DeliveryError) -> Self {
        if err.is_transient() {
            HandlerError::transient(err.to_string())
        } else {
            HandlerError::unexpected(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queue_worker::ErrorCategory;

    #[test]
    fn test_validation_errors_are_permanent() {
        let err: HandlerError = ValidationError::InvalidOtp("too short".into()).into();
        assert_eq!(err.category(), ErrorCategory::Permanent);
        assert!(!err.should_retry());
    }

    #[test]
    fn test_delivery_error_categories() {
        let provider: HandlerError = DeliveryError::Provider("timeout".into()).into();
        assert_eq!(provider.category(), ErrorCategory::Transient);

        let rejected: HandlerError = DeliveryError::Rejected { message_id: None }.into();
        assert_eq!(rejected.category(), ErrorCategory::Transient);

        let template: HandlerError = DeliveryError::Template("missing field".into()).into();
        assert_eq!(template.category(), ErrorCategory::Unexpected);
    }

    #[test]
    fn test_provider_error_converts_to_delivery_error() {
        let err: DeliveryError = ProviderError::Send("connection refused".into()).into();
        assert_eq!(
            err,
            DeliveryError::Provider("SMTP send failed: connection refused".into())
        );
    }
}
