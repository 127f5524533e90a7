//! Email provider implementations.
//!
//! `SmtpProvider` sends through any SMTP relay (Mailpit locally); `RecordingProvider`
//! keeps messages in memory and can be scripted to fail.

mod recording;
mod smtp;

pub use recording::RecordingProvider;
pub use smtp::{SmtpConfig, SmtpProvider};

use crate::error::ProviderError;
use async_trait::async_trait;
use std::sync::Arc;

/// A rendered email ready to hand to a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub from_name: String,
    pub from_email: String,
    pub to: String,
    pub subject: String,
    pub html: String,
}

impl OutgoingEmail {
    /// `"Name" <address>` as it appears in the From header
    pub fn from_header(&self) -> String {
        format!("\"{}\" <{}>", self.from_name, self.from_email)
    }
}

/// What the provider reported for a sent email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    /// Provider-specific message ID for tracking.
    pub message_id: Option<String>,
    /// Whether the email was accepted for delivery.
    pub accepted: bool,
}

/// Trait for email sending providers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailProvider: Send + Sync + 'static {
    /// Make exactly one send attempt.
    async fn send(&self, email: &OutgoingEmail) -> Result<SentEmail, ProviderError>;

    /// Get the provider name for logging.
    fn name(&self) -> &'static str;

    /// Check if the provider is reachable.
    async fn health_check(&self) -> Result<bool, ProviderError>;
}

#[async_trait]
impl<P: EmailProvider + ?Sized> EmailProvider for Arc<P> {
    async fn send(&self, email: &OutgoingEmail) -> Result<SentEmail, ProviderError> {
        (**self).send(email).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        (**self).health_check().await
    }
}
