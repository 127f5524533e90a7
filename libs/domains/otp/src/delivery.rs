//! One OTP delivery attempt: render, send, time it.

use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, OtpResult};
use crate::models::OtpEmailData;
use crate::providers::{EmailProvider, OutgoingEmail};
use crate::templates::OtpTemplates;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingResult {
    pub success: bool,
    pub error: Option<DeliveryError>,
    pub processing_time: Duration,
    pub message_id: Option<String>,
}

impl ProcessingResult {
    fn succeeded(message_id: Option<String>, processing_time: Duration) -> Self {
        Self {
            success: true,
            error: None,
            processing_time,
            message_id,
        }
    }

    fn failed(error: DeliveryError, processing_time: Duration) -> Self {
        Self {
            success: false,
            error: Some(error),
            processing_time,
            message_id: None,
        }
    }

    pub fn into_result(self) -> Result<Option<String>, DeliveryError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.message_id),
        }
    }
}

/// Renders the OTP email and makes exactly one send attempt through the provider.
pub struct DeliveryInvoker<P: EmailProvider> {
    provider: Arc<P>,
    templates: OtpTemplates,
    config: DeliveryConfig,
}

impl<P: EmailProvider> DeliveryInvoker<P> {
    pub fn new(provider: Arc<P>, config: DeliveryConfig) -> OtpResult<Self> {
        Ok(Self {
            provider,
            templates: OtpTemplates::new()?,
            config,
        })
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub async fn deliver(&self, email: &str, otp: &str) -> ProcessingResult {
        let started = Instant::now();

        match self.attempt(email, otp).await {
            Ok(message_id) => {
                debug!(
                    to = %email,
                    message_id = ?message_id,
                    provider = self.provider.name(),
                    "OTP email sent"
                );
                ProcessingResult::succeeded(message_id, started.elapsed())
            }
            Err(error) => {
                warn!(
                    to = %email,
                    provider = self.provider.name(),
                    error = %error,
                    "OTP email delivery failed"
                );
                ProcessingResult::failed(error, started.elapsed())
            }
        }
    }

    async fn attempt(&self, email: &str, otp: &str) -> Result<Option<String>, DeliveryError> {
        let rendered = self.templates.render_otp(&OtpEmailData {
            user_name: email.to_string(),
            otp_code: otp.to_string(),
            expiry_minutes: self.config.expiry_minutes,
        })?;

        let outgoing = OutgoingEmail {
            from_name: self.config.sender_name.clone(),
            from_email: self.config.sender_email.clone(),
            to: email.to_string(),
            subject: rendered.subject,
            html: rendered.html,
        };

        let sent = self.provider.send(&outgoing).await?;
        if !sent.accepted {
            return Err(DeliveryError::Rejected {
                message_id: sent.message_id,
            });
        }
        Ok(sent.message_id)
    }
}
