//! OTP processor for queue workers.
//!
//! Implements `JobHandler<OtpJob>`: payload validation on decode, one delivery attempt
//! per job. Retry scheduling and acknowledgment belong to the worker.

use crate::config::DeliveryConfig;
use crate::delivery::{DeliveryInvoker, ProcessingResult};
use crate::error::OtpResult;
use crate::models::OtpJob;
use crate::providers::EmailProvider;
use crate::validation::JobValidator;
use async_trait::async_trait;
use queue_worker::{HandlerError, JobHandler, QueueJob};
use std::sync::Arc;
use tracing::info;

pub struct OtpProcessor<P: EmailProvider> {
    validator: JobValidator,
    invoker: DeliveryInvoker<P>,
}

impl<P: EmailProvider> OtpProcessor<P> {
    pub fn new(provider: P, config: DeliveryConfig) -> OtpResult<Self> {
        Self::with_arc_provider(Arc::new(provider), config)
    }

    pub fn with_arc_provider(provider: Arc<P>, config: DeliveryConfig) -> OtpResult<Self> {
        Ok(Self {
            validator: JobValidator::new(),
            invoker: DeliveryInvoker::new(provider, config)?,
        })
    }

    /// Replace the default validator, e.g. to cap `retryCount` at the worker's `max_retries`.
    pub fn with_validator(mut self, validator: JobValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn validator(&self) -> &JobValidator {
        &self.validator
    }

    pub fn provider(&self) -> &Arc<P> {
        self.invoker.provider()
    }

    /// Deliver one job without the queue around it.
    pub async fn deliver(&self, job: &OtpJob) -> ProcessingResult {
        self.invoker.deliver(job.email(), job.otp()).await
    }
}

#[async_trait]
impl<P: EmailProvider> JobHandler<OtpJob> for OtpProcessor<P> {
    fn decode(&self, payload: &[u8]) -> Result<OtpJob, HandlerError> {
        Ok(self.validator.validate(payload)?)
    }

    async fn handle(&self, job: &OtpJob) -> Result<(), HandlerError> {
        info!(
            job_id = %job.job_id(),
            to = %job.email(),
            attempt = job.attempt(),
            "Processing OTP job"
        );

        let result = self.deliver(job).await;
        let processing_time_ms = result.processing_time.as_millis() as u64;

        match result.into_result() {
            Ok(message_id) => {
                info!(
                    job_id = %job.job_id(),
                    message_id = ?message_id,
                    processing_time_ms,
                    "OTP sent"
                );
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    fn name(&self) -> &'static str {
        "otp_processor"
    }

    async fn health_check(&self) -> Result<bool, HandlerError> {
        self.invoker
            .provider()
            .health_check()
            .await
            .map_err(|e| HandlerError::transient(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::providers::{MockEmailProvider, SentEmail};
    use queue_worker::ErrorCategory;

    fn processor(mock: MockEmailProvider) -> OtpProcessor<MockEmailProvider> {
        OtpProcessor::new(mock, DeliveryConfig::new("noreply@example.com")).unwrap()
    }

    fn accepted() -> Result<SentEmail, ProviderError> {
        Ok(SentEmail {
            message_id: Some("m-1".into()),
            accepted: true,
        })
    }

    #[test]
    fn test_decode_maps_validation_to_invalid() {
        let processor = processor(MockEmailProvider::new());

        let err = processor
            .decode(br#"{"email":"a@b.co","otp":"12"}"#)
            .unwrap_err();
        assert!(matches!(err, HandlerError::Invalid(_)));
        assert_eq!(err.category(), ErrorCategory::Permanent);
    }

    #[test]
    fn test_decode_applies_retry_ceiling() {
        let processor = processor(MockEmailProvider::new())
            .with_validator(JobValidator::new().with_retry_ceiling(3));

        assert!(processor
            .decode(br#"{"email":"a@b.co","otp":"1234","retryCount":3}"#)
            .is_ok());
        assert!(matches!(
            processor.decode(br#"{"email":"a@b.co","otp":"1234","retryCount":9}"#),
            Err(HandlerError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_handle_success() {
        let mut mock = MockEmailProvider::new();
        mock.expect_name().return_const("mock");
        mock.expect_send().times(1).returning(|_| accepted());

        let processor = processor(mock);
        let job = OtpJob::new("a@b.co", "1234").unwrap();

        assert!(processor.handle(&job).await.is_ok());
    }

    #[tokio::test]
    async fn test_handle_provider_failure_is_transient() {
        let mut mock = MockEmailProvider::new();
        mock.expect_name().return_const("mock");
        mock.expect_send()
            .times(1)
            .returning(|_| Err(ProviderError::Send("timeout".into())));

        let processor = processor(mock);
        let job = OtpJob::new("a@b.co", "1234").unwrap();

        let err = processor.handle(&job).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Transient);
    }

    #[tokio::test]
    async fn test_health_check_delegates_to_provider() {
        let mut mock = MockEmailProvider::new();
        mock.expect_health_check()
            .times(1)
            .returning(|| Err(ProviderError::Send("down".into())));

        let err = processor(mock).health_check().await.unwrap_err();
        assert!(err.should_retry());
    }
}
