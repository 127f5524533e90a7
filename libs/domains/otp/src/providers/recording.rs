//! In-memory provider that records what it was asked to send.

use super::{EmailProvider, OutgoingEmail, SentEmail};
use crate::error::ProviderError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

/// Captures sent emails and can be scripted to fail or reject.
#[derive(Debug, Default)]
pub struct RecordingProvider {
    sent: Mutex<Vec<OutgoingEmail>>,
    attempts: AtomicUsize,
    failures_left: AtomicUsize,
    always_fail: AtomicBool,
    reject: AtomicBool,
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl RecordingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `n` attempts, then succeed.
    pub fn failing_first(n: usize) -> Self {
        let provider = Self::new();
        provider.failures_left.store(n, Ordering::SeqCst);
        provider
    }

    pub fn always_failing() -> Self {
        let provider = Self::new();
        provider.always_fail.store(true, Ordering::SeqCst);
        provider
    }

    /// Answer every send with `accepted = false`.
    pub fn rejecting() -> Self {
        let provider = Self::new();
        provider.reject.store(true, Ordering::SeqCst);
        provider
    }

    /// Hold every send for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_always_fail(&self, fail: bool) {
        self.always_fail.store(fail, Ordering::SeqCst);
    }

    /// Successfully sent emails, in order
    pub async fn sent(&self) -> Vec<OutgoingEmail> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }

    pub async fn was_sent_to(&self, address: &str) -> bool {
        self.sent.lock().await.iter().any(|e| e.to == address)
    }

    /// Every call to `send`, successful or not
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Highest number of sends in progress at once
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        if self.always_fail.load(Ordering::SeqCst) {
            return true;
        }
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EmailProvider for RecordingProvider {
    async fn send(&self, email: &OutgoingEmail) -> Result<SentEmail, ProviderError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = if self.take_failure() {
            Err(ProviderError::Send(format!(
                "simulated failure on attempt {}",
                attempt
            )))
        } else if self.reject.load(Ordering::SeqCst) {
            Ok(SentEmail {
                message_id: None,
                accepted: false,
            })
        } else {
            self.sent.lock().await.push(email.clone());
            Ok(SentEmail {
                message_id: Some(format!("recorded-{}", attempt)),
                accepted: true,
            })
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn name(&self) -> &'static str {
        "recording"
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        Ok(!self.always_fail.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email(to: &str) -> OutgoingEmail {
        OutgoingEmail {
            from_name: "OTP Service".into(),
            from_email: "noreply@example.com".into(),
            to: to.into(),
            subject: "code".into(),
            html: "<p>1234</p>".into(),
        }
    }

    #[tokio::test]
    async fn test_records_successful_sends() {
        let provider = RecordingProvider::new();
        let sent = provider.send(&email("a@b.co")).await.unwrap();

        assert!(sent.accepted);
        assert_eq!(sent.message_id.as_deref(), Some("recorded-1"));
        assert!(provider.was_sent_to("a@b.co").await);
        assert_eq!(provider.attempts(), 1);
    }

    #[tokio::test]
    async fn test_failing_first_then_succeeds() {
        let provider = RecordingProvider::failing_first(2);

        assert!(provider.send(&email("a@b.co")).await.is_err());
        assert!(provider.send(&email("a@b.co")).await.is_err());
        assert!(provider.send(&email("a@b.co")).await.is_ok());

        assert_eq!(provider.attempts(), 3);
        assert_eq!(provider.sent_count().await, 1);
    }

    #[tokio::test]
    async fn test_rejecting_reports_not_accepted() {
        let provider = RecordingProvider::rejecting();
        let sent = provider.send(&email("a@b.co")).await.unwrap();

        assert!(!sent.accepted);
        assert_eq!(provider.sent_count().await, 0);
    }
}
