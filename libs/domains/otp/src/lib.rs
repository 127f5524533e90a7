//! OTP Domain
//!
//! Delivery of one-time-password emails pulled from a queue.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   OTP issuer    │  ← JobProducer::send(&OtpJob::new(email, otp)?)
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │  notifications  │  ← Redis Stream
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   QueueWorker   │  ← ack/nack, retries, DLQ
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │  OtpProcessor   │  ← JobValidator + DeliveryInvoker
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │ Email Provider  │  ← SMTP
//! └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use domain_otp::{DeliveryConfig, OtpProcessor, OtpQueue, SmtpConfig, SmtpProvider};
//!
//! let provider = SmtpProvider::new(SmtpConfig::from_env()?)?;
//! let processor = OtpProcessor::new(provider, DeliveryConfig::from_env()?)?;
//! let worker = QueueWorker::new(transport, processor, config, ShutdownHandle::new());
//! ```

pub mod config;
pub mod delivery;
pub mod error;
pub mod models;
pub mod processor;
pub mod providers;
pub mod queues;
pub mod templates;
pub mod validation;

pub use config::DeliveryConfig;
pub use delivery::{DeliveryInvoker, ProcessingResult};
pub use error::{DeliveryError, OtpError, OtpResult, ProviderError, ValidationError};
pub use models::{OtpEmailData, OtpJob};
pub use processor::OtpProcessor;
pub use providers::{
    EmailProvider, OutgoingEmail, RecordingProvider, SentEmail, SmtpConfig, SmtpProvider,
};
pub use queues::OtpQueue;
pub use templates::{OtpTemplates, RenderedEmail};
pub use validation::JobValidator;
