//! SMTP email provider implementation using lettre.
//!
//! Without TLS it talks plain SMTP, which is what Mailpit/MailHog expect locally.

use super::{EmailProvider, OutgoingEmail, SentEmail};
use crate::error::ProviderError;
use async_trait::async_trait;
use core_config::{ConfigError, FromEnv, env_flag, env_optional, env_or_default, env_parse};
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use std::fmt;
use tracing::{debug, error, info};

/// SMTP configuration.
#[derive(Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    /// Optional for dev servers like Mailpit.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Whether to use TLS (false for local dev servers).
    pub use_tls: bool,
}

impl SmtpConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            use_tls: false,
        }
    }

    /// localhost:1025, no auth, no TLS
    pub fn mailpit() -> Self {
        Self::new("localhost", 1025)
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.username = Some(username);
        self.password = Some(password);
        self
    }

    fn credentials(&self) -> Option<Credentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                Some(Credentials::new(username.clone(), password.clone()))
            }
            _ => None,
        }
    }
}

impl fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

impl FromEnv for SmtpConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_or_default("SMTP_HOST", "localhost"),
            port: env_parse("SMTP_PORT", 1025u16)?,
            username: env_optional("SMTP_USERNAME"),
            password: env_optional("SMTP_PASSWORD"),
            use_tls: env_flag("SMTP_USE_TLS", false),
        })
    }
}

/// SMTP email provider.
pub struct SmtpProvider {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    config: SmtpConfig,
}

impl SmtpProvider {
    pub fn new(config: SmtpConfig) -> Result<Self, ProviderError> {
        let transport = Self::build_transport(&config)?;
        info!(
            host = %config.host,
            port = config.port,
            tls = config.use_tls,
            authenticated = config.username.is_some(),
            "SMTP provider configured"
        );
        Ok(Self { transport, config })
    }

    fn build_transport(
        config: &SmtpConfig,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, ProviderError> {
        let transport = if config.use_tls {
            let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| ProviderError::Config(format!("Failed to create SMTP relay: {}", e)))?
                .port(config.port);
            if let Some(credentials) = config.credentials() {
                builder = builder.credentials(credentials);
            }
            builder.build()
        } else {
            let mut builder =
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
                    .port(config.port);
            if let Some(credentials) = config.credentials() {
                builder = builder.credentials(credentials);
            }
            builder.build()
        };

        Ok(transport)
    }

    fn build_message(email: &OutgoingEmail) -> Result<Message, ProviderError> {
        let from_address = email.from_email.parse().map_err(|e| {
            ProviderError::InvalidAddress(format!("from '{}': {}", email.from_email, e))
        })?;
        let from = Mailbox::new(Some(email.from_name.clone()), from_address);

        let to: Mailbox = email
            .to
            .parse()
            .map_err(|e| ProviderError::InvalidAddress(format!("to '{}': {}", email.to, e)))?;

        Message::builder()
            .from(from)
            .to(to)
            .subject(&email.subject)
            .header(ContentType::TEXT_HTML)
            .body(email.html.clone())
            .map_err(|e| ProviderError::Message(e.to_string()))
    }
}

#[async_trait]
impl EmailProvider for SmtpProvider {
    async fn send(&self, email: &OutgoingEmail) -> Result<SentEmail, ProviderError> {
        debug!(
            to = %email.to,
            subject = %email.subject,
            host = %self.config.host,
            port = self.config.port,
            "Sending email via SMTP"
        );

        let message = Self::build_message(email)?;

        let response = self.transport.send(message).await.map_err(|e| {
            error!(to = %email.to, error = %e, "Failed to send email via SMTP");
            ProviderError::Send(e.to_string())
        })?;

        let message_id = response.message().next().map(|s| s.to_string());

        Ok(SentEmail {
            message_id,
            accepted: response.is_positive(),
        })
    }

    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        self.transport
            .test_connection()
            .await
            .map_err(|e| ProviderError::Send(format!("SMTP health check failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email() -> OutgoingEmail {
        OutgoingEmail {
            from_name: "OTP Service".into(),
            from_email: "noreply@example.com".into(),
            to: "user@example.com".into(),
            subject: "Your code".into(),
            html: "<p>1234</p>".into(),
        }
    }

    #[test]
    fn test_smtp_config_from_env_defaults() {
        temp_env::with_vars(
            [
                ("SMTP_HOST", None::<&str>),
                ("SMTP_PORT", None),
                ("SMTP_USERNAME", None),
                ("SMTP_PASSWORD", None),
                ("SMTP_USE_TLS", None),
            ],
            || {
                let config = SmtpConfig::from_env().unwrap();
                assert_eq!(config.host, "localhost");
                assert_eq!(config.port, 1025);
                assert!(config.username.is_none());
                assert!(!config.use_tls);
            },
        );
    }

    #[test]
    fn test_smtp_config_from_env_overrides() {
        temp_env::with_vars(
            [
                ("SMTP_HOST", Some("smtp.example.com")),
                ("SMTP_PORT", Some("587")),
                ("SMTP_USERNAME", Some("mailer")),
                ("SMTP_PASSWORD", Some("s3cret")),
                ("SMTP_USE_TLS", Some("true")),
            ],
            || {
                let config = SmtpConfig::from_env().unwrap();
                assert_eq!(config.host, "smtp.example.com");
                assert_eq!(config.port, 587);
                assert_eq!(config.username.as_deref(), Some("mailer"));
                assert!(config.use_tls);
                assert!(!format!("{:?}", config).contains("s3cret"));
            },
        );
    }

    #[test]
    fn test_smtp_config_rejects_bad_port() {
        temp_env::with_var("SMTP_PORT", Some("not-a-port"), || {
            assert!(SmtpConfig::from_env().is_err());
        });
    }

    #[test]
    fn test_build_message_headers() {
        let message = SmtpProvider::build_message(&email()).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();

        assert!(raw.contains("OTP Service"));
        assert!(raw.contains("<noreply@example.com>"));
        assert!(raw.contains("To: user@example.com"));
        assert!(raw.contains("Subject: Your code"));
        assert!(raw.contains("Content-Type: text/html"));
    }

    #[test]
    fn test_build_message_rejects_bad_recipient() {
        let mut bad = email();
        bad.to = "not an address".into();
        assert!(matches!(
            SmtpProvider::build_message(&bad),
            Err(ProviderError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_provider_builds_without_connecting() {
        let provider = SmtpProvider::new(SmtpConfig::mailpit()).unwrap();
        assert_eq!(provider.name(), "smtp");
    }
}
