//! Sender identity and OTP email settings.

use core_config::{ConfigError, FromEnv, env_or_default, env_parse, env_required};
use lettre::Address;

pub const DEFAULT_SENDER_NAME: &str = "OTP Service";
pub const DEFAULT_EXPIRY_MINUTES: u32 = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryConfig {
    pub sender_email: String,
    pub sender_name: String,
    /// Shown in the email; the code's real lifetime is enforced by the issuer
    pub expiry_minutes: u32,
}

impl DeliveryConfig {
    pub fn new(sender_email: impl Into<String>) -> Self {
        Self {
            sender_email: sender_email.into(),
            sender_name: DEFAULT_SENDER_NAME.to_string(),
            expiry_minutes: DEFAULT_EXPIRY_MINUTES,
        }
    }

    pub fn with_sender_name(mut self, name: impl Into<String>) -> Self {
        self.sender_name = name.into();
        self
    }

    pub fn with_expiry_minutes(mut self, minutes: u32) -> Self {
        self.expiry_minutes = minutes;
        self
    }
}

impl FromEnv for DeliveryConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let sender_email = env_required("SENDER_EMAIL")?;
        sender_email
            .parse::<Address>()
            .map_err(|e| ConfigError::parse("SENDER_EMAIL", e.to_string()))?;

        Ok(Self {
            sender_email,
            sender_name: env_or_default("SENDER_NAME", DEFAULT_SENDER_NAME),
            expiry_minutes: env_parse("OTP_EXPIRY_MINUTES", DEFAULT_EXPIRY_MINUTES)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_env_requires_sender_email() {
        temp_env::with_var_unset("SENDER_EMAIL", || {
            assert!(matches!(
                DeliveryConfig::from_env(),
                Err(ConfigError::MissingEnvVar(_))
            ));
        });
    }

    #[test]
    fn test_from_env_defaults() {
        temp_env::with_vars(
            [
                ("SENDER_EMAIL", Some("noreply@example.com")),
                ("SENDER_NAME", None),
                ("OTP_EXPIRY_MINUTES", None),
            ],
            || {
                let config = DeliveryConfig::from_env().unwrap();
                assert_eq!(config, DeliveryConfig::new("noreply@example.com"));
                assert_eq!(config.sender_name, "OTP Service");
                assert_eq!(config.expiry_minutes, 15);
            },
        );
    }

    #[test]
    fn test_from_env_rejects_bad_sender() {
        temp_env::with_var("SENDER_EMAIL", Some("not-an-address"), || {
            assert!(matches!(
                DeliveryConfig::from_env(),
                Err(ConfigError::ParseError { .. })
            ));
        });
    }
}
