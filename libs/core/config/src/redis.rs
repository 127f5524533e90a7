use crate::{env_optional, env_required, ConfigError, Environment, FromEnv};

/// Connection settings for the Redis server backing the job queue
#[derive(Clone)]
pub struct RedisConfig {
    pub url: String,
    pub password: Option<String>,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            password: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// URL handed to the Redis client.
    ///
    /// A configured password is spliced in as `redis://:<password>@host` unless the URL
    /// already carries credentials.
    pub fn connection_url(&self) -> String {
        let Some(password) = &self.password else {
            return self.url.clone();
        };

        match self.url.split_once("://") {
            Some((scheme, rest)) if !rest.contains('@') => {
                format!("{}://:{}@{}", scheme, password, rest)
            }
            _ => self.url.clone(),
        }
    }
}

// Keep the password out of logs.
impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConfig")
            .field("url", &self.url)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl FromEnv for RedisConfig {
    /// Requires `REDIS_URL`; `REDIS_PASSWORD` is also required when `APP_ENV=production`
    fn from_env() -> Result<Self, ConfigError> {
        let url = env_required("REDIS_URL")?;
        let password = if Environment::from_env().is_production() {
            Some(env_required("REDIS_PASSWORD")?)
        } else {
            env_optional("REDIS_PASSWORD")
        };

        Ok(Self { url, password })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_from_env_success() {
        temp_env::with_vars(
            [
                ("APP_ENV", None),
                ("REDIS_URL", Some("redis://localhost:6379")),
                ("REDIS_PASSWORD", None),
            ],
            || {
                let config = RedisConfig::from_env().unwrap();
                assert_eq!(config.url, "redis://localhost:6379");
                assert!(config.password.is_none());
            },
        );
    }

    #[test]
    fn test_redis_config_from_env_missing_url() {
        temp_env::with_var_unset("REDIS_URL", || {
            let err = RedisConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("REDIS_URL"));
        });
    }

    #[test]
    fn test_redis_password_required_in_production() {
        temp_env::with_vars(
            [
                ("APP_ENV", Some("production")),
                ("REDIS_URL", Some("redis://cache:6379")),
                ("REDIS_PASSWORD", None),
            ],
            || {
                let err = RedisConfig::from_env().unwrap_err();
                assert!(err.to_string().contains("REDIS_PASSWORD"));
            },
        );
    }

    #[test]
    fn test_connection_url_splices_password() {
        let config = RedisConfig::new("redis://cache:6379/0").with_password("s3cret");
        assert_eq!(config.connection_url(), "redis://:s3cret@cache:6379/0");
    }

    #[test]
    fn test_connection_url_keeps_existing_credentials() {
        let config = RedisConfig::new("redis://user:pw@cache:6379").with_password("other");
        assert_eq!(config.connection_url(), "redis://user:pw@cache:6379");
    }

    #[test]
    fn test_debug_hides_password() {
        let config = RedisConfig::new("redis://cache:6379").with_password("s3cret");
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("s3cret"));
    }
}
