//! Service configuration loaded from the environment.

use std::env;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::scheduler::DEFAULT_POLL_INTERVAL;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// SQLite database holding messages and credentials.
    pub database_path: PathBuf,
    /// Master key for the token vault.
    pub encryption_key: String,
    pub slack_client_id: String,
    pub slack_client_secret: String,
    /// Alternate Slack API root, mainly for local testing.
    pub slack_api_base_url: Option<String>,
    pub poll_interval: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let encryption_key = require_env("ENCRYPTION_KEY")?;
        let slack_client_id = require_env("SLACK_CLIENT_ID")?;
        let slack_client_secret = require_env("SLACK_CLIENT_SECRET")?;
        let database_path = resolve_path(
            env::var("DATABASE_PATH").unwrap_or_else(|_| "state/messages.db".to_string()),
        )?;
        let poll_interval = env::var("SCHEDULER_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        let slack_api_base_url = env_var_non_empty("SLACK_API_BASE_URL");

        Ok(Self {
            database_path,
            encryption_key,
            slack_client_id,
            slack_client_secret,
            slack_api_base_url,
            poll_interval,
        })
    }
}

fn require_env(key: &'static str) -> Result<String, ConfigError> {
    env_var_non_empty(key).ok_or(ConfigError::Missing(key))
}

fn env_var_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_path(raw: String) -> Result<PathBuf, io::Error> {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        Ok(path)
    } else {
        let cwd = env::current_dir()?;
        Ok(cwd.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        key: &'static str,
        previous: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let previous = env::var(key).ok();
            env::set_var(key, value);
            Self { key, previous }
        }

        fn unset(key: &'static str) -> Self {
            let previous = env::var(key).ok();
            env::remove_var(key);
            Self { key, previous }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.previous {
                Some(value) => env::set_var(self.key, value),
                None => env::remove_var(self.key),
            }
        }
    }

    #[test]
    fn from_env_reads_required_and_optional_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _key = EnvGuard::set("ENCRYPTION_KEY", "master-key");
        let _id = EnvGuard::set("SLACK_CLIENT_ID", "client-id");
        let _secret = EnvGuard::set("SLACK_CLIENT_SECRET", "client-secret");
        let _db = EnvGuard::set("DATABASE_PATH", "/tmp/scheduler-test/messages.db");
        let _interval = EnvGuard::set("SCHEDULER_POLL_INTERVAL_SECS", "5");
        let _base = EnvGuard::set("SLACK_API_BASE_URL", "http://127.0.0.1:9999");

        let config = ServiceConfig::from_env().expect("config");
        assert_eq!(config.encryption_key, "master-key");
        assert_eq!(config.database_path, PathBuf::from("/tmp/scheduler-test/messages.db"));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.slack_api_base_url.as_deref(), Some("http://127.0.0.1:9999"));
    }

    #[test]
    fn missing_encryption_key_is_fatal() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _key = EnvGuard::unset("ENCRYPTION_KEY");
        let _id = EnvGuard::set("SLACK_CLIENT_ID", "client-id");
        let _secret = EnvGuard::set("SLACK_CLIENT_SECRET", "client-secret");

        let err = ServiceConfig::from_env().expect_err("should fail");
        assert!(matches!(err, ConfigError::Missing("ENCRYPTION_KEY")));
    }

    #[test]
    fn blank_provider_credentials_are_fatal() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _key = EnvGuard::set("ENCRYPTION_KEY", "master-key");
        let _id = EnvGuard::set("SLACK_CLIENT_ID", "   ");
        let _secret = EnvGuard::set("SLACK_CLIENT_SECRET", "client-secret");

        let err = ServiceConfig::from_env().expect_err("should fail");
        assert!(matches!(err, ConfigError::Missing("SLACK_CLIENT_ID")));
    }

    #[test]
    fn poll_interval_defaults_to_one_minute() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _key = EnvGuard::set("ENCRYPTION_KEY", "master-key");
        let _id = EnvGuard::set("SLACK_CLIENT_ID", "client-id");
        let _secret = EnvGuard::set("SLACK_CLIENT_SECRET", "client-secret");
        let _interval = EnvGuard::unset("SCHEDULER_POLL_INTERVAL_SECS");
        let _base = EnvGuard::unset("SLACK_API_BASE_URL");

        let config = ServiceConfig::from_env().expect("config");
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert!(config.slack_api_base_url.is_none());
    }
}
