// ABOUTME: Process configuration for the readerlink agent, loaded from environment variables.
// ABOUTME: Covers the data directory and broker connection; runtime settings live in the settings file instead.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_BROKER_HOST: &str = "127.0.0.1";
const DEFAULT_BROKER_PORT: u16 = 1883;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("READERLINK_BROKER_HOST must not be empty")]
    EmptyHost,

    #[error("READERLINK_BROKER_PORT is not a valid port: {0}")]
    InvalidPort(String),

    #[error("READERLINK_CONNECT_TIMEOUT_SECS is not a positive number of seconds: {0}")]
    InvalidTimeout(String),

    #[error("READERLINK_PASSWORD is set but READERLINK_USERNAME is not")]
    PasswordWithoutUsername,
}

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub home: PathBuf,
    pub broker_host: String,
    pub broker_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
}

impl AgentConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - READERLINK_HOME: data directory (default: ~/.readerlink)
    /// - READERLINK_BROKER_HOST: broker host name (default: 127.0.0.1)
    /// - READERLINK_BROKER_PORT: broker port (default: 1883)
    /// - READERLINK_USERNAME: broker user name (optional)
    /// - READERLINK_PASSWORD: broker password (optional, requires a user name)
    /// - READERLINK_CONNECT_TIMEOUT_SECS: bound on one connect attempt (default: 30)
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = std::env::var("READERLINK_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("/tmp"))
                    .join(".readerlink")
            });

        let broker_host = std::env::var("READERLINK_BROKER_HOST")
            .unwrap_or_else(|_| DEFAULT_BROKER_HOST.to_string());
        if broker_host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }

        let broker_port = match std::env::var("READERLINK_BROKER_PORT") {
            Ok(raw) => raw
                .trim()
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or(ConfigError::InvalidPort(raw))?,
            Err(_) => DEFAULT_BROKER_PORT,
        };

        let connect_timeout = match std::env::var("READERLINK_CONNECT_TIMEOUT_SECS") {
            Ok(raw) => raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .ok_or(ConfigError::InvalidTimeout(raw))?,
            Err(_) => Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        };

        let username = std::env::var("READERLINK_USERNAME").ok().filter(|u| !u.is_empty());
        let password = std::env::var("READERLINK_PASSWORD").ok().filter(|p| !p.is_empty());

        if password.is_some() && username.is_none() {
            return Err(ConfigError::PasswordWithoutUsername);
        }

        Ok(Self {
            home,
            broker_host,
            broker_port,
            username,
            password,
            connect_timeout,
        })
    }

    /// Pending record queue.
    pub fn records_path(&self) -> PathBuf {
        self.home.join("records.json")
    }

    /// Runtime settings.
    pub fn settings_path(&self) -> PathBuf {
        self.home.join("settings.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 6] = [
        "READERLINK_HOME",
        "READERLINK_BROKER_HOST",
        "READERLINK_BROKER_PORT",
        "READERLINK_USERNAME",
        "READERLINK_PASSWORD",
        "READERLINK_CONNECT_TIMEOUT_SECS",
    ];

    fn clear_env() {
        // SAFETY: test-only code; every test touching these variables runs inside config_from_env
        unsafe {
            for var in VARS {
                std::env::remove_var(var);
            }
        }
    }

    // One test owns the READERLINK_* variables so parallel tests cannot race on them.
    #[test]
    fn config_from_env() {
        clear_env();
        let config = AgentConfig::from_env().unwrap();
        assert_eq!(config.broker_host, "127.0.0.1");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert!(config.username.is_none());
        assert!(config.home.to_string_lossy().contains(".readerlink"));

        // SAFETY: see clear_env
        unsafe {
            std::env::set_var("READERLINK_HOME", "/var/lib/readerlink");
            std::env::set_var("READERLINK_BROKER_HOST", "broker.local");
            std::env::set_var("READERLINK_BROKER_PORT", "8883");
            std::env::set_var("READERLINK_USERNAME", "gate");
            std::env::set_var("READERLINK_PASSWORD", "secret");
            std::env::set_var("READERLINK_CONNECT_TIMEOUT_SECS", "5");
        }
        let config = AgentConfig::from_env().unwrap();
        assert_eq!(config.broker_host, "broker.local");
        assert_eq!(config.broker_port, 8883);
        assert_eq!(config.username.as_deref(), Some("gate"));
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(
            config.records_path(),
            PathBuf::from("/var/lib/readerlink/records.json")
        );
        assert_eq!(
            config.settings_path(),
            PathBuf::from("/var/lib/readerlink/settings.json")
        );

        // SAFETY: see clear_env
        unsafe {
            std::env::set_var("READERLINK_BROKER_PORT", "not-a-port");
        }
        let err = AgentConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("READERLINK_BROKER_PORT"), "{err}");

        // SAFETY: see clear_env
        unsafe {
            std::env::remove_var("READERLINK_BROKER_PORT");
            std::env::set_var("READERLINK_CONNECT_TIMEOUT_SECS", "0");
        }
        assert!(matches!(
            AgentConfig::from_env(),
            Err(ConfigError::InvalidTimeout(_))
        ));

        // SAFETY: see clear_env
        unsafe {
            std::env::remove_var("READERLINK_CONNECT_TIMEOUT_SECS");
            std::env::remove_var("READERLINK_USERNAME");
        }
        assert!(matches!(
            AgentConfig::from_env(),
            Err(ConfigError::PasswordWithoutUsername)
        ));

        clear_env();
    }
}
