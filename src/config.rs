//! Manager configuration
//!
//! Plain data with serde defaults so a partial JSON file only overrides
//! what it names. Always run [`ManagerConfig::validate`] before use;
//! [`ManagerConfig::load`] does it for you.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::error::{ChatError, ConfigError};

/// Which users `Room::userlist` reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserlistMode {
    /// Authors of the most recent messages
    Recent,
    /// Every participant in the roster
    All,
}

/// What to do with an outgoing message longer than `max_length`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BigMessage {
    /// Send only the first `max_length` characters
    Cut,
    /// Send every `max_length` slice as its own message
    Multiple,
}

/// Reconnect backoff bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ReconnectPolicy {
    pub initial_ms: u64,
    pub max_ms: u64,
}

impl ReconnectPolicy {
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    /// Delay following `previous`: doubled, capped at the maximum
    pub fn next(&self, previous: Option<Duration>) -> Duration {
        let max = Duration::from_millis(self.max_ms);
        match previous {
            None => self.initial().min(max),
            Some(prev) => prev.saturating_mul(2).min(max),
        }
    }
}

/// Tunables of a [`RoomManager`](crate::manager::RoomManager)
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Keep-alive interval for rooms and PM, in seconds
    pub ping_delay_secs: u64,
    /// Upper bound on the loop wait while work is pending, in milliseconds
    pub timer_resolution_ms: u64,
    pub userlist_mode: UserlistMode,
    pub userlist_unique: bool,
    /// Number of recent messages scanned in `Recent` mode
    pub userlist_memory: usize,
    /// Suppress join/leave events for extra sessions of the same user
    pub userlist_event_unique: bool,
    pub too_big_message: BigMessage,
    /// Maximum characters per outgoing room message
    pub max_length: usize,
    pub max_history_length: usize,
    pub room_port: u16,
    pub pm_host: String,
    pub pm_port: u16,
    /// Open the PM connection when a password is supplied
    pub enable_pm: bool,
    pub login_url: String,
    /// Bound on the blocking worker pool
    pub worker_threads: usize,
    /// Leave the loop once no connection, task or deferred job is left
    pub stop_when_idle: bool,
    /// Reconnect lost rooms with backoff instead of dropping them
    pub reconnect: Option<ReconnectPolicy>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            ping_delay_secs: 90,
            timer_resolution_ms: 200,
            userlist_mode: UserlistMode::Recent,
            userlist_unique: true,
            userlist_memory: 50,
            userlist_event_unique: false,
            too_big_message: BigMessage::Multiple,
            max_length: 1800,
            max_history_length: 150,
            room_port: 443,
            pm_host: "c1.chatango.com".to_string(),
            pm_port: 5222,
            enable_pm: true,
            login_url: "http://chatango.com/login".to_string(),
            worker_threads: 4,
            stop_when_idle: true,
            reconnect: None,
        }
    }
}

impl ManagerConfig {
    /// Parse a JSON document and validate it
    pub fn from_json_str(json: &str) -> Result<Self, ChatError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON file and validate it
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ChatError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration");
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_length == 0 {
            return Err(ConfigError::ZeroMaxLength);
        }
        if self.max_history_length == 0 {
            return Err(ConfigError::ZeroHistory);
        }
        if self.userlist_memory == 0 {
            return Err(ConfigError::ZeroUserlistMemory);
        }
        if self.enable_pm && self.pm_host.is_empty() {
            return Err(ConfigError::EmptyPmHost);
        }
        if self.ping_delay_secs == 0 {
            return Err(ConfigError::ZeroPingDelay);
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if let Some(policy) = self.reconnect {
            if policy.initial_ms == 0 || policy.max_ms < policy.initial_ms {
                return Err(ConfigError::InvalidBackoff {
                    initial_ms: policy.initial_ms,
                    max_ms: policy.max_ms,
                });
            }
        }
        Ok(())
    }

    pub fn ping_delay(&self) -> Duration {
        Duration::from_secs(self.ping_delay_secs)
    }

    pub fn timer_resolution(&self) -> Duration {
        Duration::from_millis(self.timer_resolution_ms)
    }
}

/// Account used to join rooms and open the PM connection
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub name: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Empty strings count as absent
    pub fn new(name: Option<String>, password: Option<String>) -> Self {
        Self {
            name: name.filter(|s| !s.is_empty()),
            password: password.filter(|s| !s.is_empty()),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("name", &self.name)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ManagerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ping_delay(), Duration::from_secs(90));
        assert_eq!(config.timer_resolution(), Duration::from_millis(200));
        assert_eq!(config.max_history_length, 150);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ManagerConfig::from_json_str(
            r#"{"max_length": 300, "too_big_message": "cut", "userlist_mode": "all"}"#,
        )
        .unwrap();
        assert_eq!(config.max_length, 300);
        assert_eq!(config.too_big_message, BigMessage::Cut);
        assert_eq!(config.userlist_mode, UserlistMode::All);
        assert_eq!(config.pm_port, 5222);
    }

    #[test]
    fn test_unknown_policy_is_rejected() {
        let err = ManagerConfig::from_json_str(r#"{"too_big_message": "drop"}"#).unwrap_err();
        assert!(matches!(err, ChatError::Json(_)));
    }

    #[test]
    fn test_zero_max_length_is_rejected() {
        let err = ManagerConfig::from_json_str(r#"{"max_length": 0}"#).unwrap_err();
        assert!(matches!(err, ChatError::Config(ConfigError::ZeroMaxLength)));
    }

    #[test]
    fn test_backoff_validation() {
        let mut config = ManagerConfig {
            reconnect: Some(ReconnectPolicy {
                initial_ms: 500,
                max_ms: 100,
            }),
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBackoff {
                initial_ms: 500,
                max_ms: 100
            })
        );
        config.reconnect = Some(ReconnectPolicy {
            initial_ms: 100,
            max_ms: 500,
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let policy = ReconnectPolicy {
            initial_ms: 100,
            max_ms: 350,
        };
        let first = policy.next(None);
        let second = policy.next(Some(first));
        let third = policy.next(Some(second));
        assert_eq!(first, Duration::from_millis(100));
        assert_eq!(second, Duration::from_millis(200));
        assert_eq!(third, Duration::from_millis(350));
        assert_eq!(policy.next(Some(third)), Duration::from_millis(350));
        assert_eq!(policy.next(Some(Duration::MAX)), Duration::from_millis(350));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"ping_delay_secs": 20, "stop_when_idle": false}}"#).unwrap();
        let config = ManagerConfig::load(file.path()).unwrap();
        assert_eq!(config.ping_delay_secs, 20);
        assert!(!config.stop_when_idle);
    }

    #[test]
    fn test_credentials_treat_empty_as_absent() {
        let creds = Credentials::new(Some(String::new()), Some("pw".into()));
        assert_eq!(creds.name, None);
        assert_eq!(creds.password.as_deref(), Some("pw"));
        assert!(!format!("{creds:?}").contains("pw"));
    }
}
