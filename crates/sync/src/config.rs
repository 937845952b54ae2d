//! Session configuration loaded from `JOBSYNC_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

/// Default poll supervisor interval.
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Default age after which settled records are pruned.
const DEFAULT_SETTLED_RETENTION_SECS: u64 = 3600;

/// Default per-task wait during shutdown.
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Default limit on a push channel handshake.
const DEFAULT_OPEN_TIMEOUT_SECS: u64 = 10;

/// Session configuration.
///
/// All fields have defaults suitable for local development. Load from the
/// environment with [`SyncConfig::from_env`], or start from
/// [`SyncConfig::default`] and override with the `with_*` methods.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Status fetch and submission base URL.
    pub api_url: String,
    /// Push channel base URL.
    pub ws_url: String,
    /// Bearer credential for channels and API calls.
    pub auth_token: Option<String>,
    /// Enables batched status fetches and discovery of in-flight jobs.
    pub user_id: Option<String>,
    /// Poll supervisor interval.
    pub poll_interval: Duration,
    /// Age after which settled records are pruned.
    pub settled_retention: Duration,
    /// Per-task wait during shutdown.
    pub shutdown_timeout: Duration,
    /// Handshake limit before a channel's job falls back to polling.
    pub open_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:3000".into(),
            ws_url: "ws://localhost:3000".into(),
            auth_token: None,
            user_id: None,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            settled_retention: Duration::from_secs(DEFAULT_SETTLED_RETENTION_SECS),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            open_timeout: Duration::from_secs(DEFAULT_OPEN_TIMEOUT_SECS),
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                          | Default                 |
    /// |----------------------------------|-------------------------|
    /// | `JOBSYNC_API_URL`                | `http://localhost:3000` |
    /// | `JOBSYNC_WS_URL`                 | `ws://localhost:3000`   |
    /// | `JOBSYNC_AUTH_TOKEN`             | --                      |
    /// | `JOBSYNC_USER_ID`                | --                      |
    /// | `JOBSYNC_POLL_INTERVAL_SECS`     | `5`                     |
    /// | `JOBSYNC_SETTLED_RETENTION_SECS` | `3600`                  |
    /// | `JOBSYNC_SHUTDOWN_TIMEOUT_SECS`  | `5`                     |
    /// | `JOBSYNC_OPEN_TIMEOUT_SECS`      | `10`                    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let poll_interval_secs: u64 =
            parse_var(&get, "JOBSYNC_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?;
        if poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "JOBSYNC_POLL_INTERVAL_SECS",
                value: "0".into(),
            });
        }

        let open_timeout_secs: u64 =
            parse_var(&get, "JOBSYNC_OPEN_TIMEOUT_SECS", DEFAULT_OPEN_TIMEOUT_SECS)?;
        if open_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "JOBSYNC_OPEN_TIMEOUT_SECS",
                value: "0".into(),
            });
        }

        Ok(Self {
            api_url: get("JOBSYNC_API_URL").unwrap_or(defaults.api_url),
            ws_url: get("JOBSYNC_WS_URL").unwrap_or(defaults.ws_url),
            auth_token: get("JOBSYNC_AUTH_TOKEN"),
            user_id: get("JOBSYNC_USER_ID"),
            poll_interval: Duration::from_secs(poll_interval_secs),
            settled_retention: Duration::from_secs(parse_var(
                &get,
                "JOBSYNC_SETTLED_RETENTION_SECS",
                DEFAULT_SETTLED_RETENTION_SECS,
            )?),
            shutdown_timeout: Duration::from_secs(parse_var(
                &get,
                "JOBSYNC_SHUTDOWN_TIMEOUT_SECS",
                DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            )?),
            open_timeout: Duration::from_secs(open_timeout_secs),
        })
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_ws_url(mut self, url: impl Into<String>) -> Self {
        self.ws_url = url.into();
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_settled_retention(mut self, retention: Duration) -> Self {
        self.settled_retention = retention;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }
}

fn parse_var<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set to a value that does not parse.
    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.api_url, "http://localhost:3000");
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert!(config.auth_token.is_none());
        assert!(config.user_id.is_none());
        assert_eq!(config.open_timeout, Duration::from_secs(10));
    }

    #[test]
    fn values_are_read_from_environment() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("JOBSYNC_API_URL", "https://api.example.com"),
            ("JOBSYNC_AUTH_TOKEN", "secret"),
            ("JOBSYNC_USER_ID", "u1"),
            ("JOBSYNC_POLL_INTERVAL_SECS", " 12 "),
            ("JOBSYNC_OPEN_TIMEOUT_SECS", "3"),
        ]))
        .unwrap();
        assert_eq!(config.api_url, "https://api.example.com");
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.user_id.as_deref(), Some("u1"));
        assert_eq!(config.poll_interval, Duration::from_secs(12));
        assert_eq!(config.open_timeout, Duration::from_secs(3));
    }

    #[test]
    fn empty_values_count_as_unset() {
        let config = SyncConfig::from_lookup(lookup(&[("JOBSYNC_USER_ID", "  ")])).unwrap();
        assert!(config.user_id.is_none());
    }

    #[test]
    fn invalid_number_is_an_error() {
        let result = SyncConfig::from_lookup(lookup(&[("JOBSYNC_POLL_INTERVAL_SECS", "soon")]));
        assert_matches!(
            result,
            Err(ConfigError::Invalid { name: "JOBSYNC_POLL_INTERVAL_SECS", .. })
        );
    }

    #[test]
    fn zero_open_timeout_is_rejected() {
        let result = SyncConfig::from_lookup(lookup(&[("JOBSYNC_OPEN_TIMEOUT_SECS", "0")]));
        assert_matches!(
            result,
            Err(ConfigError::Invalid { name: "JOBSYNC_OPEN_TIMEOUT_SECS", .. })
        );
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let result = SyncConfig::from_lookup(lookup(&[("JOBSYNC_POLL_INTERVAL_SECS", "0")]));
        assert!(result.is_err());
    }
}
