//! Configuration for a pool session.
//!
//! Values can be deserialized (every field except the pool URL has a default)
//! or read from `STRATUM_*` environment variables with [`Config::from_env`].

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::stratum::{ReconnectPolicy, SessionConfig};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    pub pool: PoolConfig,

    #[serde(default)]
    pub session: SessionSettings,
}

/// Where to mine and as whom.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Pool address (`host:port`, optionally `stratum+tcp://host:port`)
    pub url: String,

    /// Worker name
    #[serde(default)]
    pub user: String,

    #[serde(default = "default_password")]
    pub password: String,
}

/// Session tunables in plain units.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Keep-alive period; absent or zero disables it
    pub keep_alive_secs: Option<u64>,
    pub reconnect_initial_ms: u64,
    pub reconnect_retry_ms: u64,
}

fn default_password() -> String {
    "x".to_string()
}

impl Default for SessionSettings {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            keep_alive_secs: None,
            reconnect_initial_ms: duration_ms(policy.initial_delay),
            reconnect_retry_ms: duration_ms(policy.retry_delay),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl SessionSettings {
    /// Convert to the value a session is built with.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            keep_alive: self
                .keep_alive_secs
                .filter(|&secs| secs > 0)
                .map(Duration::from_secs),
            reconnect: ReconnectPolicy {
                initial_delay: Duration::from_millis(self.reconnect_initial_ms),
                retry_delay: Duration::from_millis(self.reconnect_retry_ms),
            },
        }
    }
}

impl Config {
    /// Read configuration from the process environment.
    ///
    /// `STRATUM_POOL_URL` is required. `STRATUM_POOL_USER`,
    /// `STRATUM_POOL_PASS`, `STRATUM_KEEPALIVE_SECS`,
    /// `STRATUM_RECONNECT_INITIAL_MS` and `STRATUM_RECONNECT_RETRY_MS` are
    /// optional.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let url = lookup("STRATUM_POOL_URL")
            .filter(|url| !url.is_empty())
            .ok_or_else(|| Error::Config("STRATUM_POOL_URL is not set".to_string()))?;

        let number = |key: &str| -> Result<Option<u64>> {
            lookup(key)
                .map(|value| {
                    value
                        .parse::<u64>()
                        .map_err(|e| Error::Config(format!("{}={:?}: {}", key, value, e)))
                })
                .transpose()
        };

        let defaults = SessionSettings::default();
        Ok(Self {
            pool: PoolConfig {
                url,
                user: lookup("STRATUM_POOL_USER").unwrap_or_default(),
                password: lookup("STRATUM_POOL_PASS").unwrap_or_else(default_password),
            },
            session: SessionSettings {
                keep_alive_secs: number("STRATUM_KEEPALIVE_SECS")?,
                reconnect_initial_ms: number("STRATUM_RECONNECT_INITIAL_MS")?
                    .unwrap_or(defaults.reconnect_initial_ms),
                reconnect_retry_ms: number("STRATUM_RECONNECT_RETRY_MS")?
                    .unwrap_or(defaults.reconnect_retry_ms),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let vars: HashMap<&str, &str> = vars.iter().copied().collect();
        move |key: &str| vars.get(key).map(|v| v.to_string())
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = Config::from_lookup(lookup(&[("STRATUM_POOL_URL", "pool:3333")])).unwrap();

        assert_eq!(config.pool.url, "pool:3333");
        assert_eq!(config.pool.user, "");
        assert_eq!(config.pool.password, "x");

        let session = config.session.session_config();
        assert_eq!(session, SessionConfig::default());
        assert_eq!(session.keep_alive, None);
        assert_eq!(session.reconnect.initial_delay, Duration::from_secs(1));
        assert_eq!(session.reconnect.retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("STRATUM_POOL_URL", "stratum+tcp://pool:3333"),
            ("STRATUM_POOL_USER", "wallet.rig1"),
            ("STRATUM_POOL_PASS", "secret"),
            ("STRATUM_KEEPALIVE_SECS", "30"),
            ("STRATUM_RECONNECT_INITIAL_MS", "250"),
            ("STRATUM_RECONNECT_RETRY_MS", "2000"),
        ]))
        .unwrap();

        assert_eq!(config.pool.user, "wallet.rig1");
        assert_eq!(config.pool.password, "secret");

        let session = config.session.session_config();
        assert_eq!(session.keep_alive, Some(Duration::from_secs(30)));
        assert_eq!(session.reconnect.initial_delay, Duration::from_millis(250));
        assert_eq!(session.reconnect.retry_delay, Duration::from_millis(2000));
    }

    #[test]
    fn test_from_lookup_requires_url() {
        assert!(matches!(
            Config::from_lookup(lookup(&[])),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("STRATUM_POOL_URL", "")])),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_from_lookup_rejects_garbage_numbers() {
        let result = Config::from_lookup(lookup(&[
            ("STRATUM_POOL_URL", "pool:3333"),
            ("STRATUM_KEEPALIVE_SECS", "soon"),
        ]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_keep_alive_disables_it() {
        let settings = SessionSettings {
            keep_alive_secs: Some(0),
            ..Default::default()
        };
        assert_eq!(settings.session_config().keep_alive, None);
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: Config = serde_json::from_str(r#"{"pool": {"url": "pool:3333"}}"#).unwrap();
        assert_eq!(config.pool.password, "x");
        assert_eq!(config.session, SessionSettings::default());

        let config: Config = serde_json::from_str(
            r#"{"pool": {"url": "pool:3333", "user": "w"}, "session": {"keep_alive_secs": 10}}"#,
        )
        .unwrap();
        assert_eq!(config.session.keep_alive_secs, Some(10));
        assert_eq!(config.session.reconnect_retry_ms, 5000);
    }
}
