//! Environment-backed session configuration.

use std::{env, time::Duration};

use thiserror::Error;
use url::Url;

const DEFAULT_ENDPOINT: &str = "ws://localhost:8080/ws/2";
const DEFAULT_SESSION_NAME: &str = "ditto-session";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_ACK_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_CONSUMPTION_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_TOKEN_GRACE_PERIOD_MS: u64 = 30_000;
const DEFAULT_OUTBOUND_BUFFER: usize = 256;

/// Runtime configuration of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// WebSocket endpoint of the backend.
    pub endpoint: Url,
    /// Prefix of the generated session id.
    pub session_name: String,
    /// How long `send` waits for a correlated response.
    pub request_timeout: Duration,
    /// How long requested acknowledgements are collected.
    pub acknowledgement_timeout: Duration,
    /// How long a consumption handshake waits for its `:ACK`.
    pub consumption_timeout: Duration,
    /// How long before expiry an access token is refreshed.
    pub token_grace_period: Duration,
    /// Per-direction frame buffer of connections opened by a transport
    /// built from this config, e.g. [`crate::MemoryTransport::for_config`].
    pub outbound_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            session_name: DEFAULT_SESSION_NAME.to_owned(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            acknowledgement_timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS),
            consumption_timeout: Duration::from_millis(DEFAULT_CONSUMPTION_TIMEOUT_MS),
            token_grace_period: Duration::from_millis(DEFAULT_TOKEN_GRACE_PERIOD_MS),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
        }
    }
}

impl SessionConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let endpoint = match optional_trimmed_env("DITTO_ENDPOINT", &mut lookup) {
            Some(raw) => parse_endpoint(raw)?,
            None => default_endpoint(),
        };
        let session_name = optional_trimmed_env("DITTO_SESSION_NAME", &mut lookup)
            .unwrap_or_else(|| DEFAULT_SESSION_NAME.to_owned());

        let request_timeout = parse_millis(
            "DITTO_REQUEST_TIMEOUT_MS",
            DEFAULT_REQUEST_TIMEOUT_MS,
            &mut lookup,
        )?;
        let acknowledgement_timeout =
            parse_millis("DITTO_ACK_TIMEOUT_MS", DEFAULT_ACK_TIMEOUT_MS, &mut lookup)?;
        let consumption_timeout = parse_millis(
            "DITTO_CONSUMPTION_TIMEOUT_MS",
            DEFAULT_CONSUMPTION_TIMEOUT_MS,
            &mut lookup,
        )?;
        let token_grace_period = parse_millis(
            "DITTO_TOKEN_GRACE_PERIOD_MS",
            DEFAULT_TOKEN_GRACE_PERIOD_MS,
            &mut lookup,
        )?;
        let outbound_buffer = parse_optional_usize(
            "DITTO_OUTBOUND_BUFFER",
            DEFAULT_OUTBOUND_BUFFER,
            &mut lookup,
        )?;

        for (key, value) in [
            ("DITTO_REQUEST_TIMEOUT_MS", request_timeout),
            ("DITTO_ACK_TIMEOUT_MS", acknowledgement_timeout),
            ("DITTO_CONSUMPTION_TIMEOUT_MS", consumption_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: "0".to_owned(),
                    reason: "must be at least 1".to_owned(),
                });
            }
        }
        if outbound_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DITTO_OUTBOUND_BUFFER",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            endpoint,
            session_name,
            request_timeout,
            acknowledgement_timeout,
            consumption_timeout,
            token_grace_period,
            outbound_buffer,
        })
    }
}

/// Errors produced while parsing session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn default_endpoint() -> Url {
    match Url::parse(DEFAULT_ENDPOINT) {
        Ok(url) => url,
        Err(err) => unreachable!("default endpoint is a valid url: {err}"),
    }
}

fn parse_endpoint(raw: String) -> Result<Url, ConfigError> {
    let url = Url::parse(&raw).map_err(|err| ConfigError::InvalidValue {
        key: "DITTO_ENDPOINT",
        value: raw.clone(),
        reason: err.to_string(),
    })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConfigError::InvalidValue {
            key: "DITTO_ENDPOINT",
            value: raw,
            reason: format!("unsupported scheme '{other}', expected ws or wss"),
        }),
    }
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_millis<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<Duration, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(Duration::from_millis(default));
    };
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_usize<F>(
    key: &'static str,
    default: usize,
    lookup: &mut F,
) -> Result<usize, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<usize>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<SessionConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        SessionConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn uses_defaults_without_environment() {
        let cfg = config_from_pairs(&[]).expect("config should parse");
        assert_eq!(cfg, SessionConfig::default());
        assert_eq!(cfg.endpoint.as_str(), DEFAULT_ENDPOINT);
        assert_eq!(cfg.consumption_timeout, Duration::from_secs(10));
    }

    #[test]
    fn parses_overrides() {
        let cfg = config_from_pairs(&[
            ("DITTO_ENDPOINT", " wss://ditto.example.org/ws/2 "),
            ("DITTO_SESSION_NAME", "fleet-monitor"),
            ("DITTO_REQUEST_TIMEOUT_MS", "5000"),
            ("DITTO_ACK_TIMEOUT_MS", "2500"),
            ("DITTO_CONSUMPTION_TIMEOUT_MS", "1500"),
            ("DITTO_TOKEN_GRACE_PERIOD_MS", "0"),
            ("DITTO_OUTBOUND_BUFFER", "16"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.endpoint.as_str(), "wss://ditto.example.org/ws/2");
        assert_eq!(cfg.session_name, "fleet-monitor");
        assert_eq!(cfg.request_timeout, Duration::from_millis(5_000));
        assert_eq!(cfg.acknowledgement_timeout, Duration::from_millis(2_500));
        assert_eq!(cfg.consumption_timeout, Duration::from_millis(1_500));
        assert_eq!(cfg.token_grace_period, Duration::ZERO);
        assert_eq!(cfg.outbound_buffer, 16);
    }

    #[test]
    fn rejects_non_websocket_endpoints() {
        let err = config_from_pairs(&[("DITTO_ENDPOINT", "https://ditto.example.org")])
            .expect_err("http endpoint should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "DITTO_ENDPOINT",
                ..
            }
        ));
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let err = config_from_pairs(&[("DITTO_ACK_TIMEOUT_MS", "soon")])
            .expect_err("invalid timeout should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "DITTO_ACK_TIMEOUT_MS",
                ..
            }
        ));

        let err = config_from_pairs(&[("DITTO_REQUEST_TIMEOUT_MS", "0")])
            .expect_err("zero timeout should fail");
        assert_eq!(err.to_string(), "invalid DITTO_REQUEST_TIMEOUT_MS='0': must be at least 1");
    }
}
