use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::acks::Acknowledgements;

/// Broad error category used for caller handling and retry behavior.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Invalid input, missing arguments or unsupported configuration.
    Config,
    /// Authentication/authorization failure.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Establishing the connection failed.
    Connect,
    /// Rate-limited by the backend.
    RateLimited,
    /// A request, acknowledgement or handshake did not complete in time.
    Timeout,
    /// A consumption request raced an in-flight one on the same sub-stream.
    Concurrency,
    /// Registration bookkeeping failure.
    Registration,
    /// At least one requested acknowledgement was not successful.
    Acknowledgement,
    /// Serialization/deserialization failure.
    Serialization,
    /// Internal bug, invariant break or wrapped completion failure.
    Internal,
}

/// Distinguishes the ways a connection attempt can fail.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConnectFailureKind {
    Default,
    Interrupted,
    Timeout,
}

impl ConnectFailureKind {
    fn code(self) -> &'static str {
        match self {
            Self::Default => CONNECT_FAILED,
            Self::Interrupted => CONNECT_INTERRUPTED,
            Self::Timeout => CONNECT_TIMEOUT,
        }
    }
}

pub const MISSING_ARGUMENT: &str = "missing_argument";
pub const CONCURRENT_CONSUMPTION: &str = "concurrent_consumption_request";
pub const DUPLICATE_REGISTRATION: &str = "duplicate_registration";
pub const ACKNOWLEDGEMENTS_FAILED: &str = "acknowledgements_failed";
pub const ACKNOWLEDGEMENT_TIMEOUT: &str = "acknowledgement_timeout";
pub const REQUEST_TIMEOUT: &str = "request_timeout";
pub const COMPLETION_FAILED: &str = "completion_failed";
pub const CONNECT_FAILED: &str = "connect_failed";
pub const CONNECT_INTERRUPTED: &str = "connect_interrupted";
pub const CONNECT_TIMEOUT: &str = "connect_timeout";
pub const SESSION_CLOSED: &str = "session_closed";

/// Stable client error payload returned from every fallible session operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ClientError {
    /// High-level error category.
    pub category: ErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
    /// HTTP-like status reported by the backend, if any.
    pub status: Option<u16>,
    /// Underlying error this one wraps.
    pub cause: Option<Box<ClientError>>,
    /// Every collected acknowledgement for aggregate acknowledgement failures.
    pub acknowledgements: Option<Acknowledgements>,
}

impl ClientError {
    /// Construct a new client error.
    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
            status: None,
            cause: None,
            acknowledgements: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn caused_by(mut self, cause: ClientError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Build an error from a backend status code and its description.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let category = classify_http_status(status);
        Self::new(category, format!("status_{status}"), message).with_status(status)
    }

    /// Wrap a failure that surfaced through an async completion.
    pub fn completion(cause: ClientError) -> Self {
        Self::new(
            ErrorCategory::Internal,
            COMPLETION_FAILED,
            format!("completion failed: {}", cause.message),
        )
        .caused_by(cause)
    }

    /// Unwrap completion wrappers down to the error that actually happened.
    pub fn root_cause(&self) -> &ClientError {
        let mut current = self;
        while current.code == COMPLETION_FAILED
            && let Some(cause) = current.cause.as_deref()
        {
            current = cause;
        }
        current
    }

    pub fn into_root_cause(self) -> ClientError {
        let mut current = self;
        while current.code == COMPLETION_FAILED && current.cause.is_some() {
            match current.cause.take() {
                Some(cause) => current = *cause,
                None => break,
            }
        }
        current
    }

    /// Contract violation for a required argument that was never supplied.
    pub fn missing_argument(name: &str) -> Self {
        Self::new(
            ErrorCategory::Config,
            MISSING_ARGUMENT,
            format!("{name} must not be null"),
        )
    }

    pub fn concurrent_consumption(sub_stream: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorCategory::Concurrency,
            CONCURRENT_CONSUMPTION,
            format!("a consumption request for {sub_stream} is already in flight"),
        )
    }

    pub fn duplicate_registration(id: &str) -> Self {
        Self::new(
            ErrorCategory::Registration,
            DUPLICATE_REGISTRATION,
            format!("a registration with id '{id}' already exists"),
        )
    }

    /// Aggregate failure carrying every collected acknowledgement.
    pub fn acknowledgements_failed(acknowledgements: Acknowledgements) -> Self {
        let failed = acknowledgements
            .failed()
            .map(|ack| format!("{}={}", ack.label, ack.status))
            .collect::<Vec<_>>()
            .join(", ");
        let mut err = Self::new(
            ErrorCategory::Acknowledgement,
            ACKNOWLEDGEMENTS_FAILED,
            format!(
                "acknowledgements for correlation id '{}' failed: {failed}",
                acknowledgements.correlation_id
            ),
        );
        err.status = acknowledgements.combined_status();
        err.acknowledgements = Some(acknowledgements);
        err
    }

    pub fn acknowledgement_timeout(acknowledgements: Acknowledgements, waited: Duration) -> Self {
        let mut err = Self::new(
            ErrorCategory::Timeout,
            ACKNOWLEDGEMENT_TIMEOUT,
            format!(
                "acknowledgements for correlation id '{}' not complete after {}ms",
                acknowledgements.correlation_id,
                waited.as_millis()
            ),
        )
        .with_status(408);
        err.acknowledgements = Some(acknowledgements);
        err
    }

    pub fn request_timeout(what: impl std::fmt::Display, waited: Duration) -> Self {
        Self::new(
            ErrorCategory::Timeout,
            REQUEST_TIMEOUT,
            format!("no reply for {what} after {}ms", waited.as_millis()),
        )
        .with_status(408)
    }

    pub fn connect(kind: ConnectFailureKind, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Connect, kind.code(), message)
    }

    /// Classify a connect failure, or `None` for non-connect errors.
    pub fn connect_failure_kind(&self) -> Option<ConnectFailureKind> {
        if self.category != ErrorCategory::Connect {
            return None;
        }
        Some(match self.code.as_str() {
            CONNECT_INTERRUPTED => ConnectFailureKind::Interrupted,
            CONNECT_TIMEOUT => ConnectFailureKind::Timeout,
            _ => ConnectFailureKind::Default,
        })
    }

    pub fn session_closed() -> Self {
        Self::new(ErrorCategory::Network, SESSION_CLOSED, "session is closed")
    }

    pub fn serialization(err: serde_json::Error) -> Self {
        Self::new(
            ErrorCategory::Serialization,
            "invalid_json",
            err.to_string(),
        )
    }
}

/// Map HTTP status codes to client error categories.
pub fn classify_http_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Auth,
        408 => ErrorCategory::Timeout,
        429 => ErrorCategory::RateLimited,
        400..=499 => ErrorCategory::Config,
        500..=599 => ErrorCategory::Network,
        _ => ErrorCategory::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acks::Acknowledgement;

    #[test]
    fn classifies_http_status_categories() {
        assert_eq!(classify_http_status(401), ErrorCategory::Auth);
        assert_eq!(classify_http_status(408), ErrorCategory::Timeout);
        assert_eq!(classify_http_status(429), ErrorCategory::RateLimited);
        assert_eq!(classify_http_status(404), ErrorCategory::Config);
        assert_eq!(classify_http_status(503), ErrorCategory::Network);
        assert_eq!(classify_http_status(700), ErrorCategory::Internal);
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = ClientError::new(ErrorCategory::RateLimited, "rate_limited", "wait")
            .with_retry_after(Duration::from_secs(3));
        assert_eq!(err.retry_after_ms, Some(3000));
    }

    #[test]
    fn unwraps_nested_completion_wrappers() {
        let cause = ClientError::new(ErrorCategory::Auth, "status_401", "token expired");
        let wrapped = ClientError::completion(ClientError::completion(cause.clone()));

        assert_eq!(wrapped.root_cause(), &cause);
        assert_eq!(wrapped.into_root_cause(), cause);
    }

    #[test]
    fn leaves_non_completion_errors_untouched() {
        let err = ClientError::new(ErrorCategory::Network, "io", "reset")
            .caused_by(ClientError::new(ErrorCategory::Internal, "inner", "x"));
        assert_eq!(err.root_cause().code, "io");
    }

    #[test]
    fn keeps_missing_argument_message_stable() {
        let err = ClientError::missing_argument("session id");
        assert_eq!(err.code, MISSING_ARGUMENT);
        assert_eq!(err.message, "session id must not be null");
    }

    #[test]
    fn round_trips_connect_failure_kinds() {
        for kind in [
            ConnectFailureKind::Default,
            ConnectFailureKind::Interrupted,
            ConnectFailureKind::Timeout,
        ] {
            let err = ClientError::connect(kind, "boom");
            assert_eq!(err.connect_failure_kind(), Some(kind));
        }
        let other = ClientError::new(ErrorCategory::Network, CONNECT_TIMEOUT, "not connect");
        assert_eq!(other.connect_failure_kind(), None);
    }

    #[test]
    fn aggregate_failure_lists_failed_labels() {
        let acks = Acknowledgements::new(
            "corr-1",
            vec![
                Acknowledgement::new("twin-persisted", 200, None),
                Acknowledgement::new("custom", 403, None),
            ],
        );
        let err = ClientError::acknowledgements_failed(acks);
        assert_eq!(err.category, ErrorCategory::Acknowledgement);
        assert!(err.message.contains("custom=403"));
        assert_eq!(
            err.acknowledgements.map(|acks| acks.entries.len()),
            Some(2)
        );
    }
}
