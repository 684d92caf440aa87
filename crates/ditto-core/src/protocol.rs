//! Generic wire envelope and outbound signals.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{error::ClientError, selector::Pointer};

pub const CORRELATION_ID_HEADER: &str = "correlation-id";
pub const REQUESTED_ACKS_HEADER: &str = "requested-acks";
pub const RESPONSE_REQUIRED_HEADER: &str = "response-required";

/// Prefix of the control frame that pushes a fresh access token.
pub const JWT_TOKEN_PREFIX: &str = "JWT-TOKEN?jwtToken=";

fn root_path() -> String {
    "/".to_owned()
}

/// `{topic, headers, path, value, status}` as exchanged with the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub topic: String,
    #[serde(default)]
    pub headers: Map<String, Value>,
    #[serde(default = "root_path")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            headers: Map::new(),
            path: path.into(),
            value: None,
            status: None,
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_correlation_id(self, correlation_id: impl Into<String>) -> Self {
        self.with_header(CORRELATION_ID_HEADER, correlation_id.into())
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.get(CORRELATION_ID_HEADER).and_then(Value::as_str)
    }

    /// Labels from the `requested-acks` header, given as array or comma list.
    pub fn requested_acks(&self) -> Vec<String> {
        match self.headers.get(REQUESTED_ACKS_HEADER) {
            Some(Value::Array(labels)) => labels
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect(),
            Some(Value::String(labels)) => labels
                .split(',')
                .map(str::trim)
                .filter(|label| !label.is_empty())
                .map(str::to_owned)
                .collect(),
            _ => Vec::new(),
        }
    }

    fn topic_segments(&self) -> Vec<&str> {
        self.topic.split('/').collect()
    }

    /// `namespace:name` from the first two topic segments.
    pub fn thing_id(&self) -> Option<String> {
        let segments = self.topic_segments();
        match segments.as_slice() {
            [namespace, name, ..] if *namespace != "_" && *name != "_" => {
                Some(format!("{namespace}:{name}"))
            }
            _ => None,
        }
    }

    /// `/things/{thingId}{path}`, or just the path when no thing is addressed.
    pub fn resource_pointer(&self) -> Pointer {
        let path = Pointer::parse(&self.path);
        match self.thing_id() {
            Some(thing_id) => Pointer::from_segments(["things".to_owned(), thing_id]).join(&path),
            None => path,
        }
    }

    /// The topic's criterion segment, e.g. `events`, `acks` or `search`.
    pub fn criterion(&self) -> Option<&str> {
        self.topic.split('/').nth(4)
    }

    pub fn is_acknowledgement(&self) -> bool {
        self.criterion() == Some("acks")
    }

    /// Responses carry a status; notifications and inbound commands do not.
    pub fn is_response(&self) -> bool {
        self.status.is_some()
    }

    pub fn is_change_notification(&self) -> bool {
        !self.is_response()
            && matches!(self.criterion(), Some("events" | "messages" | "commands"))
    }

    pub fn search_subscription_id(&self) -> Option<&str> {
        if self.criterion() != Some("search") {
            return None;
        }
        self.value
            .as_ref()
            .and_then(|value| value.get("subscriptionId"))
            .and_then(Value::as_str)
    }

    /// Error description from the value of a failed response.
    pub fn error_description(&self) -> String {
        let described = self.value.as_ref().and_then(|value| {
            value
                .get("message")
                .or_else(|| value.get("description"))
                .and_then(Value::as_str)
        });
        match (described, self.status) {
            (Some(message), _) => message.to_owned(),
            (None, Some(status)) => format!("backend responded with status {status}"),
            (None, None) => "backend responded with an error".to_owned(),
        }
    }

    pub fn to_json(&self) -> Result<String, ClientError> {
        serde_json::to_string(self).map_err(ClientError::serialization)
    }

    pub fn from_json(text: &str) -> Result<Self, ClientError> {
        serde_json::from_str(text).map_err(ClientError::serialization)
    }
}

/// An outbound command with a correlation id that is always set.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    correlation_id: String,
    requested_acks: Vec<String>,
    envelope: Envelope,
}

impl Signal {
    pub fn new(topic: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            requested_acks: Vec::new(),
            envelope: Envelope::new(topic, path),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.envelope.value = Some(value);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.envelope.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_requested_acks<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requested_acks = labels.into_iter().map(Into::into).collect();
        self.requested_acks.sort();
        self.requested_acks.dedup();
        self
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn requested_acks(&self) -> &[String] {
        &self.requested_acks
    }

    pub fn to_envelope(&self) -> Envelope {
        let mut envelope = self
            .envelope
            .clone()
            .with_correlation_id(self.correlation_id.clone());
        if !self.requested_acks.is_empty() {
            envelope = envelope.with_header(
                REQUESTED_ACKS_HEADER,
                Value::from(self.requested_acks.clone()),
            );
        }
        envelope
    }

    pub fn to_json(&self) -> Result<String, ClientError> {
        self.to_envelope().to_json()
    }
}

/// One inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Bare protocol string such as `START-SEND-EVENTS:ACK`.
    Control(String),
    Envelope(Envelope),
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, ClientError> {
        let trimmed = text.trim();
        if trimmed.starts_with('{') {
            Envelope::from_json(trimmed).map(Self::Envelope)
        } else {
            Ok(Self::Control(trimmed.to_owned()))
        }
    }
}

pub fn token_frame(token: &str) -> String {
    format!("{JWT_TOKEN_PREFIX}{token}")
}
