use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

pub const GET_LATEST_PICTURES: &str = "GET_LATEST_PICTURES_N";
pub const SEND_LATEST_PICTURES: &str = "SEND_LATEST_PICTURES";
pub const TAKE_PICTURE: &str = "TAKE_PICTURE";
pub const LATEST_PICTURE_TAKEN: &str = "LATEST_PICTURE_TAKEN";
pub const PIR_MOTION_DETECTED: &str = "PIR/MOTION_DETECTED";
pub const PIR_MOTION_ENDED: &str = "PIR/MOTION_ENDED";
pub const PIR_HEARTBEAT: &str = "PIR/HEARTBEAT";

/// Bounded wait applied to requests that do not set their own timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A statically known request topic and the topic its reply arrives on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestRoute {
    pub request_topic: &'static str,
    pub reply_topic: &'static str,
}

pub const LATEST_PICTURES: RequestRoute = RequestRoute {
    request_topic: GET_LATEST_PICTURES,
    reply_topic: SEND_LATEST_PICTURES,
};

#[derive(Error, Debug)]
#[error("Malformed payload on '{topic}': {source}")]
pub struct MalformedPayload {
    pub topic: String,
    #[source]
    pub source: serde_json::Error,
}

/// Canonical payload carried on the bus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: String,
    pub event: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Envelope {
    pub fn new(source: &str, event: &str) -> Self {
        Self {
            source: source.to_string(),
            event: event.to_string(),
            timestamp: Utc::now(),
            data: Map::new(),
            correlation_id: None,
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a struct of strings and JSON values cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_slice(topic: &str, payload: &[u8]) -> Result<Self, MalformedPayload> {
        serde_json::from_slice(payload).map_err(|source| MalformedPayload {
            topic: topic.to_string(),
            source,
        })
    }
}

/// A frame as it travels over a bus link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawFrame {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl RawFrame {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// An inbound message, immutable once built by the transport.
#[derive(Clone, Debug)]
pub struct Event {
    topic: String,
    payload: Vec<u8>,
    source: String,
    event_type: String,
    correlation_id: Option<String>,
    timestamp: DateTime<Utc>,
}

impl Event {
    /// Builds an event from a raw frame.
    ///
    /// Envelope fields are lifted when the payload parses as one. Anything
    /// else is kept as an opaque payload with empty source and type.
    pub fn from_frame(frame: RawFrame) -> Self {
        let envelope = serde_json::from_slice::<Envelope>(&frame.payload).ok();
        let (source, event_type, correlation_id) = match envelope {
            Some(envelope) => (envelope.source, envelope.event, envelope.correlation_id),
            None => (String::new(), String::new(), None),
        };

        Self {
            topic: frame.topic,
            payload: frame.payload,
            source,
            event_type,
            correlation_id,
            timestamp: Utc::now(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn envelope(&self) -> Result<Envelope, MalformedPayload> {
        Envelope::from_slice(&self.topic, &self.payload)
    }
}
