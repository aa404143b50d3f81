use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Identity of one endpoint. `0` is the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(pub u32);

impl EndpointId {
    pub const COORDINATOR: EndpointId = EndpointId(0);

    pub fn is_coordinator(self) -> bool {
        self == Self::COORDINATOR
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of an endpoint in the star topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointRole {
    Coordinator,
    Peer,
}

/// Targets of a send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destinations {
    /// Every endpoint known to the coordinator, coordinator included
    All,
    Only(Vec<EndpointId>),
}

impl From<EndpointId> for Destinations {
    fn from(id: EndpointId) -> Self {
        Destinations::Only(vec![id])
    }
}

impl From<Vec<EndpointId>> for Destinations {
    fn from(ids: Vec<EndpointId>) -> Self {
        Destinations::Only(ids)
    }
}

impl From<&[EndpointId]> for Destinations {
    fn from(ids: &[EndpointId]) -> Self {
        Destinations::Only(ids.to_vec())
    }
}

/// What the receiving endpoint must do with an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Emit to local listeners and answer the source
    Event,
    /// Peer-originated send; the coordinator fans it out on the source's behalf
    Forward,
    /// Listener results travelling back to the source
    Response,
}

/// Wire-level unit exchanged by message buses.
///
/// `data` is opaque to the bus. `response_id` is allocated by the source
/// endpoint and carried unchanged through forwards and responses so only one
/// response tracker exists per send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub message_type: String,
    pub data: Value,
    pub destinations: Destinations,
    pub source: EndpointId,
    pub response_id: Option<u64>,
    /// Number of endpoints contributing a response to `response_id`
    pub response_origin_count: usize,
    pub sent_at_ms: i64,
}

impl Envelope {
    pub fn new(
        kind: EnvelopeKind,
        message_type: impl Into<String>,
        data: Value,
        destinations: Destinations,
        source: EndpointId,
    ) -> Self {
        Self {
            kind,
            message_type: message_type.into(),
            data,
            destinations,
            source,
            response_id: None,
            response_origin_count: 0,
            sent_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Response envelope answering `request` from endpoint `from`.
    pub fn response_to(request: &Envelope, from: EndpointId, values: Vec<Value>) -> Self {
        Self {
            kind: EnvelopeKind::Response,
            message_type: request.message_type.clone(),
            data: Value::Array(values),
            destinations: Destinations::Only(vec![request.source]),
            source: from,
            response_id: request.response_id,
            response_origin_count: request.response_origin_count,
            sent_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Single endpoint a response is routed to.
    pub fn response_target(&self) -> Option<EndpointId> {
        match &self.destinations {
            Destinations::Only(ids) => ids.first().copied(),
            Destinations::All => None,
        }
    }

    /// Response values, degrading malformed data instead of failing.
    pub fn response_values(&self) -> Vec<Value> {
        match &self.data {
            Value::Array(values) => values.clone(),
            Value::Null => Vec::new(),
            other => {
                warn!(target: "ipc", message_type = %self.message_type, "Response data is not a list; wrapping");
                vec![other.clone()]
            }
        }
    }

    /// Encodes the envelope for byte-oriented transports.
    pub fn encode(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a frame; malformed frames are logged and dropped.
    pub fn decode(bytes: &[u8]) -> Option<Envelope> {
        match serde_json::from_slice(bytes) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                warn!(target: "ipc", error = %e, len = bytes.len(), "Dropping undecodable envelope");
                None
            }
        }
    }
}

/// Reads `field` from an object payload as `T`.
///
/// Missing fields yield `None`; fields that fail to decode are logged and
/// also yield `None` so a bad payload never interrupts delivery.
pub fn decode_field<T: DeserializeOwned>(data: &Value, field: &str) -> Option<T> {
    let raw = data.get(field)?;
    if raw.is_null() {
        return None;
    }
    match serde_json::from_value(raw.clone()) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(target: "ipc", field, error = %e, "Failed to decode payload field");
            None
        }
    }
}
