//! Messaging layer: Message Bus, wire Envelope, and Transport links.
//!
//! This module provides the inter-endpoint messaging substrate:
//! - `MessageBus`: addressed multi-destination send with response aggregation
//! - `Envelope`: wire unit with response tracking fields and a byte codec
//! - `Transport`: the host-provided link, plus an in-process implementation

pub mod bus;
pub mod envelope;
pub mod transport;

pub use bus::{IpcEvent, ListenerFuture, ListenerId, MessageBus};
pub use envelope::{decode_field, Destinations, EndpointId, EndpointRole, Envelope, EnvelopeKind};
pub use transport::{link, link_framed, LocalTransport, Transport};
