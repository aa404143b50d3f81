//! Transport collaborator interface and an in-process implementation.
//!
//! The bus only needs an ordered, reliable way to hand an envelope to the
//! other side of a link. Real hosts plug their own channel in; tests and the
//! demo use `LocalTransport`, which feeds the target bus's inbox directly.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::debug;

use super::bus::MessageBus;
use super::envelope::Envelope;
use crate::{Result, WeftError};

/// One direction of a link between two endpoints.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<()>;
}

/// Delivers envelopes to a bus living in the same process.
pub struct LocalTransport {
    target: Weak<MessageBus>,
    encode_frames: bool,
}

impl LocalTransport {
    pub fn new(target: &Arc<MessageBus>) -> Self {
        Self {
            target: Arc::downgrade(target),
            encode_frames: false,
        }
    }

    /// Pushes every envelope through the byte codec, as a process boundary would.
    pub fn with_frames(mut self) -> Self {
        self.encode_frames = true;
        self
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        let target = self
            .target
            .upgrade()
            .ok_or_else(|| WeftError::Transport("target endpoint is gone".into()))?;
        if self.encode_frames {
            let frame = envelope.encode()?;
            target.deliver_frame(&frame).await
        } else {
            target.deliver(envelope).await
        }
    }
}

/// Connects a peer bus to the coordinator bus in both directions.
pub fn link(coordinator: &Arc<MessageBus>, peer: &Arc<MessageBus>) -> Result<()> {
    link_with(coordinator, peer, false)
}

/// Like `link`, but every envelope crosses the link as an encoded frame.
pub fn link_framed(coordinator: &Arc<MessageBus>, peer: &Arc<MessageBus>) -> Result<()> {
    link_with(coordinator, peer, true)
}

fn link_with(coordinator: &Arc<MessageBus>, peer: &Arc<MessageBus>, frames: bool) -> Result<()> {
    let down = LocalTransport::new(peer);
    let up = LocalTransport::new(coordinator);
    let (down, up) = if frames {
        (down.with_frames(), up.with_frames())
    } else {
        (down, up)
    };
    coordinator.register_endpoint(Arc::new(down), peer.id())?;
    peer.connect_upstream(Arc::new(up))?;
    debug!(target: "ipc", peer = %peer.id(), framed = frames, "Linked peer to coordinator");
    Ok(())
}
