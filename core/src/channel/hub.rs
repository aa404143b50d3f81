use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::trace;

use super::receiver::{ChannelReceiver, ReceiverShared};
use super::sender::ChannelSender;
use super::types::MethodTable;
use crate::config::ChannelConfig;
use crate::ipc::{EndpointId, MessageBus};
use crate::{RequestPath, Result};

/// Per-endpoint channel context.
///
/// Keeps the endpoint's bus and a table of the receivers living on it, so a
/// sender on the same endpoint can call its receiver without serializing.
pub struct ChannelHub {
    bus: Arc<MessageBus>,
    config: ChannelConfig,
    receivers: DashMap<String, Weak<ReceiverShared>>,
}

impl ChannelHub {
    pub fn new(bus: Arc<MessageBus>, config: ChannelConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            config,
            receivers: DashMap::new(),
        })
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn endpoint(&self) -> EndpointId {
        self.bus.id()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Creates a receiver for `id` on this endpoint.
    pub async fn receiver(self: &Arc<Self>, id: RequestPath, methods: MethodTable) -> Result<ChannelReceiver> {
        ChannelReceiver::create(self, id, methods).await
    }

    /// Connects a sender to the receiver identified by `id`.
    pub async fn sender(
        self: &Arc<Self>,
        id: RequestPath,
        sub_channel: Option<String>,
        sender_id: Option<RequestPath>,
    ) -> Result<ChannelSender> {
        ChannelSender::connect(self, id, sub_channel, sender_id).await
    }

    /// Number of live receivers on this endpoint.
    pub fn receiver_count(&self) -> usize {
        self.receivers
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    pub(crate) fn local_receiver(&self, key: &str) -> Option<Arc<ReceiverShared>> {
        self.receivers.get(key).and_then(|weak| weak.upgrade())
    }

    pub(crate) fn attach(&self, key: String, receiver: &Arc<ReceiverShared>) {
        trace!(target: "channel", endpoint = %self.endpoint(), receiver = %key, "Attached local receiver");
        self.receivers.insert(key, Arc::downgrade(receiver));
    }

    pub(crate) fn detach(&self, key: &str, receiver: &Arc<ReceiverShared>) {
        let target = Arc::downgrade(receiver);
        self.receivers
            .remove_if(key, |_, weak| weak.ptr_eq(&target) || weak.strong_count() == 0);
    }
}
