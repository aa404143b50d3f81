use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::hub::ChannelHub;
use super::types::{
    error_marker, message_types, ChannelCall, ChannelMessage, MessageTypes, MethodFuture, MethodTable,
};
use crate::ipc::{Destinations, EndpointId, ListenerId};
use crate::{RequestPath, Result, WeftError};

/// State of a receiver reachable from bus listeners and same-endpoint senders.
pub(crate) struct ReceiverShared {
    key: String,
    endpoint: EndpointId,
    global: RwLock<MethodTable>,
    sub_channels: RwLock<BTreeMap<String, MethodTable>>,
    enabled: AtomicBool,
}

impl ReceiverShared {
    /// Runs the handler for `call`. A sub-channel handler takes precedence
    /// over a global one with the same name.
    pub(crate) fn dispatch(&self, call: ChannelCall) -> MethodFuture {
        let handler = call
            .sub_channel
            .as_deref()
            .and_then(|sub| {
                self.sub_channels
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(sub)
                    .and_then(|table| table.get(&call.method))
            })
            .or_else(|| {
                self.global
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&call.method)
            });
        match handler {
            Some(handler) => handler(call),
            None => {
                let error = WeftError::UnknownMethod {
                    channel: self.key.clone(),
                    method: call.method,
                };
                Box::pin(async move { Err(error) })
            }
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn message_types(&self) -> MessageTypes {
        let global = self
            .global
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .names();
        let sub_channels = self
            .sub_channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, table)| (id.clone(), table.names()))
            .collect();
        MessageTypes {
            endpoint: self.endpoint,
            enabled: self.is_enabled(),
            global,
            sub_channels,
        }
    }

    async fn handle_message(&self, data: Value) -> Value {
        let message: ChannelMessage = match serde_json::from_value(data) {
            Ok(message) => message,
            Err(e) => {
                warn!(target: "channel", receiver = %self.key, error = %e, "Malformed channel message");
                return error_marker(&WeftError::Serialization(e));
            }
        };
        let call = ChannelCall {
            sender_id: message.sender_id,
            sub_channel: message.sub_channel_id,
            method: message.method_name,
            args: message.args,
        };
        match self.dispatch(call).await {
            Ok(value) => value,
            Err(e) => {
                debug!(target: "channel", receiver = %self.key, error = %e, "Channel handler failed");
                error_marker(&e)
            }
        }
    }
}

/// Callee side of a channel, living on the endpoint that hosts the module.
///
/// Disposed on drop: its bus listeners are removed and same-endpoint senders
/// stop seeing it.
pub struct ChannelReceiver {
    hub: Arc<ChannelHub>,
    id: RequestPath,
    shared: Arc<ReceiverShared>,
    listeners: Mutex<Vec<(String, ListenerId)>>,
    disposed: AtomicBool,
}

impl ChannelReceiver {
    /// Registers the receiver on its endpoint and advertises its methods to every endpoint.
    pub async fn create(hub: &Arc<ChannelHub>, id: RequestPath, methods: MethodTable) -> Result<Self> {
        let key = id.to_string_form(true);
        let shared = Arc::new(ReceiverShared {
            key: key.clone(),
            endpoint: hub.endpoint(),
            global: RwLock::new(methods),
            sub_channels: RwLock::new(BTreeMap::new()),
            enabled: AtomicBool::new(true),
        });
        hub.attach(key.clone(), &shared);

        let bus = hub.bus();
        let mut listeners = Vec::with_capacity(2);

        let message_type = message_types::message(&key);
        let weak = Arc::downgrade(&shared);
        let listener = bus.on(message_type.clone(), move |event| {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(receiver) => receiver.handle_message(event.data).await,
                    None => Value::Null,
                }
            }
        });
        listeners.push((message_type, listener));

        let message_type = message_types::request_message_types(&key);
        let weak = Arc::downgrade(&shared);
        let listener = bus.on(message_type.clone(), move |_event| {
            let weak = weak.clone();
            async move {
                weak.upgrade()
                    .and_then(|receiver| serde_json::to_value(receiver.message_types()).ok())
                    .unwrap_or(Value::Null)
            }
        });
        listeners.push((message_type, listener));

        let receiver = Self {
            hub: Arc::clone(hub),
            id,
            shared,
            listeners: Mutex::new(listeners),
            disposed: AtomicBool::new(false),
        };
        debug!(target: "channel", receiver = %key, endpoint = %hub.endpoint(), "Created channel receiver");
        receiver.advertise().await?;
        Ok(receiver)
    }

    pub fn id(&self) -> &RequestPath {
        &self.id
    }

    /// Global method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        self.shared
            .global
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .names()
    }

    pub fn sub_channels(&self) -> Vec<String> {
        self.shared
            .sub_channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.is_enabled()
    }

    /// Adds (or replaces) a named method set and re-advertises the receiver.
    pub async fn create_sub_channel(&self, sub_channel_id: impl Into<String>, methods: MethodTable) -> Result<()> {
        let sub_channel_id = sub_channel_id.into();
        self.shared
            .sub_channels
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(sub_channel_id.clone(), methods);
        debug!(target: "channel", receiver = %self.shared.key, sub_channel = %sub_channel_id, "Created sub-channel");
        self.advertise().await
    }

    /// Toggles whether calls are accepted. Senders buffer while disabled and
    /// flush in order once re-enabled.
    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
        debug!(target: "channel", receiver = %self.shared.key, enabled, "Receiver state changed");
        self.hub
            .bus()
            .send(
                &message_types::state(&self.shared.key),
                json!({ "enabled": enabled }),
                Destinations::All,
            )
            .await?;
        Ok(())
    }

    /// Tells every sender that this receiver now lives on this endpoint.
    pub async fn announce(&self) -> Result<()> {
        self.hub
            .bus()
            .send(
                &message_types::moved(&self.shared.key),
                json!({ "endpoint": self.shared.endpoint }),
                Destinations::All,
            )
            .await?;
        Ok(())
    }

    async fn advertise(&self) -> Result<()> {
        let types = serde_json::to_value(self.shared.message_types())?;
        self.hub
            .bus()
            .send(&message_types::message_types(&self.shared.key), types, Destinations::All)
            .await?;
        Ok(())
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let listeners = std::mem::take(&mut *self.listeners.lock().unwrap_or_else(|e| e.into_inner()));
        for (message_type, id) in listeners {
            self.hub.bus().off(&message_type, id);
        }
        self.hub.detach(&self.shared.key, &self.shared);
        debug!(target: "channel", receiver = %self.shared.key, "Disposed channel receiver");
    }
}

impl Drop for ChannelReceiver {
    fn drop(&mut self) {
        self.dispose();
    }
}
