use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace, warn};

use super::hub::ChannelHub;
use super::receiver::ReceiverShared;
use super::types::{from_wire_result, message_types, ChannelCall, ChannelMessage, MessageTypes};
use crate::ipc::{decode_field, Destinations, EndpointId, ListenerId};
use crate::{RequestPath, Result, WeftError};

/// What the sender currently knows about its receiver.
struct RemoteState {
    ready: bool,
    destination: Option<EndpointId>,
    methods: BTreeSet<String>,
    enabled: bool,
    direct: Weak<ReceiverShared>,
}

struct BufferedCall {
    method: String,
    args: Vec<Value>,
    resolve: oneshot::Sender<Result<Value>>,
}

struct SenderShared {
    hub: Arc<ChannelHub>,
    id: RequestPath,
    key: String,
    sub_channel: Option<String>,
    sender_id: Option<RequestPath>,
    state: Mutex<RemoteState>,
    buffer: Mutex<VecDeque<BufferedCall>>,
    listeners: Mutex<Vec<(String, ListenerId)>>,
    handshake: Notify,
    flush_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl SenderShared {
    fn state(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<BufferedCall>> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn local_receiver(&self, endpoint: EndpointId) -> Weak<ReceiverShared> {
        if endpoint == self.hub.endpoint() {
            self.hub
                .local_receiver(&self.key)
                .map(|r| Arc::downgrade(&r))
                .unwrap_or_default()
        } else {
            Weak::new()
        }
    }

    /// Adopts an advertisement. Ignored when it lacks the required sub-channel.
    fn apply_types(self: &Arc<Self>, types: &MessageTypes) -> bool {
        let Some(methods) = types.methods_for(self.sub_channel.as_deref()) else {
            trace!(target: "channel", channel = %self.key, sub_channel = ?self.sub_channel, "Advertisement lacks sub-channel");
            return false;
        };
        let direct = self.local_receiver(types.endpoint);
        let first = {
            let mut state = self.state();
            let first = !state.ready;
            state.ready = true;
            state.destination = Some(types.endpoint);
            state.methods = methods;
            state.enabled = types.enabled;
            state.direct = direct;
            first
        };
        if first {
            debug!(target: "channel", channel = %self.key, endpoint = %types.endpoint, "Channel handshake complete");
            self.handshake.notify_one();
        }
        if types.enabled {
            self.flush();
        }
        true
    }

    fn relocate(&self, endpoint: EndpointId) {
        let direct = self.local_receiver(endpoint);
        let mut state = self.state();
        state.destination = Some(endpoint);
        state.direct = direct;
        debug!(target: "channel", channel = %self.key, endpoint = %endpoint, "Receiver moved");
    }

    fn set_remote_enabled(self: &Arc<Self>, enabled: bool) {
        self.state().enabled = enabled;
        trace!(target: "channel", channel = %self.key, enabled, "Receiver state observed");
        if enabled {
            self.flush();
        }
    }

    fn is_ready(&self) -> bool {
        self.state().ready
    }

    fn is_enabled(&self) -> bool {
        let state = self.state();
        match state.direct.upgrade() {
            Some(receiver) => receiver.is_enabled(),
            None => state.enabled,
        }
    }

    fn enqueue(&self, method: &str, args: Vec<Value>) -> Result<oneshot::Receiver<Result<Value>>> {
        let limit = self.hub.config().call_buffer_limit;
        let mut buffer = self.buffer();
        if buffer.len() >= limit {
            return Err(WeftError::Channel(format!(
                "call buffer of channel {} is full ({limit} calls)",
                self.key
            )));
        }
        let (resolve, pending) = oneshot::channel();
        buffer.push_back(BufferedCall {
            method: method.to_string(),
            args,
            resolve,
        });
        trace!(target: "channel", channel = %self.key, method, buffered = buffer.len(), "Buffered call");
        Ok(pending)
    }

    /// Delivers buffered calls in order while the receiver stays enabled.
    fn flush(self: &Arc<Self>) {
        if self.buffer().is_empty() {
            return;
        }
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = shared.flush_lock.lock().await;
            while shared.is_enabled() {
                let Some(call) = shared.buffer().pop_front() else {
                    break;
                };
                let result = shared.deliver(&call.method, call.args).await;
                let _ = call.resolve.send(result);
            }
        });
    }

    async fn deliver(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let (direct, destination) = {
            let state = self.state();
            (state.direct.upgrade(), state.destination)
        };
        if let Some(receiver) = direct {
            trace!(target: "channel", channel = %self.key, method, "Direct call");
            let call = ChannelCall {
                sender_id: self.sender_id.clone(),
                sub_channel: self.sub_channel.clone(),
                method: method.to_string(),
                args,
            };
            return receiver
                .dispatch(call)
                .await
                .map_err(|e| WeftError::Remote(e.to_string()));
        }

        let destination = destination
            .ok_or_else(|| WeftError::Channel(format!("channel {} has no known endpoint", self.key)))?;
        let payload = serde_json::to_value(ChannelMessage {
            sender_id: self.sender_id.clone(),
            sub_channel_id: self.sub_channel.clone(),
            method_name: method.to_string(),
            args,
        })?;
        trace!(target: "channel", channel = %self.key, method, endpoint = %destination, "Bus call");
        let responses = self
            .hub
            .bus()
            .send(&message_types::message(&self.key), payload, destination)
            .await?;
        match responses.into_iter().next() {
            Some(value) => from_wire_result(value),
            None => Err(WeftError::Channel(format!(
                "no receiver for channel {} at endpoint {destination}",
                self.key
            ))),
        }
    }

    fn remove_listeners(&self) {
        let listeners = std::mem::take(&mut *self.listeners.lock().unwrap_or_else(|e| e.into_inner()));
        for (message_type, id) in listeners {
            self.hub.bus().off(&message_type, id);
        }
    }
}

impl Drop for SenderShared {
    fn drop(&mut self) {
        self.remove_listeners();
    }
}

/// Caller side of a channel.
///
/// Cloning shares the same connection. Calls go straight to the receiver when
/// it lives on this endpoint and over the bus otherwise; callers see the same
/// results and errors either way.
#[derive(Clone)]
pub struct ChannelSender {
    shared: Arc<SenderShared>,
}

impl std::fmt::Debug for ChannelSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSender")
            .field("key", &self.shared.key)
            .finish_non_exhaustive()
    }
}

impl ChannelSender {
    /// Connects to the receiver `id`, resolving once its methods are known.
    ///
    /// With a `sub_channel`, the handshake waits until the receiver advertises
    /// that sub-channel, asking again every `handshake_retry_ms`.
    pub async fn connect(
        hub: &Arc<ChannelHub>,
        id: RequestPath,
        sub_channel: Option<String>,
        sender_id: Option<RequestPath>,
    ) -> Result<Self> {
        let key = id.to_string_form(true);
        let shared = Arc::new(SenderShared {
            hub: Arc::clone(hub),
            id,
            key: key.clone(),
            sub_channel,
            sender_id,
            state: Mutex::new(RemoteState {
                ready: false,
                destination: None,
                methods: BTreeSet::new(),
                enabled: true,
                direct: Weak::new(),
            }),
            buffer: Mutex::new(VecDeque::new()),
            listeners: Mutex::new(Vec::new()),
            handshake: Notify::new(),
            flush_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        });
        Self::listen(&shared);

        let bus = Arc::clone(hub.bus());
        let retry = Duration::from_millis(hub.config().handshake_retry_ms.max(1));
        let request_type = message_types::request_message_types(&key);
        loop {
            let responses = bus.send(&request_type, Value::Null, Destinations::All).await?;
            let answered = responses
                .into_iter()
                .filter_map(|v| serde_json::from_value::<MessageTypes>(v).ok())
                .fold(false, |found, types| shared.apply_types(&types) || found);
            if answered || shared.is_ready() {
                break;
            }
            debug!(target: "channel", channel = %key, sub_channel = ?shared.sub_channel, "Receiver not ready; waiting");
            tokio::select! {
                _ = shared.handshake.notified() => {}
                _ = tokio::time::sleep(retry) => {}
            }
            if shared.is_ready() {
                break;
            }
        }
        Ok(Self { shared })
    }

    fn listen(shared: &Arc<SenderShared>) {
        let bus = shared.hub.bus();
        let key = &shared.key;
        let mut listeners = Vec::with_capacity(3);

        let message_type = message_types::message_types(key);
        let weak = Arc::downgrade(shared);
        let id = bus.on(message_type.clone(), move |event| {
            let weak = weak.clone();
            async move {
                if let Some(shared) = weak.upgrade() {
                    match serde_json::from_value::<MessageTypes>(event.data) {
                        Ok(types) => {
                            shared.apply_types(&types);
                        }
                        Err(e) => warn!(target: "channel", channel = %shared.key, error = %e, "Malformed advertisement"),
                    }
                }
                Value::Null
            }
        });
        listeners.push((message_type, id));

        let message_type = message_types::moved(key);
        let weak = Arc::downgrade(shared);
        let id = bus.on(message_type.clone(), move |event| {
            let weak = weak.clone();
            async move {
                if let Some(shared) = weak.upgrade() {
                    if let Some(endpoint) = decode_field::<EndpointId>(&event.data, "endpoint") {
                        shared.relocate(endpoint);
                    }
                }
                Value::Null
            }
        });
        listeners.push((message_type, id));

        let message_type = message_types::state(key);
        let weak = Arc::downgrade(shared);
        let id = bus.on(message_type.clone(), move |event| {
            let weak = weak.clone();
            async move {
                if let Some(shared) = weak.upgrade() {
                    if let Some(enabled) = decode_field::<bool>(&event.data, "enabled") {
                        shared.set_remote_enabled(enabled);
                    }
                }
                Value::Null
            }
        });
        listeners.push((message_type, id));

        *shared.listeners.lock().unwrap_or_else(|e| e.into_inner()) = listeners;
    }

    /// Calls `method` on the receiver.
    ///
    /// Fails with `UnknownMethod` when the receiver did not advertise it.
    /// While the receiver is disabled the call is buffered and resolves after
    /// it is re-enabled.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::SeqCst) {
            return Err(WeftError::Channel(format!("channel {} is closed", shared.key)));
        }
        if !self.has_method(method) {
            return Err(WeftError::UnknownMethod {
                channel: shared.key.clone(),
                method: method.to_string(),
            });
        }
        // earlier buffered calls go first
        if !shared.is_enabled() || !shared.buffer().is_empty() {
            let pending = shared.enqueue(method, args)?;
            if shared.is_enabled() {
                shared.flush();
            }
            return pending.await.map_err(|_| {
                WeftError::Channel(format!("buffered call to {method} on {} was dropped", shared.key))
            })?;
        }
        shared.deliver(method, args).await
    }

    pub fn id(&self) -> &RequestPath {
        &self.shared.id
    }

    pub fn sub_channel(&self) -> Option<&str> {
        self.shared.sub_channel.as_deref()
    }

    /// Endpoint the receiver was last seen on.
    pub fn destination(&self) -> Option<EndpointId> {
        self.shared.state().destination
    }

    /// Whether calls currently skip the bus.
    pub fn is_direct(&self) -> bool {
        self.shared.state().direct.strong_count() > 0
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.is_enabled()
    }

    /// Methods callable through this sender, sorted.
    pub fn methods(&self) -> Vec<String> {
        self.shared.state().methods.iter().cloned().collect()
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.shared.state().methods.contains(method)
    }

    /// Number of calls waiting for the receiver to be re-enabled.
    pub fn buffered_calls(&self) -> usize {
        self.shared.buffer().len()
    }

    /// Stops tracking the receiver. Later calls fail; buffered calls are dropped.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.remove_listeners();
        self.shared.buffer().clear();
        debug!(target: "channel", channel = %self.shared.key, "Closed channel sender");
    }
}
