use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::envelope::{Destinations, EndpointId, EndpointRole, Envelope, EnvelopeKind};
use super::transport::Transport;
use crate::config::IpcConfig;
use crate::{Result, WeftError};

/// Event handed to a local listener.
#[derive(Debug, Clone)]
pub struct IpcEvent {
    pub source: EndpointId,
    pub message_type: String,
    pub data: Value,
}

pub type ListenerFuture = Pin<Box<dyn Future<Output = Value> + Send>>;
type Handler = Arc<dyn Fn(IpcEvent) -> ListenerFuture + Send + Sync>;

/// Handle returned by `on`/`once`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ListenerEntry {
    id: ListenerId,
    once: bool,
    handler: Handler,
}

/// Bookkeeping for one outstanding send.
struct ResponseTracker {
    responder: oneshot::Sender<Vec<Value>>,
    received: usize,
    /// Unknown on peers until the coordinator's fan-out reports it
    expected: Option<usize>,
    accumulated: Vec<Value>,
    opened_at: DateTime<Utc>,
}

/// Endpoint-local message bus.
///
/// Star topology: peers only talk to the coordinator, which fans sends out on
/// their behalf and relays responses back. Every send gets one response
/// tracker at its source endpoint; the returned future resolves once every
/// endpoint targeted at dispatch time has answered. There is no built-in
/// timeout: callers needing a bounded wait wrap `send` in
/// `tokio::time::timeout`.
///
/// # Examples
///
/// ```no_run
/// use serde_json::json;
/// use weft_core::config::IpcConfig;
/// use weft_core::ipc::{Destinations, EndpointId, EndpointRole, MessageBus};
///
/// # async fn example() -> weft_core::Result<()> {
/// let bus = MessageBus::new(EndpointRole::Coordinator, EndpointId::COORDINATOR, &IpcConfig::default())?;
/// bus.start()?;
/// bus.on("ping", |event| async move { json!(event.data["n"].as_i64().unwrap_or(0) + 1) });
/// let responses = bus.send("ping", json!({"n": 1}), Destinations::All).await?;
/// assert_eq!(responses, vec![json!(2)]);
/// # Ok(())
/// # }
/// ```
pub struct MessageBus {
    role: EndpointRole,
    id: EndpointId,
    listeners: DashMap<String, Vec<ListenerEntry>>,
    trackers: DashMap<u64, ResponseTracker>,
    next_response_id: AtomicU64,
    next_listener_id: AtomicU64,
    // Coordinator: one link per live peer. Peer: the upstream link, keyed by the coordinator id.
    endpoints: DashMap<EndpointId, Arc<dyn Transport>>,
    inbox_tx: mpsc::Sender<Envelope>,
    inbox_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MessageBus {
    pub fn new(role: EndpointRole, id: EndpointId, config: &IpcConfig) -> Result<Arc<Self>> {
        let valid = match role {
            EndpointRole::Coordinator => id.is_coordinator(),
            EndpointRole::Peer => !id.is_coordinator(),
        };
        if !valid {
            return Err(WeftError::Ipc(format!(
                "endpoint {id} cannot take the {role:?} role"
            )));
        }
        let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity.max(1));
        Ok(Arc::new(Self {
            role,
            id,
            listeners: DashMap::new(),
            trackers: DashMap::new(),
            next_response_id: AtomicU64::new(0),
            next_listener_id: AtomicU64::new(0),
            endpoints: DashMap::new(),
            inbox_tx,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            pump: Mutex::new(None),
        }))
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn role(&self) -> EndpointRole {
        self.role
    }

    pub fn is_coordinator(&self) -> bool {
        self.role == EndpointRole::Coordinator
    }

    /// Starts the endpoint's event loop draining the inbox.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut rx = self
            .inbox_rx
            .lock()
            .map_err(|_| WeftError::Ipc("inbox lock poisoned".into()))?
            .take()
            .ok_or_else(|| WeftError::Ipc("message bus already started".into()))?;
        let bus = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let Some(bus) = bus.upgrade() else {
                    break;
                };
                bus.handle_envelope(envelope).await;
            }
        });
        if let Ok(mut pump) = self.pump.lock() {
            *pump = Some(handle);
        }
        info!(target: "ipc", endpoint = %self.id, role = ?self.role, "Message bus started");
        Ok(())
    }

    /// Stops the event loop and drops all listeners, links and trackers.
    ///
    /// Outstanding sends resolve with an error once their tracker is dropped.
    pub fn shutdown(&self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
        self.listeners.clear();
        self.trackers.clear();
        self.endpoints.clear();
        info!(target: "ipc", endpoint = %self.id, "Message bus shut down");
    }

    // ------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------

    /// Coordinator only: adds a peer to the live destination set.
    pub fn register_endpoint(&self, transport: Arc<dyn Transport>, id: EndpointId) -> Result<()> {
        if !self.is_coordinator() {
            return Err(WeftError::Ipc(
                "only the coordinator can register endpoints".into(),
            ));
        }
        if id.is_coordinator() {
            return Err(WeftError::Ipc(
                "endpoint 0 is reserved for the coordinator".into(),
            ));
        }
        self.endpoints.insert(id, transport);
        info!(target: "ipc", endpoint = %id, "Registered endpoint");
        Ok(())
    }

    /// Coordinator only: removes a peer from the live destination set.
    pub fn deregister_endpoint(&self, id: EndpointId) -> bool {
        if !self.is_coordinator() {
            return false;
        }
        let removed = self.endpoints.remove(&id).is_some();
        if removed {
            info!(target: "ipc", endpoint = %id, "Deregistered endpoint");
        }
        removed
    }

    /// Peer only: sets the link to the coordinator.
    pub fn connect_upstream(&self, transport: Arc<dyn Transport>) -> Result<()> {
        if self.is_coordinator() {
            return Err(WeftError::Ipc("the coordinator has no upstream".into()));
        }
        self.endpoints.insert(EndpointId::COORDINATOR, transport);
        Ok(())
    }

    /// Endpoints a `Destinations::All` send currently reaches (coordinator view).
    pub fn endpoints(&self) -> Vec<EndpointId> {
        self.resolve_destinations(&Destinations::All)
    }

    /// Number of sends still waiting for responses.
    pub fn pending_responses(&self) -> usize {
        self.trackers.len()
    }

    // ------------------------------------------------------------------
    // Local listeners
    // ------------------------------------------------------------------

    pub fn on<F, Fut>(&self, message_type: impl Into<String>, handler: F) -> ListenerId
    where
        F: Fn(IpcEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        self.add_listener(message_type.into(), handler, false)
    }

    /// Listener removed after its first invocation.
    pub fn once<F, Fut>(&self, message_type: impl Into<String>, handler: F) -> ListenerId
    where
        F: Fn(IpcEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        self.add_listener(message_type.into(), handler, true)
    }

    pub fn off(&self, message_type: &str, id: ListenerId) -> bool {
        let removed = match self.listeners.get_mut(message_type) {
            Some(mut entries) => {
                let before = entries.len();
                entries.retain(|e| e.id != id);
                entries.len() < before
            }
            None => false,
        };
        self.listeners
            .remove_if(message_type, |_, entries| entries.is_empty());
        removed
    }

    pub fn listener_count(&self, message_type: &str) -> usize {
        self.listeners
            .get(message_type)
            .map(|e| e.len())
            .unwrap_or(0)
    }

    fn add_listener<F, Fut>(&self, message_type: String, handler: F, once: bool) -> ListenerId
    where
        F: Fn(IpcEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Value> + Send + 'static,
    {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler = Arc::new(move |event| Box::pin(handler(event)) as ListenerFuture);
        trace!(target: "ipc", endpoint = %self.id, message_type = %message_type, once, "Adding listener");
        self.listeners
            .entry(message_type)
            .or_default()
            .push(ListenerEntry { id, once, handler });
        id
    }

    /// Invokes local listeners in registration order, returning their pending results.
    fn emit_local(&self, message_type: &str, source: EndpointId, data: &Value) -> Vec<ListenerFuture> {
        let handlers: Vec<Handler> = match self.listeners.get_mut(message_type) {
            Some(mut entries) => {
                let handlers = entries.iter().map(|e| Arc::clone(&e.handler)).collect();
                entries.retain(|e| !e.once);
                handlers
            }
            None => Vec::new(),
        };
        handlers
            .into_iter()
            .map(|handler| {
                handler(IpcEvent {
                    source,
                    message_type: message_type.to_string(),
                    data: data.clone(),
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Sends `message_type` to `destinations` and gathers every listener result.
    ///
    /// Destinations that are not live are dropped before dispatch. With no
    /// remaining destination the call resolves immediately with an empty
    /// list. Responses are concatenated in the order endpoints replied. A
    /// target whose link fails at dispatch counts as an empty response.
    pub async fn send(
        self: &Arc<Self>,
        message_type: &str,
        data: Value,
        destinations: impl Into<Destinations>,
    ) -> Result<Vec<Value>> {
        let destinations = destinations.into();
        let response_id = self.next_response_id.fetch_add(1, Ordering::Relaxed);
        let (responder, receiver) = oneshot::channel();

        if self.is_coordinator() {
            let targets = self.resolve_destinations(&destinations);
            if targets.is_empty() {
                debug!(target: "ipc", message_type, "No live destination; resolving empty");
                return Ok(Vec::new());
            }
            self.trackers.insert(
                response_id,
                ResponseTracker::new(responder, Some(targets.len())),
            );
            let mut envelope = Envelope::new(
                EnvelopeKind::Event,
                message_type,
                data,
                destinations,
                self.id,
            );
            envelope.response_id = Some(response_id);
            envelope.response_origin_count = targets.len();
            debug!(target: "ipc", message_type, response_id, targets = ?targets, "Dispatching");
            self.dispatch(envelope, &targets).await;
        } else {
            self.trackers
                .insert(response_id, ResponseTracker::new(responder, None));
            let mut envelope = Envelope::new(
                EnvelopeKind::Forward,
                message_type,
                data,
                destinations,
                self.id,
            );
            envelope.response_id = Some(response_id);
            debug!(target: "ipc", endpoint = %self.id, message_type, response_id, "Forwarding to coordinator");
            if let Err(e) = self.transmit(EndpointId::COORDINATOR, envelope).await {
                self.trackers.remove(&response_id);
                return Err(e);
            }
        }

        receiver.await.map_err(|_| {
            WeftError::Ipc(format!(
                "response tracker for '{message_type}' dropped before completion"
            ))
        })
    }

    /// Round trip answered by the coordinator's local listeners only.
    pub async fn send_sync(self: &Arc<Self>, message_type: &str, data: Value) -> Result<Vec<Value>> {
        self.send(message_type, data, EndpointId::COORDINATOR).await
    }

    /// Live, de-duplicated targets of a send (coordinator view).
    fn resolve_destinations(&self, destinations: &Destinations) -> Vec<EndpointId> {
        match destinations {
            Destinations::All => {
                let mut ids: Vec<EndpointId> = self
                    .endpoints
                    .iter()
                    .map(|e| *e.key())
                    .filter(|id| *id != self.id)
                    .collect();
                ids.sort();
                ids.insert(0, self.id);
                ids
            }
            Destinations::Only(ids) => {
                let mut seen = HashSet::new();
                ids.iter()
                    .copied()
                    .filter(|id| {
                        let live = *id == self.id || self.endpoints.contains_key(id);
                        if !live {
                            debug!(target: "ipc", endpoint = %id, "Dropping unknown destination");
                        }
                        live && seen.insert(*id)
                    })
                    .collect()
            }
        }
    }

    async fn dispatch(self: &Arc<Self>, envelope: Envelope, targets: &[EndpointId]) {
        for &target in targets {
            if target == self.id {
                self.answer(envelope.clone());
                continue;
            }
            if let Err(e) = self.transmit(target, envelope.clone()).await {
                warn!(
                    target: "ipc",
                    endpoint = %target,
                    message_type = %envelope.message_type,
                    error = %e,
                    "Destination unreachable; counting it as an empty response"
                );
                let empty = Envelope::response_to(&envelope, target, Vec::new());
                self.route_response(empty).await;
            }
        }
    }

    async fn transmit(&self, target: EndpointId, envelope: Envelope) -> Result<()> {
        let hop = if self.is_coordinator() {
            target
        } else {
            EndpointId::COORDINATOR
        };
        let transport = self
            .endpoints
            .get(&hop)
            .map(|t| Arc::clone(t.value()))
            .ok_or_else(|| WeftError::Transport(format!("no link to endpoint {hop}")))?;
        transport.send(envelope).await
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Queues an envelope arriving from a transport.
    pub async fn deliver(&self, envelope: Envelope) -> Result<()> {
        self.inbox_tx
            .send(envelope)
            .await
            .map_err(|_| WeftError::Transport(format!("inbox of endpoint {} is closed", self.id)))
    }

    /// Queues an encoded envelope; undecodable frames are logged and dropped.
    pub async fn deliver_frame(&self, frame: &[u8]) -> Result<()> {
        match Envelope::decode(frame) {
            Some(envelope) => self.deliver(envelope).await,
            None => Ok(()),
        }
    }

    async fn handle_envelope(self: &Arc<Self>, envelope: Envelope) {
        trace!(
            target: "ipc",
            endpoint = %self.id,
            kind = ?envelope.kind,
            message_type = %envelope.message_type,
            source = %envelope.source,
            "Handling envelope"
        );
        match envelope.kind {
            EnvelopeKind::Event => self.answer(envelope),
            EnvelopeKind::Forward => {
                if !self.is_coordinator() {
                    warn!(target: "ipc", endpoint = %self.id, "Peer received a forward request; dropping");
                    return;
                }
                let targets = self.resolve_destinations(&envelope.destinations);
                let mut envelope = envelope;
                envelope.kind = EnvelopeKind::Event;
                envelope.response_origin_count = targets.len();
                if targets.is_empty() {
                    let empty = Envelope::response_to(&envelope, self.id, Vec::new());
                    self.route_response(empty).await;
                    return;
                }
                self.dispatch(envelope, &targets).await;
            }
            EnvelopeKind::Response => self.route_response(envelope).await,
        }
    }

    /// Emits `request` locally and sends the gathered results back to its source.
    fn answer(self: &Arc<Self>, request: Envelope) {
        let pending = self.emit_local(&request.message_type, request.source, &request.data);
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            let values = collect_results(pending).await;
            let response = Envelope::response_to(&request, bus.id, values);
            bus.route_response(response).await;
        });
    }

    async fn route_response(&self, response: Envelope) {
        match response.response_target() {
            Some(target) if target == self.id => self.accept_response(response),
            Some(target) => {
                if let Err(e) = self.transmit(target, response).await {
                    warn!(target: "ipc", endpoint = %target, error = %e, "Failed to route response");
                }
            }
            None => warn!(target: "ipc", "Response without a target endpoint; dropping"),
        }
    }

    fn accept_response(&self, response: Envelope) {
        let Some(response_id) = response.response_id else {
            warn!(target: "ipc", message_type = %response.message_type, "Response without id; dropping");
            return;
        };
        let values = response.response_values();
        let finished = match self.trackers.get_mut(&response_id) {
            Some(mut tracker) => {
                let expected = *tracker
                    .expected
                    .get_or_insert(response.response_origin_count);
                tracker.received += 1;
                tracker.accumulated.extend(values);
                trace!(
                    target: "ipc",
                    response_id,
                    from = %response.source,
                    received = tracker.received,
                    expected,
                    transit_ms = Utc::now().timestamp_millis() - response.sent_at_ms,
                    "Accumulated response"
                );
                tracker.received >= expected
            }
            None => {
                warn!(target: "ipc", response_id, "Response for unknown tracker; dropping");
                return;
            }
        };
        if finished {
            if let Some((_, tracker)) = self.trackers.remove(&response_id) {
                debug!(
                    target: "ipc",
                    response_id,
                    message_type = %response.message_type,
                    round_trip_ms = (Utc::now() - tracker.opened_at).num_milliseconds(),
                    "Send resolved"
                );
                let _ = tracker.responder.send(tracker.accumulated);
            }
        }
    }
}

impl ResponseTracker {
    fn new(responder: oneshot::Sender<Vec<Value>>, expected: Option<usize>) -> Self {
        Self {
            responder,
            received: 0,
            expected,
            accumulated: Vec::new(),
            opened_at: Utc::now(),
        }
    }
}

/// Awaits listener results concurrently, keeping registration order.
async fn collect_results(pending: Vec<ListenerFuture>) -> Vec<Value> {
    let handles: Vec<_> = pending.into_iter().map(tokio::spawn).collect();
    let mut values = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(value) => values.push(value),
            Err(e) => {
                warn!(target: "ipc", error = %e, "Listener failed; answering null");
                values.push(Value::Null);
            }
        }
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::transport::MockTransport;
    use serde_json::json;

    #[test]
    fn role_must_match_id() {
        let cfg = IpcConfig::default();
        assert!(MessageBus::new(EndpointRole::Peer, EndpointId::COORDINATOR, &cfg).is_err());
        assert!(MessageBus::new(EndpointRole::Coordinator, EndpointId(2), &cfg).is_err());
    }

    #[test]
    fn peers_cannot_register_endpoints() {
        let bus = MessageBus::new(EndpointRole::Peer, EndpointId(1), &IpcConfig::default()).unwrap();
        let transport = Arc::new(MockTransport::new());
        assert!(bus.register_endpoint(transport, EndpointId(2)).is_err());
    }

    #[tokio::test]
    async fn no_destination_resolves_immediately() {
        let bus = MessageBus::new(
            EndpointRole::Coordinator,
            EndpointId::COORDINATOR,
            &IpcConfig::default(),
        )
        .unwrap();
        let out = bus
            .send("nothing", Value::Null, Destinations::Only(vec![EndpointId(9)]))
            .await
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(bus.pending_responses(), 0);
    }

    #[tokio::test]
    async fn peer_send_is_forwarded_and_aggregated() {
        let bus = MessageBus::new(EndpointRole::Peer, EndpointId(1), &IpcConfig::default()).unwrap();
        let (seen_tx, seen_rx) = std::sync::mpsc::channel();
        let mut upstream = MockTransport::new();
        upstream.expect_send().times(1).returning(move |envelope| {
            seen_tx.send(envelope).unwrap();
            Ok(())
        });
        bus.connect_upstream(Arc::new(upstream)).unwrap();

        let sender = Arc::clone(&bus);
        let pending =
            tokio::spawn(async move { sender.send("ping", json!({"n": 1}), Destinations::All).await });

        let forwarded = loop {
            if let Ok(envelope) = seen_rx.try_recv() {
                break envelope;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(forwarded.kind, EnvelopeKind::Forward);
        assert_eq!(forwarded.destinations, Destinations::All);
        assert!(forwarded.response_id.is_some());

        // Coordinator fanned out to two endpoints
        let mut fanned = forwarded.clone();
        fanned.kind = EnvelopeKind::Event;
        fanned.response_origin_count = 2;
        bus.handle_envelope(Envelope::response_to(&fanned, EndpointId::COORDINATOR, vec![json!(2)]))
            .await;
        assert_eq!(bus.pending_responses(), 1);
        bus.handle_envelope(Envelope::response_to(&fanned, EndpointId(1), vec![json!(2)]))
            .await;

        let values = pending.await.unwrap().unwrap();
        assert_eq!(values, vec![json!(2), json!(2)]);
        assert_eq!(bus.pending_responses(), 0);
    }
}
