//! Module registry: priority-based module resolution and instance ids.
//!
//! The coordinator holds the authoritative tables. Peers keep an empty local
//! table and resolve through the coordinator with synchronous bus round trips
//! (`Registry.request`, `Registry.registerInstance`,
//! `Registry.deregisterInstance`).

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::channel::{ChannelHub, ChannelSender};
use crate::config::RegistryConfig;
use crate::ipc::{decode_field, ListenerId, MessageBus};
use crate::{RequestPath, Result, WeftError};

pub const REQUEST_MESSAGE: &str = "Registry.request";
pub const REGISTER_INSTANCE_MESSAGE: &str = "Registry.registerInstance";
pub const DEREGISTER_INSTANCE_MESSAGE: &str = "Registry.deregisterInstance";

/// A module type that can satisfy requests, named by its global module path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleRef(pub String);

impl ModuleRef {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type PriorityFn = Arc<dyn Fn(&Request) -> f64 + Send + Sync>;
pub type Selector = Arc<dyn Fn(&[ModuleRef]) -> Vec<ModuleRef> + Send + Sync>;

/// How many of the ranked candidates a request wants.
#[derive(Clone)]
pub enum Use {
    /// Highest priority only
    One,
    All,
    /// Picks from the full ranked list
    Custom(Selector),
}

impl fmt::Debug for Use {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Use::One => f.write_str("One"),
            Use::All => f.write_str("All"),
            Use::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A request for modules of `request_type`.
#[derive(Debug, Clone)]
pub struct Request {
    pub request_type: String,
    pub use_: Use,
    pub data: Value,
    /// Path of the requesting module, visible to priority functions
    pub source: Option<RequestPath>,
    /// Sub-channel `request_handle` connects to
    pub sub_channel: Option<String>,
}

impl Request {
    pub fn new(request_type: impl Into<String>) -> Self {
        Self {
            request_type: request_type.into(),
            use_: Use::One,
            data: Value::Null,
            source: None,
            sub_channel: None,
        }
    }

    pub fn use_all(mut self) -> Self {
        self.use_ = Use::All;
        self
    }

    pub fn use_custom<F>(mut self, selector: F) -> Self
    where
        F: Fn(&[ModuleRef]) -> Vec<ModuleRef> + Send + Sync + 'static,
    {
        self.use_ = Use::Custom(Arc::new(selector));
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn from_source(mut self, source: RequestPath) -> Self {
        self.source = Some(source);
        self
    }

    pub fn on_sub_channel(mut self, sub_channel: impl Into<String>) -> Self {
        self.sub_channel = Some(sub_channel.into());
        self
    }

    fn to_wire(&self) -> WireRequest {
        WireRequest {
            request_type: self.request_type.clone(),
            // custom selectors run where the request was made
            all: !matches!(self.use_, Use::One),
            data: self.data.clone(),
            source: self.source.clone(),
        }
    }
}

/// Form of a request sent to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireRequest {
    request_type: String,
    all: bool,
    data: Value,
    source: Option<RequestPath>,
}

impl WireRequest {
    fn into_request(self) -> Request {
        Request {
            request_type: self.request_type,
            use_: if self.all { Use::All } else { Use::One },
            data: self.data,
            source: self.source,
            sub_channel: None,
        }
    }
}

/// Outcome of resolving a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    None,
    One(ModuleRef),
    Many(Vec<ModuleRef>),
}

impl Resolved {
    fn from_ranked(use_: &Use, ranked: Vec<ModuleRef>) -> Self {
        match use_ {
            Use::One => ranked.into_iter().next().map_or(Resolved::None, Resolved::One),
            Use::All => Resolved::Many(ranked),
            Use::Custom(selector) => Resolved::Many(selector(&ranked)),
        }
    }

    pub fn one(&self) -> Option<&ModuleRef> {
        match self {
            Resolved::One(module) => Some(module),
            Resolved::Many(modules) => modules.first(),
            Resolved::None => None,
        }
    }

    pub fn into_vec(self) -> Vec<ModuleRef> {
        match self {
            Resolved::None => Vec::new(),
            Resolved::One(module) => vec![module],
            Resolved::Many(modules) => modules,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Resolved::None)
    }
}

/// Instantiates modules for `request_handle`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModuleLauncher: Send + Sync {
    /// Creates an instance of `module` and returns the unique path of its channel receiver.
    async fn launch(&self, module: &ModuleRef, request: &Request) -> Result<RequestPath>;
}

struct RegistryListener {
    module: ModuleRef,
    priority: PriorityFn,
}

/// Endpoint-local view of the module registry.
pub struct Registry {
    bus: Arc<MessageBus>,
    channels: Arc<ChannelHub>,
    config: RegistryConfig,
    listeners: DashMap<String, Vec<RegistryListener>>,
    // type key -> live instance ids
    instances: DashMap<String, BTreeSet<u32>>,
    launcher: RwLock<Option<Arc<dyn ModuleLauncher>>>,
    bus_listeners: Mutex<Vec<(&'static str, ListenerId)>>,
}

impl Registry {
    pub fn new(bus: Arc<MessageBus>, channels: Arc<ChannelHub>, config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            bus,
            channels,
            config,
            listeners: DashMap::new(),
            instances: DashMap::new(),
            launcher: RwLock::new(None),
            bus_listeners: Mutex::new(Vec::new()),
        })
    }

    /// On the coordinator, starts answering registry requests from peers.
    pub fn init(self: &Arc<Self>) {
        if !self.bus.is_coordinator() {
            return;
        }
        let mut ids = Vec::with_capacity(3);

        let weak = Arc::downgrade(self);
        ids.push((
            REQUEST_MESSAGE,
            self.bus.on(REQUEST_MESSAGE, move |event| {
                let registry = Weak::clone(&weak);
                async move {
                    match registry.upgrade() {
                        Some(registry) => registry.answer_requests(&event.data),
                        None => Value::Null,
                    }
                }
            }),
        ));

        let weak = Arc::downgrade(self);
        ids.push((
            REGISTER_INSTANCE_MESSAGE,
            self.bus.on(REGISTER_INSTANCE_MESSAGE, move |event| {
                let registry = Weak::clone(&weak);
                async move {
                    let path = decode_field::<RequestPath>(&event.data, "path");
                    match (registry.upgrade(), path) {
                        (Some(registry), Some(path)) => json!(registry.allocate_instance(&path)),
                        _ => Value::Null,
                    }
                }
            }),
        ));

        let weak = Arc::downgrade(self);
        ids.push((
            DEREGISTER_INSTANCE_MESSAGE,
            self.bus.on(DEREGISTER_INSTANCE_MESSAGE, move |event| {
                let registry = Weak::clone(&weak);
                async move {
                    let path = decode_field::<RequestPath>(&event.data, "path");
                    match (registry.upgrade(), path) {
                        (Some(registry), Some(path)) => json!(registry.free_instance(&path)),
                        _ => json!(false),
                    }
                }
            }),
        ));

        *self.bus_listeners.lock().unwrap_or_else(|e| e.into_inner()) = ids;
        info!(target: "registry", "Registry serving peer requests");
    }

    pub fn shutdown(&self) {
        let ids = std::mem::take(&mut *self.bus_listeners.lock().unwrap_or_else(|e| e.into_inner()));
        for (message_type, id) in ids {
            self.bus.off(message_type, id);
        }
    }

    pub fn set_launcher(&self, launcher: Arc<dyn ModuleLauncher>) {
        *self.launcher.write().unwrap_or_else(|e| e.into_inner()) = Some(launcher);
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Registers `module` as able to satisfy `request_type` with `priority`.
    ///
    /// Returns false on peers, whose requests resolve on the coordinator, and
    /// when the type already has the configured maximum of listeners.
    pub fn register_listener<F>(&self, request_type: impl Into<String>, module: ModuleRef, priority: F) -> bool
    where
        F: Fn(&Request) -> f64 + Send + Sync + 'static,
    {
        let request_type = request_type.into();
        if !self.bus.is_coordinator() {
            warn!(
                target: "registry",
                endpoint = %self.bus.id(),
                request_type = %request_type,
                module = %module,
                "Listeners must be registered on the coordinator; ignoring"
            );
            return false;
        }
        let mut entries = self.listeners.entry(request_type.clone()).or_default();
        if entries.len() >= self.config.max_listeners_per_type {
            warn!(target: "registry", request_type = %request_type, module = %module, "Listener limit reached");
            return false;
        }
        debug!(target: "registry", request_type = %request_type, module = %module, "Registered listener");
        entries.push(RegistryListener {
            module,
            priority: Arc::new(priority),
        });
        true
    }

    /// Registers a listener with a fixed priority.
    pub fn register_static(&self, request_type: impl Into<String>, module: ModuleRef, priority: f64) -> bool {
        self.register_listener(request_type, module, move |_| priority)
    }

    pub fn deregister_listener(&self, request_type: &str, module: &ModuleRef) -> bool {
        let removed = match self.listeners.get_mut(request_type) {
            Some(mut entries) => {
                let before = entries.len();
                entries.retain(|l| &l.module != module);
                entries.len() < before
            }
            None => false,
        };
        self.listeners
            .remove_if(request_type, |_, entries| entries.is_empty());
        removed
    }

    /// Candidates for `request` from the local table, highest priority first.
    ///
    /// Listeners with a priority of 0 or less are excluded; ties keep
    /// registration order.
    pub fn ranked(&self, request: &Request) -> Vec<ModuleRef> {
        let candidates: Vec<(ModuleRef, PriorityFn)> = match self.listeners.get(&request.request_type) {
            Some(entries) => entries
                .iter()
                .map(|l| (l.module.clone(), Arc::clone(&l.priority)))
                .collect(),
            None => Vec::new(),
        };
        let mut scored: Vec<(ModuleRef, f64)> = candidates
            .into_iter()
            .map(|(module, priority)| (module, priority(request)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(module, _)| module).collect()
    }

    /// Resolves `request` against the local table.
    pub fn resolve(&self, request: &Request) -> Resolved {
        Resolved::from_ranked(&request.use_, self.ranked(request))
    }

    fn answer_requests(&self, data: &Value) -> Value {
        let requests: Vec<WireRequest> = decode_field(data, "requests").unwrap_or_default();
        let answers: Vec<Vec<ModuleRef>> = requests
            .into_iter()
            .map(|wire| {
                let request = wire.into_request();
                self.resolve(&request).into_vec()
            })
            .collect();
        json!(answers)
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Resolves `request` on the coordinator, wherever this endpoint is.
    pub async fn request_module(&self, request: &Request) -> Result<Resolved> {
        let mut resolved = self.request_batch(std::slice::from_ref(request)).await?;
        Ok(resolved.pop().unwrap_or(Resolved::None))
    }

    /// Resolves several requests in one round trip, keyed by request type.
    pub async fn request_modules(&self, requests: &[Request]) -> Result<HashMap<String, Resolved>> {
        let resolved = self.request_batch(requests).await?;
        Ok(requests
            .iter()
            .map(|r| r.request_type.clone())
            .zip(resolved)
            .collect())
    }

    async fn request_batch(&self, requests: &[Request]) -> Result<Vec<Resolved>> {
        if self.bus.is_coordinator() {
            return Ok(requests.iter().map(|r| self.resolve(r)).collect());
        }
        let wire: Vec<WireRequest> = requests.iter().map(Request::to_wire).collect();
        let responses = self
            .bus
            .send_sync(REQUEST_MESSAGE, json!({ "requests": wire }))
            .await?;
        let answer = responses
            .into_iter()
            .next()
            .ok_or_else(|| WeftError::Registry("coordinator did not answer the registry request".into()))?;
        let lists: Vec<Vec<ModuleRef>> = serde_json::from_value(answer)
            .map_err(|e| WeftError::Registry(format!("malformed registry answer: {e}")))?;
        if lists.len() != requests.len() {
            return Err(WeftError::Registry(format!(
                "registry answered {} of {} requests",
                lists.len(),
                requests.len()
            )));
        }
        Ok(requests
            .iter()
            .zip(lists)
            .map(|(request, ranked)| Resolved::from_ranked(&request.use_, ranked))
            .collect())
    }

    /// Resolves `request`, launches each selected module and connects a
    /// channel to it.
    pub async fn request_handle(&self, request: &Request) -> Result<Vec<ChannelSender>> {
        let modules = self.request_module(request).await?.into_vec();
        if modules.is_empty() {
            return Ok(Vec::new());
        }
        let launcher = self
            .launcher
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| WeftError::Registry("no module launcher configured".into()))?;
        let mut senders = Vec::with_capacity(modules.len());
        for module in &modules {
            let path = launcher.launch(module, request).await?;
            debug!(target: "registry", module = %module, path = %path, "Launched module");
            let sender = ChannelSender::connect(
                &self.channels,
                path,
                request.sub_channel.clone(),
                request.source.clone(),
            )
            .await?;
            senders.push(sender);
        }
        Ok(senders)
    }

    // ------------------------------------------------------------------
    // Instance ids
    // ------------------------------------------------------------------

    /// Allocates the smallest free instance id for `path`'s type.
    pub async fn register_instance(&self, path: &RequestPath) -> Result<u32> {
        if self.bus.is_coordinator() {
            return Ok(self.allocate_instance(path));
        }
        let responses = self
            .bus
            .send_sync(REGISTER_INSTANCE_MESSAGE, json!({ "path": path }))
            .await?;
        responses
            .into_iter()
            .next()
            .and_then(|v| v.as_u64())
            .and_then(|id| u32::try_from(id).ok())
            .ok_or_else(|| WeftError::Registry(format!("no instance id allocated for {}", path.type_key())))
    }

    /// Frees `path`'s instance id. Returns false if it was not allocated.
    pub async fn deregister_instance(&self, path: &RequestPath) -> Result<bool> {
        if self.bus.is_coordinator() {
            return Ok(self.free_instance(path));
        }
        let responses = self
            .bus
            .send_sync(DEREGISTER_INSTANCE_MESSAGE, json!({ "path": path }))
            .await?;
        Ok(responses
            .into_iter()
            .next()
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    /// Live instance ids of `path`'s type (coordinator view).
    pub fn instances(&self, path: &RequestPath) -> Vec<u32> {
        self.instances
            .get(&path.type_key())
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    fn allocate_instance(&self, path: &RequestPath) -> u32 {
        let key = path.type_key();
        // the entry guard serializes allocations for one type
        let mut ids = self.instances.entry(key.clone()).or_default();
        let id = (0..=u32::MAX).find(|i| !ids.contains(i)).unwrap_or(u32::MAX);
        ids.insert(id);
        debug!(target: "registry", path = %key, instance = id, "Allocated instance id");
        id
    }

    fn free_instance(&self, path: &RequestPath) -> bool {
        let key = path.type_key();
        let instance = path.last().instance_id;
        let removed = self
            .instances
            .get_mut(&key)
            .map(|mut ids| ids.remove(&instance))
            .unwrap_or(false);
        self.instances.remove_if(&key, |_, ids| ids.is_empty());
        if removed {
            debug!(target: "registry", path = %key, instance, "Freed instance id");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, IpcConfig};
    use crate::ipc::{EndpointId, EndpointRole};

    fn coordinator_registry() -> Arc<Registry> {
        let bus = MessageBus::new(EndpointRole::Coordinator, EndpointId::COORDINATOR, &IpcConfig::default()).unwrap();
        let hub = ChannelHub::new(Arc::clone(&bus), ChannelConfig::default());
        Registry::new(bus, hub, RegistryConfig::default())
    }

    #[test]
    fn ranking_drops_non_positive_and_keeps_ties_in_order() {
        let registry = coordinator_registry();
        registry.register_static("edit", ModuleRef::new("a"), 1.0);
        registry.register_static("edit", ModuleRef::new("b"), 3.0);
        registry.register_static("edit", ModuleRef::new("c"), 0.0);
        registry.register_static("edit", ModuleRef::new("d"), 1.0);
        let ranked = registry.ranked(&Request::new("edit"));
        assert_eq!(
            ranked,
            vec![ModuleRef::new("b"), ModuleRef::new("a"), ModuleRef::new("d")]
        );
    }

    #[test]
    fn listener_limit_is_enforced() {
        let bus = MessageBus::new(EndpointRole::Coordinator, EndpointId::COORDINATOR, &IpcConfig::default()).unwrap();
        let hub = ChannelHub::new(Arc::clone(&bus), ChannelConfig::default());
        let registry = Registry::new(bus, hub, RegistryConfig { max_listeners_per_type: 1 });
        assert!(registry.register_static("edit", ModuleRef::new("a"), 1.0));
        assert!(!registry.register_static("edit", ModuleRef::new("b"), 1.0));
    }

    #[test]
    fn freed_ids_are_reused_smallest_first() {
        let registry = coordinator_registry();
        let path = RequestPath::parse("root->tab").unwrap();
        assert_eq!(registry.allocate_instance(&path), 0);
        assert_eq!(registry.allocate_instance(&path), 1);
        assert_eq!(registry.allocate_instance(&path), 2);
        assert!(registry.free_instance(&path.with_instance_id(1)));
        assert!(!registry.free_instance(&path.with_instance_id(1)));
        assert_eq!(registry.allocate_instance(&path), 1);
    }

    #[test]
    fn deregistered_listener_stops_resolving() {
        let registry = coordinator_registry();
        registry.register_static("edit", ModuleRef::new("a"), 2.0);
        registry.register_static("edit", ModuleRef::new("b"), 1.0);
        assert!(registry.deregister_listener("edit", &ModuleRef::new("a")));
        assert!(!registry.deregister_listener("edit", &ModuleRef::new("a")));
        assert_eq!(registry.ranked(&Request::new("edit")), vec![ModuleRef::new("b")]);

        assert!(registry.deregister_listener("edit", &ModuleRef::new("b")));
        assert!(registry.ranked(&Request::new("edit")).is_empty());
        assert!(!registry.deregister_listener("view", &ModuleRef::new("b")));
    }

    #[test]
    fn peers_refuse_listener_registration() {
        let bus = MessageBus::new(EndpointRole::Peer, EndpointId(1), &IpcConfig::default()).unwrap();
        let hub = ChannelHub::new(Arc::clone(&bus), ChannelConfig::default());
        let registry = Registry::new(bus, hub, RegistryConfig::default());
        assert!(!registry.register_static("edit", ModuleRef::new("a"), 1.0));
        assert!(registry.ranked(&Request::new("edit")).is_empty());
    }

    #[tokio::test]
    async fn request_handle_uses_launcher() {
        let registry = coordinator_registry();
        registry.register_static("edit", ModuleRef::new("editor"), 1.0);
        let mut launcher = MockModuleLauncher::new();
        launcher
            .expect_launch()
            .times(1)
            .returning(|_, _| Err(WeftError::Registry("launch refused".into())));
        registry.set_launcher(Arc::new(launcher));
        let err = registry.request_handle(&Request::new("edit")).await.unwrap_err();
        assert!(matches!(err, WeftError::Registry(m) if m.contains("refused")));
    }

    #[tokio::test]
    async fn request_handle_without_candidates_is_empty() {
        let registry = coordinator_registry();
        let handles = registry.request_handle(&Request::new("missing")).await.unwrap();
        assert!(handles.is_empty());
    }
}
