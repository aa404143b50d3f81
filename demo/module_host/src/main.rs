mod config;
use config::{ModuleHostConfig, ModuleSpec};

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};
use weft_core::channel::{ExposesChannelMethods, MethodTable};
use weft_core::{
    ChannelHub, ChannelReceiver, Endpoint, EndpointId, ModuleLauncher, ModuleRef, Registry, Request,
    RequestPath, WeftError,
};

/// Demo module: greets callers and counts calls.
struct Greeter {
    spec: ModuleSpec,
    calls: AtomicU64,
}

impl ExposesChannelMethods for Greeter {
    fn channel_methods(self: Arc<Self>) -> MethodTable {
        let greeter = Arc::clone(&self);
        let counter = self;
        MethodTable::new()
            .with("greet", move |call| {
                let greeter = Arc::clone(&greeter);
                async move {
                    greeter.calls.fetch_add(1, Ordering::Relaxed);
                    let who = call.arg(0).as_str().unwrap_or("stranger").to_string();
                    Ok(json!(format!("{}, {who}! ({})", greeter.spec.greeting, greeter.spec.name)))
                }
            })
            .with("calls", move |_| {
                let counter = Arc::clone(&counter);
                async move { Ok(json!(counter.calls.load(Ordering::Relaxed))) }
            })
    }
}

/// Launches modules round-robin over the hosting peers.
struct HostLauncher {
    hosts: Vec<(Arc<ChannelHub>, Arc<Registry>)>,
    specs: HashMap<String, ModuleSpec>,
    parent: RequestPath,
    next: AtomicUsize,
    live: Mutex<Vec<ChannelReceiver>>,
}

#[async_trait]
impl ModuleLauncher for HostLauncher {
    async fn launch(&self, module: &ModuleRef, _request: &Request) -> weft_core::Result<RequestPath> {
        let spec = self
            .specs
            .get(module.as_str())
            .cloned()
            .ok_or_else(|| WeftError::Registry(format!("unknown module {module}")))?;
        let (channels, registry) = &self.hosts[self.next.fetch_add(1, Ordering::Relaxed) % self.hosts.len()];

        let draft = self.parent.augment(module.as_str(), 0);
        let instance = registry.register_instance(&draft).await?;
        let path = draft.with_instance_id(instance);

        let greeter = Arc::new(Greeter {
            spec,
            calls: AtomicU64::new(0),
        });
        let receiver = ChannelReceiver::create(channels, path.clone(), greeter.channel_methods()).await?;
        info!(target: "module_host", module = %module, path = %path, endpoint = %channels.endpoint(), "Module launched");
        if let Ok(mut live) = self.live.lock() {
            live.push(receiver);
        }
        Ok(path)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Logging / tracing
    weft_core::telemetry::init_tracing("info,weft_core=info,module_host=info")?;

    info!(target: "module_host", "Starting module host demo: coordinator + peers → registry → channels");

    // Load configuration (defaults + env + optional TOML overlay)
    let cfg = ModuleHostConfig::load();

    // 1) Coordinator and peers, linked in-process
    let coordinator = Endpoint::coordinator(&cfg.core).await?;
    let mut peers = Vec::new();
    for id in 1..=cfg.peers.max(1) {
        let peer = Endpoint::peer(EndpointId(id), &cfg.core).await?;
        coordinator.link_peer(&peer)?;
        peers.push(peer);
    }
    info!(target: "module_host", endpoints = ?coordinator.bus.endpoints(), "Endpoints linked");

    // 2) Module types offered to the registry
    for spec in &cfg.modules {
        let accepted = coordinator.registry.register_static(
            spec.request_type.clone(),
            ModuleRef::new(spec.name.clone()),
            spec.priority,
        );
        if !accepted {
            warn!(target: "module_host", module = %spec.name, "Registry refused module");
        }
    }

    // 3) Modules are hosted on every peer but the first, which plays the requester
    let requester = &peers[0];
    let hosting = if peers.len() > 1 { &peers[1..] } else { &peers[..] };
    let hosts: Vec<_> = hosting
        .iter()
        .map(|p| (Arc::clone(&p.channels), Arc::clone(&p.registry)))
        .collect();
    let launcher = Arc::new(HostLauncher {
        hosts,
        specs: cfg
            .modules
            .iter()
            .map(|s| (s.name.clone(), s.clone()))
            .collect(),
        parent: RequestPath::parse("host:0")?,
        next: AtomicUsize::new(0),
        live: Mutex::new(Vec::new()),
    });
    requester.registry.set_launcher(launcher.clone());

    // 4) Resolve, launch and call every module type
    let source = RequestPath::parse("host:0->shell:0")?;
    let request_types: BTreeSet<String> = cfg.modules.iter().map(|m| m.request_type.clone()).collect();
    for request_type in &request_types {
        let request = Request::new(request_type.clone())
            .use_all()
            .from_source(source.clone());
        let channels = requester.registry.request_handle(&request).await?;
        for channel in &channels {
            info!(target: "module_host", channel = %channel.id(), methods = ?channel.methods(), "Channel open");
            for round in 0..cfg.rounds {
                let reply = channel
                    .invoke("greet", vec![json!(format!("caller #{round}"))])
                    .await?;
                info!(target: "module_host", channel = %channel.id(), reply = %reply, "Round trip");
            }
            let calls = channel.invoke("calls", vec![]).await?;
            info!(target: "module_host", channel = %channel.id(), calls = %calls, "Call count");
        }
    }

    // 5) One batched registry round trip
    let batch: Vec<Request> = request_types.iter().map(|t| Request::new(t.clone())).collect();
    let resolved = requester.registry.request_modules(&batch).await?;
    for (request_type, result) in &resolved {
        info!(target: "module_host", request_type = %request_type, best = ?result.one(), "Preferred module");
    }

    // Graceful shutdown
    if let Ok(mut live) = launcher.live.lock() {
        live.clear();
    }
    for peer in &peers {
        peer.shutdown();
    }
    coordinator.shutdown();
    info!(target: "module_host", "Module host demo finished");
    Ok(())
}
