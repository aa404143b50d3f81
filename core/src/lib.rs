// Weft Core Library
// Multi-endpoint module framework: message bus, addressing, registry, channels

pub mod addressing;
pub mod channel;
pub mod config;
pub mod init;
pub mod ipc;
pub mod registry;
pub mod telemetry;

use std::sync::Arc;

pub use addressing::{
    select_best, AddressingError, MatchTimes, ModuleId, ModuleMatcher, PatternSegment, RequestPath,
    RequestPathPattern,
};
pub use channel::{ChannelCall, ChannelHub, ChannelReceiver, ChannelSender, ExposesChannelMethods, MethodTable};
pub use config::WeftConfig;
pub use init::{InitTasks, Ready};
pub use ipc::{Destinations, EndpointId, EndpointRole, MessageBus};
pub use registry::{ModuleLauncher, ModuleRef, Registry, Request, Resolved, Use};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WeftError {
    #[error("Addressing error: {0}")]
    Addressing(#[from] AddressingError),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Remote handler error: {0}")]
    Remote(String),

    #[error("Channel {channel} has no method '{method}'")]
    UnknownMethod { channel: String, method: String },

    #[error("Init error: {0}")]
    Init(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
pub type Result<T> = std::result::Result<T, WeftError>;

/// One endpoint's runtime: its bus, registry view and channel hub.
pub struct Endpoint {
    pub bus: Arc<MessageBus>,
    pub registry: Arc<Registry>,
    pub channels: Arc<ChannelHub>,
    ready: Ready,
}

impl Endpoint {
    /// Creates and starts an endpoint. Resolves once its init tasks have run.
    pub async fn init(role: EndpointRole, id: EndpointId, config: &WeftConfig) -> Result<Self> {
        tracing::info!(target: "endpoint", endpoint = %id, role = ?role, "Starting endpoint...");

        let bus = MessageBus::new(role, id, &config.ipc)?;
        bus.start()?;
        let channels = ChannelHub::new(Arc::clone(&bus), config.channel.clone());
        let registry = Registry::new(Arc::clone(&bus), Arc::clone(&channels), config.registry.clone());

        let (signal, ready) = init::readiness();
        let mut tasks = InitTasks::new();
        {
            let registry = Arc::clone(&registry);
            tasks.push("registry", async move {
                registry.init();
                Ok(())
            });
        }
        tasks.run(&signal).await?;

        tracing::info!(target: "endpoint", endpoint = %id, "Endpoint started successfully");
        Ok(Self {
            bus,
            registry,
            channels,
            ready,
        })
    }

    pub async fn coordinator(config: &WeftConfig) -> Result<Self> {
        Self::init(EndpointRole::Coordinator, EndpointId::COORDINATOR, config).await
    }

    pub async fn peer(id: EndpointId, config: &WeftConfig) -> Result<Self> {
        Self::init(EndpointRole::Peer, id, config).await
    }

    pub fn id(&self) -> EndpointId {
        self.bus.id()
    }

    pub fn ready(&self) -> Ready {
        self.ready.clone()
    }

    /// Links `peer` to this coordinator over an in-process transport.
    pub fn link_peer(&self, peer: &Endpoint) -> Result<()> {
        ipc::link(&self.bus, &peer.bus)
    }

    pub fn shutdown(&self) {
        tracing::info!(target: "endpoint", endpoint = %self.id(), "Shutting down endpoint...");
        self.registry.shutdown();
        self.bus.shutdown();
        tracing::info!(target: "endpoint", endpoint = %self.id(), "Endpoint shut down successfully");
    }
}
