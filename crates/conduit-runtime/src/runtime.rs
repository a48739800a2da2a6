//! The assembled bus stack.
//!
//! ```rust,ignore
//! // Reads conduit.toml from the current directory
//! let runtime = ConduitRuntime::builder()
//!     .route(Regex::new(r"^billing\.")?, Arc::new(remote))
//!     .build()?;
//!
//! runtime.bus().subscribe("math.add", add)?;
//! runtime.run().await?;
//! ```

use std::future::Future;
use std::path::Path;

use tracing::{debug, info};

use conduit_core::{BoxedTransport, Regex};
use conduit_framework::Bus;
use conduit_transport::{MessageBus, TransportRouter};

use crate::config::{ConduitConfig, ConfigLoader, ConfigResult};
use crate::error::RuntimeResult;
use crate::logging;
use crate::service::ServiceBus;

/// A [`Bus`] served through a [`ServiceBus`] over a routed [`MessageBus`].
///
/// Topics without a more specific route are delivered over a loopback
/// transport, so the service can always reach its own handlers.
pub struct ConduitRuntime {
    config: ConduitConfig,
    service: ServiceBus,
}

impl ConduitRuntime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn from_config(config: &ConduitConfig) -> RuntimeResult<Self> {
        Self::assemble(config.clone(), None, Vec::new())
    }

    fn assemble(
        config: ConduitConfig,
        bus: Option<Bus>,
        routes: Vec<(Regex, BoxedTransport)>,
    ) -> RuntimeResult<Self> {
        logging::init_from_config(&config.logging);

        let bus = bus.unwrap_or_else(|| Bus::with_config(config.bus.clone()));
        let router = TransportRouter::loopback();
        for (pattern, transport) in routes {
            router.add_route(pattern, transport);
        }
        let message_bus = MessageBus::new(router, &config.transport);
        let service = ServiceBus::connect(bus, message_bus, &config.service.namespace)?;

        info!(
            namespace = %config.service.namespace,
            delimiter = %service.bus().delimiter(),
            reply_timeout_ms = config.transport.reply_timeout_ms,
            transports = service.message_bus().transports().len(),
            "Conduit runtime ready"
        );
        Ok(Self { config, service })
    }

    pub fn config(&self) -> &ConduitConfig {
        &self.config
    }

    pub fn bus(&self) -> &Bus {
        self.service.bus()
    }

    pub fn message_bus(&self) -> &MessageBus {
        self.service.message_bus()
    }

    pub fn service(&self) -> &ServiceBus {
        &self.service
    }

    /// Serves until Ctrl+C or SIGTERM.
    pub async fn run(&self) -> RuntimeResult<()> {
        info!("Serving, press Ctrl+C to stop");
        self.run_until(termination()).await
    }

    /// Serves until `stop` resolves, then shuts down.
    pub async fn run_until(&self, stop: impl Future<Output = ()>) -> RuntimeResult<()> {
        self.service.attach();
        stop.await;
        self.shutdown();
        Ok(())
    }

    /// Stops serving and fails every send still waiting for a reply.
    pub fn shutdown(&self) {
        let pending = self.message_bus().pending_count();
        self.service.disconnect();
        self.message_bus().close();
        info!(pending, "Conduit runtime stopped");
    }
}

/// Resolves on the first termination signal.
async fn termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => debug!("Ctrl+C received"),
                    _ = sigterm.recv() => debug!("SIGTERM received"),
                }
            }
            Err(e) => {
                debug!(error = %e, "SIGTERM unavailable, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        debug!("Ctrl+C received");
    }
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Loads configuration and assembles a [`ConduitRuntime`].
pub struct RuntimeBuilder {
    loader: ConfigLoader,
    bus: Option<Bus>,
    routes: Vec<(Regex, BoxedTransport)>,
}

impl RuntimeBuilder {
    /// Searches the current directory for configuration files.
    pub fn new() -> Self {
        Self {
            loader: ConfigLoader::new().with_current_dir(),
            bus: None,
            routes: Vec::new(),
        }
    }

    /// Replaces the loader, e.g. to search other directories.
    pub fn loader(mut self, loader: ConfigLoader) -> Self {
        self.loader = loader;
        self
    }

    pub fn config_file(self, path: impl AsRef<Path>) -> Self {
        self.map_loader(|loader| loader.file(path))
    }

    pub fn profile(self, profile: impl AsRef<str>) -> Self {
        self.map_loader(|loader| loader.profile(profile))
    }

    pub fn search_path(self, path: impl AsRef<Path>) -> Self {
        self.map_loader(|loader| loader.search_path(path))
    }

    pub fn without_env(self) -> Self {
        self.map_loader(ConfigLoader::without_env)
    }

    /// Merges `config` below files and environment.
    pub fn merge(self, config: ConduitConfig) -> Self {
        self.map_loader(|loader| loader.merge(config))
    }

    /// Serves an existing bus; `bus` settings from the configuration are
    /// then ignored.
    pub fn bus(mut self, bus: Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Routes topics matching `pattern` over `transport`, ahead of loopback.
    pub fn route(mut self, pattern: Regex, transport: BoxedTransport) -> Self {
        self.routes.push((pattern, transport));
        self
    }

    fn map_loader(mut self, f: impl FnOnce(ConfigLoader) -> ConfigLoader) -> Self {
        self.loader = f(self.loader);
        self
    }

    /// Loads the configuration without assembling anything.
    pub fn load(self) -> ConfigResult<ConduitConfig> {
        self.loader.load()
    }

    pub fn build(self) -> RuntimeResult<ConduitRuntime> {
        let config = self.loader.load()?;
        ConduitRuntime::assemble(config, self.bus, self.routes)
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
