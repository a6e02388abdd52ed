//! Client orchestrator.
//!
//! The [`Client`] is the root object that wires the component graph together:
//! session cache, metadata API, gateway connector, handler registry, and the
//! session manager that supervises the shard fleet. Every cross-component
//! reference is an explicitly injected dependency; there are no module-level
//! singletons. The builder fills in working defaults for whatever the
//! embedder does not supply.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};

use tether_core::{
    EventRegistry, EventStages, GatewayConnector, MemorySessionCache, MetadataApi, SessionCache,
    SessionState,
};
use tether_gateway::{ConnectError, GatewaySessionManager, IdentifyCredentials};

use crate::config::{ConfigError, ConfigLoader, TetherConfig};
use crate::error::{ClientError, ClientResult};
use crate::logging;

/// The Tether client.
///
/// # Example
///
/// ```rust,ignore
/// use tether_runtime::Client;
/// use tether_core::EventStages;
///
/// let client = Client::builder().config_file("tether.toml").build()?;
///
/// client.on(
///     "MESSAGE_CREATE",
///     EventStages::new()
///         .cache(|payload| async move { /* update local caches */ Ok(()) })
///         .business(|payload| async move { /* application logic */ Ok(()) }),
/// );
///
/// client.run().await?;
/// ```
pub struct Client {
    config: TetherConfig,
    registry: Arc<EventRegistry>,
    manager: GatewaySessionManager,
}

impl Client {
    /// Creates a client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The loaded configuration.
    pub fn config(&self) -> &TetherConfig {
        &self.config
    }

    /// The handler registry.
    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    /// Registers the handler stages for an event type.
    pub fn on(&self, event_type: impl Into<String>, stages: EventStages) {
        self.registry.register(event_type, stages);
    }

    /// Snapshot of every shard's session state.
    pub fn shard_states(&self) -> Vec<SessionState> {
        self.manager.shard_states()
    }

    /// Connects using the configured credentials.
    ///
    /// Resolves once all shards have reached `Ready` for the first time;
    /// fails only on a fatal (non-retryable) condition.
    pub async fn connect(&self) -> ClientResult<()> {
        let credentials = IdentifyCredentials::new(
            self.config.credentials.token.clone(),
            self.config.credentials.intents,
        );
        self.connect_with(credentials).await
    }

    /// Connects with explicit credentials, overriding the configuration.
    pub async fn connect_with(&self, credentials: IdentifyCredentials) -> ClientResult<()> {
        self.manager.connect(credentials).await?;
        info!("All shards ready");
        Ok(())
    }

    /// Shuts the fleet down, draining retries and closing every shard.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
    }

    /// Connects and runs until a shutdown signal or a fatal session failure,
    /// then shuts down.
    pub async fn run(&self) -> ClientResult<()> {
        self.connect().await?;
        info!("Tether client running. Press Ctrl+C to stop.");

        let fatal = self.wait_for_shutdown().await;
        self.shutdown().await;

        match fatal {
            Some(err) => {
                error!(error = %err, "Client stopped on fatal session failure");
                Err(err.into())
            }
            None => Ok(()),
        }
    }

    /// Waits for Ctrl+C, SIGTERM, or a fatal session failure.
    async fn wait_for_shutdown(&self) -> Option<ConnectError> {
        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");

            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down");
                    None
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                    None
                }
                fatal = self.manager.next_fatal() => fatal,
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down");
                    None
                }
                fatal = self.manager.next_fatal() => fatal,
            }
        }
    }
}

/// Builder for a [`Client`].
///
/// Collaborators not supplied explicitly fall back to the stock
/// implementations: the WebSocket connector and REST client from
/// `tether-transport` (when their features are enabled), an in-memory
/// session cache, and a fresh handler registry.
#[derive(Default)]
pub struct ClientBuilder {
    config: Option<TetherConfig>,
    config_file: Option<PathBuf>,
    connector: Option<Arc<dyn GatewayConnector>>,
    api: Option<Arc<dyn MetadataApi>>,
    cache: Option<Arc<dyn SessionCache>>,
    registry: Option<Arc<EventRegistry>>,
}

impl ClientBuilder {
    /// Creates a builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a pre-built configuration instead of loading one.
    pub fn config(mut self, config: TetherConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Loads configuration from a specific file.
    pub fn config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Injects a gateway connector.
    pub fn connector(mut self, connector: Arc<dyn GatewayConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Injects a metadata API client.
    pub fn api(mut self, api: Arc<dyn MetadataApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Injects a session cache.
    pub fn cache(mut self, cache: Arc<dyn SessionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Uses an existing handler registry.
    pub fn registry(mut self, registry: Arc<EventRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Builds the client, initializing logging from the configuration.
    pub fn build(self) -> ClientResult<Client> {
        let config = match self.config {
            Some(config) => {
                config.validate().map_err(ConfigError::Invalid)?;
                config
            }
            None => {
                let mut loader = ConfigLoader::new().with_current_dir().with_user_dir();
                if let Some(file) = self.config_file {
                    loader = loader.file(file);
                }
                loader.load()?
            }
        };

        logging::init_from_config(&config.logging);

        let connector = match self.connector {
            Some(connector) => connector,
            None => default_connector()?,
        };
        let api = match self.api {
            Some(api) => api,
            None => default_api(&config)?,
        };
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemorySessionCache::new()));
        let registry = self.registry.unwrap_or_default();

        let manager = GatewaySessionManager::new(
            connector,
            api,
            cache,
            Arc::clone(&registry),
            config.gateway.to_manager_config(),
        );

        Ok(Client {
            config,
            registry,
            manager,
        })
    }
}

#[cfg(feature = "ws-client")]
fn default_connector() -> ClientResult<Arc<dyn GatewayConnector>> {
    Ok(Arc::new(tether_transport::WsConnector::new()))
}

#[cfg(not(feature = "ws-client"))]
fn default_connector() -> ClientResult<Arc<dyn GatewayConnector>> {
    Err(ClientError::TransportUnavailable("ws-client"))
}

#[cfg(feature = "http-client")]
fn default_api(config: &TetherConfig) -> ClientResult<Arc<dyn MetadataApi>> {
    if config.api.endpoint.is_empty() {
        return Err(ClientError::Config(ConfigError::Invalid(
            "api.endpoint must be set when no metadata API is injected".to_string(),
        )));
    }
    Ok(Arc::new(tether_transport::RestClient::with_timeout(
        &config.api.endpoint,
        &config.credentials.token,
        config.api.timeout,
    )))
}

#[cfg(not(feature = "http-client"))]
fn default_api(_config: &TetherConfig) -> ClientResult<Arc<dyn MetadataApi>> {
    Err(ClientError::TransportUnavailable("http-client"))
}
