//! Server bootstrap.

use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use super::registry::{ConnectionHandler, ConnectionRegistry};
use crate::core::{ConfigError, PollerError, ServerConfig, SessionId};
use crate::substrate::{MediaDriver, udp_channel};
use crate::transport::{DuplexConnection, Poller, PollerHandle, SubscriptionId};

/// Errors starting or running a server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration rejected.
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),

    /// Duty thread or subscription could not be set up.
    #[error("poller error: {0}")]
    Poller(#[from] PollerError),
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// A listening transport server.
///
/// Owns its duty thread. Dropping the server stops the thread without
/// closing connections; use [`shutdown`](Self::shutdown) to disconnect peers
/// first.
pub struct TransportServer {
    config: ServerConfig,
    channel: String,
    registry: Arc<ConnectionRegistry>,
    poller: PollerHandle,
    subscription: SubscriptionId,
}

impl std::fmt::Debug for TransportServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportServer")
            .field("channel", &self.channel)
            .field("connections", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl TransportServer {
    /// Start the duty thread and listen on `config.listen_addr`.
    ///
    /// `handler` is told about every connection that completes the
    /// handshake.
    pub fn bind(
        driver: Arc<dyn MediaDriver>,
        config: ServerConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> ServerResult<Self> {
        config.validate()?;

        let poller = Poller::start(config.poller.clone())?;
        let (registry, duty) = ConnectionRegistry::new(
            Arc::clone(&driver),
            handler,
            poller.scheduler(),
            config.handshake,
            config.client_stream_id,
        );
        poller.add_duty(duty)?;

        let channel = udp_channel(config.listen_addr);
        let subscription = poller.add_subscription(
            driver.as_ref(),
            &channel,
            config.server_stream_id,
            registry.clone(),
            registry.clone(),
        )?;

        info!(
            channel = %channel,
            stream_id = config.server_stream_id,
            thread = poller.thread_name(),
            "server listening"
        );
        Ok(Self {
            config,
            channel,
            registry,
            poller,
            subscription,
        })
    }

    /// Channel clients publish to.
    pub fn listen_channel(&self) -> &str {
        &self.channel
    }

    /// Configuration in use.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Established connection for a peer session.
    pub fn connection(&self, session: SessionId) -> Option<Arc<DuplexConnection>> {
        self.registry.connection(session)
    }

    /// Number of established connections.
    pub fn connection_count(&self) -> usize {
        self.registry.connections().len()
    }

    /// Disconnect every peer, stop listening and join the duty thread.
    pub fn shutdown(self) {
        // Unsubscribing can fail only if the thread is already gone.
        let _ = self.poller.remove_subscription(self.subscription);
        self.registry.close_all();
        self.poller.shutdown();
        info!(channel = %self.channel, "server stopped");
    }
}
