//! Client side of the transport.
//!
//! A [`TransportClient`] owns one duty thread and one response subscription.
//! Each [`connect`](TransportClient::connect) opens a publication to the
//! server, repeats ESTABLISH_CONNECTION until the server acknowledges the
//! publication's session, and hands back the resulting [`DuplexConnection`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::core::{
    ClientConfig, ConfigError, ConnectionError, ConnectionId, PollerError, SessionId,
    SubstrateError,
};
use crate::substrate::{ImageInfo, ImageListener, MediaDriver, Publication, udp_channel};
use crate::transport::{
    CloseNotifier, DuplexConnection, Duty, Envelope, EnvelopeHandler, EstablishRequest,
    EstablishResponse, MessageKind, Poller, PollerHandle, SubscriptionId, encode,
    offer_with_retries,
};

/// Errors that can occur in the transport client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration rejected.
    #[error("invalid config: {0}")]
    Config(#[from] ConfigError),

    /// Duty thread or subscription could not be set up.
    #[error("poller error: {0}")]
    Poller(#[from] PollerError),

    /// Publication to the server could not be opened.
    #[error("substrate error: {0}")]
    Substrate(#[from] SubstrateError),

    /// Establish request hit a hard transport error.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// The server never acknowledged.
    #[error("no acknowledgement from {peer} after {attempts} attempts")]
    ConnectTimeout {
        /// Server address.
        peer: SocketAddr,
        /// Establish requests sent.
        attempts: u32,
    },

    /// The client was shut down while connecting.
    #[error("client shut down")]
    Shutdown,
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

struct PendingEstablish {
    peer: SocketAddr,
    publication: Arc<dyn Publication>,
    tx: oneshot::Sender<Arc<DuplexConnection>>,
}

#[derive(Default)]
struct ClientState {
    /// Keyed by the session of our own publication.
    pending: HashMap<SessionId, PendingEstablish>,
    /// Keyed by the session of the server's response image.
    connections: HashMap<SessionId, Arc<DuplexConnection>>,
    peers: HashMap<SocketAddr, Arc<DuplexConnection>>,
}

impl ClientState {
    fn take(&mut self, session: SessionId, id: Option<ConnectionId>) -> Option<Arc<DuplexConnection>> {
        let matches = self
            .connections
            .get(&session)
            .is_some_and(|c| id.is_none_or(|id| c.id() == id));
        if !matches {
            return None;
        }
        let connection = self.connections.remove(&session)?;
        self.peers.retain(|_, c| c.id() != connection.id());
        Some(connection)
    }
}

struct ClientShared {
    state: Mutex<ClientState>,
    send_retries: u32,
    close_notifier: CloseNotifier,
}

impl ClientShared {
    fn on_ack(&self, session: SessionId, payload: &[u8]) {
        let ack = match EstablishResponse::decode(payload) {
            Ok(ack) => ack,
            Err(e) => {
                warn!(session = %session, error = %e, "malformed acknowledgement");
                return;
            }
        };

        let Some(pending) = self.state.lock().pending.remove(&ack.session_id) else {
            trace!(session = %session, acked = %ack.session_id, "acknowledgement for no pending connect");
            return;
        };

        let connection = Arc::new(
            DuplexConnection::new(session, pending.publication, self.send_retries)
                .with_close_notifier(self.close_notifier.clone()),
        );
        {
            let mut state = self.state.lock();
            if let Some(previous) = state.connections.insert(session, Arc::clone(&connection)) {
                previous.close_lost();
            }
            state.peers.insert(pending.peer, Arc::clone(&connection));
        }

        debug!(peer = %pending.peer, session = %session, connection = %connection.id(), "acknowledged");
        if let Err(connection) = pending.tx.send(connection) {
            // The connect call gave up between our removal and this send.
            self.state.lock().take(session, Some(connection.id()));
            connection.close();
        }
    }

    fn on_frame(&self, session: SessionId, frame: &[u8]) {
        let connection = self.state.lock().connections.get(&session).cloned();
        match connection {
            Some(connection) => {
                connection.dispatch(frame);
            }
            None => trace!(session = %session, "frame for unknown connection"),
        }
    }

    fn lost(&self, session: SessionId, reason: &'static str) {
        let connection = self.state.lock().take(session, None);
        if let Some(connection) = connection {
            connection.close_lost();
            info!(session = %session, connection = %connection.id(), reason, "connection removed");
        }
    }

    fn closed(&self, session: SessionId, id: ConnectionId) {
        let connection = self.state.lock().take(session, Some(id));
        if let Some(connection) = connection {
            connection.close_lost();
            info!(session = %session, connection = %id, "connection removed after transport error");
        }
    }
}

impl ImageListener for ClientShared {
    fn on_available_image(&self, image: &ImageInfo) {
        debug!(session = %image.session_id, source = %image.source_identity, "response image available");
    }

    fn on_unavailable_image(&self, image: &ImageInfo) {
        self.lost(image.session_id, "image unavailable");
    }
}

impl EnvelopeHandler for ClientShared {
    fn on_envelope(&self, session: SessionId, envelope: Envelope<'_>) {
        match envelope.kind {
            MessageKind::Frame => self.on_frame(session, envelope.payload),
            MessageKind::EstablishConnectionResponse => self.on_ack(session, envelope.payload),
            MessageKind::ConnectionDisconnect => self.lost(session, "peer disconnected"),
            MessageKind::EstablishConnection => {
                debug!(session = %session, "unexpected establish request on response stream")
            }
        }
    }
}

struct ClientDuty {
    shared: Weak<ClientShared>,
    closed: mpsc::UnboundedReceiver<(SessionId, ConnectionId)>,
}

impl Duty for ClientDuty {
    fn do_work(&mut self) -> usize {
        let Some(shared) = self.shared.upgrade() else {
            return 0;
        };
        let mut work = 0;
        while let Ok((session, id)) = self.closed.try_recv() {
            shared.closed(session, id);
            work += 1;
        }
        work
    }

    fn name(&self) -> &str {
        "client-connections"
    }
}

/// Transport client.
///
/// Connections are keyed by server address; connecting twice to the same
/// server returns the open connection.
pub struct TransportClient {
    driver: Arc<dyn MediaDriver>,
    config: ClientConfig,
    response_channel: String,
    shared: Arc<ClientShared>,
    poller: PollerHandle,
    subscription: SubscriptionId,
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("response_channel", &self.response_channel)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl TransportClient {
    /// Start the duty thread and subscribe for responses on
    /// `config.response_addr`.
    pub fn new(driver: Arc<dyn MediaDriver>, config: ClientConfig) -> ClientResult<Self> {
        config.validate()?;

        let poller = Poller::start(config.poller.clone())?;
        let (close_notifier, closed) = mpsc::unbounded_channel();
        let shared = Arc::new(ClientShared {
            state: Mutex::new(ClientState::default()),
            send_retries: config.send_retries,
            close_notifier,
        });
        poller.add_duty(ClientDuty {
            shared: Arc::downgrade(&shared),
            closed,
        })?;

        let response_channel = udp_channel(config.response_addr);
        let subscription = poller.add_subscription(
            driver.as_ref(),
            &response_channel,
            config.client_stream_id,
            shared.clone(),
            shared.clone(),
        )?;

        debug!(channel = %response_channel, thread = poller.thread_name(), "client started");
        Ok(Self {
            driver,
            config,
            response_channel,
            shared,
            poller,
            subscription,
        })
    }

    /// Channel the server is asked to respond on.
    pub fn response_channel(&self) -> &str {
        &self.response_channel
    }

    /// Configuration in use.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect to the server listening on `peer`.
    ///
    /// Sends up to `establish_attempts` establish requests, waiting
    /// `establish_backoff` after the first and doubling the wait after each,
    /// all within `connect_timeout`.
    pub async fn connect(&self, peer: SocketAddr) -> ClientResult<Arc<DuplexConnection>> {
        if let Some(connection) = self.connection(peer) {
            return Ok(connection);
        }

        let publication = self
            .driver
            .add_publication(&udp_channel(peer), self.config.server_stream_id)?;
        let local = publication.session_id();
        let (tx, mut rx) = oneshot::channel();
        self.shared.state.lock().pending.insert(
            local,
            PendingEstablish {
                peer,
                publication: Arc::clone(&publication),
                tx,
            },
        );

        let request = EstablishRequest::new(self.response_channel.clone()).encode();
        let deadline = Instant::now() + self.config.connect_timeout;
        let mut wait = self.config.establish_backoff;
        let mut attempts: u32 = 0;
        debug!(peer = %peer, session = %local, "connecting");

        let outcome = loop {
            attempts += 1;
            let bytes = encode(MessageKind::EstablishConnection, attempts as u16, &request);
            match offer_with_retries(publication.as_ref(), &bytes, self.config.send_retries) {
                Ok(()) => trace!(peer = %peer, attempt = attempts, "establish request sent"),
                Err(e) if e.is_transient() => {
                    debug!(peer = %peer, attempt = attempts, error = %e, "establish request not sent")
                }
                Err(e) => break Err(ClientError::Connection(e)),
            }

            let now = Instant::now();
            if now >= deadline {
                break Err(ClientError::ConnectTimeout { peer, attempts });
            }
            match tokio::time::timeout(wait.min(deadline - now), &mut rx).await {
                Ok(Ok(connection)) => break Ok(connection),
                Ok(Err(_)) => break Err(ClientError::Shutdown),
                Err(_) if attempts >= self.config.establish_attempts || Instant::now() >= deadline => {
                    break Err(ClientError::ConnectTimeout { peer, attempts });
                }
                Err(_) => wait = wait.saturating_mul(2),
            }
        };

        match outcome {
            Ok(connection) => {
                info!(peer = %peer, connection = %connection.id(), attempts, "connected");
                Ok(connection)
            }
            Err(e) => self.abandon(peer, local, rx, publication.as_ref(), e, attempts).await,
        }
    }

    /// Give up on a connect, unless the acknowledgement has already claimed
    /// the pending entry. In that case its connection is on its way through
    /// `rx` and is returned instead.
    async fn abandon(
        &self,
        peer: SocketAddr,
        local: SessionId,
        rx: oneshot::Receiver<Arc<DuplexConnection>>,
        publication: &dyn Publication,
        error: ClientError,
        attempts: u32,
    ) -> ClientResult<Arc<DuplexConnection>> {
        let abandoned = self.shared.state.lock().pending.remove(&local);
        if abandoned.is_none() {
            // Whoever removed the entry either sends on its sender or drops
            // it, so this await is bounded.
            if let Ok(connection) = rx.await {
                info!(peer = %peer, connection = %connection.id(), attempts, "connected");
                return Ok(connection);
            }
        }
        publication.close();
        warn!(peer = %peer, attempts, error = %error, "connect failed");
        Err(error)
    }

    /// Open connection to `peer`, if any.
    pub fn connection(&self, peer: SocketAddr) -> Option<Arc<DuplexConnection>> {
        self.shared
            .state
            .lock()
            .peers
            .get(&peer)
            .filter(|c| c.is_open())
            .cloned()
    }

    /// Number of connections held.
    pub fn connection_count(&self) -> usize {
        self.shared.state.lock().connections.len()
    }

    /// Close the connection to `peer`, telling the server. Returns `false`
    /// if there was none.
    pub fn close(&self, peer: SocketAddr) -> bool {
        let connection = {
            let mut state = self.shared.state.lock();
            let Some(connection) = state.peers.remove(&peer) else {
                return false;
            };
            state.connections.retain(|_, c| c.id() != connection.id());
            connection
        };
        connection.close();
        info!(peer = %peer, connection = %connection.id(), "connection closed");
        true
    }

    /// Close every connection, stop listening and join the duty thread.
    pub fn shutdown(self) {
        let _ = self.poller.remove_subscription(self.subscription);
        let connections: Vec<_> = {
            let mut state = self.shared.state.lock();
            state.pending.clear();
            state.peers.clear();
            state.connections.drain().map(|(_, c)| c).collect()
        };
        for connection in &connections {
            connection.close();
        }
        self.poller.shutdown();
        info!(channel = %self.response_channel, closed = connections.len(), "client stopped");
    }
}
