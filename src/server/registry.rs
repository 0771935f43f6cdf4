//! Connection registry and handshake state machine.
//!
//! One entry per inbound image session:
//!
//! ```text
//!  image available ──▶ AWAITING_ESTABLISH ──ESTABLISH──▶ AWAITING_ACK_DELIVERY
//!                                                         │            │
//!                                                   ack delivered   retries exhausted
//!                                                         ▼            ▼
//!                                                    ESTABLISHED     FAILED (removed)
//! ```
//!
//! The registry owns its connections by session id. Connections only know
//! their session and report closes through a channel drained by
//! [`RegistryDuty`], so there is no reference cycle between the two.
//!
//! All mutation happens on the poller thread: image events and envelopes
//! arrive from inside the subscription poll, ack retries and the establish
//! timeout run as timer tasks, and close notifications are drained by the
//! duty. The entry table is behind a mutex only so lookups from other
//! threads are safe; it is never held across a send or a callback.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::core::{ConnectionId, HandshakeConfig, HandshakeError, SessionId};
use crate::substrate::{ImageInfo, ImageListener, MediaDriver};
use crate::transport::{
    CloseNotifier, Duty, DuplexConnection, Envelope, EnvelopeHandler, EstablishRequest,
    MessageKind, Scheduler, TimerToken,
};

/// Handshake progress of one registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Image seen, no establish request yet.
    AwaitingEstablish,
    /// Connection built, acknowledgement not yet delivered.
    AwaitingAckDelivery,
    /// Acknowledgement delivered; the connection is usable.
    Established,
    /// Acknowledgement could not be delivered. The entry is removed.
    Failed,
}

/// Application callbacks for server-side connection lifecycle.
///
/// Methods run on the poller thread and must not block. The exception is
/// [`ConnectionRegistry::close_all`], which reports `on_disconnect` from the
/// calling thread.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// A connection reached ESTABLISHED. Called before any frame from the
    /// peer is dispatched, so consumers registered here see every frame.
    fn on_connection(&self, connection: Arc<DuplexConnection>);

    /// A handshake was abandoned.
    fn on_handshake_failed(&self, session: SessionId, error: &HandshakeError) {
        let _ = (session, error);
    }

    /// An established connection went away.
    fn on_disconnect(&self, session: SessionId) {
        let _ = session;
    }
}

#[derive(Debug)]
struct RegistryEntry {
    state: HandshakeState,
    connection: Option<Arc<DuplexConnection>>,
    last_activity: Instant,
    establish_timer: Option<TimerToken>,
    ack_timer: Option<TimerToken>,
    ack_attempts: u32,
}

impl RegistryEntry {
    fn new(establish_timer: Option<TimerToken>) -> Self {
        Self {
            state: HandshakeState::AwaitingEstablish,
            connection: None,
            last_activity: Instant::now(),
            establish_timer,
            ack_timer: None,
            ack_attempts: 0,
        }
    }

    fn connection_id(&self) -> Option<ConnectionId> {
        self.connection.as_ref().map(|c| c.id())
    }

    fn cancel_timers(&mut self) {
        if let Some(token) = self.establish_timer.take() {
            token.cancel();
        }
        if let Some(token) = self.ack_timer.take() {
            token.cancel();
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    images: HashMap<SessionId, String>,
    entries: HashMap<SessionId, RegistryEntry>,
}

/// Process-wide table of server-side connections.
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    driver: Arc<dyn MediaDriver>,
    handler: Arc<dyn ConnectionHandler>,
    scheduler: Scheduler,
    config: HandshakeConfig,
    client_stream_id: i32,
    close_notifier: CloseNotifier,
    weak: Weak<ConnectionRegistry>,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("entries", &self.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Drains connection close notifications into the registry.
///
/// Must run on the same poller that polls the registry's subscription.
pub struct RegistryDuty {
    registry: Weak<ConnectionRegistry>,
    closed: mpsc::UnboundedReceiver<(SessionId, ConnectionId)>,
}

impl Duty for RegistryDuty {
    fn do_work(&mut self) -> usize {
        let Some(registry) = self.registry.upgrade() else {
            return 0;
        };
        let mut work = 0;
        while let Ok((session, id)) = self.closed.try_recv() {
            registry.connection_closed(session, id);
            work += 1;
        }
        work
    }

    fn name(&self) -> &str {
        "connection-registry"
    }
}

impl ConnectionRegistry {
    /// Create a registry that opens response publications on
    /// `client_stream_id` through `driver` and schedules handshake timers on
    /// `scheduler`.
    pub fn new(
        driver: Arc<dyn MediaDriver>,
        handler: Arc<dyn ConnectionHandler>,
        scheduler: Scheduler,
        config: HandshakeConfig,
        client_stream_id: i32,
    ) -> (Arc<Self>, RegistryDuty) {
        let (close_notifier, closed) = mpsc::unbounded_channel();
        let registry = Arc::new_cyclic(|weak| Self {
            state: Mutex::new(RegistryState::default()),
            driver,
            handler,
            scheduler,
            config,
            client_stream_id,
            close_notifier,
            weak: weak.clone(),
        });
        let duty = RegistryDuty {
            registry: Arc::downgrade(&registry),
            closed,
        };
        (registry, duty)
    }

    /// Handshake state of `session`, if it has an entry.
    pub fn state(&self, session: SessionId) -> Option<HandshakeState> {
        self.state.lock().entries.get(&session).map(|e| e.state)
    }

    /// Established connection for `session`.
    pub fn connection(&self, session: SessionId) -> Option<Arc<DuplexConnection>> {
        let state = self.state.lock();
        state
            .entries
            .get(&session)
            .filter(|e| e.state == HandshakeState::Established)
            .and_then(|e| e.connection.clone())
    }

    /// All established connections.
    pub fn connections(&self) -> Vec<Arc<DuplexConnection>> {
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| e.state == HandshakeState::Established)
            .filter_map(|e| e.connection.clone())
            .collect()
    }

    /// Time since the last envelope from `session`.
    pub fn idle_time(&self, session: SessionId) -> Option<Duration> {
        self.state
            .lock()
            .entries
            .get(&session)
            .map(|e| e.last_activity.elapsed())
    }

    /// Substrate identity of the image carrying `session`.
    pub fn source_identity(&self, session: SessionId) -> Option<String> {
        self.state.lock().images.get(&session).cloned()
    }

    /// Number of entries in any state.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// No entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every connection and drop every entry.
    pub fn close_all(&self) {
        let entries: Vec<_> = {
            let mut state = self.state.lock();
            state.entries.drain().collect()
        };
        for (session, mut entry) in entries {
            entry.cancel_timers();
            if let Some(connection) = entry.connection.take() {
                connection.close();
            }
            if entry.state == HandshakeState::Established {
                self.handler.on_disconnect(session);
            }
        }
    }

    fn schedule<F>(&self, delay: Duration, task: F) -> TimerToken
    where
        F: FnOnce(&ConnectionRegistry) + Send + 'static,
    {
        let weak = self.weak.clone();
        self.scheduler.schedule_after(delay, move || {
            if let Some(registry) = weak.upgrade() {
                task(&*registry);
            }
        })
    }

    fn on_establish(&self, session: SessionId, payload: &[u8]) {
        let request = match EstablishRequest::decode(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(session = %session, error = %e, "dropping malformed establish request");
                return;
            }
        };

        let resend_to = {
            let mut state = self.state.lock();
            let entry = state
                .entries
                .entry(session)
                .or_insert_with(|| RegistryEntry::new(None));
            entry.last_activity = Instant::now();
            match entry.state {
                HandshakeState::Established => entry.connection.clone(),
                HandshakeState::AwaitingAckDelivery => {
                    debug!(session = %session, "establish while acknowledgement pending, ignored");
                    return;
                }
                HandshakeState::AwaitingEstablish | HandshakeState::Failed => None,
            }
        };

        if let Some(connection) = resend_to {
            debug!(session = %session, connection = %connection.id(), "duplicate establish, resending acknowledgement");
            if let Err(e) = connection.send_establish_ack(session, self.config.offer_retries) {
                warn!(session = %session, error = %e, "acknowledgement resend failed");
            }
            return;
        }

        let publication = match self
            .driver
            .add_publication(&request.response_channel, self.client_stream_id)
        {
            Ok(publication) => publication,
            Err(e) => {
                self.fail(session, None, HandshakeError::Substrate(e));
                return;
            }
        };
        let connection = Arc::new(
            DuplexConnection::new(session, publication, self.config.offer_retries)
                .with_close_notifier(self.close_notifier.clone()),
        );

        let accepted = {
            let mut state = self.state.lock();
            match state.entries.get_mut(&session) {
                Some(entry) if entry.state == HandshakeState::AwaitingEstablish => {
                    entry.state = HandshakeState::AwaitingAckDelivery;
                    entry.connection = Some(Arc::clone(&connection));
                    entry.ack_attempts = 0;
                    true
                }
                _ => false,
            }
        };
        if !accepted {
            connection.close_lost();
            return;
        }

        debug!(session = %session, connection = %connection.id(), channel = %request.response_channel, "establish received");
        self.attempt_ack(session, connection.id());
    }

    fn attempt_ack(&self, session: SessionId, expected: ConnectionId) {
        let (connection, attempt) = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(&session) else {
                return;
            };
            if entry.state != HandshakeState::AwaitingAckDelivery
                || entry.connection_id() != Some(expected)
            {
                return;
            }
            let Some(connection) = entry.connection.clone() else {
                return;
            };
            entry.ack_attempts += 1;
            entry.ack_timer = None;
            (connection, entry.ack_attempts)
        };

        match connection.send_establish_ack(session, self.config.offer_retries) {
            Ok(()) => self.established(session, connection),
            Err(e) if e.is_transient() && attempt < self.config.ack_retry_count => {
                debug!(session = %session, attempt, error = %e, "acknowledgement not delivered, retrying");
                let token = self.schedule(self.config.ack_retry_pause, move |registry| {
                    registry.attempt_ack(session, expected)
                });
                let mut state = self.state.lock();
                match state.entries.get_mut(&session) {
                    Some(entry) if entry.connection_id() == Some(expected) => {
                        entry.ack_timer = Some(token)
                    }
                    _ => token.cancel(),
                }
            }
            Err(e) if e.is_transient() => {
                self.fail(
                    session,
                    Some(expected),
                    HandshakeError::Timeout { attempts: attempt },
                );
            }
            Err(e) => self.fail(session, Some(expected), HandshakeError::Connection(e)),
        }
    }

    fn established(&self, session: SessionId, connection: Arc<DuplexConnection>) {
        {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(&session) else {
                return;
            };
            if entry.connection_id() != Some(connection.id()) {
                return;
            }
            entry.state = HandshakeState::Established;
            entry.cancel_timers();
        }

        info!(session = %session, connection = %connection.id(), "connection established");
        self.handler.on_connection(connection);
    }

    fn fail(&self, session: SessionId, expected: Option<ConnectionId>, error: HandshakeError) {
        let removed = {
            let mut state = self.state.lock();
            let matches = state
                .entries
                .get(&session)
                .is_some_and(|e| expected.is_none() || e.connection_id() == expected);
            if matches {
                state.entries.remove(&session)
            } else {
                None
            }
        };

        let Some(mut entry) = removed else {
            return;
        };
        entry.state = HandshakeState::Failed;
        entry.cancel_timers();
        if let Some(connection) = entry.connection.take() {
            connection.close_lost();
        }

        warn!(session = %session, error = %error, "handshake failed");
        self.handler.on_handshake_failed(session, &error);
    }

    fn establish_timed_out(&self, session: SessionId) {
        let timed_out = {
            let mut state = self.state.lock();
            let awaiting = state
                .entries
                .get(&session)
                .is_some_and(|e| e.state == HandshakeState::AwaitingEstablish);
            awaiting && state.entries.remove(&session).is_some()
        };
        if timed_out {
            let error = HandshakeError::EstablishTimeout(self.config.establish_timeout);
            warn!(session = %session, error = %error, "handshake abandoned");
            self.handler.on_handshake_failed(session, &error);
        }
    }

    fn remove(&self, session: SessionId, reason: &'static str) {
        let removed = self.state.lock().entries.remove(&session);
        let Some(mut entry) = removed else {
            return;
        };
        entry.cancel_timers();
        if let Some(connection) = entry.connection.take() {
            connection.close_lost();
        }
        info!(session = %session, reason, "connection removed");
        if entry.state == HandshakeState::Established {
            self.handler.on_disconnect(session);
        }
    }

    fn connection_closed(&self, session: SessionId, id: ConnectionId) {
        let current = self
            .state
            .lock()
            .entries
            .get(&session)
            .is_some_and(|e| e.connection_id() == Some(id));
        if current {
            self.remove(session, "connection closed");
        } else {
            trace!(session = %session, connection = %id, "stale close notification");
        }
    }

    fn on_frame(&self, session: SessionId, frame: &[u8]) {
        let connection = {
            let mut state = self.state.lock();
            match state.entries.get_mut(&session) {
                Some(entry) => {
                    entry.last_activity = Instant::now();
                    match entry.state {
                        HandshakeState::Established => entry.connection.clone(),
                        _ => None,
                    }
                }
                None => None,
            }
        };

        match connection {
            Some(connection) => {
                connection.dispatch(frame);
            }
            None => debug!(session = %session, "frame before established, dropped"),
        }
    }
}

impl ImageListener for ConnectionRegistry {
    fn on_available_image(&self, image: &ImageInfo) {
        let session = image.session_id;
        let token = self.schedule(self.config.establish_timeout, move |registry| {
            registry.establish_timed_out(session)
        });

        let replaced = {
            let mut state = self.state.lock();
            state
                .images
                .insert(session, image.source_identity.clone());
            state.entries.insert(session, RegistryEntry::new(Some(token)))
        };
        if let Some(mut old) = replaced {
            old.cancel_timers();
            if let Some(connection) = old.connection.take() {
                connection.close_lost();
            }
            if old.state == HandshakeState::Established {
                self.handler.on_disconnect(session);
            }
        }

        info!(session = %session, source = %image.source_identity, "image available");
    }

    fn on_unavailable_image(&self, image: &ImageInfo) {
        self.state.lock().images.remove(&image.session_id);
        info!(session = %image.session_id, source = %image.source_identity, "image unavailable");
        self.remove(image.session_id, "image unavailable");
    }
}

impl EnvelopeHandler for ConnectionRegistry {
    fn on_envelope(&self, session: SessionId, envelope: Envelope<'_>) {
        match envelope.kind {
            MessageKind::Frame => self.on_frame(session, envelope.payload),
            MessageKind::EstablishConnection => self.on_establish(session, envelope.payload),
            MessageKind::ConnectionDisconnect => self.remove(session, "peer disconnected"),
            MessageKind::EstablishConnectionResponse => {
                debug!(session = %session, "unexpected acknowledgement on server stream")
            }
        }
    }
}
