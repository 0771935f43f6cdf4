//! Duplex connection over one publication and one inbound image.
//!
//! Outbound, a connection wraps frames in envelopes tagged with its own
//! wrapping sequence and offers them to its publication, retrying a bounded
//! number of times on transient backpressure. Inbound, the poller hands it
//! FRAME payloads which it fans out to every registered [`FrameConsumer`].
//!
//! The consumer list is copy-on-write: fan-out iterates an `Arc` snapshot
//! taken under a short read lock, and writers swap in a new list. Each
//! registration also carries an `active` flag that is cleared before the
//! list is replaced, so a consumer unregistered mid fan-out is skipped for
//! the rest of that frame.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::envelope::{self, EstablishResponse, MessageKind};
use crate::core::{ConnectionError, ConnectionId, FrameConsumer, OfferError, SessionId};
use crate::substrate::Publication;

/// Notification sent when a connection leaves OPEN on its own.
pub(crate) type CloseNotifier = mpsc::UnboundedSender<(SessionId, ConnectionId)>;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Sends and fan-out are live.
    Open = 0,
    /// A hard transport error was seen; waiting for the owner to close.
    Closing = 1,
    /// Publication released, consumers notified.
    Closed = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Offer `bytes`, retrying transient backpressure up to `retries` offers.
pub(crate) fn offer_with_retries(
    publication: &dyn Publication,
    bytes: &[u8],
    retries: u32,
) -> Result<(), ConnectionError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match publication.offer(bytes) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => {
                if attempts >= retries {
                    return Err(ConnectionError::SendFailed { attempts });
                }
                std::hint::spin_loop();
            }
            Err(e) if e.is_not_connected() => return Err(ConnectionError::NotYetConnected),
            Err(e) => return Err(ConnectionError::Transport(e)),
        }
    }
}

/// Handle returned by [`DuplexConnection::register_consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerHandle {
    connection: ConnectionId,
    registration: u64,
}

impl ConsumerHandle {
    /// Connection the consumer is registered with.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }
}

struct Registration {
    id: u64,
    active: AtomicBool,
    consumer: Arc<dyn FrameConsumer>,
}

/// One logical connection to a peer.
pub struct DuplexConnection {
    id: ConnectionId,
    peer_session: SessionId,
    publication: RwLock<Option<Arc<dyn Publication>>>,
    state: AtomicU8,
    sequence: AtomicU16,
    consumers: RwLock<Arc<Vec<Arc<Registration>>>>,
    next_registration: AtomicU64,
    send_retries: u32,
    close_notifier: Option<CloseNotifier>,
}

impl fmt::Debug for DuplexConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DuplexConnection")
            .field("id", &self.id)
            .field("peer_session", &self.peer_session)
            .field("state", &self.state())
            .field("consumers", &self.consumer_count())
            .finish()
    }
}

impl DuplexConnection {
    /// Create an open connection for frames from `peer_session`, sending on
    /// `publication`.
    ///
    /// `send_retries` bounds the offers made per send on transient
    /// backpressure.
    pub fn new(
        peer_session: SessionId,
        publication: Arc<dyn Publication>,
        send_retries: u32,
    ) -> Self {
        Self {
            id: ConnectionId::next(),
            peer_session,
            publication: RwLock::new(Some(publication)),
            state: AtomicU8::new(ConnectionState::Open as u8),
            sequence: AtomicU16::new(0),
            consumers: RwLock::new(Arc::new(Vec::new())),
            next_registration: AtomicU64::new(1),
            send_retries: send_retries.max(1),
            close_notifier: None,
        }
    }

    pub(crate) fn with_close_notifier(mut self, notifier: CloseNotifier) -> Self {
        self.close_notifier = Some(notifier);
        self
    }

    /// Process-unique id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Session of the inbound image this connection dispatches.
    pub fn peer_session(&self) -> SessionId {
        self.peer_session
    }

    /// Session of the outbound publication, while it is held.
    pub fn local_session(&self) -> Option<SessionId> {
        self.publication.read().as_ref().map(|p| p.session_id())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Sends and fan-out are live.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Registered consumers.
    pub fn consumer_count(&self) -> usize {
        self.consumers.read().len()
    }

    fn next_sequence(&self) -> u16 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Send one opaque frame to the peer.
    pub fn send(&self, frame: &[u8]) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::NotConnected);
        }
        self.send_kind(MessageKind::Frame, frame, self.send_retries)
    }

    /// Acknowledge the peer's establish request for `acked` session.
    ///
    /// `retries` bounds offers on transient backpressure for this attempt.
    pub fn send_establish_ack(
        &self,
        acked: SessionId,
        retries: u32,
    ) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::NotConnected);
        }
        let payload = EstablishResponse { session_id: acked }.encode();
        self.send_kind(MessageKind::EstablishConnectionResponse, &payload, retries.max(1))
    }

    fn send_kind(
        &self,
        kind: MessageKind,
        payload: &[u8],
        retries: u32,
    ) -> Result<(), ConnectionError> {
        let publication = self
            .publication
            .read()
            .clone()
            .ok_or(ConnectionError::NotConnected)?;
        let sequence = self.next_sequence();
        let bytes = envelope::encode(kind, sequence, payload);

        match offer_with_retries(publication.as_ref(), &bytes, retries) {
            Ok(()) => {
                trace!(connection = %self.id, sequence, kind = ?kind, len = payload.len(), "sent");
                Ok(())
            }
            Err(ConnectionError::Transport(e)) => {
                self.fail(e);
                Err(ConnectionError::Transport(e))
            }
            Err(e) => {
                debug!(connection = %self.id, sequence, error = %e, "send not delivered");
                Err(e)
            }
        }
    }

    fn fail(&self, error: OfferError) {
        let moved = self
            .state
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if moved {
            warn!(connection = %self.id, session = %self.peer_session, error = %error, "transport error, connection closing");
            self.notify();
        }
    }

    fn notify(&self) {
        if let Some(notifier) = &self.close_notifier {
            // Receiver gone means the owner already shut down.
            let _ = notifier.send((self.peer_session, self.id));
        }
    }

    /// Register a consumer for inbound frames.
    pub fn register_consumer(
        &self,
        consumer: Arc<dyn FrameConsumer>,
    ) -> Result<ConsumerHandle, ConnectionError> {
        let mut consumers = self.consumers.write();
        // Checked under the write lock: close() flips the state before it
        // takes the list, so a consumer added here is always closed too.
        if !self.is_open() {
            return Err(ConnectionError::NotConnected);
        }

        let id = self.next_registration.fetch_add(1, Ordering::Relaxed);
        let mut next = Vec::with_capacity(consumers.len() + 1);
        next.extend(consumers.iter().cloned());
        next.push(Arc::new(Registration {
            id,
            active: AtomicBool::new(true),
            consumer,
        }));
        *consumers = Arc::new(next);

        debug!(connection = %self.id, registration = id, "consumer registered");
        Ok(ConsumerHandle {
            connection: self.id,
            registration: id,
        })
    }

    /// Convenience for [`register_consumer`](Self::register_consumer).
    pub fn register<C: FrameConsumer>(&self, consumer: C) -> Result<ConsumerHandle, ConnectionError> {
        self.register_consumer(Arc::new(consumer))
    }

    /// Remove a consumer. It is not invoked again, even for a frame whose
    /// fan-out is in progress. Returns `false` if the handle is unknown.
    pub fn unregister(&self, handle: &ConsumerHandle) -> bool {
        if handle.connection != self.id {
            return false;
        }

        let mut consumers = self.consumers.write();
        let Some(position) = consumers
            .iter()
            .position(|r| r.id == handle.registration)
        else {
            return false;
        };

        consumers[position].active.store(false, Ordering::Release);
        let next: Vec<_> = consumers
            .iter()
            .filter(|r| r.id != handle.registration)
            .cloned()
            .collect();
        *consumers = Arc::new(next);

        debug!(connection = %self.id, registration = handle.registration, "consumer unregistered");
        true
    }

    /// Fan one inbound frame out to every registered consumer.
    ///
    /// Returns the number of consumers invoked.
    pub fn dispatch(&self, frame: &[u8]) -> usize {
        if !self.is_open() {
            return 0;
        }

        let snapshot = Arc::clone(&self.consumers.read());
        let mut invoked = 0;
        for registration in snapshot.iter() {
            if registration.active.load(Ordering::Acquire) {
                registration.consumer.on_frame(frame);
                invoked += 1;
            }
        }
        invoked
    }

    /// Close the connection, telling the peer first if still open.
    ///
    /// Idempotent. Releases the publication and calls
    /// [`FrameConsumer::on_close`] on every registered consumer.
    pub fn close(&self) {
        self.shutdown(true);
    }

    /// Close after the peer went away; no disconnect is sent.
    pub(crate) fn close_lost(&self) {
        self.shutdown(false);
    }

    fn shutdown(&self, tell_peer: bool) {
        let previous = ConnectionState::from_u8(
            self.state
                .swap(ConnectionState::Closed as u8, Ordering::AcqRel),
        );
        if previous == ConnectionState::Closed {
            return;
        }

        let publication = self.publication.write().take();
        if let Some(publication) = publication {
            if tell_peer && previous == ConnectionState::Open {
                let bytes = envelope::encode(
                    MessageKind::ConnectionDisconnect,
                    self.next_sequence(),
                    &[],
                );
                if let Err(e) = publication.offer(&bytes) {
                    debug!(connection = %self.id, error = %e, "disconnect not delivered");
                }
            }
            publication.close();
        }

        let consumers = std::mem::take(&mut *self.consumers.write());
        for registration in consumers.iter() {
            if registration.active.swap(false, Ordering::AcqRel) {
                registration.consumer.on_close();
            }
        }

        info!(connection = %self.id, session = %self.peer_session, "connection closed");
        if previous == ConnectionState::Open {
            self.notify();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Weak;
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;

    use super::*;
    use crate::transport::envelope::decode;

    #[derive(Default)]
    struct ScriptedPublication {
        sent: Mutex<Vec<Vec<u8>>>,
        script: Mutex<VecDeque<OfferError>>,
        offers: AtomicUsize,
        closed: AtomicBool,
    }

    impl ScriptedPublication {
        fn failing(errors: impl IntoIterator<Item = OfferError>) -> Arc<Self> {
            let publication = Self::default();
            publication.script.lock().extend(errors);
            Arc::new(publication)
        }
    }

    impl Publication for ScriptedPublication {
        fn session_id(&self) -> SessionId {
            SessionId::new(77)
        }

        fn channel(&self) -> &str {
            "udp://127.0.0.1:1"
        }

        fn stream_id(&self) -> i32 {
            2
        }

        fn offer(&self, message: &[u8]) -> Result<(), OfferError> {
            self.offers.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.script.lock().pop_front() {
                return Err(error);
            }
            self.sent.lock().push(message.to_vec());
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Recorder {
        frames: Mutex<Vec<Vec<u8>>>,
        closes: AtomicUsize,
    }

    impl FrameConsumer for Recorder {
        fn on_frame(&self, frame: &[u8]) {
            self.frames.lock().push(frame.to_vec());
        }

        fn on_close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn connection(publication: Arc<ScriptedPublication>) -> DuplexConnection {
        DuplexConnection::new(SessionId::new(5), publication, 3)
    }

    #[test]
    fn test_send_sequences_frames() {
        let publication = ScriptedPublication::failing([]);
        let conn = connection(publication.clone());

        conn.send(b"first").unwrap();
        conn.send(b"second").unwrap();

        let sent = publication.sent.lock();
        let a = decode(&sent[0]).unwrap();
        let b = decode(&sent[1]).unwrap();
        assert_eq!((a.kind, a.sequence, a.payload), (MessageKind::Frame, 0, &b"first"[..]));
        assert_eq!((b.kind, b.sequence, b.payload), (MessageKind::Frame, 1, &b"second"[..]));
    }

    #[test]
    fn test_sequence_wraps() {
        let publication = ScriptedPublication::failing([]);
        let conn = connection(publication.clone());
        conn.sequence.store(u16::MAX, Ordering::Relaxed);

        conn.send(b"a").unwrap();
        conn.send(b"b").unwrap();

        let sent = publication.sent.lock();
        assert_eq!(decode(&sent[0]).unwrap().sequence, u16::MAX);
        assert_eq!(decode(&sent[1]).unwrap().sequence, 0);
    }

    #[test]
    fn test_backpressure_retried() {
        let publication =
            ScriptedPublication::failing([OfferError::BackPressured, OfferError::AdminAction]);
        let conn = connection(publication.clone());

        assert!(conn.send(b"x").is_ok());
        assert_eq!(publication.offers.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backpressure_exhausted() {
        let publication = ScriptedPublication::failing([OfferError::BackPressured; 5]);
        let conn = connection(publication.clone());

        assert_eq!(
            conn.send(b"x"),
            Err(ConnectionError::SendFailed { attempts: 3 })
        );
        assert!(conn.is_open());
    }

    #[test]
    fn test_not_yet_connected() {
        let publication = ScriptedPublication::failing([OfferError::NotConnected]);
        let conn = connection(publication);

        assert_eq!(conn.send(b"x"), Err(ConnectionError::NotYetConnected));
        assert!(conn.is_open());
    }

    #[test]
    fn test_hard_error_moves_to_closing() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let publication = ScriptedPublication::failing([OfferError::MaxPositionExceeded]);
        let conn = connection(publication).with_close_notifier(tx);

        assert_eq!(
            conn.send(b"x"),
            Err(ConnectionError::Transport(OfferError::MaxPositionExceeded))
        );
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert_eq!(rx.try_recv().unwrap(), (SessionId::new(5), conn.id()));
        assert_eq!(conn.send(b"y"), Err(ConnectionError::NotConnected));
    }

    #[test]
    fn test_fan_out_to_all_consumers() {
        let conn = connection(ScriptedPublication::failing([]));
        let recorders: Vec<_> = (0..4).map(|_| Arc::new(Recorder::default())).collect();
        for recorder in &recorders {
            conn.register_consumer(recorder.clone()).unwrap();
        }

        assert_eq!(conn.dispatch(b"frame"), 4);
        for recorder in &recorders {
            assert_eq!(recorder.frames.lock().as_slice(), &[b"frame".to_vec()]);
        }
    }

    #[test]
    fn test_unregister_during_fan_out() {
        let conn = Arc::new(connection(ScriptedPublication::failing([])));
        let victim = Arc::new(Recorder::default());
        let slot: Arc<Mutex<Option<(Weak<DuplexConnection>, ConsumerHandle)>>> =
            Arc::new(Mutex::new(None));

        let first = Arc::new(Recorder::default());
        conn.register_consumer(first.clone()).unwrap();

        let remover_slot = Arc::clone(&slot);
        conn.register(move |_: &[u8]| {
            if let Some((conn, handle)) = remover_slot.lock().take() {
                if let Some(conn) = conn.upgrade() {
                    assert!(conn.unregister(&handle));
                }
            }
        })
        .unwrap();

        let victim_handle = conn.register_consumer(victim.clone()).unwrap();
        let last = Arc::new(Recorder::default());
        conn.register_consumer(last.clone()).unwrap();
        *slot.lock() = Some((Arc::downgrade(&conn), victim_handle));

        assert_eq!(conn.dispatch(b"one"), 3);
        assert_eq!(conn.dispatch(b"two"), 3);

        assert!(victim.frames.lock().is_empty());
        assert_eq!(first.frames.lock().len(), 2);
        assert_eq!(last.frames.lock().len(), 2);
        assert_eq!(conn.consumer_count(), 3);
    }

    #[test]
    fn test_unregister_unknown_handle() {
        let a = connection(ScriptedPublication::failing([]));
        let b = connection(ScriptedPublication::failing([]));
        let handle = a.register(|_: &[u8]| {}).unwrap();

        assert!(!b.unregister(&handle));
        assert!(a.unregister(&handle));
        assert!(!a.unregister(&handle));
    }

    #[test]
    fn test_close_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let publication = ScriptedPublication::failing([]);
        let conn = connection(publication.clone()).with_close_notifier(tx);
        let kept = Arc::new(Recorder::default());
        let dropped = Arc::new(Recorder::default());
        conn.register_consumer(kept.clone()).unwrap();
        let handle = conn.register_consumer(dropped.clone()).unwrap();
        conn.unregister(&handle);

        conn.close();
        conn.close();

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(publication.is_closed());
        assert_eq!(kept.closes.load(Ordering::SeqCst), 1);
        assert_eq!(dropped.closes.load(Ordering::SeqCst), 0);

        let sent = publication.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            decode(&sent[0]).unwrap().kind,
            MessageKind::ConnectionDisconnect
        );

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_connection_rejects() {
        let conn = connection(ScriptedPublication::failing([]));
        let recorder = Arc::new(Recorder::default());
        conn.register_consumer(recorder.clone()).unwrap();
        conn.close_lost();

        assert_eq!(conn.send(b"x"), Err(ConnectionError::NotConnected));
        assert!(matches!(
            conn.register(|_: &[u8]| {}),
            Err(ConnectionError::NotConnected)
        ));
        assert_eq!(conn.dispatch(b"late"), 0);
        assert!(recorder.frames.lock().is_empty());
        assert_eq!(conn.local_session(), None);
    }

    #[test]
    fn test_establish_ack_payload() {
        let publication = ScriptedPublication::failing([]);
        let conn = connection(publication.clone());
        conn.send_establish_ack(SessionId::new(-9), 2).unwrap();

        let sent = publication.sent.lock();
        let envelope = decode(&sent[0]).unwrap();
        assert_eq!(envelope.kind, MessageKind::EstablishConnectionResponse);
        assert_eq!(
            EstablishResponse::decode(envelope.payload).unwrap().session_id,
            SessionId::new(-9)
        );
    }
}
