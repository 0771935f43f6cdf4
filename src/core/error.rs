//! Error types shared by every layer.
//!
//! Per-subscription and per-connection errors never escape the duty cycle.
//! They are logged by the poller and isolated to the stream or connection
//! that produced them.

use std::time::Duration;

use thiserror::Error;

use super::ids::SessionId;

/// Errors decoding a transport envelope.
///
/// Every variant is a `MalformedEnvelope`: the fragment is discarded, logged,
/// and polling continues.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// Buffer shorter than the envelope header (or a handshake payload).
    #[error("malformed envelope: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum size required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Kind discriminator is not recognized.
    #[error("malformed envelope: unknown message kind 0x{0:04x}")]
    UnknownKind(u16),

    /// Handshake payload does not parse.
    #[error("malformed envelope: {0}")]
    InvalidPayload(&'static str),
}

/// Errors rebuilding a message from fragments.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssemblerError {
    /// A continuation fragment arrived without its BEGIN fragment.
    #[error("fragment without begin for session {session}")]
    MissingBegin {
        /// Image session.
        session: SessionId,
    },

    /// Reassembled message would exceed the configured limit.
    #[error("message for session {session} exceeds {limit} bytes ({length} so far)")]
    MessageTooLarge {
        /// Image session.
        session: SessionId,
        /// Bytes accumulated including the offending fragment.
        length: usize,
        /// Configured maximum.
        limit: usize,
    },
}

/// Outcome of a failed substrate offer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OfferError {
    /// Flow control window full; try again.
    #[error("back pressured")]
    BackPressured,

    /// Substrate busy with an administrative action; try again.
    #[error("admin action")]
    AdminAction,

    /// No subscriber is connected to the publication yet.
    #[error("not connected")]
    NotConnected,

    /// The publication has been closed.
    #[error("publication closed")]
    Closed,

    /// The stream reached its maximum position.
    #[error("max position exceeded")]
    MaxPositionExceeded,
}

impl OfferError {
    /// "Try again" conditions retried within a send's own budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, OfferError::BackPressured | OfferError::AdminAction)
    }

    /// The peer has not connected to the publication yet.
    pub fn is_not_connected(&self) -> bool {
        matches!(self, OfferError::NotConnected)
    }
}

/// Errors from the messaging substrate outside of offers.
#[derive(Debug, Error)]
pub enum SubstrateError {
    /// The subscription or driver has been closed.
    #[error("substrate closed")]
    Closed,

    /// Channel string could not be interpreted.
    #[error("invalid channel: {0}")]
    InvalidChannel(String),
}

/// Errors surfaced by a duplex connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The connection is closing or closed (or never reached ESTABLISHED).
    #[error("not connected")]
    NotConnected,

    /// Transient backpressure persisted for the whole retry budget.
    #[error("send failed after {attempts} attempts")]
    SendFailed {
        /// Offers attempted.
        attempts: u32,
    },

    /// The substrate reports no peer on the publication yet.
    #[error("publication not yet connected")]
    NotYetConnected,

    /// Hard substrate failure; the connection is now closing.
    #[error("transport error: {0}")]
    Transport(OfferError),
}

impl ConnectionError {
    /// Retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConnectionError::SendFailed { .. } | ConnectionError::NotYetConnected
        )
    }

    /// The connection is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectionError::Transport(_) | ConnectionError::NotConnected
        )
    }
}

/// Errors from the establish/acknowledge exchange.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Acknowledgement could not be delivered within the retry budget
    /// (`HandshakeTimeout`).
    #[error("acknowledgement not delivered after {attempts} attempts")]
    Timeout {
        /// Delivery attempts made.
        attempts: u32,
    },

    /// No establish request arrived for a fresh image in time.
    #[error("no establish request within {0:?}")]
    EstablishTimeout(Duration),

    /// Acknowledgement send hit a hard connection error.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Publication back to the peer could not be opened.
    #[error("substrate error: {0}")]
    Substrate(#[from] SubstrateError),
}

/// Errors talking to a duty-cycle thread.
#[derive(Debug, Error)]
pub enum PollerError {
    /// The poller thread has stopped.
    #[error("poller stopped")]
    Stopped,

    /// Subscription could not be created.
    #[error("substrate error: {0}")]
    Substrate(#[from] SubstrateError),

    /// Poller configuration is invalid.
    #[error("invalid poller config: {0}")]
    Config(#[from] ConfigError),
}

/// Invalid configuration values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Timer wheel bucket count must be a non-zero power of two.
    #[error("timer wheel buckets must be a power of two, got {0}")]
    TimerBuckets(usize),

    /// Timer wheel tick must be non-zero.
    #[error("timer wheel tick must be non-zero")]
    ZeroTick,

    /// A retry/attempt budget must allow at least one attempt.
    #[error("{0} must be at least 1")]
    ZeroBudget(&'static str),

    /// Idle strategy park bounds are inverted.
    #[error("idle min park {min:?} exceeds max park {max:?}")]
    ParkBounds {
        /// Configured minimum.
        min: Duration,
        /// Configured maximum.
        max: Duration,
    },
}
