//! Transport constants.
//!
//! Wire values are fixed by the envelope format and MUST NOT be changed.

use std::time::Duration;

// =============================================================================
// ENVELOPE WIRE FORMAT
// =============================================================================

/// Sequence number field size.
pub const SEQUENCE_SIZE: usize = 2;

/// Message-kind discriminator field size.
pub const KIND_SIZE: usize = 2;

/// Envelope header size (sequence + kind).
pub const HEADER_SIZE: usize = SEQUENCE_SIZE + KIND_SIZE;

/// Session identifier size inside handshake payloads.
pub const SESSION_ID_SIZE: usize = 4;

/// Length prefix of the response channel inside an establish request.
pub const CHANNEL_LENGTH_SIZE: usize = 4;

/// Connection establishment request (client -> server).
pub const KIND_ESTABLISH_CONNECTION: u16 = 0x01;

/// Connection establishment acknowledgement (server -> client).
pub const KIND_ESTABLISH_CONNECTION_RESPONSE: u16 = 0x02;

/// Graceful disconnect notice (either direction).
pub const KIND_CONNECTION_DISCONNECT: u16 = 0x03;

/// Opaque RPC frame.
pub const KIND_FRAME: u16 = 0x04;

// =============================================================================
// STREAMS
// =============================================================================

/// Stream the server subscribes to for inbound connections.
pub const SERVER_STREAM_ID: i32 = 1;

/// Stream clients subscribe to for server responses.
pub const CLIENT_STREAM_ID: i32 = 2;

/// Default server listen port.
pub const DEFAULT_SERVER_PORT: u16 = 39790;

/// Default client response port.
pub const DEFAULT_CLIENT_PORT: u16 = 39791;

// =============================================================================
// SEND / HANDSHAKE RETRY BOUNDS
// =============================================================================

/// Offer attempts on transient backpressure before a send gives up.
pub const DEFAULT_OFFER_RETRIES: u32 = 30;

/// Acknowledgement delivery attempts before a handshake fails.
pub const DEFAULT_ACK_RETRY_COUNT: u32 = 10;

/// Pause between acknowledgement delivery attempts.
pub const DEFAULT_ACK_RETRY_PAUSE: Duration = Duration::from_millis(1);

/// Time a fresh image may stay without an establish request.
pub const DEFAULT_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Client: overall connect deadline.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client: establish request attempts within the connect deadline.
pub const DEFAULT_ESTABLISH_ATTEMPTS: u32 = 5;

/// Client: wait for the first establish response (doubles per attempt).
pub const DEFAULT_ESTABLISH_BACKOFF: Duration = Duration::from_millis(100);

// =============================================================================
// DUTY CYCLE
// =============================================================================

/// Timer wheel tick.
pub const DEFAULT_TIMER_TICK: Duration = Duration::from_millis(1);

/// Timer wheel buckets (power of two).
pub const DEFAULT_TIMER_BUCKETS: usize = 1024;

/// Idle strategy: busy spins before yielding.
pub const DEFAULT_IDLE_MAX_SPINS: u32 = 1;

/// Idle strategy: yields before parking.
pub const DEFAULT_IDLE_MAX_YIELDS: u32 = 10;

/// Idle strategy: first park period.
pub const DEFAULT_IDLE_MIN_PARK: Duration = Duration::from_micros(1);

/// Idle strategy: park period ceiling.
pub const DEFAULT_IDLE_MAX_PARK: Duration = Duration::from_millis(1);

/// Largest message the fragment assembler will rebuild.
pub const DEFAULT_MAX_MESSAGE_LENGTH: usize = 16 * 1024 * 1024;

/// Server duty thread name.
pub const SERVER_THREAD_NAME: &str = "reactive-socket-aeron-server";

/// Client duty thread name.
pub const CLIENT_THREAD_NAME: &str = "reactive-socket-aeron-client";
