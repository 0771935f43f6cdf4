//! Transport layer.
//!
//! Everything between the messaging substrate and the RPC payload protocol:
//!
//! - **Envelope codec**: [`encode`], [`decode`], [`MessageKind`]
//! - **Fragment reassembly**: [`FragmentAssembler`]
//! - **Duplex connection**: [`DuplexConnection`] with copy-on-write consumer fan-out
//! - **Duty cycle**: [`Poller`] with [`BackoffIdleStrategy`] and a [`TimerWheel`]
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   RPC payload protocol (FrameConsumer)  │
//! ├─────────────────────────────────────────┤
//! │   server registry  │  client driver     │
//! ├─────────────────────────────────────────┤
//! │         Transport Layer                 │  ← This module
//! │ envelopes, connections, poller, timers  │
//! ├─────────────────────────────────────────┤
//! │   Substrate (publications / images)     │
//! └─────────────────────────────────────────┘
//! ```

mod assembler;
mod connection;
pub mod envelope;
mod idle;
mod poller;
mod timer;

pub use assembler::FragmentAssembler;
pub(crate) use connection::{CloseNotifier, offer_with_retries};
pub use connection::{ConnectionState, ConsumerHandle, DuplexConnection};
pub use envelope::{
    Envelope, EstablishRequest, EstablishResponse, MessageKind, decode, encode, encode_into,
};
pub use idle::{BackoffIdleStrategy, IdlePhase};
pub use poller::{Duty, EnvelopeHandler, Poller, PollerHandle, SubscriptionId};
pub(crate) use timer::ScheduledTaskQueue;
pub use timer::{Scheduler, TimerTask, TimerToken, TimerWheel};
