//! # ReactiveSocket over Aeron-style images
//!
//! Transport binding that carries ReactiveSocket frames over a
//! publication/subscription substrate. It provides:
//!
//! - **Envelopes**: a 4-byte header (sequence, kind) around every message
//! - **Duplex connections**: one outbound publication paired with one inbound
//!   image, fanning frames out to registered consumers
//! - **Duty cycle**: a dedicated poller thread with a backoff idle strategy
//!   and a hashed timer wheel
//! - **Handshake**: ESTABLISH_CONNECTION / ESTABLISH_CONNECTION_RESPONSE with
//!   bounded, non-blocking acknowledgement retries
//!
//! ## Feature Flags
//!
//! - `transport` (default): codec, connection, poller, timers
//! - `server` (default): connection registry and [`server::TransportServer`]
//! - `client` (default): [`client::TransportClient`]
//! - `memory` (default): in-process substrate, [`substrate::memory::MemoryDriver`]
//! - `subscriber`: [`trace::init_tracing`]
//!
//! ## Modules
//!
//! - [`core`]: constants, ids, errors, configuration, consumer seam
//! - [`substrate`]: messaging substrate traits
//! - [`transport`]: envelope codec, duplex connection, poller
//! - [`server`] / [`client`]: the two ends of the handshake
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use reactivesocket_aeron::prelude::*;
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     fn on_connection(&self, connection: Arc<DuplexConnection>) {
//!         let reply = Arc::downgrade(&connection);
//!         let _ = connection.register(move |frame: &[u8]| {
//!             if let Some(connection) = reply.upgrade() {
//!                 let _ = connection.send(frame);
//!             }
//!         });
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let driver: Arc<dyn MediaDriver> = Arc::new(MemoryDriver::new());
//! let server = TransportServer::bind(driver.clone(), ServerConfig::default(), Arc::new(Echo))?;
//! let client = TransportClient::new(driver, ClientConfig::default())?;
//!
//! let connection = client.connect(server.config().listen_addr).await?;
//! connection.send(b"ping")?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Substrate seam (always included; the in-process driver is feature-gated)
pub mod substrate;

// Transport layer (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

// Client API (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

// Server API (feature-gated)
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

// Subscriber setup (feature-gated)
#[cfg(feature = "subscriber")]
#[cfg_attr(docsrs, doc(cfg(feature = "subscriber")))]
pub mod trace;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;

    pub use crate::substrate::{ImageInfo, ImageListener, MediaDriver, Publication, Subscription};

    #[cfg(feature = "memory")]
    pub use crate::substrate::memory::MemoryDriver;

    #[cfg(feature = "transport")]
    pub use crate::transport::{
        ConnectionState, ConsumerHandle, DuplexConnection, Duty, MessageKind, Poller,
        PollerHandle, Scheduler,
    };

    #[cfg(feature = "server")]
    pub use crate::server::{
        ConnectionHandler, ConnectionRegistry, HandshakeState, ServerError, TransportServer,
    };

    #[cfg(feature = "client")]
    pub use crate::client::{ClientError, TransportClient};
}

// Re-export commonly used items at crate root
pub use core::{ConnectionError, ConnectionId, FrameConsumer, SessionId};

#[cfg(feature = "transport")]
pub use transport::{DuplexConnection, MessageKind};
