//! Server side of the transport.
//!
//! [`TransportServer`] subscribes to the listen channel on its own duty
//! thread and runs the handshake state machine in [`ConnectionRegistry`].
//! Established connections are handed to a [`ConnectionHandler`].

mod registry;
#[allow(clippy::module_inception)]
mod server;

pub use registry::*;
pub use server::*;
