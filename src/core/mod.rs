//! Core types, constants, and error definitions.
//!
//! This module has no I/O dependencies. It defines the wire constants, the
//! error taxonomy shared by every layer, the configuration surface exposed to
//! embedding code, and the consumer seam towards the RPC payload protocol.

mod config;
mod constants;
mod error;
mod ids;
mod traits;

pub use config::*;
pub use constants::*;
pub use error::*;
pub use ids::*;
pub use traits::*;
