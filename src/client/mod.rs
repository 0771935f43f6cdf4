//! Client side: establish connections to a server and exchange frames.

#[allow(clippy::module_inception)]
mod client;

pub use client::*;
