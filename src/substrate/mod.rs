//! Messaging substrate seam.
//!
//! The substrate provides publications (outbound byte streams to a channel)
//! and subscriptions (inbound images, one per remote publication session).
//! It knows nothing about RPC semantics; everything above this module is
//! built against these traits.
//!
//! ```text
//!  client                                   server
//!  Publication(udp://server, 1) ──image──▶ Subscription(udp://server, 1)
//!  Subscription(udp://client, 2) ◀─image── Publication(udp://client, 2)
//! ```

#[cfg(feature = "memory")]
#[cfg_attr(docsrs, doc(cfg(feature = "memory")))]
pub mod memory;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::core::{OfferError, SessionId, SubstrateError};

/// Fragment flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragmentFlags(u8);

impl FragmentFlags {
    /// First fragment of a message.
    pub const BEGIN: Self = Self(0x80);
    /// Last fragment of a message.
    pub const END: Self = Self(0x40);
    /// Complete message in a single fragment.
    pub const UNFRAGMENTED: Self = Self(0x80 | 0x40);
    /// Middle fragment.
    pub const NONE: Self = Self(0);

    /// Create flags from a raw byte.
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Get the raw byte value.
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// BEGIN bit set.
    pub fn is_begin(self) -> bool {
        self.0 & Self::BEGIN.0 != 0
    }

    /// END bit set.
    pub fn is_end(self) -> bool {
        self.0 & Self::END.0 != 0
    }

    /// Both BEGIN and END set.
    pub fn is_unfragmented(self) -> bool {
        self.is_begin() && self.is_end()
    }
}

impl std::ops::BitOr for FragmentFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Per-fragment metadata delivered with each poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Session of the image the fragment belongs to.
    pub session_id: SessionId,
    /// Fragmentation flags.
    pub flags: FragmentFlags,
}

/// Description of an inbound image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    /// Remote publication session.
    pub session_id: SessionId,
    /// Stream the image belongs to.
    pub stream_id: i32,
    /// Substrate-specific identity of the remote source.
    pub source_identity: String,
}

/// Outbound send handle to one channel/stream.
///
/// `offer` is safe to call from many threads; the substrate serializes
/// writers so bytes from two offers never interleave.
pub trait Publication: Send + Sync {
    /// Session id the remote image will carry.
    fn session_id(&self) -> SessionId;

    /// Channel this publication sends to.
    fn channel(&self) -> &str;

    /// Stream id.
    fn stream_id(&self) -> i32;

    /// Attempt to append one message.
    fn offer(&self, message: &[u8]) -> Result<(), OfferError>;

    /// At least one subscriber has an image of this publication.
    fn is_connected(&self) -> bool;

    /// Publication has been closed.
    fn is_closed(&self) -> bool;

    /// Release the publication. Idempotent.
    fn close(&self);
}

/// Inbound handle for one channel/stream.
pub trait Subscription: Send + Sync {
    /// Channel subscribed to.
    fn channel(&self) -> &str;

    /// Stream id.
    fn stream_id(&self) -> i32;

    /// Subscription has been closed.
    fn is_closed(&self) -> bool;

    /// Release the subscription. Idempotent.
    fn close(&self);

    /// Deliver up to `limit` available fragments to `handler`.
    ///
    /// Image availability changes are reported to this subscription's
    /// [`ImageListener`] from inside `poll`, on the calling thread: an
    /// image's availability precedes its fragments, and its unavailability
    /// follows its last fragment. Returns the number of fragments delivered.
    fn poll(
        &self,
        handler: &mut dyn FnMut(&[u8], &FragmentHeader),
        limit: usize,
    ) -> Result<usize, SubstrateError>;
}

/// Image availability notifications.
pub trait ImageListener: Send + Sync {
    /// A new remote publication is visible on the subscription.
    fn on_available_image(&self, image: &ImageInfo);

    /// A remote publication went away.
    fn on_unavailable_image(&self, image: &ImageInfo);
}

/// Factory for publications and subscriptions.
pub trait MediaDriver: Send + Sync {
    /// Open a publication to `channel`/`stream_id`.
    fn add_publication(
        &self,
        channel: &str,
        stream_id: i32,
    ) -> Result<Arc<dyn Publication>, SubstrateError>;

    /// Subscribe to `channel`/`stream_id`, reporting images to `listener`.
    fn add_subscription(
        &self,
        channel: &str,
        stream_id: i32,
        listener: Arc<dyn ImageListener>,
    ) -> Result<Arc<dyn Subscription>, SubstrateError>;
}

/// Channel string for a UDP endpoint.
pub fn udp_channel(addr: SocketAddr) -> String {
    format!("udp://{}:{}", addr.ip(), addr.port())
}

/// Validate a channel string of the form `udp://host:port`.
pub fn validate_channel(channel: &str) -> Result<(), SubstrateError> {
    let endpoint = channel
        .strip_prefix("udp://")
        .ok_or_else(|| SubstrateError::InvalidChannel(channel.to_string()))?;
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(SubstrateError::InvalidChannel(channel.to_string())),
    }
}
