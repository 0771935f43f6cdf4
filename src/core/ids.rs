//! Identifiers for images, publications and connections.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Substrate session identifier of a publication and the image it produces
/// at the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(i32);

impl SessionId {
    /// Wrap a raw session id.
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Raw value.
    pub const fn get(self) -> i32 {
        self.0
    }

    /// Little-endian wire bytes.
    pub fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Parse from little-endian wire bytes.
    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self(i32::from_le_bytes(bytes))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for SessionId {
    fn from(raw: i32) -> Self {
        Self(raw)
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one duplex connection object.
///
/// Sessions can be reused after a failed handshake; the connection id tells
/// a stale close notification apart from one for the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_bytes() {
        let id = SessionId::new(-123_456);
        assert_eq!(SessionId::from_le_bytes(id.to_le_bytes()), id);
        assert_eq!(id.to_le_bytes(), (-123_456i32).to_le_bytes());
    }

    #[test]
    fn test_connection_ids_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(b.get() > a.get());
    }
}
