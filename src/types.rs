//! Basic type definitions for the client engine
//!
//! Provides newtype wrappers for type safety:
//! - `ConnId`: identifies a room connection or the PM connection
//! - `MessageId`: durable, server-assigned message id
//! - `Level`: permission level inside a room

use rand::Rng;

/// Identifies the connection an event originated from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnId {
    /// A room connection, keyed by lowercased room name
    Room(String),
    /// The private-message connection
    Pm,
}

impl ConnId {
    /// Room name if this is a room connection
    pub fn room_name(&self) -> Option<&str> {
        match self {
            ConnId::Room(name) => Some(name),
            ConnId::Pm => None,
        }
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnId::Room(name) => write!(f, "room:{}", name),
            ConnId::Pm => write!(f, "pm"),
        }
    }
}

/// Durable message id assigned by the server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Permission level of a user inside a room
///
/// Ordered so that `level >= Level::Moderator` reads naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Base = 0,
    Moderator = 1,
    Owner = 2,
}

/// Generate a random 16-digit connection uid
pub fn gen_uid() -> String {
    rand::thread_rng()
        .gen_range(1_000_000_000_000_000u64..10_000_000_000_000_000u64)
        .to_string()
}

/// Current wall-clock time as fractional unix seconds
pub fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uid_has_sixteen_digits() {
        for _ in 0..32 {
            let uid = gen_uid();
            assert_eq!(uid.len(), 16);
            assert!(uid.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_level_ordering() {
        assert!(Level::Owner > Level::Moderator);
        assert!(Level::Moderator > Level::Base);
        assert!(Level::Owner >= Level::Moderator);
    }

    #[test]
    fn test_conn_id_display() {
        assert_eq!(ConnId::Room("lobby".into()).to_string(), "room:lobby");
        assert_eq!(ConnId::Pm.to_string(), "pm");
        assert_eq!(ConnId::Room("x".into()).room_name(), Some("x"));
        assert_eq!(ConnId::Pm.room_name(), None);
    }
}
