//! Basic type definitions for the chat server
//!
//! Provides identifiers and the user snapshot shared across actors:
//! - `ClientId`: UUID-based unique connection identifier
//! - `RoomCode`: 8-character alphanumeric public room id
//! - `User`: immutable identity snapshot

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persisted account id
pub type UserId = i64;

/// Internal (numeric) room id
pub type RoomId = i64;

/// Per-room message sequence number
pub type SeqId = i64;

/// Unique client identifier (newtype pattern)
///
/// One per connection. A user with two open tabs has two `ClientId`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Create a new random client ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Public room identifier (8-character lowercase alphanumeric)
///
/// This is the `room_id` clients use on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomCode(pub String);

impl RoomCode {
    const LEN: usize = 8;

    /// Generate a new random room code
    pub fn generate() -> Self {
        use rand::Rng;
        let code: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(Self::LEN)
            .map(char::from)
            .collect::<String>()
            .to_lowercase();
        Self(code)
    }
}

impl std::fmt::Display for RoomCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity snapshot of a user
///
/// Rooms and clients keep their own copy; nothing mutates it after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
}

impl User {
    pub fn new(id: UserId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
        }
    }
}
