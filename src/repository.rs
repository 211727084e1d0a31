//! Persistence collaborator
//!
//! Rooms and the chat server only talk to storage through [`Repository`].
//! Implementations must be safe to share between actors (`Arc<dyn Repository>`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{RoomId, SeqId, User, UserId};

/// Repository errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    /// No row matched
    #[error("not found")]
    NotFound,

    /// Any other storage failure
    #[error("storage failure: {0}")]
    Internal(String),
}

/// A persisted room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
    pub id: RoomId,
    pub external_id: String,
    pub name: String,
    pub description: String,
    /// Last assigned message sequence number
    pub seq_id: SeqId,
    pub owner_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Only populated by [`Repository::get_room_with_subscribers`]
    pub subscriptions: Vec<Subscription>,
}

/// A user's persisted association with a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: i64,
    pub user_id: UserId,
    pub username: String,
    pub room_id: RoomId,
    pub room_external_id: String,
    pub last_read_seq_id: SeqId,
    pub created_at: DateTime<Utc>,
}

/// Message to persist on publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub seq_id: SeqId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Look up an account
    async fn get_user(&self, user_id: UserId) -> Result<User, RepositoryError>;

    async fn subscription_exists(&self, user_id: UserId, room_id: RoomId) -> bool;

    async fn create_subscription(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<Subscription, RepositoryError>;

    /// Fails with [`RepositoryError::NotFound`] when no subscription matches
    async fn delete_subscription(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<(), RepositoryError>;

    async fn get_room_by_external_id(&self, external_id: &str)
        -> Result<RoomRecord, RepositoryError>;

    async fn get_room_with_subscribers(&self, room_id: RoomId)
        -> Result<RoomRecord, RepositoryError>;

    async fn get_subscribers_by_room_id(&self, room_id: RoomId)
        -> Result<Vec<User>, RepositoryError>;

    async fn list_subscriptions(&self, user_id: UserId)
        -> Result<Vec<Subscription>, RepositoryError>;

    /// Persist a message and advance the room's stored `seq_id` to `msg.seq_id`
    async fn create_message(&self, msg: NewMessage) -> Result<(), RepositoryError>;

    async fn update_last_read_seq_id(
        &self,
        user_id: UserId,
        room_id: RoomId,
        seq_id: SeqId,
    ) -> Result<(), RepositoryError>;

    async fn delete_room(&self, room_id: RoomId) -> Result<(), RepositoryError>;
}
