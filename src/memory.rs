//! In-memory repository implementation
//!
//! Implements [`Repository`] with `HashMap`s behind a single async mutex.
//! Used by the binary (seeded from the command line) and by tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::message::now;
use crate::repository::{NewMessage, Repository, RepositoryError, RoomRecord, Subscription};
use crate::types::{RoomCode, RoomId, SeqId, User, UserId};

/// A persisted chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub seq_id: SeqId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct SubscriptionRow {
    id: i64,
    user_id: UserId,
    room_id: RoomId,
    last_read_seq_id: SeqId,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<UserId, User>,
    rooms: HashMap<RoomId, RoomRecord>,
    subscriptions: Vec<SubscriptionRow>,
    messages: Vec<StoredMessage>,
    next_user_id: UserId,
    next_room_id: RoomId,
    next_subscription_id: i64,
    next_message_id: i64,
}

impl Tables {
    fn subscription(&self, row: &SubscriptionRow) -> Option<Subscription> {
        let user = self.users.get(&row.user_id)?;
        let room = self.rooms.get(&row.room_id)?;
        Some(Subscription {
            id: row.id,
            user_id: row.user_id,
            username: user.username.clone(),
            room_id: row.room_id,
            room_external_id: room.external_id.clone(),
            last_read_seq_id: row.last_read_seq_id,
            created_at: row.created_at,
        })
    }

    fn room_subscriptions(&self, room_id: RoomId) -> Vec<Subscription> {
        self.subscriptions
            .iter()
            .filter(|row| row.room_id == room_id)
            .filter_map(|row| self.subscription(row))
            .collect()
    }
}

/// In-memory [`Repository`]
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    tables: Mutex<Tables>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an account and return its snapshot
    pub async fn create_user(&self, username: &str) -> User {
        let mut tables = self.tables.lock().await;
        tables.next_user_id += 1;
        let user = User::new(tables.next_user_id, username);
        tables.users.insert(user.id, user.clone());
        user
    }

    /// Create a room with a generated external id
    pub async fn create_room(
        &self,
        name: &str,
        description: &str,
        owner_id: UserId,
    ) -> Result<RoomRecord, RepositoryError> {
        self.create_room_with_external_id(&RoomCode::generate().0, name, description, owner_id)
            .await
    }

    /// Create a room with a caller-chosen external id
    pub async fn create_room_with_external_id(
        &self,
        external_id: &str,
        name: &str,
        description: &str,
        owner_id: UserId,
    ) -> Result<RoomRecord, RepositoryError> {
        let mut tables = self.tables.lock().await;
        if tables.rooms.values().any(|r| r.external_id == external_id) {
            return Err(RepositoryError::Internal(format!(
                "room {external_id:?} already exists"
            )));
        }

        tables.next_room_id += 1;
        let created_at = now();
        let room = RoomRecord {
            id: tables.next_room_id,
            external_id: external_id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            seq_id: 0,
            owner_id,
            created_at,
            updated_at: created_at,
            subscriptions: Vec::new(),
        };
        tables.rooms.insert(room.id, room.clone());
        Ok(room)
    }

    /// Messages of a room with `seq_id > since`, oldest first, at most `limit`
    pub async fn get_messages(&self, room_id: RoomId, since: SeqId, limit: usize) -> Vec<StoredMessage> {
        let tables = self.tables.lock().await;
        let mut messages: Vec<StoredMessage> = tables
            .messages
            .iter()
            .filter(|m| m.room_id == room_id && m.seq_id > since)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.seq_id);
        messages.truncate(limit);
        messages
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_user(&self, user_id: UserId) -> Result<User, RepositoryError> {
        let tables = self.tables.lock().await;
        tables
            .users
            .get(&user_id)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn subscription_exists(&self, user_id: UserId, room_id: RoomId) -> bool {
        let tables = self.tables.lock().await;
        tables
            .subscriptions
            .iter()
            .any(|row| row.user_id == user_id && row.room_id == room_id)
    }

    async fn create_subscription(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<Subscription, RepositoryError> {
        let mut tables = self.tables.lock().await;
        if !tables.users.contains_key(&user_id) || !tables.rooms.contains_key(&room_id) {
            return Err(RepositoryError::NotFound);
        }
        if tables
            .subscriptions
            .iter()
            .any(|row| row.user_id == user_id && row.room_id == room_id)
        {
            return Err(RepositoryError::Internal(format!(
                "user {user_id} is already subscribed to room {room_id}"
            )));
        }

        tables.next_subscription_id += 1;
        let row = SubscriptionRow {
            id: tables.next_subscription_id,
            user_id,
            room_id,
            last_read_seq_id: 0,
            created_at: now(),
        };
        let subscription = tables
            .subscription(&row)
            .ok_or(RepositoryError::NotFound)?;
        tables.subscriptions.push(row);
        Ok(subscription)
    }

    async fn delete_subscription(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.lock().await;
        let before = tables.subscriptions.len();
        tables
            .subscriptions
            .retain(|row| !(row.user_id == user_id && row.room_id == room_id));
        if tables.subscriptions.len() == before {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_room_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<RoomRecord, RepositoryError> {
        let tables = self.tables.lock().await;
        tables
            .rooms
            .values()
            .find(|r| r.external_id == external_id)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn get_room_with_subscribers(
        &self,
        room_id: RoomId,
    ) -> Result<RoomRecord, RepositoryError> {
        let tables = self.tables.lock().await;
        let mut room = tables
            .rooms
            .get(&room_id)
            .cloned()
            .ok_or(RepositoryError::NotFound)?;
        room.subscriptions = tables.room_subscriptions(room_id);
        Ok(room)
    }

    async fn get_subscribers_by_room_id(
        &self,
        room_id: RoomId,
    ) -> Result<Vec<User>, RepositoryError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .room_subscriptions(room_id)
            .into_iter()
            .map(|s| User::new(s.user_id, s.username))
            .collect())
    }

    async fn list_subscriptions(
        &self,
        user_id: UserId,
    ) -> Result<Vec<Subscription>, RepositoryError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .subscriptions
            .iter()
            .filter(|row| row.user_id == user_id)
            .filter_map(|row| tables.subscription(row))
            .collect())
    }

    async fn create_message(&self, msg: NewMessage) -> Result<(), RepositoryError> {
        let mut tables = self.tables.lock().await;
        let room = tables
            .rooms
            .get_mut(&msg.room_id)
            .ok_or(RepositoryError::NotFound)?;
        if msg.seq_id <= room.seq_id {
            return Err(RepositoryError::Internal(format!(
                "duplicate seq_id {} for room {}",
                msg.seq_id, msg.room_id
            )));
        }
        room.seq_id = msg.seq_id;
        room.updated_at = msg.created_at;

        tables.next_message_id += 1;
        let stored = StoredMessage {
            id: tables.next_message_id,
            seq_id: msg.seq_id,
            room_id: msg.room_id,
            user_id: msg.user_id,
            content: msg.content,
            created_at: msg.created_at,
        };
        tables.messages.push(stored);
        Ok(())
    }

    async fn update_last_read_seq_id(
        &self,
        user_id: UserId,
        room_id: RoomId,
        seq_id: SeqId,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .subscriptions
            .iter_mut()
            .find(|row| row.user_id == user_id && row.room_id == room_id)
            .ok_or(RepositoryError::NotFound)?;
        row.last_read_seq_id = seq_id;
        Ok(())
    }

    async fn delete_room(&self, room_id: RoomId) -> Result<(), RepositoryError> {
        let mut tables = self.tables.lock().await;
        if tables.rooms.remove(&room_id).is_none() {
            return Err(RepositoryError::NotFound);
        }
        tables.subscriptions.retain(|row| row.room_id != room_id);
        tables.messages.retain(|m| m.room_id != room_id);
        Ok(())
    }
}
