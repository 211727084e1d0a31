//! Room actor
//!
//! One `Room` task per active room. It owns membership, the per-user session
//! index, the subscriber cache and the message sequence counter. Everything
//! that touches them arrives through the room's mailboxes and is handled by
//! [`Room::run`], one message at a time.
//!
//! ```text
//!            join (any)                  last session leaves
//!   Empty ───────────────▶ Occupied ───────────────────────▶ Empty (idle timer armed)
//!     │                        │
//!     │ idle timer / exit      │ exit (delete or shutdown)
//!     ▼                        ▼
//!  Exiting ◀───────────────────┘
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::client::ClientHandle;
use crate::config::RoomConfig;
use crate::error::RequestError;
use crate::message::{
    ChatMessage, ClientMessage, Leave, Publish, Read, Request, ResponseData, RoomSnapshot,
    ServerMessage, Subscriber,
};
use crate::repository::{NewMessage, Repository, RepositoryError, RoomRecord};
use crate::server::ChatServerHandle;
use crate::types::{ClientId, RoomId, SeqId, User, UserId};

/// Request to tear the room down
#[derive(Debug)]
pub struct ExitRequest {
    /// Room was deleted; members get a `room_deleted` notification
    pub deleted: bool,
    /// Decline if the room has members (idle unloads)
    pub only_if_idle: bool,
    pub done: oneshot::Sender<ExitAck>,
}

/// Room's answer to an [`ExitRequest`], carrying its external id
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitAck {
    Exited(String),
    /// An idle-only request arrived after a client joined
    StillActive(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Empty,
    Occupied,
    Exiting,
}

/// Senders into a room's mailboxes
#[derive(Debug, Clone)]
pub struct RoomHandle {
    external_id: Arc<str>,
    join: mpsc::Sender<ClientMessage>,
    leave: mpsc::Sender<ClientMessage>,
    messages: mpsc::Sender<ClientMessage>,
    exit: mpsc::Sender<ExitRequest>,
}

impl RoomHandle {
    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    /// Whether both handles point at the same room task
    pub fn same_room(&self, other: &RoomHandle) -> bool {
        self.join.same_channel(&other.join)
    }

    /// Resolves once the room has stopped taking requests
    pub async fn closed(&self) {
        self.join.closed().await
    }

    pub fn try_join(&self, msg: ClientMessage) -> Result<(), TrySendError<ClientMessage>> {
        self.join.try_send(msg)
    }

    pub fn try_leave(&self, msg: ClientMessage) -> Result<(), TrySendError<ClientMessage>> {
        self.leave.try_send(msg)
    }

    /// Publish and read requests
    pub fn try_send_message(&self, msg: ClientMessage) -> Result<(), TrySendError<ClientMessage>> {
        self.messages.try_send(msg)
    }

    /// Deliver a leave that must not be lost, without blocking the caller
    ///
    /// Used by disconnect cleanup: if the mailbox is full the leave is handed
    /// to a background task that waits for room.
    pub fn leave_eventually(&self, msg: ClientMessage) {
        match self.leave.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                warn!(room = %self.external_id, "leave mailbox full, deferring cleanup leave");
                let leave = self.leave.clone();
                tokio::spawn(async move {
                    let _ = leave.send(msg).await;
                });
            }
            Err(TrySendError::Closed(_)) => {
                debug!(room = %self.external_id, "room already unloaded");
            }
        }
    }

    /// Ask the room to exit and wait for its acknowledgement
    ///
    /// Returns `None` if the room task is already gone.
    pub async fn exit(&self, deleted: bool, only_if_idle: bool) -> Option<ExitAck> {
        let (done, ack) = oneshot::channel();
        self.exit
            .send(ExitRequest {
                deleted,
                only_if_idle,
                done,
            })
            .await
            .ok()?;
        ack.await.ok()
    }
}

struct Mailboxes {
    join: mpsc::Receiver<ClientMessage>,
    leave: mpsc::Receiver<ClientMessage>,
    messages: mpsc::Receiver<ClientMessage>,
    exit: mpsc::Receiver<ExitRequest>,
}

/// The room actor
pub struct Room {
    id: RoomId,
    external_id: String,
    subscribers: Vec<User>,
    seq_id: SeqId,
    clients: HashMap<ClientId, ClientHandle>,
    user_index: HashMap<UserId, HashSet<ClientId>>,
    /// Armed only while the room is empty
    idle_deadline: Option<Instant>,
    exiting: bool,
    handle: RoomHandle,
    mailboxes: Mailboxes,
    repo: Arc<dyn Repository>,
    server: ChatServerHandle,
    config: RoomConfig,
}

impl Room {
    /// Build a room from its persisted record; the idle timer starts stopped
    pub fn new(
        record: &RoomRecord,
        subscribers: Vec<User>,
        repo: Arc<dyn Repository>,
        server: ChatServerHandle,
        config: RoomConfig,
    ) -> (Self, RoomHandle) {
        let (join_tx, join_rx) = mpsc::channel(config.mailbox_capacity);
        let (leave_tx, leave_rx) = mpsc::channel(config.mailbox_capacity);
        let (messages_tx, messages_rx) = mpsc::channel(config.mailbox_capacity);
        let (exit_tx, exit_rx) = mpsc::channel(1);

        let handle = RoomHandle {
            external_id: Arc::from(record.external_id.as_str()),
            join: join_tx,
            leave: leave_tx,
            messages: messages_tx,
            exit: exit_tx,
        };

        let room = Self {
            id: record.id,
            external_id: record.external_id.clone(),
            subscribers,
            seq_id: record.seq_id,
            clients: HashMap::new(),
            user_index: HashMap::new(),
            idle_deadline: None,
            exiting: false,
            handle: handle.clone(),
            mailboxes: Mailboxes {
                join: join_rx,
                leave: leave_rx,
                messages: messages_rx,
                exit: exit_rx,
            },
            repo,
            server,
            config,
        };
        (room, handle)
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    pub fn state(&self) -> RoomState {
        if self.exiting {
            RoomState::Exiting
        } else if self.clients.is_empty() {
            RoomState::Empty
        } else {
            RoomState::Occupied
        }
    }

    /// Last assigned message sequence number
    pub fn seq_id(&self) -> SeqId {
        self.seq_id
    }

    /// Run the room event loop until an exit request is accepted
    pub async fn run(mut self) {
        info!(room = %self.external_id, "starting room");

        loop {
            let idle_deadline = self.idle_deadline;
            // Joins forwarded before an unload request must be seen first
            tokio::select! {
                biased;
                Some(msg) = self.mailboxes.join.recv() => {
                    self.handle_join(msg).await;
                }
                Some(msg) = self.mailboxes.leave.recv() => {
                    self.handle_leave(msg).await;
                }
                Some(msg) = self.mailboxes.messages.recv() => {
                    self.handle_client_message(msg).await;
                }
                _ = sleep_until(idle_deadline.unwrap_or_else(Instant::now)), if idle_deadline.is_some() => {
                    self.handle_idle_timeout();
                }
                Some(req) = self.mailboxes.exit.recv() => {
                    if self.handle_exit(req) {
                        break;
                    }
                }
                else => break,
            }
        }

        info!(room = %self.external_id, "room stopped");
    }

    fn start_idle_timer(&mut self) {
        self.idle_deadline = Some(Instant::now() + self.config.idle_timeout);
    }

    fn stop_idle_timer(&mut self) {
        self.idle_deadline = None;
    }

    // ------------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------------

    /// Returns false if the client disconnected before it could be attached
    fn add_client(&mut self, client: &ClientHandle) -> bool {
        if !client.add_room(self.handle.clone()) {
            return false;
        }
        self.clients.insert(client.id(), client.clone());
        self.user_index
            .entry(client.user().id)
            .or_default()
            .insert(client.id());
        true
    }

    /// Drop a join whose client is already gone
    fn discard_join(&mut self, msg: &ClientMessage) {
        debug!(
            room = %self.external_id,
            client = %msg.client.id(),
            "discarding join from disconnected client"
        );
        if self.clients.is_empty() {
            self.start_idle_timer();
        }
    }

    /// Remove one session; arms the idle timer when the room empties
    fn remove_session(&mut self, client_id: ClientId) -> Option<ClientHandle> {
        let client = self.clients.remove(&client_id)?;
        let user_id = client.user().id;
        if let Some(sessions) = self.user_index.get_mut(&user_id) {
            sessions.remove(&client_id);
            if sessions.is_empty() {
                self.user_index.remove(&user_id);
            }
        }

        debug!(
            room = %self.external_id,
            user = %client.user().username,
            "removed session"
        );

        if self.clients.is_empty() {
            info!(room = %self.external_id, "no clients left, starting idle timer");
            self.start_idle_timer();
        }
        Some(client)
    }

    fn remove_all_sessions(&mut self, user_id: UserId) {
        let sessions: Vec<ClientId> = self
            .user_index
            .get(&user_id)
            .map(|sessions| sessions.iter().copied().collect())
            .unwrap_or_default();

        for client_id in sessions {
            if let Some(client) = self.remove_session(client_id) {
                client.signal_room_exit(&self.external_id);
            }
        }
        debug!(room = %self.external_id, user_id, "removed all sessions for user");
    }

    fn is_member(&self, client_id: ClientId) -> bool {
        self.clients.contains_key(&client_id)
    }

    fn is_present(&self, user_id: UserId) -> bool {
        self.user_index.contains_key(&user_id)
    }

    fn remove_subscriber(&mut self, user_id: UserId) {
        self.subscribers.retain(|sub| sub.id != user_id);
    }

    /// Send to every member except `msg.skip`
    fn broadcast(&self, msg: ServerMessage) {
        debug!(room = %self.external_id, members = self.clients.len(), "broadcast");
        for (client_id, client) in &self.clients {
            if msg.skip == Some(*client_id) {
                continue;
            }
            client.queue_message(msg.clone());
        }
    }

    /// Push a notification to every session of every cached subscriber
    fn notify_subscribers<F>(&self, skip: Option<ClientId>, mut include: F, msg: ServerMessage)
    where
        F: FnMut(&User) -> bool,
    {
        for sub in self.subscribers.iter().filter(|sub| include(sub)) {
            let mut msg = msg.clone();
            msg.skip = skip;
            self.server.broadcast_to_user(sub.id, msg);
        }
    }

    fn snapshot(&self, record: &RoomRecord) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.external_id.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            seq_id: self.seq_id,
            owner_id: record.owner_id,
            subscribers: record
                .subscriptions
                .iter()
                .map(|sub| Subscriber {
                    id: sub.user_id,
                    username: sub.username.clone(),
                    is_present: self.is_present(sub.user_id),
                })
                .collect(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    // ------------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------------

    fn reject_join(&mut self, msg: &ClientMessage, err: RequestError) {
        if self.clients.is_empty() {
            self.start_idle_timer();
        }
        msg.client.queue_message(ServerMessage::error(msg.id, err));
    }

    async fn handle_join(&mut self, msg: ClientMessage) {
        self.stop_idle_timer();
        if msg.client.is_closed() {
            self.discard_join(&msg);
            return;
        }

        let user = msg.client.user().clone();
        if !self.repo.subscription_exists(user.id, self.id).await {
            info!(
                room = %self.external_id,
                user = %user.username,
                "creating subscription"
            );
            if let Err(e) = self.repo.create_subscription(user.id, self.id).await {
                error!(room = %self.external_id, "create subscription: {}", e);
                self.reject_join(&msg, RequestError::Internal);
                return;
            }

            self.subscribers.push(user.clone());
            self.broadcast(ServerMessage::subscription_change(
                &self.external_id,
                user.clone(),
                true,
            ));
        }

        let record = match self.repo.get_room_with_subscribers(self.id).await {
            Ok(record) => record,
            Err(e) => {
                error!(room = %self.external_id, "get room with subscribers: {}", e);
                self.reject_join(&msg, RequestError::Internal);
                return;
            }
        };
        self.subscribers = record
            .subscriptions
            .iter()
            .map(|sub| User::new(sub.user_id, sub.username.clone()))
            .collect();

        if !self.add_client(&msg.client) {
            self.discard_join(&msg);
            return;
        }
        info!(
            room = %self.external_id,
            user = %user.username,
            clients = self.clients.len(),
            "client joined"
        );

        let snapshot = self.snapshot(&record);
        msg.client
            .queue_message(ServerMessage::ok(msg.id, Some(ResponseData::Room(snapshot))));

        self.broadcast(
            ServerMessage::presence(&self.external_id, Some(user.id), true)
                .skipping(msg.client.id()),
        );

        // Runs on every join, not only when the room becomes occupied
        self.notify_subscribers(
            Some(msg.client.id()),
            |_| true,
            ServerMessage::presence(&self.external_id, None, true),
        );
    }

    async fn handle_leave(&mut self, msg: ClientMessage) {
        let Request::Leave(leave) = &msg.request else {
            warn!(room = %self.external_id, "non-leave request on leave mailbox");
            return;
        };
        if leave.unsubscribe {
            let leave = leave.clone();
            self.unsubscribe(&msg, &leave).await;
        } else {
            self.leave(&msg);
        }
    }

    fn leave(&mut self, msg: &ClientMessage) {
        let client = &msg.client;
        if self.remove_session(client.id()).is_none() {
            client.queue_message(ServerMessage::error(msg.id, RequestError::RoomNotFound));
            return;
        }
        client.del_room(&self.external_id);
        client.queue_message(ServerMessage::ok(msg.id, None));

        let user_id = client.user().id;
        if !self.is_present(user_id) {
            self.broadcast(
                ServerMessage::presence(&self.external_id, Some(user_id), false)
                    .skipping(client.id()),
            );
        }
    }

    async fn unsubscribe(&mut self, msg: &ClientMessage, leave: &Leave) {
        let user = msg.client.user().clone();
        info!(
            room = %leave.room_id,
            user = %user.username,
            "unsubscribing"
        );

        if let Err(e) = self.repo.delete_subscription(user.id, self.id).await {
            let err = match e {
                RepositoryError::NotFound => RequestError::SubscriptionNotFound,
                other => {
                    error!(room = %self.external_id, "delete subscription: {}", other);
                    RequestError::Internal
                }
            };
            msg.client.queue_message(ServerMessage::error(msg.id, err));
            return;
        }

        self.remove_all_sessions(user.id);
        self.remove_subscriber(user.id);

        msg.client.queue_message(ServerMessage::ok(msg.id, None));
        self.broadcast(ServerMessage::subscription_change(
            &self.external_id,
            user,
            false,
        ));
    }

    async fn handle_client_message(&mut self, msg: ClientMessage) {
        if !self.is_member(msg.client.id()) {
            msg.client
                .queue_message(ServerMessage::error(msg.id, RequestError::RoomNotFound));
            return;
        }

        match &msg.request {
            Request::Publish(publish) => {
                let publish = publish.clone();
                self.publish(&msg, publish).await;
            }
            Request::Read(read) => {
                let read = read.clone();
                self.read(&msg, read).await;
            }
            Request::Join(_) | Request::Leave(_) => {
                warn!(room = %self.external_id, "unexpected request on message mailbox");
            }
        }
    }

    async fn publish(&mut self, msg: &ClientMessage, publish: Publish) {
        let seq_id = self.seq_id + 1;
        let saved = self
            .repo
            .create_message(NewMessage {
                seq_id,
                room_id: self.id,
                user_id: msg.user_id,
                content: publish.content.clone(),
                created_at: msg.timestamp,
            })
            .await;
        if let Err(e) = saved {
            error!(room = %self.external_id, seq_id, "error saving message: {}", e);
            msg.client
                .queue_message(ServerMessage::error(msg.id, RequestError::Internal));
            return;
        }

        self.seq_id = seq_id;
        msg.client.queue_message(ServerMessage::accepted(msg.id));

        self.broadcast(ServerMessage::chat(
            msg.id,
            ChatMessage {
                seq_id,
                room_id: self.external_id.clone(),
                user_id: msg.user_id,
                content: publish.content,
                timestamp: msg.timestamp,
            },
        ));

        // Subscribers without a session here only get the new watermark
        self.notify_subscribers(
            None,
            |sub| !self.is_present(sub.id),
            ServerMessage::new_message(&self.external_id, seq_id),
        );
    }

    async fn read(&mut self, msg: &ClientMessage, read: Read) {
        if let Err(e) = self
            .repo
            .update_last_read_seq_id(msg.user_id, self.id, read.seq_id)
            .await
        {
            error!(room = %self.external_id, "update last read seq id: {}", e);
            msg.client
                .queue_message(ServerMessage::error(msg.id, RequestError::Internal));
            return;
        }
        msg.client.queue_message(ServerMessage::ok(msg.id, None));
    }

    fn handle_idle_timeout(&mut self) {
        self.stop_idle_timer();
        if !self.clients.is_empty() {
            return;
        }

        info!(room = %self.external_id, "room timed out");
        if !self.server.request_idle_unload(&self.external_id) {
            warn!(
                room = %self.external_id,
                "unload mailbox full, retrying after another idle period"
            );
            self.start_idle_timer();
        }
    }

    /// Returns true when the room should stop
    fn handle_exit(&mut self, req: ExitRequest) -> bool {
        if req.only_if_idle && !self.clients.is_empty() {
            info!(room = %self.external_id, "declining idle unload, room is occupied");
            let _ = req.done.send(ExitAck::StillActive(self.external_id.clone()));
            return false;
        }

        info!(room = %self.external_id, deleted = req.deleted, "room is exiting");
        self.exiting = true;
        self.stop_idle_timer();

        if req.deleted {
            self.broadcast(ServerMessage::room_deleted(&self.external_id));
        }

        for client in self.clients.values() {
            client.signal_room_exit(&self.external_id);
        }
        self.clients.clear();
        self.user_index.clear();

        self.notify_subscribers(
            None,
            |_| true,
            ServerMessage::presence(&self.external_id, None, false),
        );

        self.reject_pending();

        let _ = req.done.send(ExitAck::Exited(self.external_id.clone()));
        true
    }

    /// Answer every request still queued in the client mailboxes
    fn reject_pending(&mut self) {
        let Mailboxes {
            join,
            leave,
            messages,
            ..
        } = &mut self.mailboxes;
        for mailbox in [join, leave, messages] {
            mailbox.close();
            while let Ok(msg) = mailbox.try_recv() {
                msg.client
                    .queue_message(ServerMessage::error(msg.id, RequestError::RoomNotFound));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::client::ClientReceivers;
    use crate::config::{ClientConfig, ServerConfig};
    use crate::memory::InMemoryRepository;
    use crate::message::{Join, ResponseCode};
    use crate::repository::Subscription;
    use crate::server::ChatServer;
    use crate::stats::Stats;

    /// Wraps the in-memory repository with switchable failures
    #[derive(Default)]
    struct FaultyRepository {
        inner: InMemoryRepository,
        fail_create_message: AtomicBool,
        fail_create_subscription: AtomicBool,
        fail_update_last_read: AtomicBool,
        fail_delete_subscription: AtomicBool,
        create_subscription_calls: AtomicUsize,
    }

    fn storage_down() -> RepositoryError {
        RepositoryError::Internal("storage down".to_string())
    }

    #[async_trait]
    impl Repository for FaultyRepository {
        async fn get_user(&self, user_id: UserId) -> Result<User, RepositoryError> {
            self.inner.get_user(user_id).await
        }
        async fn subscription_exists(&self, user_id: UserId, room_id: RoomId) -> bool {
            self.inner.subscription_exists(user_id, room_id).await
        }
        async fn create_subscription(
            &self,
            user_id: UserId,
            room_id: RoomId,
        ) -> Result<Subscription, RepositoryError> {
            self.create_subscription_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_create_subscription.load(Ordering::SeqCst) {
                return Err(storage_down());
            }
            self.inner.create_subscription(user_id, room_id).await
        }
        async fn delete_subscription(
            &self,
            user_id: UserId,
            room_id: RoomId,
        ) -> Result<(), RepositoryError> {
            if self.fail_delete_subscription.load(Ordering::SeqCst) {
                return Err(storage_down());
            }
            self.inner.delete_subscription(user_id, room_id).await
        }
        async fn get_room_by_external_id(
            &self,
            external_id: &str,
        ) -> Result<RoomRecord, RepositoryError> {
            self.inner.get_room_by_external_id(external_id).await
        }
        async fn get_room_with_subscribers(
            &self,
            room_id: RoomId,
        ) -> Result<RoomRecord, RepositoryError> {
            self.inner.get_room_with_subscribers(room_id).await
        }
        async fn get_subscribers_by_room_id(
            &self,
            room_id: RoomId,
        ) -> Result<Vec<User>, RepositoryError> {
            self.inner.get_subscribers_by_room_id(room_id).await
        }
        async fn list_subscriptions(
            &self,
            user_id: UserId,
        ) -> Result<Vec<Subscription>, RepositoryError> {
            self.inner.list_subscriptions(user_id).await
        }
        async fn create_message(&self, msg: NewMessage) -> Result<(), RepositoryError> {
            if self.fail_create_message.load(Ordering::SeqCst) {
                return Err(storage_down());
            }
            self.inner.create_message(msg).await
        }
        async fn update_last_read_seq_id(
            &self,
            user_id: UserId,
            room_id: RoomId,
            seq_id: SeqId,
        ) -> Result<(), RepositoryError> {
            if self.fail_update_last_read.load(Ordering::SeqCst) {
                return Err(storage_down());
            }
            self.inner
                .update_last_read_seq_id(user_id, room_id, seq_id)
                .await
        }
        async fn delete_room(&self, room_id: RoomId) -> Result<(), RepositoryError> {
            self.inner.delete_room(room_id).await
        }
    }

    struct Fixture {
        repo: Arc<FaultyRepository>,
        server: ChatServerHandle,
        record: RoomRecord,
        alice: User,
        bob: User,
    }

    async fn fixture() -> Fixture {
        let repo = Arc::new(FaultyRepository::default());
        let alice = repo.inner.create_user("alice").await;
        let bob = repo.inner.create_user("bob").await;
        let record = repo
            .inner
            .create_room_with_external_id("R", "Room R", "", alice.id)
            .await
            .unwrap();

        let mut config = ServerConfig::default();
        config.room.idle_timeout = Duration::from_millis(50);
        let (chat_server, server) = ChatServer::new(repo.clone(), Arc::new(Stats::new()), config);
        tokio::spawn(chat_server.run());

        Fixture {
            repo,
            server,
            record,
            alice,
            bob,
        }
    }

    impl Fixture {
        fn room(&self) -> Room {
            let mut config = RoomConfig::default();
            config.idle_timeout = Duration::from_millis(50);
            let (room, _handle) = Room::new(
                &self.record,
                Vec::new(),
                self.repo.clone(),
                self.server.clone(),
                config,
            );
            room
        }

        fn connect(&self, user: &User) -> (ClientHandle, ClientReceivers) {
            ClientHandle::new(user.clone(), &ClientConfig::default())
        }

        /// Connect a session and register it so cross-room pushes reach it
        async fn connect_registered(&self, user: &User) -> (ClientHandle, ClientReceivers) {
            let (client, receivers) = self.connect(user);
            self.server.register_client(&client).await;
            (client, receivers)
        }
    }

    fn request(client: &ClientHandle, id: i64, request: Request) -> ClientMessage {
        ClientMessage::new(Some(id), client.clone(), request)
    }

    fn join(client: &ClientHandle, id: i64) -> ClientMessage {
        request(
            client,
            id,
            Request::Join(Join {
                room_id: "R".to_string(),
            }),
        )
    }

    fn leave(client: &ClientHandle, id: i64, unsubscribe: bool) -> ClientMessage {
        request(
            client,
            id,
            Request::Leave(Leave {
                room_id: "R".to_string(),
                unsubscribe,
            }),
        )
    }

    fn publish(client: &ClientHandle, id: i64, content: &str) -> ClientMessage {
        request(
            client,
            id,
            Request::Publish(Publish {
                room_id: "R".to_string(),
                content: content.to_string(),
            }),
        )
    }

    fn drain(receivers: &mut ClientReceivers) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = receivers.send.try_recv() {
            out.push(msg);
        }
        out
    }

    async fn next_message(receivers: &mut ClientReceivers) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(1), receivers.send.recv())
            .await
            .expect("timed out waiting for message")
            .expect("mailbox closed")
    }

    fn response_code(msg: &ServerMessage) -> ResponseCode {
        msg.response().expect("not a response").response_code
    }

    fn assert_consistent(room: &Room) {
        let indexed: usize = room.user_index.values().map(HashSet::len).sum();
        assert_eq!(indexed, room.clients.len());
        for (user_id, sessions) in &room.user_index {
            assert!(!sessions.is_empty());
            for client_id in sessions {
                assert_eq!(room.clients[client_id].user().id, *user_id);
            }
        }
    }

    #[tokio::test]
    async fn test_join_creates_subscription_and_replies_with_snapshot() {
        let f = fixture().await;
        let mut room = f.room();
        let (alice, mut rx) = f.connect(&f.alice);

        room.handle_join(join(&alice, 1)).await;

        assert_eq!(room.state(), RoomState::Occupied);
        assert!(room.idle_deadline.is_none());
        assert!(f.repo.subscription_exists(f.alice.id, f.record.id).await);
        assert_eq!(alice.room_ids(), vec!["R".to_string()]);
        assert_consistent(&room);

        let reply = drain(&mut rx).into_iter().find(|m| m.id == Some(1)).unwrap();
        assert_eq!(response_code(&reply), ResponseCode::OK);
        let Some(ResponseData::Room(snapshot)) = &reply.response().unwrap().data else {
            panic!("missing room snapshot");
        };
        assert_eq!(snapshot.room_id, "R");
        assert_eq!(snapshot.subscribers.len(), 1);
        assert!(snapshot.subscribers[0].is_present);
    }

    #[tokio::test]
    async fn test_join_existing_subscription_skips_create() {
        let f = fixture().await;
        f.repo
            .inner
            .create_subscription(f.alice.id, f.record.id)
            .await
            .unwrap();
        let mut room = f.room();
        let (alice, _rx) = f.connect(&f.alice);

        room.handle_join(join(&alice, 1)).await;

        assert_eq!(f.repo.create_subscription_calls.load(Ordering::SeqCst), 0);
        assert_eq!(room.state(), RoomState::Occupied);
    }

    #[tokio::test]
    async fn test_join_subscription_failure_rearms_idle_timer() {
        let f = fixture().await;
        f.repo.fail_create_subscription.store(true, Ordering::SeqCst);
        let mut room = f.room();
        let (alice, mut rx) = f.connect(&f.alice);

        room.handle_join(join(&alice, 7)).await;

        assert_eq!(room.state(), RoomState::Empty);
        assert!(room.idle_deadline.is_some());
        assert!(alice.room_ids().is_empty());
        let reply = next_message(&mut rx).await;
        assert_eq!(reply.id, Some(7));
        assert_eq!(response_code(&reply), ResponseCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_join_notifies_other_members_of_presence() {
        let f = fixture().await;
        let mut room = f.room();
        let (alice, mut alice_rx) = f.connect(&f.alice);
        let (bob, _bob_rx) = f.connect(&f.bob);

        room.handle_join(join(&alice, 1)).await;
        drain(&mut alice_rx);
        room.handle_join(join(&bob, 2)).await;

        let presence: Vec<_> = drain(&mut alice_rx)
            .into_iter()
            .filter_map(|m| m.as_notification().and_then(|n| n.presence.clone()))
            .collect();
        assert_eq!(presence.len(), 1);
        assert!(presence[0].present);
        assert_eq!(presence[0].user_id, Some(f.bob.id));
    }

    /// Subscribers hear `presence(room, online)` on every join, including a
    /// second session of a user already in the room. The fan-out is not
    /// limited to the join that takes the room from empty to occupied.
    #[tokio::test]
    async fn test_subscriber_presence_fanout_runs_on_every_join() {
        let f = fixture().await;
        // Bob is subscribed but only connected elsewhere
        f.repo
            .inner
            .create_subscription(f.bob.id, f.record.id)
            .await
            .unwrap();
        let (_bob, mut bob_rx) = f.connect_registered(&f.bob).await;
        drain(&mut bob_rx);

        let mut room = f.room();
        let (alice_1, _rx1) = f.connect(&f.alice);
        let (alice_2, _rx2) = f.connect(&f.alice);
        room.handle_join(join(&alice_1, 1)).await;
        room.handle_join(join(&alice_2, 2)).await;

        for _ in 0..2 {
            let msg = next_message(&mut bob_rx).await;
            let presence = msg.as_notification().unwrap().presence.clone().unwrap();
            assert!(presence.present);
            assert_eq!(presence.room_id, "R");
            assert_eq!(presence.user_id, None);
        }
    }

    #[tokio::test]
    async fn test_publish_assigns_consecutive_sequence_numbers() {
        let f = fixture().await;
        let mut room = f.room();
        let (alice, mut rx) = f.connect(&f.alice);
        room.handle_join(join(&alice, 1)).await;
        drain(&mut rx);

        for i in 0..5 {
            room.handle_client_message(publish(&alice, 10 + i, "hello")).await;
        }

        let seq_ids: Vec<SeqId> = drain(&mut rx)
            .iter()
            .filter_map(|m| m.as_chat().map(|c| c.seq_id))
            .collect();
        assert_eq!(seq_ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(room.seq_id(), 5);
    }

    #[tokio::test]
    async fn test_failed_publish_does_not_advance_or_broadcast() {
        let f = fixture().await;
        let mut room = f.room();
        let (alice, mut alice_rx) = f.connect(&f.alice);
        let (bob, mut bob_rx) = f.connect(&f.bob);
        room.handle_join(join(&alice, 1)).await;
        room.handle_join(join(&bob, 2)).await;
        room.handle_client_message(publish(&alice, 3, "first")).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        f.repo.fail_create_message.store(true, Ordering::SeqCst);
        room.handle_client_message(publish(&alice, 4, "lost")).await;

        assert_eq!(room.seq_id(), 1);
        let replies = drain(&mut alice_rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(response_code(&replies[0]), ResponseCode::INTERNAL_SERVER_ERROR);
        assert!(drain(&mut bob_rx).is_empty());

        f.repo.fail_create_message.store(false, Ordering::SeqCst);
        room.handle_client_message(publish(&alice, 5, "second")).await;
        let chat: Vec<_> = drain(&mut bob_rx)
            .into_iter()
            .filter_map(|m| m.as_chat().cloned())
            .collect();
        assert_eq!(chat.len(), 1);
        assert_eq!(chat[0].seq_id, 2);
    }

    #[tokio::test]
    async fn test_publish_notifies_absent_subscribers_with_watermark() {
        let f = fixture().await;
        f.repo
            .inner
            .create_subscription(f.bob.id, f.record.id)
            .await
            .unwrap();
        let (_bob, mut bob_rx) = f.connect_registered(&f.bob).await;

        let mut room = f.room();
        let (alice, mut alice_rx) = f.connect(&f.alice);
        room.handle_join(join(&alice, 1)).await;
        // presence fan-out from the join
        next_message(&mut bob_rx).await;
        drain(&mut alice_rx);

        room.handle_client_message(publish(&alice, 2, "hi")).await;

        let replies = drain(&mut alice_rx);
        assert_eq!(response_code(&replies[0]), ResponseCode::ACCEPTED);
        let chat = replies[1].as_chat().unwrap();
        assert_eq!(chat.seq_id, 1);
        assert_eq!(chat.content, "hi");

        let notification = next_message(&mut bob_rx).await;
        let message = notification.as_notification().unwrap().message.clone().unwrap();
        assert_eq!(message.room_id, "R");
        assert_eq!(message.seq_id, 1);
    }

    #[tokio::test]
    async fn test_publish_from_non_member_is_rejected() {
        let f = fixture().await;
        let mut room = f.room();
        let (alice, mut rx) = f.connect(&f.alice);

        room.handle_client_message(publish(&alice, 1, "hi")).await;

        assert_eq!(room.seq_id(), 0);
        assert_eq!(
            response_code(&next_message(&mut rx).await),
            ResponseCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_read_updates_marker() {
        let f = fixture().await;
        let mut room = f.room();
        let (alice, mut rx) = f.connect(&f.alice);
        room.handle_join(join(&alice, 1)).await;
        drain(&mut rx);

        let read = |id| {
            request(
                &alice,
                id,
                Request::Read(Read {
                    room_id: "R".to_string(),
                    seq_id: 3,
                }),
            )
        };
        room.handle_client_message(read(2)).await;
        assert_eq!(response_code(&next_message(&mut rx).await), ResponseCode::OK);

        f.repo.fail_update_last_read.store(true, Ordering::SeqCst);
        room.handle_client_message(read(3)).await;
        assert_eq!(
            response_code(&next_message(&mut rx).await),
            ResponseCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_leave_keeps_presence_while_other_session_remains() {
        let f = fixture().await;
        let mut room = f.room();
        let (alice_1, _rx1) = f.connect(&f.alice);
        let (alice_2, _rx2) = f.connect(&f.alice);
        let (bob, mut bob_rx) = f.connect(&f.bob);
        room.handle_join(join(&alice_1, 1)).await;
        room.handle_join(join(&alice_2, 2)).await;
        room.handle_join(join(&bob, 3)).await;
        drain(&mut bob_rx);

        room.handle_leave(leave(&alice_1, 4, false)).await;
        assert_eq!(room.clients.len(), 2);
        assert!(room.is_present(f.alice.id));
        assert!(alice_1.room_ids().is_empty());
        assert_consistent(&room);
        assert!(drain(&mut bob_rx).is_empty());

        room.handle_leave(leave(&alice_2, 5, false)).await;
        let offline: Vec<_> = drain(&mut bob_rx)
            .into_iter()
            .filter_map(|m| m.as_notification().and_then(|n| n.presence.clone()))
            .collect();
        assert_eq!(offline.len(), 1);
        assert!(!offline[0].present);
        assert_eq!(offline[0].user_id, Some(f.alice.id));
    }

    #[tokio::test]
    async fn test_last_leave_arms_idle_timer() {
        let f = fixture().await;
        let mut room = f.room();
        let (alice, mut rx) = f.connect(&f.alice);
        room.handle_join(join(&alice, 1)).await;
        drain(&mut rx);

        room.handle_leave(leave(&alice, 2, false)).await;

        assert_eq!(room.state(), RoomState::Empty);
        assert!(room.idle_deadline.is_some());
        assert_eq!(response_code(&next_message(&mut rx).await), ResponseCode::OK);
    }

    #[tokio::test]
    async fn test_leave_unjoined_room_replies_not_found() {
        let f = fixture().await;
        let mut room = f.room();
        let (alice, mut rx) = f.connect(&f.alice);

        room.handle_leave(leave(&alice, 1, false)).await;

        assert_eq!(
            response_code(&next_message(&mut rx).await),
            ResponseCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_every_session() {
        let f = fixture().await;
        let mut room = f.room();
        let (alice_1, mut rx1) = f.connect(&f.alice);
        let (alice_2, mut rx2) = f.connect(&f.alice);
        let (bob, mut bob_rx) = f.connect(&f.bob);
        room.handle_join(join(&alice_1, 1)).await;
        room.handle_join(join(&alice_2, 2)).await;
        room.handle_join(join(&bob, 3)).await;
        drain(&mut rx1);
        drain(&mut bob_rx);

        room.handle_leave(leave(&alice_1, 4, true)).await;

        assert_eq!(room.clients.len(), 1);
        assert!(!room.is_present(f.alice.id));
        assert!(room.subscribers.iter().all(|s| s.id != f.alice.id));
        assert!(!f.repo.subscription_exists(f.alice.id, f.record.id).await);
        assert_consistent(&room);
        assert_eq!(rx1.exit_room.try_recv().unwrap(), "R");
        assert_eq!(rx2.exit_room.try_recv().unwrap(), "R");

        let reply = drain(&mut rx1).into_iter().find(|m| m.id == Some(4)).unwrap();
        assert_eq!(response_code(&reply), ResponseCode::OK);

        let change = drain(&mut bob_rx)
            .into_iter()
            .find_map(|m| m.as_notification().and_then(|n| n.subscription_change.clone()))
            .unwrap();
        assert!(!change.subscribed);
        assert_eq!(change.user.id, f.alice.id);

        // Second unsubscribe finds nothing to delete
        room.handle_leave(leave(&alice_1, 5, true)).await;
        let reply = drain(&mut rx1).into_iter().find(|m| m.id == Some(5)).unwrap();
        assert_eq!(response_code(&reply), ResponseCode::NOT_FOUND);
        assert_eq!(
            reply.response().unwrap().error.as_deref(),
            Some("subscription not found")
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_storage_failure() {
        let f = fixture().await;
        let mut room = f.room();
        let (alice, mut rx) = f.connect(&f.alice);
        room.handle_join(join(&alice, 1)).await;
        drain(&mut rx);

        f.repo.fail_delete_subscription.store(true, Ordering::SeqCst);
        room.handle_leave(leave(&alice, 2, true)).await;

        assert_eq!(
            response_code(&next_message(&mut rx).await),
            ResponseCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(room.state(), RoomState::Occupied);
    }

    #[tokio::test]
    async fn test_exit_declines_idle_unload_when_occupied() {
        let f = fixture().await;
        let mut room = f.room();
        let (alice, _rx) = f.connect(&f.alice);
        room.handle_join(join(&alice, 1)).await;

        let (done, ack) = oneshot::channel();
        let stop = room.handle_exit(ExitRequest {
            deleted: false,
            only_if_idle: true,
            done,
        });

        assert!(!stop);
        assert_eq!(ack.await.unwrap(), ExitAck::StillActive("R".to_string()));
        assert_eq!(room.state(), RoomState::Occupied);
    }

    #[tokio::test]
    async fn test_deleted_exit_notifies_members_and_detaches() {
        let f = fixture().await;
        let mut room = f.room();
        let (alice, mut rx) = f.connect(&f.alice);
        room.handle_join(join(&alice, 1)).await;
        drain(&mut rx);

        let (done, ack) = oneshot::channel();
        let stop = room.handle_exit(ExitRequest {
            deleted: true,
            only_if_idle: false,
            done,
        });

        assert!(stop);
        assert_eq!(room.state(), RoomState::Exiting);
        assert_eq!(ack.await.unwrap(), ExitAck::Exited("R".to_string()));
        let deleted = next_message(&mut rx).await;
        assert_eq!(
            deleted.as_notification().unwrap().room_deleted.as_ref().unwrap().room_id,
            "R"
        );
        assert_eq!(rx.exit_room.try_recv().unwrap(), "R");
    }

    #[tokio::test]
    async fn test_exit_rejects_queued_requests() {
        let f = fixture().await;
        let mut room = f.room();
        let handle = room.handle.clone();
        let (alice, mut rx) = f.connect(&f.alice);
        room.handle_join(join(&alice, 1)).await;
        drain(&mut rx);

        handle.try_send_message(publish(&alice, 2, "late")).unwrap();
        handle.try_leave(leave(&alice, 3, false)).unwrap();
        let (bob, mut bob_rx) = f.connect(&f.bob);
        handle.try_join(join(&bob, 4)).unwrap();

        let (done, _ack) = oneshot::channel();
        assert!(room.handle_exit(ExitRequest {
            deleted: false,
            only_if_idle: false,
            done,
        }));

        let mut codes: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|m| m.response().is_some())
            .map(|m| (m.id, response_code(&m)))
            .collect();
        codes.sort_by_key(|(id, _)| *id);
        assert_eq!(
            codes,
            vec![
                (Some(2), ResponseCode::NOT_FOUND),
                (Some(3), ResponseCode::NOT_FOUND),
            ]
        );
        let reply = next_message(&mut bob_rx).await;
        assert_eq!(reply.id, Some(4));
        assert_eq!(response_code(&reply), ResponseCode::NOT_FOUND);
        assert_eq!(room.seq_id(), 0);

        // Nothing can be queued after the exit
        assert!(matches!(
            handle.try_send_message(publish(&alice, 5, "too late")),
            Err(TrySendError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_join_from_disconnected_client_is_discarded() {
        let f = fixture().await;
        let mut room = f.room();
        let (alice, receivers) = f.connect(&f.alice);
        drop(receivers);

        room.handle_join(join(&alice, 1)).await;

        assert_eq!(room.state(), RoomState::Empty);
        assert!(room.idle_deadline.is_some());
        assert!(room.clients.is_empty());
        assert!(alice.room_ids().is_empty());
        assert_consistent(&room);
    }

    #[tokio::test]
    async fn test_join_after_client_cleanup_is_discarded() {
        let f = fixture().await;
        let mut room = f.room();
        let (bob, _bob_rx) = f.connect(&f.bob);
        room.handle_join(join(&bob, 1)).await;

        // Cleanup already ran, so nobody will ever send this session's leave
        let (alice, mut rx) = f.connect(&f.alice);
        assert!(alice.close().is_empty());
        room.handle_join(join(&alice, 2)).await;

        assert_eq!(room.clients.len(), 1);
        assert!(!room.is_present(f.alice.id));
        assert!(alice.room_ids().is_empty());
        assert_consistent(&room);
        assert!(drain(&mut rx).is_empty());

        room.handle_leave(leave(&bob, 3, false)).await;
        assert_eq!(room.state(), RoomState::Empty);
        assert!(room.idle_deadline.is_some());
    }

    #[tokio::test]
    async fn test_handles_identify_room_instance() {
        let f = fixture().await;
        let room = f.room();
        let other = f.room();
        assert!(room.handle.same_room(&room.handle.clone()));
        assert!(!room.handle.same_room(&other.handle));

        let handle = room.handle.clone();
        drop(room);
        tokio::time::timeout(Duration::from_secs(1), handle.closed())
            .await
            .expect("room handle not closed");
    }

    #[tokio::test]
    async fn test_idle_room_requests_unload() {
        let f = fixture().await;
        let (alice, mut rx) = f.connect(&f.alice);

        // Route the join through the server so the room is registered
        f.server.join_room(join(&alice, 1)).unwrap();
        assert_eq!(response_code(&next_message(&mut rx).await), ResponseCode::OK);
        assert!(f.server.is_room_active("R"));

        let room = alice.room("R").unwrap();
        room.try_leave(leave(&alice, 2, false)).unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while f.server.is_room_active("R") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("idle room was not unloaded");
    }
}
