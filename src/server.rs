//! ChatServer Actor implementation
//!
//! The registry actor: it owns the set of active rooms, creates a room actor
//! on the first join, unloads rooms on request and fans notifications out to
//! every session of a user. Client registration happens directly on the
//! shared registry so a connecting client never waits behind room work.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::client::ClientHandle;
use crate::config::ServerConfig;
use crate::error::{RequestError, ServerError};
use crate::message::{ClientMessage, ServerMessage};
use crate::repository::{Repository, RepositoryError};
use crate::room::{ExitAck, Room, RoomHandle};
use crate::stats::{
    StatsProvider, NUM_ACTIVE_CLIENTS, NUM_ACTIVE_ROOMS, TOTAL_INCOMING_MESSAGES,
    TOTAL_OUTGOING_MESSAGES,
};
use crate::types::{ClientId, UserId};

/// Message for every session of one user
#[derive(Debug)]
pub struct UserBroadcast {
    pub user_id: UserId,
    /// `message.skip` names a session to leave out
    pub message: ServerMessage,
}

#[derive(Debug)]
struct UnloadRequest {
    room_id: String,
    deleted: bool,
    only_if_idle: bool,
    done: Option<oneshot::Sender<Result<(), ServerError>>>,
}

#[derive(Debug)]
struct StopRequest {
    done: oneshot::Sender<()>,
}

#[derive(Default)]
struct Registry {
    clients: HashMap<ClientId, ClientHandle>,
    /// Sessions per user, in registration order
    users: HashMap<UserId, Vec<ClientHandle>>,
    rooms: HashMap<String, RoomHandle>,
}

/// Cloneable handle to the chat server
#[derive(Clone)]
pub struct ChatServerHandle {
    join: mpsc::Sender<ClientMessage>,
    broadcast: mpsc::Sender<UserBroadcast>,
    unload: mpsc::Sender<UnloadRequest>,
    stop: mpsc::Sender<StopRequest>,
    registry: Arc<RwLock<Registry>>,
    repo: Arc<dyn Repository>,
    stats: Arc<dyn StatsProvider>,
    config: Arc<ServerConfig>,
}

impl ChatServerHandle {
    fn registry(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stats(&self) -> &dyn StatsProvider {
        self.stats.as_ref()
    }

    pub fn repository(&self) -> Arc<dyn Repository> {
        self.repo.clone()
    }

    /// Add a connected client to the registry
    ///
    /// The client is told which of its subscribed rooms are currently active.
    pub async fn register_client(&self, client: &ClientHandle) {
        {
            let mut registry = self.registry_mut();
            registry.clients.insert(client.id(), client.clone());
            registry
                .users
                .entry(client.user().id)
                .or_default()
                .push(client.clone());
        }
        self.stats.incr(NUM_ACTIVE_CLIENTS);

        let subscriptions = match self.repo.list_subscriptions(client.user().id).await {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                warn!(
                    user = %client.user().username,
                    "list subscriptions: {}", e
                );
                return;
            }
        };
        for sub in subscriptions {
            if self.is_room_active(&sub.room_external_id) {
                client.queue_message(ServerMessage::presence(&sub.room_external_id, None, true));
            }
        }
    }

    /// Remove a client from the registry; repeated calls are no-ops
    pub fn deregister_client(&self, client: &ClientHandle) {
        let removed = {
            let mut registry = self.registry_mut();
            let removed = registry.clients.remove(&client.id()).is_some();
            let user_id = client.user().id;
            if let Some(sessions) = registry.users.get_mut(&user_id) {
                sessions.retain(|c| c.id() != client.id());
                if sessions.is_empty() {
                    registry.users.remove(&user_id);
                }
            }
            removed
        };
        if removed {
            self.stats.decr(NUM_ACTIVE_CLIENTS);
        }
    }

    /// Hand a join request to the server without blocking
    pub fn join_room(&self, msg: ClientMessage) -> Result<(), TrySendError<ClientMessage>> {
        self.join.try_send(msg)
    }

    /// Queue a message for every session of `user_id`
    ///
    /// Returns false if the broadcast mailbox is full or the server stopped.
    pub fn broadcast_to_user(&self, user_id: UserId, message: ServerMessage) -> bool {
        match self.broadcast.try_send(UserBroadcast { user_id, message }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(user_id, "broadcast mailbox full, dropping notification");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Ask the server to unload a room if it is still empty
    ///
    /// Never blocks. Returns false when the unload mailbox is full or closed.
    pub fn request_idle_unload(&self, room_id: &str) -> bool {
        self.unload
            .try_send(UnloadRequest {
                room_id: room_id.to_string(),
                deleted: false,
                only_if_idle: true,
                done: None,
            })
            .is_ok()
    }

    /// Unload a room and wait for it to exit
    ///
    /// With `deleted` the room's members are told it was deleted. Unloading a
    /// room that is not active succeeds.
    pub async fn unload_room(
        &self,
        room_id: &str,
        deleted: bool,
        deadline: Duration,
    ) -> Result<(), ServerError> {
        if room_id.is_empty() {
            return Err(ServerError::EmptyRoomId);
        }

        let (done, result) = oneshot::channel();
        let req = UnloadRequest {
            room_id: room_id.to_string(),
            deleted,
            only_if_idle: false,
            done: Some(done),
        };

        timeout(deadline, async {
            self.unload
                .send(req)
                .await
                .map_err(|_| ServerError::Stopped)?;
            result.await.map_err(|_| ServerError::Stopped)?
        })
        .await
        .map_err(|_| ServerError::DeadlineExceeded)?
    }

    /// Stop the server after unloading every active room
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ServerError> {
        let (done, stopped) = oneshot::channel();
        timeout(deadline, async {
            self.stop
                .send(StopRequest { done })
                .await
                .map_err(|_| ServerError::Stopped)?;
            stopped.await.map_err(|_| ServerError::Stopped)
        })
        .await
        .map_err(|_| ServerError::DeadlineExceeded)?
    }

    /// Drop a registry entry, but only if it still points at `room`
    ///
    /// A newer instance loaded under the same id is left alone.
    fn forget_room(&self, room: &RoomHandle) -> bool {
        let removed = {
            let mut registry = self.registry_mut();
            match registry.rooms.get(room.external_id()) {
                Some(current) if current.same_room(room) => {
                    registry.rooms.remove(room.external_id());
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.stats.decr(NUM_ACTIVE_ROOMS);
            info!(room = %room.external_id(), "room unloaded");
        }
        removed
    }

    pub fn is_room_active(&self, room_id: &str) -> bool {
        self.registry().rooms.contains_key(room_id)
    }

    pub fn num_rooms(&self) -> usize {
        self.registry().rooms.len()
    }

    pub fn num_clients(&self) -> usize {
        self.registry().clients.len()
    }

    /// Registered sessions of a user
    pub fn sessions(&self, user_id: UserId) -> Vec<ClientHandle> {
        self.registry()
            .users
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// The main ChatServer actor
pub struct ChatServer {
    handle: ChatServerHandle,
    join: mpsc::Receiver<ClientMessage>,
    broadcast: mpsc::Receiver<UserBroadcast>,
    unload: mpsc::Receiver<UnloadRequest>,
    stop: mpsc::Receiver<StopRequest>,
}

impl ChatServer {
    /// Create the server and its handle; metrics are registered here
    pub fn new(
        repo: Arc<dyn Repository>,
        stats: Arc<dyn StatsProvider>,
        config: ServerConfig,
    ) -> (Self, ChatServerHandle) {
        for metric in [
            NUM_ACTIVE_ROOMS,
            NUM_ACTIVE_CLIENTS,
            TOTAL_INCOMING_MESSAGES,
            TOTAL_OUTGOING_MESSAGES,
        ] {
            stats.register_metric(metric);
        }

        let (join_tx, join_rx) = mpsc::channel(config.join_capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_capacity);
        let (unload_tx, unload_rx) = mpsc::channel(config.unload_capacity);
        let (stop_tx, stop_rx) = mpsc::channel(1);

        let handle = ChatServerHandle {
            join: join_tx,
            broadcast: broadcast_tx,
            unload: unload_tx,
            stop: stop_tx,
            registry: Arc::new(RwLock::new(Registry::default())),
            repo,
            stats,
            config: Arc::new(config),
        };

        let server = Self {
            handle: handle.clone(),
            join: join_rx,
            broadcast: broadcast_rx,
            unload: unload_rx,
            stop: stop_rx,
        };
        (server, handle)
    }

    /// Run the ChatServer event loop until shutdown
    pub async fn run(mut self) {
        info!("ChatServer started");

        loop {
            tokio::select! {
                Some(msg) = self.join.recv() => {
                    self.handle_join_room(msg).await;
                }
                Some(broadcast) = self.broadcast.recv() => {
                    self.handle_broadcast(broadcast);
                }
                Some(req) = self.unload.recv() => {
                    self.handle_unload(req).await;
                }
                Some(req) = self.stop.recv() => {
                    info!("ChatServer stopping");
                    self.unload_all_rooms().await;
                    let _ = req.done.send(());
                    break;
                }
                else => break,
            }
        }

        info!("ChatServer shutting down");
    }

    fn room(&self, room_id: &str) -> Option<RoomHandle> {
        self.handle.registry().rooms.get(room_id).cloned()
    }

    fn reject(msg: &ClientMessage, err: RequestError) {
        msg.client.queue_message(ServerMessage::error(msg.id, err));
    }

    /// Route a join to its room, loading the room first if needed
    async fn handle_join_room(&mut self, mut msg: ClientMessage) {
        let room_id = msg.request.room_id().to_string();

        let mut reloaded = false;
        loop {
            let room = match self.room(&room_id) {
                Some(room) => room,
                None => match self.load_room(&room_id).await {
                    Ok(room) => {
                        reloaded = true;
                        room
                    }
                    Err(err) => {
                        Self::reject(&msg, err);
                        return;
                    }
                },
            };

            match room.try_join(msg) {
                Ok(()) => return,
                Err(TrySendError::Closed(returned)) if !reloaded => {
                    // The room exited after an unload gave up waiting on it
                    warn!(room = %room_id, "dropping stale room entry");
                    self.handle.forget_room(&room);
                    msg = returned;
                }
                Err(TrySendError::Full(returned) | TrySendError::Closed(returned)) => {
                    warn!(room = %room_id, "room join mailbox unavailable");
                    Self::reject(&returned, RequestError::ServiceUnavailable);
                    return;
                }
            }
        }
    }

    async fn load_room(&mut self, room_id: &str) -> Result<RoomHandle, RequestError> {
        let repo = self.handle.repository();
        let record = match repo.get_room_by_external_id(room_id).await {
            Ok(record) => record,
            Err(RepositoryError::NotFound) => {
                debug!(room = %room_id, "join for unknown room");
                return Err(RequestError::RoomNotFound);
            }
            Err(e) => {
                error!(room = %room_id, "get room: {}", e);
                return Err(RequestError::Internal);
            }
        };
        let subscribers = repo
            .get_subscribers_by_room_id(record.id)
            .await
            .map_err(|e| {
                error!(room = %room_id, "get subscribers: {}", e);
                RequestError::Internal
            })?;

        let (room, handle) = Room::new(
            &record,
            subscribers,
            repo,
            self.handle.clone(),
            self.handle.config.room.clone(),
        );
        self.handle
            .registry_mut()
            .rooms
            .insert(room_id.to_string(), handle.clone());
        self.handle.stats.incr(NUM_ACTIVE_ROOMS);
        tokio::spawn(room.run());

        info!(room = %room_id, "room loaded");
        Ok(handle)
    }

    fn handle_broadcast(&self, broadcast: UserBroadcast) {
        let UserBroadcast { user_id, message } = broadcast;
        for client in self.handle.sessions(user_id) {
            if message.skip == Some(client.id()) {
                continue;
            }
            client.queue_message(message.clone());
        }
    }

    async fn handle_unload(&mut self, req: UnloadRequest) {
        let result = match self.room(&req.room_id) {
            None => {
                debug!(room = %req.room_id, "unload for inactive room");
                Ok(())
            }
            Some(room) => {
                let unload_timeout = self.handle.config.unload_timeout;
                let ack = timeout(unload_timeout, room.exit(req.deleted, req.only_if_idle)).await;
                match ack {
                    Ok(Some(ExitAck::Exited(_))) | Ok(None) => {
                        self.handle.forget_room(&room);
                        Ok(())
                    }
                    Ok(Some(ExitAck::StillActive(_))) => {
                        debug!(room = %req.room_id, "room became active, keeping it");
                        Ok(())
                    }
                    Err(_) => {
                        warn!(room = %req.room_id, "room did not acknowledge exit in time");
                        let handle = self.handle.clone();
                        tokio::spawn(async move {
                            room.closed().await;
                            handle.forget_room(&room);
                        });
                        Err(ServerError::DeadlineExceeded)
                    }
                }
            }
        };

        if let Some(done) = req.done {
            let _ = done.send(result);
        }
    }

    async fn unload_all_rooms(&mut self) {
        let rooms: Vec<RoomHandle> = self.handle.registry().rooms.values().cloned().collect();
        info!("unloading {} rooms", rooms.len());

        let unload_timeout = self.handle.config.unload_timeout;
        let acks = join_all(
            rooms
                .iter()
                .map(|room| timeout(unload_timeout, room.exit(false, false))),
        )
        .await;

        for (room, ack) in rooms.iter().zip(acks) {
            if ack.is_err() {
                warn!(room = %room.external_id(), "room did not exit before shutdown deadline");
            }
            self.handle.forget_room(room);
        }
    }
}
