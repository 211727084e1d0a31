//! Client actor
//!
//! One `Client` per WebSocket connection, run as two pumps:
//! - the inbound pump decodes frames and routes them to the server or a room
//! - the outbound pump drains the mailbox to the socket and keeps it alive
//!
//! Other actors only ever see a [`ClientHandle`]: the bounded outbound mailbox,
//! the forced room-exit channel and the client's room index.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::error::{Error as WsError, ProtocolError as WsProtocolError};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::RequestError;
use crate::message::{decode_frame, encode, ClientMessage, Leave, Request, ServerMessage};
use crate::room::RoomHandle;
use crate::server::ChatServerHandle;
use crate::stats::{TOTAL_INCOMING_MESSAGES, TOTAL_OUTGOING_MESSAGES};
use crate::types::{ClientId, User};

#[derive(Debug)]
struct Shared {
    id: ClientId,
    user: User,
    send: mpsc::Sender<ServerMessage>,
    exit_room: mpsc::Sender<String>,
    rooms: Mutex<HashMap<String, RoomHandle>>,
    /// Set once the connection is torn down, guarded by `rooms`
    closed: AtomicBool,
}

/// Cloneable reference to a connected client
///
/// Holding a handle does not keep the connection alive: once the client's
/// pumps are gone, queued messages are dropped.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    shared: Arc<Shared>,
}

/// Receiving ends owned by the outbound pump
#[derive(Debug)]
pub struct ClientReceivers {
    pub send: mpsc::Receiver<ServerMessage>,
    pub exit_room: mpsc::Receiver<String>,
}

impl ClientHandle {
    /// Create a handle and the receivers its outbound pump will drain
    pub fn new(user: User, config: &ClientConfig) -> (Self, ClientReceivers) {
        let (send_tx, send_rx) = mpsc::channel(config.send_capacity);
        let (exit_tx, exit_rx) = mpsc::channel(config.exit_capacity);
        let handle = Self {
            shared: Arc::new(Shared {
                id: ClientId::new(),
                user,
                send: send_tx,
                exit_room: exit_tx,
                rooms: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        };
        let receivers = ClientReceivers {
            send: send_rx,
            exit_room: exit_rx,
        };
        (handle, receivers)
    }

    pub fn id(&self) -> ClientId {
        self.shared.id
    }

    pub fn user(&self) -> &User {
        &self.shared.user
    }

    /// Queue a message without blocking
    ///
    /// Returns false if the mailbox is full or the client is gone.
    pub fn queue_message(&self, msg: ServerMessage) -> bool {
        match self.shared.send.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    client = %self.shared.id,
                    user = %self.shared.user.username,
                    "outbound mailbox full, dropping message"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(client = %self.shared.id, "client gone, dropping message");
                false
            }
        }
    }

    /// Tell the client a room dropped it
    ///
    /// The outbound pump removes the room from the index. If the signal
    /// cannot be queued the index is updated in place.
    pub fn signal_room_exit(&self, room_id: &str) {
        if let Err(err) = self.shared.exit_room.try_send(room_id.to_string()) {
            debug!(
                client = %self.shared.id,
                room = %room_id,
                "room exit signal not queued ({}), detaching directly",
                err
            );
            self.del_room(room_id);
        }
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<String, RoomHandle>> {
        self.shared
            .rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the connection is gone or being torn down
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.shared.send.is_closed()
    }

    /// Mark the client closed and take its room index
    ///
    /// Rooms that handle a join afterwards see `add_room` fail, so a
    /// departing client can never be left attached to a room.
    pub fn close(&self) -> Vec<RoomHandle> {
        let mut rooms = self.rooms();
        self.shared.closed.store(true, Ordering::Release);
        rooms.drain().map(|(_, room)| room).collect()
    }

    /// Record a joined room
    ///
    /// Returns false, leaving the index untouched, if the client is closed.
    pub fn add_room(&self, room: RoomHandle) -> bool {
        let mut rooms = self.rooms();
        if self.is_closed() {
            return false;
        }
        rooms.insert(room.external_id().to_string(), room);
        debug!(
            user = %self.shared.user.username,
            rooms = ?rooms.keys().collect::<Vec<_>>(),
            "added room to client"
        );
        true
    }

    pub fn del_room(&self, room_id: &str) {
        let mut rooms = self.rooms();
        rooms.remove(room_id);
        debug!(
            user = %self.shared.user.username,
            rooms = ?rooms.keys().collect::<Vec<_>>(),
            "removed room from client"
        );
    }

    /// Handle of a joined room
    pub fn room(&self, room_id: &str) -> Option<RoomHandle> {
        self.rooms().get(room_id).cloned()
    }

    /// External ids of all joined rooms, sorted
    pub fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl PartialEq for ClientHandle {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for ClientHandle {}

/// A connected client: handle plus the state its pumps own
pub struct Client {
    handle: ClientHandle,
    receivers: ClientReceivers,
    server: ChatServerHandle,
    config: ClientConfig,
}

impl Client {
    pub fn new(user: User, server: ChatServerHandle) -> Self {
        let config = server.config().client.clone();
        let (handle, receivers) = ClientHandle::new(user, &config);
        Self {
            handle,
            receivers,
            server,
            config,
        }
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Run both pumps over an upgraded connection until it closes
    ///
    /// On return the client is deregistered and has left every room.
    pub async fn run<S>(self, ws: WebSocketStream<S>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Client {
            handle,
            receivers,
            server,
            config,
        } = self;
        let (sink, stream) = ws.split();

        server.register_client(&handle).await;
        info!(
            client = %handle.id(),
            user = %handle.user().username,
            "client registered"
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let writer = tokio::spawn(write_pump(
            sink,
            handle.clone(),
            receivers,
            stop_rx,
            server.clone(),
            config.clone(),
        ));

        read_pump(stream, &handle, &server, &config).await;

        server.deregister_client(&handle);
        leave_all_rooms(&handle);
        let _ = stop_tx.send(());
        if let Err(e) = writer.await {
            error!(client = %handle.id(), "write pump panicked: {}", e);
        }

        info!(
            client = %handle.id(),
            user = %handle.user().username,
            "client disconnected"
        );
    }
}

/// Closures that are part of a normal disconnect
fn is_unexpected_close(err: &WsError) -> bool {
    !matches!(
        err,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake)
    )
}

async fn write_frame<S>(
    sink: &mut SplitSink<WebSocketStream<S>, Message>,
    frame: Message,
    write_wait: Duration,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(write_wait, sink.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            if is_unexpected_close(&e) {
                warn!("write message: {}", e);
            } else {
                debug!("write on closed connection: {}", e);
            }
            false
        }
        Err(_) => {
            warn!("write deadline exceeded");
            false
        }
    }
}

async fn write_pump<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    handle: ClientHandle,
    mut receivers: ClientReceivers,
    mut stop: oneshot::Receiver<()>,
    server: ChatServerHandle,
    config: ClientConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = receivers.send.recv() => {
                let Some(msg) = msg else {
                    break;
                };
                let json = match encode(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("failed to serialize message: {}", e);
                        continue;
                    }
                };
                if !write_frame(&mut sink, Message::Text(json.into()), config.write_wait).await {
                    break;
                }
                server.stats().incr(TOTAL_OUTGOING_MESSAGES);
                // Only ping an idle connection
                ping.reset();
            }
            Some(room_id) = receivers.exit_room.recv() => {
                handle.del_room(&room_id);
            }
            _ = &mut stop => {
                break;
            }
            _ = ping.tick() => {
                if !write_frame(&mut sink, Message::Ping(Vec::new().into()), config.write_wait).await {
                    break;
                }
            }
        }
    }

    let _ = timeout(config.write_wait, sink.close()).await;
    debug!(client = %handle.id(), "write pump exiting");
}

async fn read_pump<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    handle: &ClientHandle,
    server: &ChatServerHandle,
    config: &ClientConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = match timeout(config.pong_wait, stream.next()).await {
            Err(_) => {
                info!(client = %handle.id(), "read deadline exceeded");
                break;
            }
            Ok(None) => {
                debug!(client = %handle.id(), "stream ended");
                break;
            }
            Ok(Some(Err(e))) => {
                if is_unexpected_close(&e) {
                    warn!(client = %handle.id(), "ws: read: {}", e);
                } else {
                    debug!(client = %handle.id(), "connection closed: {}", e);
                }
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let raw: &[u8] = match &frame {
            Message::Text(text) => text.as_bytes(),
            Message::Binary(data) => data.as_slice(),
            Message::Close(close) => {
                match close {
                    Some(close) if !matches!(close.code, CloseCode::Normal | CloseCode::Away) => {
                        info!(client = %handle.id(), code = ?close.code, "client closed connection");
                    }
                    _ => debug!(client = %handle.id(), "client sent close frame"),
                }
                break;
            }
            // Any frame, pongs included, extends the read deadline
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        if raw.len() > config.max_message_size {
            warn!(
                client = %handle.id(),
                size = raw.len(),
                "frame exceeds read limit, closing"
            );
            break;
        }

        server.stats().incr(TOTAL_INCOMING_MESSAGES);
        dispatch(raw, handle, server);
    }

    debug!(client = %handle.id(), "read pump exiting");
}

/// Decode one frame and route it
fn dispatch(raw: &[u8], handle: &ClientHandle, server: &ChatServerHandle) {
    let (id, request) = match decode_frame(raw) {
        Ok(decoded) => decoded,
        Err(e) => {
            debug!(client = %handle.id(), "error parsing message: {}", e);
            handle.queue_message(ServerMessage::error(e.request_id(), RequestError::InvalidMessage));
            return;
        }
    };

    let msg = ClientMessage::new(id, handle.clone(), request);
    if matches!(msg.request, Request::Join(_)) {
        if let Err(err) = server.join_room(msg) {
            let (TrySendError::Full(msg) | TrySendError::Closed(msg)) = err;
            warn!(client = %handle.id(), "join mailbox unavailable");
            handle.queue_message(ServerMessage::error(msg.id, RequestError::ServiceUnavailable));
        }
        return;
    }

    let room_id = msg.request.room_id().to_string();
    let Some(room) = handle.room(&room_id) else {
        handle.queue_message(ServerMessage::error(msg.id, RequestError::RoomNotFound));
        return;
    };

    let sent = match msg.request {
        Request::Leave(_) => room.try_leave(msg),
        _ => room.try_send_message(msg),
    };
    match sent {
        Ok(()) => {}
        Err(TrySendError::Full(msg)) => {
            warn!(client = %handle.id(), room = %room_id, "room mailbox full");
            handle.queue_message(ServerMessage::error(msg.id, RequestError::ServiceUnavailable));
        }
        Err(TrySendError::Closed(msg)) => {
            debug!(client = %handle.id(), room = %room_id, "room already unloaded");
            handle.del_room(&room_id);
            handle.queue_message(ServerMessage::error(msg.id, RequestError::RoomNotFound));
        }
    }
}

/// Leave every joined room after the connection dropped
fn leave_all_rooms(handle: &ClientHandle) {
    for room in handle.close() {
        let msg = ClientMessage::new(
            None,
            handle.clone(),
            Request::Leave(Leave {
                room_id: room.external_id().to_string(),
                unsubscribe: false,
            }),
        );
        room.leave_eventually(msg);
    }
}
