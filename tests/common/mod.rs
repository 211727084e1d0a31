//! Shared helpers for integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use room_chat_server::client::ClientReceivers;
use room_chat_server::message::{ClientFrame, Join, Leave, Publish};
use room_chat_server::repository::{NewMessage, RoomRecord, Subscription};
use room_chat_server::types::{RoomId, SeqId};
use room_chat_server::{
    handle_connection, ChatServer, ChatServerHandle, ClientHandle, InMemoryRepository, Repository,
    RepositoryError, Request, ServerConfig, ServerMessage, Stats, User, UserId,
};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Config with timers short enough for tests
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.room.idle_timeout = Duration::from_millis(100);
    config.unload_timeout = Duration::from_secs(1);
    config
}

/// In-memory storage with switchable faults
///
/// Room lookups can be made to fail and message writes can be slowed down,
/// which keeps a room busy long enough to fill its mailboxes.
#[derive(Default)]
pub struct FlakyRepository {
    pub inner: InMemoryRepository,
    pub fail_room_lookup: AtomicBool,
    pub message_delay_ms: AtomicU64,
}

impl FlakyRepository {
    pub fn delay_messages(&self, delay: Duration) {
        self.message_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl Repository for FlakyRepository {
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
        self.inner.create_subscription(user_id, room_id).await
    }
    async fn delete_subscription(
        &self,
        user_id: UserId,
        room_id: RoomId,
    ) -> Result<(), RepositoryError> {
        self.inner.delete_subscription(user_id, room_id).await
    }
    async fn get_room_by_external_id(&self, external_id: &str) -> Result<RoomRecord, RepositoryError> {
        if self.fail_room_lookup.load(Ordering::SeqCst) {
            return Err(RepositoryError::Internal("connection refused".to_string()));
        }
        self.inner.get_room_by_external_id(external_id).await
    }
    async fn get_room_with_subscribers(&self, room_id: RoomId) -> Result<RoomRecord, RepositoryError> {
        self.inner.get_room_with_subscribers(room_id).await
    }
    async fn get_subscribers_by_room_id(&self, room_id: RoomId) -> Result<Vec<User>, RepositoryError> {
        self.inner.get_subscribers_by_room_id(room_id).await
    }
    async fn list_subscriptions(&self, user_id: UserId) -> Result<Vec<Subscription>, RepositoryError> {
        self.inner.list_subscriptions(user_id).await
    }
    async fn create_message(&self, msg: NewMessage) -> Result<(), RepositoryError> {
        let delay = self.message_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.create_message(msg).await
    }
    async fn update_last_read_seq_id(
        &self,
        user_id: UserId,
        room_id: RoomId,
        seq_id: SeqId,
    ) -> Result<(), RepositoryError> {
        self.inner.update_last_read_seq_id(user_id, room_id, seq_id).await
    }
    async fn delete_room(&self, room_id: RoomId) -> Result<(), RepositoryError> {
        self.inner.delete_room(room_id).await
    }
}

pub struct TestServer {
    pub handle: ChatServerHandle,
    pub repo: Arc<FlakyRepository>,
    pub stats: Arc<Stats>,
}

impl TestServer {
    pub fn start(config: ServerConfig) -> Self {
        let repo = Arc::new(FlakyRepository::default());
        let stats = Arc::new(Stats::new());
        let (server, handle) = ChatServer::new(repo.clone(), stats.clone(), config);
        tokio::spawn(server.run());
        Self {
            handle,
            repo,
            stats,
        }
    }

    /// Accept WebSocket connections on a loopback port
    pub async fn listen(&self) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = self.handle.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handle = handle.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, handle).await;
                });
            }
        });
        addr
    }

    pub async fn user(&self, username: &str) -> User {
        self.repo.inner.create_user(username).await
    }

    pub async fn room(&self, external_id: &str, owner: &User) {
        self.repo
            .inner
            .create_room_with_external_id(external_id, external_id, "", owner.id)
            .await
            .unwrap();
    }

    /// A registered in-process session, bypassing the socket
    pub async fn session(&self, user: &User) -> (ClientHandle, ClientReceivers) {
        let (client, receivers) = ClientHandle::new(user.clone(), &self.handle.config().client);
        self.handle.register_client(&client).await;
        (client, receivers)
    }

    /// Wait until `check` holds, polling the shared state
    pub async fn wait_for<F>(&self, mut check: F)
    where
        F: FnMut(&ChatServerHandle) -> bool,
    {
        timeout(RECV_TIMEOUT, async {
            while !check(&self.handle) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }
}

pub fn join(room_id: &str) -> Request {
    Request::Join(Join {
        room_id: room_id.to_string(),
    })
}

pub fn leave(room_id: &str, unsubscribe: bool) -> Request {
    Request::Leave(Leave {
        room_id: room_id.to_string(),
        unsubscribe,
    })
}

pub fn publish(room_id: &str, content: &str) -> Request {
    Request::Publish(Publish {
        room_id: room_id.to_string(),
        content: content.to_string(),
    })
}

/// Next message on an in-process session mailbox
pub async fn next(receivers: &mut ClientReceivers) -> ServerMessage {
    timeout(RECV_TIMEOUT, receivers.send.recv())
        .await
        .expect("timed out waiting for message")
        .expect("mailbox closed")
}

/// Skip messages until one matches
pub async fn next_matching<F>(receivers: &mut ClientReceivers, mut matches: F) -> ServerMessage
where
    F: FnMut(&ServerMessage) -> bool,
{
    loop {
        let msg = next(receivers).await;
        if matches(&msg) {
            return msg;
        }
    }
}

pub fn ws_url(addr: SocketAddr, user_id: UserId) -> String {
    format!("ws://{}/ws?user_id={}", addr, user_id)
}

/// WebSocket test client speaking the JSON protocol
pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr, user_id: UserId) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(ws_url(addr, user_id))
            .await
            .expect("failed to connect");
        Self { ws }
    }

    pub async fn send(&mut self, id: i64, request: Request) {
        let frame = serde_json::to_string(&ClientFrame::new(Some(id), request)).unwrap();
        self.send_raw(&frame).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string())).await.unwrap();
    }

    /// Next server message, skipping control frames
    pub async fn recv(&mut self) -> ServerMessage {
        loop {
            let frame = timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("connection ended")
                .expect("websocket error");
            match frame {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Close(close) => panic!("connection closed: {:?}", close),
                _ => continue,
            }
        }
    }

    /// Skip messages until the response to request `id`
    pub async fn response(&mut self, id: i64) -> ServerMessage {
        loop {
            let msg = self.recv().await;
            if msg.id == Some(id) && msg.response().is_some() {
                return msg;
            }
        }
    }

    pub async fn recv_matching<F>(&mut self, mut matches: F) -> ServerMessage
    where
        F: FnMut(&ServerMessage) -> bool,
    {
        loop {
            let msg = self.recv().await;
            if matches(&msg) {
                return msg;
            }
        }
    }

    /// Wait for the server to close the connection, returning its close frame
    pub async fn closed(&mut self) -> Option<CloseFrame<'static>> {
        loop {
            match timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for close")
            {
                Some(Ok(Message::Close(close))) => return close,
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
        // Drain until the server acknowledges
        while let Ok(Some(Ok(_))) = timeout(RECV_TIMEOUT, self.ws.next()).await {}
    }
}
