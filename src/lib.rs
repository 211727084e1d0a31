//! Multi-room WebSocket Chat Server Library
//!
//! A real-time chat backend built with tokio-tungstenite using the Actor
//! pattern: one registry actor, one actor per active room and a pair of pumps
//! per connection, linked by bounded mailboxes.
//!
//! # Features
//! - Join, leave, unsubscribe, publish and read-marker requests
//! - Lazy room activation and idle unloading
//! - Per-user presence across rooms and sessions
//! - Notifications for subscribers not joined to a room
//! - Room deletion and graceful shutdown
//!
//! # Architecture
//! - `ChatServer` owns the set of active rooms and fans out per-user messages
//! - Each `Room` owns its membership and message sequence
//! - Each connection runs a `Client` with an inbound and an outbound pump
//! - Sends never block: a full mailbox turns into a `service unavailable`
//!   response or a dropped notification
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use room_chat_server::{handle_connection, ChatServer, InMemoryRepository, ServerConfig, Stats};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     let repo = Arc::new(InMemoryRepository::new());
//!     let (server, handle) = ChatServer::new(repo, Arc::new(Stats::new()), ServerConfig::default());
//!     tokio::spawn(server.run());
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         tokio::spawn(handle_connection(stream, handle.clone()));
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod memory;
pub mod message;
pub mod repository;
pub mod room;
pub mod rooms;
pub mod server;
pub mod stats;
pub mod types;

// Re-export main types for convenience
pub use client::{Client, ClientHandle};
pub use config::{ClientConfig, RoomConfig, ServerConfig};
pub use error::{AppError, ProtocolError, RequestError, ServerError};
pub use handler::handle_connection;
pub use memory::InMemoryRepository;
pub use message::{ClientMessage, Request, ResponseCode, ServerMessage};
pub use repository::{Repository, RepositoryError};
pub use room::{Room, RoomHandle};
pub use rooms::{delete_room, RoomAdminError};
pub use server::{ChatServer, ChatServerHandle};
pub use stats::{Stats, StatsProvider};
pub use types::{ClientId, RoomCode, User, UserId};
