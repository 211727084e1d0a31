//! Runtime configuration
//!
//! Mailbox capacities and timers for the server, room and client actors, plus
//! the command line of the binary.

use std::time::Duration;

use clap::Parser;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";

/// Room actor settings
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Grace period between losing the last client and unloading
    pub idle_timeout: Duration,
    /// Capacity of each room mailbox (join, leave, client messages)
    pub mailbox_capacity: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5),
            mailbox_capacity: 256,
        }
    }
}

/// Per-connection settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Outbound mailbox capacity
    pub send_capacity: usize,
    /// Forced room-exit signal capacity
    pub exit_capacity: usize,
    /// Time allowed to write one frame
    pub write_wait: Duration,
    /// Time allowed between two inbound frames (pongs included)
    pub pong_wait: Duration,
    /// Keepalive ping period, must be shorter than `pong_wait`
    pub ping_interval: Duration,
    /// Largest accepted inbound frame in bytes
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let pong_wait = Duration::from_secs(60);
        Self {
            send_capacity: 256,
            exit_capacity: 16,
            write_wait: Duration::from_secs(10),
            pong_wait,
            ping_interval: pong_wait * 9 / 10,
            max_message_size: 1024,
        }
    }
}

/// Chat server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub join_capacity: usize,
    pub broadcast_capacity: usize,
    pub unload_capacity: usize,
    /// How long the control loop waits for a room to acknowledge an exit
    pub unload_timeout: Duration,
    pub room: RoomConfig,
    pub client: ClientConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            join_capacity: 256,
            broadcast_capacity: 256,
            unload_capacity: 64,
            unload_timeout: Duration::from_secs(5),
            room: RoomConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

/// Command line of the server binary
#[derive(Parser, Debug)]
#[command(name = "room_chat_server")]
#[command(about = "Multi-room WebSocket chat server", long_about = None)]
pub struct Cli {
    /// Address to bind to
    #[arg(default_value = DEFAULT_ADDR)]
    pub addr: String,

    /// Seconds an empty room stays loaded
    #[arg(long, default_value_t = 5)]
    pub idle_timeout_secs: u64,

    /// Seconds allowed for graceful shutdown
    #[arg(long, default_value_t = 10)]
    pub shutdown_timeout_secs: u64,

    /// Seed a user account (ids are assigned from 1 in order)
    #[arg(long = "user")]
    pub users: Vec<String>,

    /// Seed a room with this external id, owned by the first user
    #[arg(long = "room")]
    pub rooms: Vec<String>,
}

impl Cli {
    pub fn server_config(&self) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.room.idle_timeout = Duration::from_secs(self.idle_timeout_secs);
        config
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
