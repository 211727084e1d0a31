//! Error types for the chat server
//!
//! Defines connection-level errors, client-visible request errors,
//! control-plane errors and protocol decode errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::repository::RepositoryError;

/// Connection-level errors
///
/// These end a single connection handler; they never reach other clients.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Persistence lookup failed while setting up the connection
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Failures reported back to the client as a `response`
///
/// Each variant maps to an HTTP-style response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RequestError {
    /// Frame could not be decoded
    #[error("invalid message format")]
    InvalidMessage,

    /// Room does not exist or the client has not joined it
    #[error("room not found")]
    RoomNotFound,

    /// Unsubscribe without a subscription
    #[error("subscription not found")]
    SubscriptionNotFound,

    /// Persistence failure
    #[error("internal server error")]
    Internal,

    /// A mailbox was full
    #[error("service unavailable")]
    ServiceUnavailable,
}

/// Control-plane errors returned by `ChatServerHandle`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerError {
    /// `unload_room` called with an empty room id
    #[error("room id cannot be empty")]
    EmptyRoomId,

    /// The request or its acknowledgement did not complete before the deadline
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The server control loop is no longer running
    #[error("chat server is not running")]
    Stopped,
}

/// Inbound frame decode errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Not valid JSON or wrong field types
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// None of join/leave/publish/read was present
    #[error("frame carries no action")]
    MissingAction { id: Option<i64> },

    /// More than one of join/leave/publish/read was present
    #[error("frame carries more than one action")]
    MultipleActions { id: Option<i64> },
}

impl ProtocolError {
    /// Request id to echo in the error response, if the frame got far enough to carry one
    pub fn request_id(&self) -> Option<i64> {
        match self {
            ProtocolError::Malformed(_) => None,
            ProtocolError::MissingAction { id } | ProtocolError::MultipleActions { id } => *id,
        }
    }
}
