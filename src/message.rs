//! Message protocol definitions
//!
//! JSON envelopes exchanged with clients. Every frame is an object with an
//! optional request `id`, a `timestamp` and exactly one action key:
//!
//! ```text
//! inbound:  {"id": 1, "join": {"room_id": "lobby"}}
//! outbound: {"id": 1, "timestamp": "...", "response": {"response_code": 200, "data": {...}}}
//! ```
//!
//! `ClientMessage` and `ServerMessage` are also the in-process envelopes passed
//! between client, room and server actors.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::client::ClientHandle;
use crate::error::{ProtocolError, RequestError};
use crate::types::{ClientId, SeqId, User, UserId};

/// Current UTC time rounded to milliseconds
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    now.duration_round(TimeDelta::milliseconds(1)).unwrap_or(now)
}

// ----------------------------------------------------------------------------
// Client → Server
// ----------------------------------------------------------------------------

/// Join a room, subscribing first if needed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    pub room_id: String,
}

/// Leave a room; `unsubscribe` also deletes the subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leave {
    pub room_id: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unsubscribe: bool,
}

/// Publish a message to a joined room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publish {
    pub room_id: String,
    pub content: String,
}

/// Mark messages up to `seq_id` as read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Read {
    pub room_id: String,
    pub seq_id: SeqId,
}

/// The single action carried by a client frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Join(Join),
    Leave(Leave),
    Publish(Publish),
    Read(Read),
}

impl Request {
    /// External id of the room this request addresses
    pub fn room_id(&self) -> &str {
        match self {
            Request::Join(join) => &join.room_id,
            Request::Leave(leave) => &leave.room_id,
            Request::Publish(publish) => &publish.room_id,
            Request::Read(read) => &read.room_id,
        }
    }
}

/// Raw wire shape of an inbound frame
///
/// Also used by test clients to build frames.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<Join>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leave: Option<Leave>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<Publish>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<Read>,
}

impl ClientFrame {
    pub fn new(id: Option<i64>, request: Request) -> Self {
        let mut frame = ClientFrame {
            id,
            ..Default::default()
        };
        match request {
            Request::Join(join) => frame.join = Some(join),
            Request::Leave(leave) => frame.leave = Some(leave),
            Request::Publish(publish) => frame.publish = Some(publish),
            Request::Read(read) => frame.read = Some(read),
        }
        frame
    }

    /// Validate that exactly one action is present
    pub fn into_request(self) -> Result<(Option<i64>, Request), ProtocolError> {
        let id = self.id;
        let mut actions = [
            self.join.map(Request::Join),
            self.leave.map(Request::Leave),
            self.publish.map(Request::Publish),
            self.read.map(Request::Read),
        ]
        .into_iter()
        .flatten();

        match (actions.next(), actions.next()) {
            (Some(request), None) => Ok((id, request)),
            (None, _) => Err(ProtocolError::MissingAction { id }),
            (Some(_), Some(_)) => Err(ProtocolError::MultipleActions { id }),
        }
    }
}

/// Decode one inbound frame into its request id and action
pub fn decode_frame(raw: &[u8]) -> Result<(Option<i64>, Request), ProtocolError> {
    let frame: ClientFrame = serde_json::from_slice(raw)?;
    frame.into_request()
}

/// Inbound envelope after the client pump stamped it
///
/// `client` is the sender's handle. Its channels may already be closed by the
/// time a room processes the message; replies to a gone client are dropped.
#[derive(Debug, Clone)]
pub struct ClientMessage {
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub user_id: UserId,
    pub client: ClientHandle,
    pub request: Request,
}

impl ClientMessage {
    pub fn new(id: Option<i64>, client: ClientHandle, request: Request) -> Self {
        Self {
            id,
            timestamp: now(),
            user_id: client.user().id,
            client,
            request,
        }
    }
}

// ----------------------------------------------------------------------------
// Server → Client
// ----------------------------------------------------------------------------

/// HTTP-style response code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseCode(pub u16);

impl ResponseCode {
    pub const OK: ResponseCode = ResponseCode(200);
    pub const ACCEPTED: ResponseCode = ResponseCode(202);
    pub const BAD_REQUEST: ResponseCode = ResponseCode(400);
    pub const NOT_FOUND: ResponseCode = ResponseCode(404);
    pub const INTERNAL_SERVER_ERROR: ResponseCode = ResponseCode(500);
    pub const SERVICE_UNAVAILABLE: ResponseCode = ResponseCode(503);
}

impl From<RequestError> for ResponseCode {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::InvalidMessage => ResponseCode::BAD_REQUEST,
            RequestError::RoomNotFound | RequestError::SubscriptionNotFound => {
                ResponseCode::NOT_FOUND
            }
            RequestError::Internal => ResponseCode::INTERNAL_SERVER_ERROR,
            RequestError::ServiceUnavailable => ResponseCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Subscriber entry of a room snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: UserId,
    pub username: String,
    /// User has at least one session joined to the room
    pub is_present: bool,
}

/// Room state sent to a client on a successful join
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub name: String,
    pub description: String,
    pub seq_id: SeqId,
    pub owner_id: UserId,
    pub subscribers: Vec<Subscriber>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    Room(RoomSnapshot),
}

/// Reply to a specific request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub response_code: ResponseCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

/// A published chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub seq_id: SeqId,
    pub room_id: String,
    pub user_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// A user's presence in a room, or a room's liveness when `user_id` is absent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub present: bool,
    pub room_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

/// New message available in a room the user is not joined to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageNotification {
    pub room_id: String,
    pub seq_id: SeqId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionChange {
    pub room_id: String,
    pub subscribed: bool,
    pub user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomDeleted {
    pub room_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Presence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageNotification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_change: Option<SubscriptionChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_deleted: Option<RoomDeleted>,
}

/// The single payload of a server frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerBody {
    Response(Response),
    Message(ChatMessage),
    Notification(Notification),
}

/// Server → Client envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: ServerBody,
    /// Session excluded from an in-process fan-out; never serialized
    #[serde(skip)]
    pub skip: Option<ClientId>,
}

impl ServerMessage {
    fn new(id: Option<i64>, body: ServerBody) -> Self {
        Self {
            id,
            timestamp: now(),
            body,
            skip: None,
        }
    }

    /// 200 with optional data
    pub fn ok(id: Option<i64>, data: Option<ResponseData>) -> Self {
        Self::new(
            id,
            ServerBody::Response(Response {
                response_code: ResponseCode::OK,
                error: None,
                data,
            }),
        )
    }

    /// 202, used to acknowledge a publish
    pub fn accepted(id: Option<i64>) -> Self {
        Self::new(
            id,
            ServerBody::Response(Response {
                response_code: ResponseCode::ACCEPTED,
                error: None,
                data: None,
            }),
        )
    }

    /// Error response for a failed request
    pub fn error(id: Option<i64>, err: RequestError) -> Self {
        Self::new(
            id,
            ServerBody::Response(Response {
                response_code: err.into(),
                error: Some(err.to_string()),
                data: None,
            }),
        )
    }

    pub fn chat(id: Option<i64>, message: ChatMessage) -> Self {
        Self::new(id, ServerBody::Message(message))
    }

    pub fn notification(notification: Notification) -> Self {
        Self::new(None, ServerBody::Notification(notification))
    }

    pub fn presence(room_id: &str, user_id: Option<UserId>, present: bool) -> Self {
        Self::notification(Notification {
            presence: Some(Presence {
                present,
                room_id: room_id.to_string(),
                user_id,
            }),
            ..Default::default()
        })
    }

    pub fn new_message(room_id: &str, seq_id: SeqId) -> Self {
        Self::notification(Notification {
            message: Some(MessageNotification {
                room_id: room_id.to_string(),
                seq_id,
            }),
            ..Default::default()
        })
    }

    pub fn subscription_change(room_id: &str, user: User, subscribed: bool) -> Self {
        Self::notification(Notification {
            subscription_change: Some(SubscriptionChange {
                room_id: room_id.to_string(),
                subscribed,
                user,
            }),
            ..Default::default()
        })
    }

    pub fn room_deleted(room_id: &str) -> Self {
        Self::notification(Notification {
            room_deleted: Some(RoomDeleted {
                room_id: room_id.to_string(),
            }),
            ..Default::default()
        })
    }

    /// Exclude one session from a fan-out
    pub fn skipping(mut self, client: ClientId) -> Self {
        self.skip = Some(client);
        self
    }

    /// The response payload, if this is a response
    pub fn response(&self) -> Option<&Response> {
        match &self.body {
            ServerBody::Response(response) => Some(response),
            _ => None,
        }
    }

    /// The notification payload, if this is a notification
    pub fn as_notification(&self) -> Option<&Notification> {
        match &self.body {
            ServerBody::Notification(notification) => Some(notification),
            _ => None,
        }
    }

    /// The chat message, if this is a message
    pub fn as_chat(&self) -> Option<&ChatMessage> {
        match &self.body {
            ServerBody::Message(message) => Some(message),
            _ => None,
        }
    }
}

/// Serialize a server message for the wire
pub fn encode(msg: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}
