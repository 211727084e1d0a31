//! WebSocket connection handler
//!
//! Performs the WebSocket handshake, resolves the connecting user and hands
//! the upgraded socket to a [`Client`] actor.

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{debug, info, warn};

use crate::client::Client;
use crate::error::AppError;
use crate::repository::RepositoryError;
use crate::server::ChatServerHandle;
use crate::types::UserId;

/// Extract a positive `user_id` from a request query string
///
/// The query is not percent-decoded: only a plain run of ASCII digits is
/// accepted, so `user_id=%37` or `user_id=+7` is treated as missing.
pub fn user_id_from_query(query: Option<&str>) -> Option<UserId> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "user_id")
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|value| value.parse::<UserId>().ok())
        .filter(|id| *id > 0)
}

fn unauthorized() -> ErrorResponse {
    let mut response = ErrorResponse::new(Some("missing or invalid user_id".to_string()));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response
}

/// Handle a new TCP connection
///
/// The handshake is refused with 401 unless the request URI carries a valid
/// `user_id`. Unknown users are closed with a policy close frame.
pub async fn handle_connection(
    stream: TcpStream,
    server: ChatServerHandle,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    let mut user_id = None;
    let callback = |request: &Request, response: Response| {
        user_id = user_id_from_query(request.uri().query());
        match user_id {
            Some(_) => Ok(response),
            None => Err(unauthorized()),
        }
    };

    let mut ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            warn!("Handshake with {} failed: {}", peer_addr, e);
            return Err(e.into());
        }
    };
    let Some(user_id) = user_id else {
        return Ok(());
    };

    let user = match server.repository().get_user(user_id).await {
        Ok(user) => user,
        Err(RepositoryError::NotFound) => {
            info!("Rejecting unknown user {} from {}", user_id, peer_addr);
            ws_stream
                .close(Some(CloseFrame {
                    code: CloseCode::Policy,
                    reason: "unknown user".into(),
                }))
                .await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    info!("User {} ({}) connected from {}", user.username, user.id, peer_addr);
    Client::new(user, server).run(ws_stream).await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_from_query() {
        assert_eq!(user_id_from_query(Some("user_id=7")), Some(7));
        assert_eq!(user_id_from_query(Some("token=x&user_id=12")), Some(12));
    }

    #[test]
    fn test_user_id_from_query_rejects_invalid() {
        assert_eq!(user_id_from_query(None), None);
        assert_eq!(user_id_from_query(Some("")), None);
        assert_eq!(user_id_from_query(Some("user=7")), None);
        assert_eq!(user_id_from_query(Some("user_id=abc")), None);
        assert_eq!(user_id_from_query(Some("user_id=0")), None);
        assert_eq!(user_id_from_query(Some("user_id=-3")), None);
    }

    #[test]
    fn test_user_id_from_query_takes_plain_digits_only() {
        assert_eq!(user_id_from_query(Some("user_id=%37")), None);
        assert_eq!(user_id_from_query(Some("user_id=+7")), None);
        assert_eq!(user_id_from_query(Some("user_id= 7")), None);
        assert_eq!(user_id_from_query(Some("user_id=")), None);
        assert_eq!(user_id_from_query(Some("user_id=007")), Some(7));
    }

    #[test]
    fn test_unauthorized_response() {
        let response = unauthorized();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
