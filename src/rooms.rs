//! Room administration

use std::time::Duration;

use thiserror::Error;
use tracing::info;

use crate::error::ServerError;
use crate::repository::RepositoryError;
use crate::server::ChatServerHandle;
use crate::types::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomAdminError {
    #[error("room not found")]
    NotFound,

    #[error("only the room owner can delete a room")]
    Forbidden,

    #[error("repository error: {0}")]
    Repository(RepositoryError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

impl From<RepositoryError> for RoomAdminError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound => RoomAdminError::NotFound,
            other => RoomAdminError::Repository(other),
        }
    }
}

/// Delete a room owned by `requester`
///
/// The room is removed from storage first, then unloaded so joined clients
/// receive `room_deleted` and are detached.
pub async fn delete_room(
    server: &ChatServerHandle,
    external_id: &str,
    requester: UserId,
    deadline: Duration,
) -> Result<(), RoomAdminError> {
    if external_id.is_empty() {
        return Err(ServerError::EmptyRoomId.into());
    }

    let repo = server.repository();
    let room = repo.get_room_by_external_id(external_id).await?;
    if room.owner_id != requester {
        return Err(RoomAdminError::Forbidden);
    }

    repo.delete_room(room.id).await?;
    server.unload_room(external_id, true, deadline).await?;

    info!(room = %external_id, "room deleted");
    Ok(())
}
