//! Engine error types

use thiserror::Error;
use uuid::Uuid;
use xschedule_client::DeviceError;

/// Errors surfaced by the player and queue operations
#[derive(Error, Debug)]
pub enum PlayerError {
    /// The device API call behind an operation failed
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// A queue operation needs an active playlist and none is tracked
    #[error("no playlist is currently active")]
    NoActivePlaylist,

    /// The requested song is not a step of the active playlist
    #[error("song '{song}' is not in playlist '{playlist}'")]
    SongNotInPlaylist { song: String, playlist: String },

    /// The queue item id does not exist
    #[error("unknown queue item: {0}")]
    UnknownQueueItem(Uuid),

    /// A reorder did not name exactly the current queue's items
    #[error("reorder ids do not match the current queue")]
    ReorderMismatch,
}

impl PlayerError {
    /// Check if this is a validation failure (caller mistake, queue left
    /// unchanged) as opposed to a device or transport failure
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PlayerError::NoActivePlaylist
                | PlayerError::SongNotInPlaylist { .. }
                | PlayerError::UnknownQueueItem(_)
                | PlayerError::ReorderMismatch
        )
    }
}
