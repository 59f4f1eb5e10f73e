use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced across the engine facade. Transient remote failures
/// normally degrade to the fallback store and never reach the caller;
/// only validation and session problems are expected to be shown.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A remote call failed and no fallback path could absorb it.
    #[error("backend_unavailable")]
    Backend(#[source] anyhow::Error),

    /// The local fallback store itself failed.
    #[error("storage_error")]
    Storage(#[source] anyhow::Error),

    /// User-visible input problem; the operation was aborted, no retry.
    #[error("{0}")]
    Validation(ValidationError),

    /// Session restore failed closed; the stored session was cleared.
    #[error("{0}")]
    SessionInvalid(RestoreFailure),

    /// All reconnection attempts were spent. Reported on the status
    /// channel; the room keeps running in polling mode.
    #[error("reconnection_exhausted")]
    ReconnectionExhausted { attempts: u32 },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    #[error("empty_message")]
    EmptyMessage,
    #[error("message_too_long")]
    MessageTooLong,
    #[error("message_limit_reached")]
    MessageLimitReached,
    #[error("empty_room_code")]
    EmptyRoomCode,
    #[error("invalid_room_code")]
    InvalidRoomCode,
    #[error("room_not_found")]
    RoomNotFound,
    #[error("room_expired")]
    RoomExpired,
    #[error("message_not_found")]
    MessageNotFound,
    #[error("empty_name")]
    EmptyName,
    #[error("empty_question")]
    EmptyQuestion,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RestoreFailure {
    #[error("no_session")]
    NoSession,
    #[error("session_expired")]
    SessionExpired,
    #[error("room_not_found")]
    RoomNotFound,
    #[error("room_expired")]
    RoomExpired,
    #[error("restore_error")]
    RestoreError,
}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        EngineError::Validation(e)
    }
}

impl From<RestoreFailure> for EngineError {
    fn from(e: RestoreFailure) -> Self {
        EngineError::SessionInvalid(e)
    }
}
