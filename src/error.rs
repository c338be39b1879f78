use std::io;

use thiserror::Error;

/// Hearth global error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupted snapshot: {0}")]
    BadSnapshot(String),

    #[error("Configuration error: {0}")]
    BadConfig(String),

    #[error("Listener panic in session {session} (sync token {token}): {details}")]
    ListenerPanic {
        session: String,
        token: String,
        details: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn room_not_found(room_id: impl std::fmt::Display) -> Self {
        Error::RoomNotFound(room_id.to_string())
    }

    pub fn event_not_found(event_id: impl std::fmt::Display) -> Self {
        Error::EventNotFound(event_id.to_string())
    }

    pub fn bad_database(message: impl Into<String>) -> Self {
        Error::Database(message.into())
    }

    pub fn bad_snapshot(message: impl Into<String>) -> Self {
        Error::BadSnapshot(message.into())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Database(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::BadSnapshot(e.to_string())
    }
}

/// Hearth global result type
pub type Result<T> = std::result::Result<T, Error>;
