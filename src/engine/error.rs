use ulid::Ulid;

use crate::model::BookingSummary;
use crate::repository::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid time range: {0}")]
    InvalidRange(String),
    #[error("reservations must be between {open_hour:02}:00 and {close_hour:02}:00")]
    OutOfWindow { open_hour: u32, close_hour: u32 },
    #[error("room is already booked for this time slot ({} conflicting)", .0.len())]
    Conflict(Vec<BookingSummary>),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl EngineError {
    /// Short label for rejection metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::InvalidRange(_) => "invalid_range",
            EngineError::OutOfWindow { .. } => "out_of_window",
            EngineError::Conflict(_) => "conflict",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Persistence(_) => "persistence",
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) | StoreError::UnknownRoom(id) => EngineError::NotFound(id),
            StoreError::AlreadyExists(id) => EngineError::AlreadyExists(id),
            StoreError::Wal(_) | StoreError::WriterGone(_) => EngineError::Persistence(e.to_string()),
        }
    }
}
