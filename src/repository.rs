use async_trait::async_trait;
use ulid::Ulid;

use crate::model::{Booking, Room};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("WAL error: {0}")]
    Wal(#[from] std::io::Error),
    #[error("WAL writer unavailable: {0}")]
    WriterGone(&'static str),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("unknown room: {0}")]
    UnknownRoom(Ulid),
    #[error("not found: {0}")]
    NotFound(Ulid),
}

/// Durable store of rooms and bookings.
///
/// Stamps are naive local text in one fixed zone. Implementations must not
/// shift or reinterpret them.
#[async_trait]
pub trait BookingRepository: Send + Sync {
    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError>;

    async fn get_room(&self, id: Ulid) -> Result<Option<Room>, StoreError>;

    async fn insert_room(&self, room: Room) -> Result<Room, StoreError>;

    async fn update_room(&self, room: Room) -> Result<Room, StoreError>;

    /// Bookings of one room, ordered by start.
    async fn list_by_room(&self, room_id: Ulid) -> Result<Vec<Booking>, StoreError>;

    /// Every booking, ordered by start.
    async fn list_all(&self) -> Result<Vec<Booking>, StoreError>;

    async fn get(&self, id: Ulid) -> Result<Option<Booking>, StoreError>;

    async fn insert(&self, booking: Booking) -> Result<Booking, StoreError>;

    /// Remove a booking, returning it if it existed.
    async fn delete_by_id(&self, id: Ulid) -> Result<Option<Booking>, StoreError>;
}

/// Who belongs to which class, and the display names the calendar needs.
#[async_trait]
pub trait Roster: Send + Sync {
    async fn students_of(&self, class_id: Ulid) -> Result<Vec<Ulid>, StoreError>;

    async fn user_name(&self, user_id: Ulid) -> Result<Option<String>, StoreError>;

    async fn class_name(&self, class_id: Ulid) -> Result<Option<String>, StoreError>;
}
