use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::conflict::conflicts;
use super::window::validate_window;
use super::{Engine, EngineError};

const CREATED_TITLE: &str = "Booking for your class";
const CANCELLED_TITLE: &str = "Booking cancelled";

fn parse_bound(raw: &str, which: &str) -> Result<Stamp, EngineError> {
    parse_stamp(raw).ok_or_else(|| EngineError::InvalidRange(format!("unparsable {which} {raw:?}")))
}

impl Engine {
    pub async fn create_room(&self, room: Room) -> Result<Room, EngineError> {
        let room = self.repo.insert_room(room).await?;
        tracing::info!("room {} created: {}", room.id, room.name);
        Ok(room)
    }

    pub async fn update_room(&self, room: Room) -> Result<Room, EngineError> {
        Ok(self.repo.update_room(room).await?)
    }

    /// Update the room if it exists, else create it.
    pub async fn upsert_room(&self, room: Room) -> Result<Room, EngineError> {
        if self.repo.get_room(room.id).await?.is_some() {
            self.update_room(room).await
        } else {
            self.create_room(room).await
        }
    }

    /// Validate, check for overlaps and persist a new booking, then tell the
    /// booking's class (if any) about it.
    pub async fn create_booking(&self, new: NewBooking) -> Result<Booking, EngineError> {
        match self.admit(new).await {
            Ok(booking) => {
                metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
                if let Some(class_id) = booking.class_id {
                    let title = if booking.title.is_empty() { "New booking" } else { booking.title.as_str() };
                    let end = booking.end_time.as_deref().unwrap_or_default();
                    let message = format!("New booking: {title} on {} - {end}", booking.start_time);
                    self.notify_class(class_id, CREATED_TITLE, message);
                }
                Ok(booking)
            }
            Err(e) => {
                metrics::counter!(observability::BOOKINGS_REJECTED_TOTAL, "reason" => e.reason())
                    .increment(1);
                Err(e)
            }
        }
    }

    async fn admit(&self, new: NewBooking) -> Result<Booking, EngineError> {
        let start = parse_bound(&new.start_time, "start")?;
        let end = parse_bound(&new.end_time, "end")?;
        validate_window(start, end, &self.window)?;
        let candidate = Span::new(start, end);

        // Rooms are never deleted; only known rooms get a lock.
        if self.repo.get_room(new.room_id).await?.is_none() {
            return Err(EngineError::NotFound(new.room_id));
        }
        let lock = self.room_lock(new.room_id);
        let _admission = lock.lock().await;

        let existing = self.repo.list_by_room(new.room_id).await?;
        let colliding = conflicts(new.room_id, &candidate, &existing);
        if !colliding.is_empty() {
            tracing::debug!(
                "booking in room {} at {start} rejected: {} conflicts",
                new.room_id,
                colliding.len()
            );
            return Err(EngineError::Conflict(colliding));
        }

        let booking = Booking {
            id: Ulid::new(),
            room_id: new.room_id,
            user_id: new.user_id,
            class_id: new.class_id,
            title: new.title,
            start_time: format_stamp(start),
            end_time: Some(format_stamp(end)),
            description: new.description,
        };
        let booking = self.repo.insert(booking).await?;
        tracing::info!("booking {} created in room {}", booking.id, booking.room_id);
        Ok(booking)
    }

    /// Remove a booking, past or future. Returns the removed row.
    pub async fn delete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let Some(found) = self.repo.get(id).await? else {
            return Err(EngineError::NotFound(id));
        };

        let removed = {
            let lock = self.room_lock(found.room_id);
            let _admission = lock.lock().await;
            self.repo.delete_by_id(id).await?.ok_or(EngineError::NotFound(id))?
        };
        metrics::counter!(observability::BOOKINGS_DELETED_TOTAL).increment(1);
        tracing::info!("booking {id} deleted from room {}", removed.room_id);

        if let Some(class_id) = removed.class_id {
            let title = if removed.title.is_empty() { "Reservation" } else { removed.title.as_str() };
            let message = format!(
                "The booking \"{title}\" for your class at {} was cancelled.",
                removed.start_time
            );
            self.notify_class(class_id, CANCELLED_TITLE, message);
        }
        Ok(removed)
    }

    /// Notify every student of `class_id` on a tracked background task.
    /// Failures are logged and counted, never returned.
    fn notify_class(&self, class_id: Ulid, title: &'static str, message: String) {
        let roster = self.roster.clone();
        let notifier = self.notifier.clone();
        self.fanout.spawn(async move {
            let students = match roster.students_of(class_id).await {
                Ok(students) => students,
                Err(e) => {
                    tracing::warn!("cannot list students of class {class_id}: {e}");
                    metrics::counter!(observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
                    return;
                }
            };
            for student in students {
                if let Err(e) = notifier.notify(student, title, &message, None).await {
                    tracing::warn!("notification to {student} failed: {e}");
                    metrics::counter!(observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
                }
            }
        });
    }
}
