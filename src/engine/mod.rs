mod calendar;
mod conflict;
mod error;
mod mutations;
mod normalize;
mod occupancy;
mod queries;
mod window;

pub use calendar::{
    day_timeline, month_view, CalendarDay, DayTimeline, EventLabel, MonthView, TimelineCell,
    TimelineEntry, TimelineRow,
};
pub use conflict::{conflicts, has_conflict};
pub use error::EngineError;
pub use normalize::{booking_span, normalized_span, DEFAULT_DURATION_HOURS};
pub use occupancy::{occupied_hours, slot_options, SlotOption, SlotOptions};
pub use window::{validate_window, OperatingWindow};

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use ulid::Ulid;

use crate::notify::Notifier;
use crate::repository::{BookingRepository, Roster};

/// Booking service. Owns no booking state: every call reads through the
/// repository.
///
/// Admission for one room is serialized by that room's mutex, held from the
/// conflict read until the insert (or delete) is durable. Notification fan-out
/// runs after the mutex is released, on tasks tracked by `fanout`.
pub struct Engine {
    repo: Arc<dyn BookingRepository>,
    roster: Arc<dyn Roster>,
    notifier: Arc<dyn Notifier>,
    window: OperatingWindow,
    room_locks: DashMap<Ulid, Arc<Mutex<()>>>,
    fanout: TaskTracker,
}

impl Engine {
    pub fn new(
        repo: Arc<dyn BookingRepository>,
        roster: Arc<dyn Roster>,
        notifier: Arc<dyn Notifier>,
        window: OperatingWindow,
    ) -> Self {
        Self {
            repo,
            roster,
            notifier,
            window,
            room_locks: DashMap::new(),
            fanout: TaskTracker::new(),
        }
    }

    pub fn window(&self) -> OperatingWindow {
        self.window
    }

    fn room_lock(&self, room_id: Ulid) -> Arc<Mutex<()>> {
        self.room_locks.entry(room_id).or_default().clone()
    }

    /// Wait for every notification fan-out spawned so far.
    pub async fn drain_notifications(&self) {
        self.fanout.close();
        self.fanout.wait().await;
        self.fanout.reopen();
    }
}
