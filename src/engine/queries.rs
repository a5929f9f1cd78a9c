use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::calendar::{day_timeline, month_view, DayTimeline, EventLabel, MonthView};
use super::normalize::booking_span;
use super::occupancy::{occupied_hours, slot_options, SlotOptions};
use super::{Engine, EngineError};

impl Engine {
    pub async fn list_rooms(&self) -> Result<Vec<Room>, EngineError> {
        Ok(self.repo.list_rooms().await?)
    }

    pub async fn get_room(&self, id: Ulid) -> Result<Room, EngineError> {
        self.repo.get_room(id).await?.ok_or(EngineError::NotFound(id))
    }

    /// Bookings of one room, or of every room, ordered by start.
    pub async fn list_bookings(&self, room_id: Option<Ulid>) -> Result<Vec<Booking>, EngineError> {
        Ok(match room_id {
            Some(id) => self.repo.list_by_room(id).await?,
            None => self.repo.list_all().await?,
        })
    }

    async fn room_bookings(&self, room_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        self.get_room(room_id).await?;
        Ok(self.repo.list_by_room(room_id).await?)
    }

    pub async fn occupancy(&self, room_id: Ulid, date: NaiveDate) -> Result<BTreeSet<HourBucket>, EngineError> {
        check_day(date)?;
        let bookings = self.room_bookings(room_id).await?;
        Ok(occupied_hours(room_id, date, &bookings))
    }

    pub async fn slot_options(
        &self,
        room_id: Ulid,
        date: NaiveDate,
        selected_start: Option<HourBucket>,
    ) -> Result<SlotOptions, EngineError> {
        let occupied = self.occupancy(room_id, date).await?;
        Ok(slot_options(&occupied, &self.window, selected_start))
    }

    /// Every room's bookings bucketed over the month containing `date`.
    pub async fn month_calendar(&self, date: NaiveDate) -> Result<MonthView, EngineError> {
        check_day(date)?;
        let bookings = self.repo.list_all().await?;
        Ok(month_view(&bookings, date))
    }

    /// Per-room hour grid for `date`, labelled with owner and class names.
    pub async fn day_timeline(&self, date: NaiveDate) -> Result<DayTimeline, EngineError> {
        check_day(date)?;
        let rooms = self.repo.list_rooms().await?;
        let visible = self.window.span_on(date);
        let bookings: Vec<Booking> = self
            .repo
            .list_all()
            .await?
            .into_iter()
            .filter(|b| booking_span(b).is_some_and(|s| s.overlaps(&visible)))
            .collect();

        let mut user_names = HashMap::new();
        let mut class_names = HashMap::new();
        for b in &bookings {
            if !user_names.contains_key(&b.user_id) {
                user_names.insert(b.user_id, self.roster.user_name(b.user_id).await?);
            }
            if let Some(class_id) = b.class_id
                && !class_names.contains_key(&class_id)
            {
                class_names.insert(class_id, self.roster.class_name(class_id).await?);
            }
        }

        Ok(day_timeline(&rooms, &bookings, date, &self.window, |b| EventLabel {
            title: b.title.clone(),
            user_name: user_names.get(&b.user_id).cloned().flatten(),
            class_name: b.class_id.and_then(|c| class_names.get(&c).cloned().flatten()),
        }))
    }
}

fn check_day(date: NaiveDate) -> Result<(), EngineError> {
    if day_in_range(date) {
        Ok(())
    } else {
        Err(EngineError::InvalidRange(format!("date {date} out of range")))
    }
}
