use std::collections::BTreeSet;

use chrono::{NaiveDate, Timelike};
use serde::Serialize;
use ulid::Ulid;

use crate::model::{Booking, HourBucket, Span};

use super::normalize::booking_span;
use super::window::OperatingWindow;

/// Hours of `date` that any booking of `room_id` touches, even partially.
///
/// Advisory: admission decisions go through the conflict check, never
/// through this set.
pub fn occupied_hours(room_id: Ulid, date: NaiveDate, bookings: &[Booking]) -> BTreeSet<HourBucket> {
    let day = Span::day(date);
    bookings
        .iter()
        .filter(|b| b.room_id == room_id)
        .filter_map(booking_span)
        .filter_map(|span| span.intersection(&day))
        .flat_map(Span::touched_hours)
        .map(|t| t.hour())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotOption {
    pub hour: HourBucket,
    pub available: bool,
}

/// Start and end hour choices for a picker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotOptions {
    /// `open..close`.
    pub starts: Vec<SlotOption>,
    /// `open+1..=close`.
    pub ends: Vec<SlotOption>,
}

pub fn slot_options(
    occupied: &BTreeSet<HourBucket>,
    window: &OperatingWindow,
    selected_start: Option<HourBucket>,
) -> SlotOptions {
    let starts = window
        .hours()
        .map(|hour| SlotOption { hour, available: !occupied.contains(&hour) })
        .collect();

    let scan_from = selected_start.unwrap_or(window.open_hour);
    let ends = (window.open_hour + 1..=window.close_hour)
        .map(|hour| {
            let available = if selected_start.is_some_and(|s| hour <= s) {
                false
            } else {
                // scan_from < hour here, so the range is well formed.
                occupied.range(scan_from..hour).next().is_none()
            };
            SlotOption { hour, available }
        })
        .collect();

    SlotOptions { starts, ends }
}
