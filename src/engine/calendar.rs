//! Month grid and per-room day timeline, projected from a plain booking list.
//!
//! Both views are rebuilt from scratch on every call and hold no state
//! between calls.

use std::collections::{BTreeMap, HashSet};

use chrono::{Datelike, Days, NaiveDate};
use serde::Serialize;
use ulid::Ulid;

use crate::model::{Booking, BookingSummary, HourBucket, Room, Span};

use super::normalize::booking_span;
use super::window::OperatingWindow;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarDay {
    pub date: NaiveDate,
    /// Zero-based row in a Sunday-first grid.
    pub week_row: u32,
    /// 0 = Sunday.
    pub weekday: u32,
    /// Bookings starting on this date, ordered by start.
    pub bookings: Vec<BookingSummary>,
}

impl CalendarDay {
    pub fn count(&self) -> usize {
        self.bookings.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthView {
    pub year: i32,
    pub month: u32,
    /// Empty grid cells before the 1st.
    pub leading_blanks: u32,
    pub days: Vec<CalendarDay>,
}

/// Bucket bookings by start date across the month containing `date`.
pub fn month_view(bookings: &[Booking], date: NaiveDate) -> MonthView {
    let first = date - Days::new(u64::from(date.day0()));
    let leading_blanks = first.weekday().num_days_from_sunday();

    let mut by_day: BTreeMap<NaiveDate, Vec<(Span, BookingSummary)>> = BTreeMap::new();
    for booking in bookings {
        let Some(span) = booking_span(booking) else { continue };
        let day = span.start.date();
        if day.year() == first.year() && day.month() == first.month() {
            by_day.entry(day).or_default().push((span, booking.summary()));
        }
    }

    let days = first
        .iter_days()
        .take_while(|d| d.month() == first.month())
        .map(|d| {
            let slot = leading_blanks + d.day0();
            let mut entries = by_day.remove(&d).unwrap_or_default();
            entries.sort_by(|(a, x), (b, y)| a.start.cmp(&b.start).then(x.id.cmp(&y.id)));
            CalendarDay {
                date: d,
                week_row: slot / 7,
                weekday: slot % 7,
                bookings: entries.into_iter().map(|(_, s)| s).collect(),
            }
        })
        .collect();

    MonthView { year: first.year(), month: first.month(), leading_blanks, days }
}

/// What a timeline shows for a booking, on its first occupied cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventLabel {
    pub title: String,
    pub user_name: Option<String>,
    pub class_name: Option<String>,
}

/// A booking's presence in one cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineEntry {
    pub booking_id: Ulid,
    /// Set on the booking's first occupied cell only.
    pub label: Option<EventLabel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineCell {
    pub hour: HourBucket,
    /// Bookings intersecting this hour, by start then id.
    pub entries: Vec<TimelineEntry>,
}

impl TimelineCell {
    pub fn is_occupied(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn booking_ids(&self) -> impl Iterator<Item = Ulid> + '_ {
        self.entries.iter().map(|e| e.booking_id)
    }

    pub fn labels(&self) -> impl Iterator<Item = &EventLabel> {
        self.entries.iter().filter_map(|e| e.label.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineRow {
    pub room: Room,
    pub cells: Vec<TimelineCell>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayTimeline {
    pub date: NaiveDate,
    pub rows: Vec<TimelineRow>,
}

/// One row per room, one cell per window hour of `date`.
///
/// A cell lists every booking whose interval intersects it. `label` is called
/// once per booking, for its first intersecting cell.
pub fn day_timeline(
    rooms: &[Room],
    bookings: &[Booking],
    date: NaiveDate,
    window: &OperatingWindow,
    label: impl Fn(&Booking) -> EventLabel,
) -> DayTimeline {
    let visible = window.span_on(date);
    let mut spans: Vec<(Span, &Booking)> = bookings
        .iter()
        .filter_map(|b| booking_span(b).map(|s| (s, b)))
        .filter(|(s, _)| s.overlaps(&visible))
        .collect();
    spans.sort_by(|(a, x), (b, y)| a.start.cmp(&b.start).then(x.id.cmp(&y.id)));

    let rows = rooms
        .iter()
        .map(|room| {
            let mut labelled = HashSet::new();
            let cells = window
                .hours()
                .map(|hour| {
                    let cell = Span::hours(date, hour, hour + 1);
                    let entries = spans
                        .iter()
                        .filter(|(s, b)| b.room_id == room.id && s.overlaps(&cell))
                        .map(|(_, b)| TimelineEntry {
                            booking_id: b.id,
                            label: labelled.insert(b.id).then(|| label(b)),
                        })
                        .collect();
                    TimelineCell { hour, entries }
                })
                .collect();
            TimelineRow { room: room.clone(), cells }
        })
        .collect();

    DayTimeline { date, rows }
}
