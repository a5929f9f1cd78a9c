use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Naive local date-time, the only time type. Every stamp shares one implicit
/// zone; nothing in the crate converts between zones.
pub type Stamp = NaiveDateTime;

/// Whole hour of a day, `0..=23`.
pub type HourBucket = u32;

/// Text form written for every stamp the engine produces.
pub const STAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Parse a stored or client-supplied stamp. Accepts `T` or a space between
/// date and time, with or without seconds and fractional seconds.
pub fn parse_stamp(raw: &str) -> Option<Stamp> {
    let text = raw.trim().replacen(' ', "T", 1);
    if text.is_empty() {
        return None;
    }
    NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M"))
        .ok()
        .filter(|stamp| day_in_range(stamp.date()))
}

pub fn format_stamp(stamp: Stamp) -> String {
    stamp.format(STAMP_FORMAT).to_string()
}

/// Whether the midnight ending `date` is representable, so every hour of the
/// day can be addressed.
pub fn day_in_range(date: NaiveDate) -> bool {
    date.succ_opt().is_some()
}

/// Midnight at the start of `date`.
pub fn midnight(date: NaiveDate) -> Stamp {
    date.and_time(NaiveTime::MIN)
}

/// `date` at `hour:00`. Hour 24 is the following midnight. Saturates at the
/// last representable stamp; see [`day_in_range`].
pub fn at_hour(date: NaiveDate, hour: u32) -> Stamp {
    midnight(date)
        .checked_add_signed(TimeDelta::hours(i64::from(hour)))
        .unwrap_or(NaiveDateTime::MAX)
}

fn top_of_hour(stamp: Stamp) -> Stamp {
    at_hour(stamp.date(), stamp.hour())
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Stamp,
    pub end: Stamp,
}

impl Span {
    pub fn new(start: Stamp, end: Stamp) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `[date 00:00, date+1 00:00)`.
    pub fn day(date: NaiveDate) -> Self {
        Self::hours(date, 0, 24)
    }

    /// `[date from:00, date to:00)`; `to` may be 24.
    pub fn hours(date: NaiveDate, from: u32, to: u32) -> Self {
        Self::new(at_hour(date, from), at_hour(date, to))
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn intersection(&self, other: &Span) -> Option<Span> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then(|| Span::new(start, end))
    }

    /// Start of every whole hour the span touches, beginning at the top of the
    /// hour containing `start`.
    pub fn touched_hours(self) -> impl Iterator<Item = Stamp> {
        let end = self.end;
        std::iter::successors(Some(top_of_hour(self.start)), |t| {
            t.checked_add_signed(TimeDelta::hours(1))
        })
        .take_while(move |t| *t < end)
    }
}

/// A bookable physical room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub name: String,
    /// Free-form tag, e.g. "lab" or "auditorium".
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Class {
    pub id: Ulid,
    pub name: String,
}

/// A user known to the roster. Users with a class are its students.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub class_id: Option<Ulid>,
}

/// A stored reservation of one room.
///
/// Stamps are kept as the text the store holds. Rows written by the engine are
/// always well formed, but rows imported from older stores may carry a
/// malformed or missing end; see [`crate::engine::booking_span`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub room_id: Ulid,
    pub user_id: Ulid,
    pub class_id: Option<Ulid>,
    pub title: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub description: Option<String>,
}

impl Booking {
    pub fn start(&self) -> Option<Stamp> {
        parse_stamp(&self.start_time)
    }

    pub fn summary(&self) -> BookingSummary {
        BookingSummary {
            id: self.id,
            room_id: self.room_id,
            title: self.title.clone(),
            start_time: self.start_time.clone(),
            end_time: self.end_time.clone(),
        }
    }
}

/// Client input for a new booking. The id is assigned by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBooking {
    pub room_id: Ulid,
    pub user_id: Ulid,
    pub class_id: Option<Ulid>,
    pub title: String,
    pub start_time: String,
    pub end_time: String,
    pub description: Option<String>,
}

/// Short form of a booking, used in conflict reports and calendar cells.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingSummary {
    pub id: Ulid,
    pub room_id: Ulid,
    pub title: String,
    pub start_time: String,
    pub end_time: Option<String>,
}

/// WAL record format. Flat, one variant per state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated { room: Room },
    RoomUpdated { room: Room },
    ClassCreated { class: Class },
    UserRegistered { user: User },
    BookingCreated { booking: Booking },
    BookingDeleted { id: Ulid, room_id: Ulid },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(s: &str) -> Stamp {
        parse_stamp(s).unwrap()
    }

    #[test]
    fn parse_accepts_space_and_t_separators() {
        let t = stamp("2025-03-10T10:30:00");
        assert_eq!(stamp("2025-03-10 10:30:00"), t);
        assert_eq!(stamp("2025-03-10T10:30"), t);
        assert_eq!(stamp("  2025-03-10 10:30  "), t);
        assert_eq!(stamp("2025-03-10T10:30:00.000"), t);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_stamp("").is_none());
        assert!(parse_stamp("tomorrow").is_none());
        assert!(parse_stamp("2025-03-10").is_none());
        assert!(parse_stamp("2025-02-30T10:00").is_none());
    }

    #[test]
    fn format_is_canonical() {
        assert_eq!(format_stamp(stamp("2025-03-10 09:05")), "2025-03-10T09:05:00");
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(stamp("2025-03-10T10:00"), stamp("2025-03-10T11:00"));
        let b = Span::new(stamp("2025-03-10T10:30"), stamp("2025-03-10T11:30"));
        let c = Span::new(stamp("2025-03-10T11:00"), stamp("2025-03-10T12:00"));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn intersection_clamps_to_both() {
        let day = Span::day(NaiveDate::from_ymd_opt(2025, 3, 10).unwrap());
        let late = Span::new(stamp("2025-03-10T23:00"), stamp("2025-03-11T02:00"));
        assert_eq!(
            day.intersection(&late),
            Some(Span::new(stamp("2025-03-10T23:00"), stamp("2025-03-11T00:00")))
        );
        let next = Span::new(stamp("2025-03-11T00:00"), stamp("2025-03-11T01:00"));
        assert_eq!(day.intersection(&next), None);
    }

    #[test]
    fn day_span_covers_24_hours() {
        let day = Span::day(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert_eq!(day.start, stamp("2024-02-29T00:00"));
        assert_eq!(day.end, stamp("2024-03-01T00:00"));
        assert_eq!(day.duration(), TimeDelta::hours(24));
    }

    #[test]
    fn last_representable_day_does_not_overflow() {
        assert!(day_in_range(NaiveDate::from_ymd_opt(2025, 12, 31).unwrap()));
        assert!(!day_in_range(NaiveDate::MAX));
        assert!(parse_stamp(&format!("{}T10:00", NaiveDate::MAX)).is_none());

        let day = Span::day(NaiveDate::MAX);
        assert_eq!(day.start, midnight(NaiveDate::MAX));
        assert_eq!(day.touched_hours().count(), 24);
    }

    #[test]
    fn touched_hours_aligns_to_top_of_hour() {
        let s = Span::new(stamp("2025-03-10T10:30"), stamp("2025-03-10T12:15"));
        let hours: Vec<u32> = s.touched_hours().map(|t| t.hour()).collect();
        assert_eq!(hours, vec![10, 11, 12]);

        let exact = Span::new(stamp("2025-03-10T10:00"), stamp("2025-03-10T12:00"));
        let hours: Vec<u32> = exact.touched_hours().map(|t| t.hour()).collect();
        assert_eq!(hours, vec![10, 11]);
    }

    #[test]
    fn summary_copies_identity_and_times() {
        let b = Booking {
            id: Ulid::new(),
            room_id: Ulid::new(),
            user_id: Ulid::new(),
            class_id: None,
            title: "Chemistry".into(),
            start_time: "2025-03-10T10:00:00".into(),
            end_time: Some("2025-03-10T11:00:00".into()),
            description: None,
        };
        let s = b.summary();
        assert_eq!(s.id, b.id);
        assert_eq!(s.room_id, b.room_id);
        assert_eq!(s.end_time.as_deref(), Some("2025-03-10T11:00:00"));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            booking: Booking {
                id: Ulid::new(),
                room_id: Ulid::new(),
                user_id: Ulid::new(),
                class_id: Some(Ulid::new()),
                title: "Lab".into(),
                start_time: "2025-03-10T10:00:00".into(),
                end_time: None,
                description: Some("bring goggles".into()),
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
