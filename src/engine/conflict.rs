use ulid::Ulid;

use crate::model::{Booking, BookingSummary, Span};

use super::normalize::booking_span;

/// Bookings of `room_id` paired with their normalized intervals.
fn same_room(room_id: Ulid, existing: &[Booking]) -> impl Iterator<Item = (&Booking, Span)> {
    existing
        .iter()
        .filter(move |b| b.room_id == room_id)
        .filter_map(|b| booking_span(b).map(|span| (b, span)))
}

/// Whether `candidate` overlaps any booking of `room_id`. Stops at the first hit.
pub fn has_conflict(room_id: Ulid, candidate: &Span, existing: &[Booking]) -> bool {
    same_room(room_id, existing).any(|(_, span)| span.overlaps(candidate))
}

/// Every booking of `room_id` that `candidate` overlaps, in input order.
pub fn conflicts(room_id: Ulid, candidate: &Span, existing: &[Booking]) -> Vec<BookingSummary> {
    same_room(room_id, existing)
        .filter(|(_, span)| span.overlaps(candidate))
        .map(|(b, _)| b.summary())
        .collect()
}
