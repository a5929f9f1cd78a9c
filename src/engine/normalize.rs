use chrono::TimeDelta;

use crate::model::{parse_stamp, Booking, Span, Stamp};
use crate::observability;

/// Length assumed for a booking whose end is missing, malformed, or not after
/// its start.
pub const DEFAULT_DURATION_HOURS: i64 = 1;

/// The interval a stored booking occupies.
///
/// `None` when the start does not parse; such rows take part in no conflict,
/// occupancy or calendar computation.
pub fn booking_span(booking: &Booking) -> Option<Span> {
    let Some(start) = booking.start() else {
        tracing::warn!(
            "skipping booking {} with unparsable start {:?}",
            booking.id,
            booking.start_time
        );
        metrics::counter!(observability::MALFORMED_BOOKINGS_TOTAL).increment(1);
        return None;
    };
    let end = booking.end_time.as_deref().and_then(parse_stamp);
    normalized_span(start, end)
}

/// `[start, end)` when `end` is after `start`, else `[start, start + 1h)`.
/// `None` only when the default end is not representable.
pub fn normalized_span(start: Stamp, end: Option<Stamp>) -> Option<Span> {
    match end {
        Some(end) if end > start => Some(Span::new(start, end)),
        _ => start
            .checked_add_signed(TimeDelta::hours(DEFAULT_DURATION_HOURS))
            .map(|end| Span::new(start, end)),
    }
}
