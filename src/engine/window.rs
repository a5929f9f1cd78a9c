use std::ops::Range;

use chrono::NaiveDate;

use crate::model::{at_hour, HourBucket, Span, Stamp};

use super::EngineError;

/// Daily hours during which rooms may be booked, `[open_hour, close_hour)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperatingWindow {
    pub open_hour: HourBucket,
    pub close_hour: HourBucket,
}

impl Default for OperatingWindow {
    fn default() -> Self {
        Self { open_hour: 8, close_hour: 21 }
    }
}

impl OperatingWindow {
    /// `None` unless `open < close <= 24`.
    pub fn new(open_hour: HourBucket, close_hour: HourBucket) -> Option<Self> {
        (open_hour < close_hour && close_hour <= 24).then_some(Self { open_hour, close_hour })
    }

    /// Whole hours a booking may start in.
    pub fn hours(&self) -> Range<HourBucket> {
        self.open_hour..self.close_hour
    }

    pub fn span_on(&self, date: NaiveDate) -> Span {
        Span::hours(date, self.open_hour, self.close_hour)
    }
}

/// Reject unless `start < end` and both fall inside the window of the start's
/// own day. A range that runs past midnight always fails.
pub fn validate_window(start: Stamp, end: Stamp, window: &OperatingWindow) -> Result<(), EngineError> {
    if start >= end {
        return Err(EngineError::InvalidRange("start must be before end".into()));
    }
    let day = start.date();
    if start < at_hour(day, window.open_hour) || end > at_hour(day, window.close_hour) {
        return Err(EngineError::OutOfWindow {
            open_hour: window.open_hour,
            close_hour: window.close_hour,
        });
    }
    Ok(())
}
