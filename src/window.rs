//! Dispatch windows
//!
//! A window is the half-open interval `[start, end)` of reminder times that one
//! dispatch tick is responsible for. Windows are aligned to the dispatch period,
//! counted from the Unix epoch, so consecutive periods never overlap.

use chrono::DurationRound;
use chrono::RoundingError;
use chrono::TimeDelta;
use chrono::naive::NaiveDateTime;

/// Half-open interval of due reminder times
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchWindow {
    /// Inclusive lower bound
    pub start: NaiveDateTime,

    /// Exclusive upper bound
    pub end: NaiveDateTime,
}

impl DispatchWindow {
    /// The window of `period` length that `now` falls in
    ///
    /// # Errors
    ///
    /// Will return `Err` when the period is not positive or does not fit the
    /// representable time range
    pub fn containing(now: NaiveDateTime, period: TimeDelta) -> Result<Self, RoundingError> {
        let start = now.duration_trunc(period)?;
        let end = start
            .checked_add_signed(period)
            .ok_or(RoundingError::TimestampExceedsLimit)?;

        Ok(Self { start, end })
    }

    /// Does the instant fall in this window?
    pub fn contains(&self, instant: &NaiveDateTime) -> bool {
        &self.start <= instant && instant < &self.end
    }
}
