use chrono::{Datelike, NaiveDate, NaiveTime, TimeDelta};

use crate::limits::MAX_QUERY_DAYS;
use crate::model::*;

use super::EngineError;

// ── Query range ───────────────────────────────────────────────────

/// Calendar range to compute slots for, in court-local dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityQuery {
    Day(NaiveDate),
    /// `[start, end)`, `end` exclusive.
    Range { start: NaiveDate, end: NaiveDate },
}

impl AvailabilityQuery {
    /// Build a query from optional caller fields. A single date wins over a range.
    pub fn from_parts(
        date: Option<NaiveDate>,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Self, EngineError> {
        match (date, start, end) {
            (Some(day), _, _) => Ok(AvailabilityQuery::Day(day)),
            (None, Some(start), Some(end)) => Self::range(start, end),
            (None, None, None) => Err(EngineError::Validation(
                "either a date or a start and end date is required".into(),
            )),
            _ => Err(EngineError::Validation(
                "a date range needs both a start and an end".into(),
            )),
        }
    }

    pub fn range(start: NaiveDate, end: NaiveDate) -> Result<Self, EngineError> {
        if end <= start {
            return Err(EngineError::Validation(
                "end date must be after start date".into(),
            ));
        }
        Ok(AvailabilityQuery::Range { start, end })
    }

    fn bounds(&self) -> Result<(NaiveDate, NaiveDate), EngineError> {
        match *self {
            AvailabilityQuery::Day(day) => day
                .succ_opt()
                .map(|next| (day, next))
                .ok_or_else(|| EngineError::Validation(format!("date {day} is out of range"))),
            AvailabilityQuery::Range { start, end } => Ok((start, end)),
        }
    }

    /// Every calendar day covered, ascending.
    pub fn days(&self) -> Result<Vec<NaiveDate>, EngineError> {
        let (start, end) = self.bounds()?;
        let count = (end - start).num_days();
        if count <= 0 {
            return Err(EngineError::Validation(
                "end date must be after start date".into(),
            ));
        }
        if count > MAX_QUERY_DAYS {
            return Err(EngineError::Validation(format!(
                "date range too wide: {count} days (max {MAX_QUERY_DAYS})"
            )));
        }
        Ok(start.iter_days().take(count as usize).collect())
    }

    /// The covered range as a court-local span, midnight to midnight.
    pub fn span(&self) -> Result<Span, EngineError> {
        let (start, end) = self.bounds()?;
        Ok(Span::new(
            local_ms(start.and_time(NaiveTime::MIN)),
            local_ms(end.and_time(NaiveTime::MIN)),
        ))
    }
}

// ── Slot Algorithm ────────────────────────────────────────────────

/// 0 = Sunday .. 6 = Saturday.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// Hourly rate scaled to `minutes`, rounded half up. Saturates at `Cents::MAX`.
pub fn prorated_cost(hourly_rate: Cents, minutes: u32) -> Cents {
    let scaled = (u128::from(hourly_rate) * u128::from(minutes) + 30) / 60;
    Cents::try_from(scaled).unwrap_or(Cents::MAX)
}

/// Discretize the court's weekly windows over `days` into fixed-length slots
/// and keep those no active reservation overlaps.
///
/// A trailing piece shorter than `slot_minutes` is dropped. Output is sorted
/// by start; callers hold the court's read lock so all reservation checks see
/// one snapshot.
pub fn compute_slots(court: &CourtState, days: &[NaiveDate], slot_minutes: u32) -> Vec<Slot> {
    let step = TimeDelta::minutes(slot_minutes as i64);
    let cost = prorated_cost(court.hourly_rate, slot_minutes);
    let mut slots = Vec::new();

    for &day in days {
        for window in court.windows_on(day_of_week(day)) {
            let window_end = day.and_time(window.end);
            let mut start = day.and_time(window.start);
            while start + step <= window_end {
                let end = start + step;
                let candidate = Span::new(local_ms(start), local_ms(end));
                if court.active_overlapping(&candidate).next().is_none() {
                    slots.push(Slot {
                        start,
                        end,
                        duration_minutes: slot_minutes,
                        cost,
                    });
                }
                start = end;
            }
        }
    }

    slots.sort_by_key(|s| s.start);
    slots
}
