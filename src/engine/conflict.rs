use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Half-open overlap test for `[a_start, a_end)` and `[b_start, b_end)`.
///
/// Empty intervals never overlap anything.
pub fn overlaps<T: Ord>(a_start: T, a_end: T, b_start: T, b_end: T) -> bool {
    a_start < a_end && b_start < b_end && a_start < b_end && b_start < a_end
}

pub(crate) fn validate_reservation_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Validation(
            "reservation must end after it starts".into(),
        ));
    }
    if span.duration_ms() > MAX_RESERVATION_MS {
        return Err(EngineError::Validation("reservation too long".into()));
    }
    Ok(())
}

/// Reject `span` if any active reservation on the court overlaps it.
pub(crate) fn check_no_conflict(court: &CourtState, span: &Span) -> Result<(), EngineError> {
    match court.active_overlapping(span).next() {
        Some(existing) => Err(EngineError::Conflict(format!(
            "overlaps reservation {}",
            existing.id
        ))),
        None => Ok(()),
    }
}
