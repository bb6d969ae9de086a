use std::time::Instant;

use ulid::Ulid;

use crate::model::*;
use crate::observability::*;

use super::availability::{compute_slots, AvailabilityQuery};
use super::{Engine, EngineError, WaitlistEntry};

impl Engine {
    /// Open, unreserved slots on a court for the queried day or range.
    ///
    /// Slots and the returned reservations come from one read-locked snapshot
    /// of the court, so a concurrent booking shows up in both or neither.
    pub async fn compute_available_slots(
        &self,
        court_id: Ulid,
        query: AvailabilityQuery,
    ) -> Result<AvailabilityReport, EngineError> {
        let started = Instant::now();
        let result = self.available_slots_snapshot(court_id, query).await;
        metrics::counter!(AVAILABILITY_QUERIES_TOTAL, "outcome" => outcome_label(&result)).increment(1);
        metrics::histogram!(AVAILABILITY_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        result
    }

    async fn available_slots_snapshot(
        &self,
        court_id: Ulid,
        query: AvailabilityQuery,
    ) -> Result<AvailabilityReport, EngineError> {
        let days = query.days()?;
        let span = query.span()?;
        let court = self.read_court(&court_id).await?;
        if !court.is_bookable {
            return Err(EngineError::Validation("court is not bookable".into()));
        }

        let slots = compute_slots(&court, &days, self.config.slot_minutes);
        let reservations: Vec<Reservation> = court.active_overlapping(&span).cloned().collect();
        tracing::debug!(
            %court_id,
            days = days.len(),
            slots = slots.len(),
            reservations = reservations.len(),
            "availability computed"
        );
        Ok(AvailabilityReport {
            slots,
            reservations,
        })
    }

    // ── Activities ───────────────────────────────────────────

    pub async fn get_activity(&self, id: Ulid) -> Result<ActivityInfo, EngineError> {
        let state = self.read_activity(&id).await?;
        Ok(ActivityInfo {
            id: state.id,
            organizer_id: state.organizer_id,
            capacity: state.capacity,
            skill_min: state.skill_min,
            skill_max: state.skill_max,
            status: state.status,
            joined_count: state.joined_count,
            waitlist_len: state.waitlist.len(),
        })
    }

    /// Every membership row, including departed ones, oldest join first.
    pub async fn participants(&self, activity_id: Ulid) -> Result<Vec<Participant>, EngineError> {
        let state = self.read_activity(&activity_id).await?;
        let mut rows: Vec<Participant> = state.participants.values().cloned().collect();
        rows.sort_by_key(|p| (p.joined_at, p.user_id));
        Ok(rows)
    }

    /// Currently joined participants.
    pub async fn roster(&self, activity_id: Ulid) -> Result<Vec<Participant>, EngineError> {
        let state = self.read_activity(&activity_id).await?;
        Ok(state.roster())
    }

    /// Waitlist in position order.
    pub async fn waitlist(&self, activity_id: Ulid) -> Result<Vec<WaitlistEntry>, EngineError> {
        let state = self.read_activity(&activity_id).await?;
        Ok(state.waitlist.iter().cloned().collect())
    }

    pub fn get_user(&self, id: Ulid) -> Result<UserProfile, EngineError> {
        self.store.user(&id).ok_or(EngineError::NotFound("user", id))
    }

    /// Re-derive the roster invariants from the stored rows.
    ///
    /// Returns `Internal` on the first violation; reaching one means a bug in
    /// the transition logic, not bad input.
    pub async fn check_invariants(&self, activity_id: Ulid) -> Result<(), EngineError> {
        let state = self.read_activity(&activity_id).await?;
        let result = verify_activity(&state);
        if let Err(e) = &result {
            tracing::warn!(%activity_id, "roster invariant violated: {e}");
        }
        result
    }

    // ── Courts ───────────────────────────────────────────────

    pub async fn get_court(&self, id: Ulid) -> Result<CourtInfo, EngineError> {
        let court = self.read_court(&id).await?;
        Ok(CourtInfo {
            id: court.id,
            name: court.name.clone(),
            is_bookable: court.is_bookable,
            hourly_rate: court.hourly_rate,
            window_count: court.windows.len(),
        })
    }

    /// Weekly windows ordered by weekday, then start time.
    pub async fn windows(&self, court_id: Ulid) -> Result<Vec<AvailabilityWindow>, EngineError> {
        let court = self.read_court(&court_id).await?;
        Ok(court.windows.clone())
    }

    /// Reservations on a court by start time, cancelled ones included.
    /// With `within`, only those overlapping it.
    pub async fn list_reservations(
        &self,
        court_id: Ulid,
        within: Option<Span>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let court = self.read_court(&court_id).await?;
        Ok(court
            .reservations
            .iter()
            .filter(|r| within.is_none_or(|w| r.span.overlaps(&w)))
            .cloned()
            .collect())
    }
}

fn verify_activity(state: &ActivityState) -> Result<(), EngineError> {
    let joined = state
        .participants
        .values()
        .filter(|p| p.status == ParticipantStatus::Joined)
        .count() as u32;
    if joined != state.joined_count {
        return Err(EngineError::Internal(format!(
            "joined count {} does not match {joined} joined rows",
            state.joined_count
        )));
    }
    if joined > state.capacity {
        return Err(EngineError::Internal(format!(
            "{joined} joined exceeds capacity {}",
            state.capacity
        )));
    }
    state.waitlist.verify()?;
    if let Some(entry) = state.waitlist.iter().find(|e| state.is_joined(&e.user_id)) {
        return Err(EngineError::Internal(format!(
            "user {} is both joined and waitlisted",
            entry.user_id
        )));
    }
    if !state.waitlist.is_empty() && joined < state.capacity {
        return Err(EngineError::Internal(
            "waitlist is non-empty while seats are free".into(),
        ));
    }
    Ok(())
}
