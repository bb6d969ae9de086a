use chrono::{NaiveDateTime, NaiveTime};
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::*;

use super::conflict::{check_no_conflict, now_ms, overlaps, validate_reservation_span};
use super::roster;
use super::{Engine, EngineError, WalCommand};

/// Count a roster operation by outcome. Successful promotions are counted
/// separately by their trigger.
fn record_roster_op<T>(op: &'static str, result: &Result<T, EngineError>) {
    metrics::counter!(ROSTER_OPS_TOTAL, "op" => op, "outcome" => outcome_label(result)).increment(1);
    if let Err(e) = result {
        tracing::debug!(op, kind = e.kind(), "roster operation rejected: {e}");
    }
}

fn record_promotion(trigger: &'static str, activity_id: Ulid, promoted: Option<Ulid>) {
    if let Some(user_id) = promoted {
        metrics::counter!(PROMOTIONS_TOTAL, "trigger" => trigger).increment(1);
        tracing::info!(%activity_id, %user_id, trigger, "promoted from waitlist");
    }
}

impl Engine {
    // ── Users ────────────────────────────────────────────────

    /// Create or replace the profile the roster reads skill levels from.
    pub async fn upsert_user(&self, id: Ulid, skill_level: SkillLevel) -> Result<(), EngineError> {
        let _permit = self.lock_for_create("user", id).await?;
        self.commit_top_level(Event::UserUpserted { id, skill_level }).await
    }

    // ── Activities ───────────────────────────────────────────

    pub async fn create_activity(
        &self,
        id: Ulid,
        organizer_id: Ulid,
        capacity: u32,
        skill_min: SkillLevel,
        skill_max: SkillLevel,
    ) -> Result<(), EngineError> {
        if capacity == 0 {
            return Err(EngineError::Validation("capacity must be at least 1".into()));
        }
        if capacity > MAX_ACTIVITY_CAPACITY {
            return Err(EngineError::Validation(format!(
                "capacity {capacity} exceeds the maximum of {MAX_ACTIVITY_CAPACITY}"
            )));
        }
        if skill_min > skill_max {
            return Err(EngineError::Validation(format!(
                "skill range {skill_min}..={skill_max} is empty"
            )));
        }

        let _permit = self.lock_for_create("activity", id).await?;
        if self.store.contains_activity(&id) {
            return Err(EngineError::Conflict(format!("activity {id} already exists")));
        }
        if self.store.activity_count() >= MAX_ACTIVITIES {
            return Err(EngineError::Validation("too many activities".into()));
        }

        self.commit_top_level(Event::ActivityCreated {
            id,
            organizer_id,
            capacity,
            skill_min,
            skill_max,
        })
        .await?;
        tracing::debug!(activity_id = %id, %organizer_id, capacity, "activity created");
        Ok(())
    }

    /// Advance the activity lifecycle. Roster changes are only accepted while Scheduled.
    pub async fn set_activity_status(&self, id: Ulid, status: ActivityStatus) -> Result<(), EngineError> {
        let mut state = self.lock_activity(&id).await?;
        if !state.status.can_transition_to(status) {
            return Err(EngineError::State("invalid activity status transition"));
        }
        self.commit_activity(&mut state, Event::ActivityStatusChanged { id, status })
            .await?;
        tracing::info!(activity_id = %id, status = status.as_str(), "activity status changed");
        Ok(())
    }

    // ── Roster ───────────────────────────────────────────────

    /// Join the activity, or take the next waitlist position when it is full.
    pub async fn join(&self, activity_id: Ulid, user_id: Ulid) -> Result<JoinOutcome, EngineError> {
        let result = self.join_locked(activity_id, user_id).await;
        record_roster_op("join", &result);
        result
    }

    async fn join_locked(&self, activity_id: Ulid, user_id: Ulid) -> Result<JoinOutcome, EngineError> {
        let mut state = self.lock_activity(&activity_id).await?;
        let skill = self.store.user(&user_id).map(|u| u.skill_level);
        let (event, outcome) = roster::plan_join(&state, user_id, skill, now_ms())?;
        self.commit_activity(&mut state, event).await?;
        tracing::debug!(%activity_id, %user_id, ?outcome, "join committed");
        Ok(outcome)
    }

    /// Leave the activity. The waitlist head, if any, takes the freed place
    /// in the same commit.
    pub async fn leave(&self, activity_id: Ulid, user_id: Ulid) -> Result<LeaveOutcome, EngineError> {
        let result = self.leave_locked(activity_id, user_id).await;
        record_roster_op("leave", &result);
        if let Ok(outcome) = &result {
            record_promotion("leave", activity_id, outcome.promoted);
        }
        result
    }

    async fn leave_locked(&self, activity_id: Ulid, user_id: Ulid) -> Result<LeaveOutcome, EngineError> {
        let mut state = self.lock_activity(&activity_id).await?;
        let (event, outcome) = roster::plan_leave(&state, user_id, now_ms())?;
        self.commit_activity(&mut state, event).await?;
        tracing::debug!(%activity_id, %user_id, "leave committed");
        Ok(outcome)
    }

    /// Organizer removes a joined participant; promotion as for `leave`.
    pub async fn kick(
        &self,
        activity_id: Ulid,
        requester_id: Ulid,
        target_id: Ulid,
    ) -> Result<KickOutcome, EngineError> {
        let result = self.kick_locked(activity_id, requester_id, target_id).await;
        record_roster_op("kick", &result);
        if let Ok(outcome) = &result {
            record_promotion("kick", activity_id, outcome.promoted);
        }
        result
    }

    async fn kick_locked(
        &self,
        activity_id: Ulid,
        requester_id: Ulid,
        target_id: Ulid,
    ) -> Result<KickOutcome, EngineError> {
        let mut state = self.lock_activity(&activity_id).await?;
        let (event, outcome) = roster::plan_kick(&state, requester_id, target_id, now_ms())?;
        self.commit_activity(&mut state, event).await?;
        tracing::info!(%activity_id, %requester_id, %target_id, "participant removed by organizer");
        Ok(outcome)
    }

    /// Drop off the waitlist; everyone behind moves up one position.
    pub async fn leave_waitlist(
        &self,
        activity_id: Ulid,
        user_id: Ulid,
    ) -> Result<WaitlistWithdrawal, EngineError> {
        let result = async {
            let mut state = self.lock_activity(&activity_id).await?;
            let (event, outcome) = roster::plan_withdraw(&state, user_id)?;
            self.commit_activity(&mut state, event).await?;
            Ok::<_, EngineError>(outcome)
        }
        .await;
        record_roster_op("leave_waitlist", &result);
        result
    }

    // ── Courts ───────────────────────────────────────────────

    pub async fn create_court(
        &self,
        id: Ulid,
        name: Option<String>,
        is_bookable: bool,
        hourly_rate: Cents,
    ) -> Result<(), EngineError> {
        validate_court_name(name.as_deref())?;
        let _permit = self.lock_for_create("court", id).await?;
        if self.store.contains_court(&id) {
            return Err(EngineError::Conflict(format!("court {id} already exists")));
        }
        if self.store.court_count() >= MAX_COURTS {
            return Err(EngineError::Validation("too many courts".into()));
        }
        self.commit_top_level(Event::CourtCreated {
            id,
            name,
            is_bookable,
            hourly_rate,
        })
        .await
    }

    /// Replace a court's name, bookable flag and rate. Existing reservations are untouched.
    pub async fn update_court(
        &self,
        id: Ulid,
        name: Option<String>,
        is_bookable: bool,
        hourly_rate: Cents,
    ) -> Result<(), EngineError> {
        validate_court_name(name.as_deref())?;
        let mut court = self.lock_court(&id).await?;
        let event = Event::CourtUpdated {
            id,
            name,
            is_bookable,
            hourly_rate,
        };
        self.commit_court(&mut court, event).await
    }

    /// Add a weekly opening window. Windows may not cross midnight or overlap
    /// another window on the same weekday.
    pub async fn add_window(
        &self,
        id: Ulid,
        court_id: Ulid,
        day_of_week: u8,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<(), EngineError> {
        if day_of_week > 6 {
            return Err(EngineError::Validation(format!(
                "day_of_week must be 0..=6, got {day_of_week}"
            )));
        }
        if start >= end {
            return Err(EngineError::Validation(
                "window must end after it starts on the same day".into(),
            ));
        }

        let mut court = self.lock_court(&court_id).await?;
        if self.store.court_for_entity(&id).is_some() {
            return Err(EngineError::Conflict(format!("window {id} already exists")));
        }
        if court.windows.len() >= MAX_WINDOWS_PER_COURT {
            return Err(EngineError::Validation("too many windows on court".into()));
        }
        if let Some(existing) = court
            .windows_on(day_of_week)
            .find(|w| overlaps(w.start, w.end, start, end))
        {
            return Err(EngineError::Validation(format!(
                "window overlaps window {}",
                existing.id
            )));
        }

        let event = Event::WindowAdded {
            id,
            court_id,
            day_of_week,
            start,
            end,
        };
        self.commit_court(&mut court, event).await
    }

    /// Remove a window; returns the court it belonged to.
    pub async fn remove_window(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let court_id = self
            .store
            .court_for_entity(&id)
            .ok_or(EngineError::NotFound("window", id))?;
        let mut court = self.lock_court(&court_id).await?;
        if !court.windows.iter().any(|w| w.id == id) {
            return Err(EngineError::NotFound("window", id));
        }
        self.commit_court(&mut court, Event::WindowRemoved { id, court_id })
            .await?;
        Ok(court_id)
    }

    // ── Reservations ─────────────────────────────────────────

    /// Book `[start, end)` in court-local time. The conflict check and the
    /// insert happen under one court lock, so two overlapping requests can
    /// never both succeed.
    pub async fn place_reservation(
        &self,
        id: Ulid,
        court_id: Ulid,
        start: NaiveDateTime,
        end: NaiveDateTime,
        status: ReservationStatus,
        label: Option<String>,
    ) -> Result<(), EngineError> {
        if !status.is_active() {
            return Err(EngineError::Validation(
                "a reservation must be placed as pending or confirmed".into(),
            ));
        }
        if let Some(ref l) = label
            && l.len() > MAX_LABEL_LEN
        {
            return Err(EngineError::Validation("reservation label too long".into()));
        }
        let span = Span {
            start: local_ms(start),
            end: local_ms(end),
        };
        validate_reservation_span(&span)?;

        let mut court = self.lock_court(&court_id).await?;
        if !court.is_bookable {
            return Err(EngineError::Validation("court is not bookable".into()));
        }
        if self.store.court_for_entity(&id).is_some() {
            return Err(EngineError::Conflict(format!("reservation {id} already exists")));
        }
        if court.reservations.len() >= MAX_RESERVATIONS_PER_COURT {
            return Err(EngineError::Validation("too many reservations on court".into()));
        }
        check_no_conflict(&court, &span)?;

        let event = Event::ReservationPlaced {
            id,
            court_id,
            span,
            status,
            label,
        };
        self.commit_court(&mut court, event).await?;
        tracing::debug!(reservation_id = %id, %court_id, %start, %end, "reservation placed");
        Ok(())
    }

    /// Pending → Confirmed. Returns the court id.
    pub async fn confirm_reservation(&self, id: Ulid) -> Result<Ulid, EngineError> {
        self.change_reservation_status(id, ReservationStatus::Confirmed, |current| {
            if current == ReservationStatus::Pending {
                Ok(())
            } else {
                Err(EngineError::State("reservation is not pending"))
            }
        })
        .await
    }

    /// Cancel a pending or confirmed reservation; its time becomes free again.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Ulid, EngineError> {
        self.change_reservation_status(id, ReservationStatus::Cancelled, |current| {
            if current.is_active() {
                Ok(())
            } else {
                Err(EngineError::State("reservation is already cancelled"))
            }
        })
        .await
    }

    async fn change_reservation_status(
        &self,
        id: Ulid,
        status: ReservationStatus,
        allowed: impl FnOnce(ReservationStatus) -> Result<(), EngineError>,
    ) -> Result<Ulid, EngineError> {
        let court_id = self
            .store
            .court_for_entity(&id)
            .ok_or(EngineError::NotFound("reservation", id))?;
        let mut court = self.lock_court(&court_id).await?;
        let current = court
            .reservation(&id)
            .map(|r| r.status)
            .ok_or(EngineError::NotFound("reservation", id))?;
        allowed(current)?;
        self.commit_court(
            &mut court,
            Event::ReservationStatusChanged {
                id,
                court_id,
                status,
            },
        )
        .await?;
        Ok(court_id)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL as the minimal event sequence that rebuilds current state.
    ///
    /// Holds the commit gate exclusively, so no transaction is between its
    /// append and its apply while the snapshot is taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self
            .bounded("wal", Ulid::nil(), self.commit_gate.write())
            .await?;

        let mut events: Vec<Event> = self
            .store
            .users()
            .into_iter()
            .map(|u| Event::UserUpserted {
                id: u.id,
                skill_level: u.skill_level,
            })
            .collect();
        for id in self.store.activity_ids() {
            if let Some(shared) = self.store.get_activity(&id) {
                activity_snapshot(&*shared.read().await, &mut events);
            }
        }
        for id in self.store.court_ids() {
            if let Some(shared) = self.store.get_court(&id) {
                court_snapshot(&*shared.read().await, &mut events);
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Internal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Internal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Internal(format!("WAL compaction failed: {e}")))?;

        tracing::info!(events = count, "WAL compacted");
        Ok(())
    }

    /// Compact once the WAL has grown past the configured threshold.
    pub async fn maybe_compact(&self) -> Result<bool, EngineError> {
        if self.wal_appends_since_compact().await < self.config.compact_threshold {
            return Ok(false);
        }
        self.compact_wal().await?;
        Ok(true)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn validate_court_name(name: Option<&str>) -> Result<(), EngineError> {
    match name {
        Some(n) if n.len() > MAX_NAME_LEN => Err(EngineError::Validation("court name too long".into())),
        _ => Ok(()),
    }
}

/// Events that rebuild one activity: membership rows in join order, then the
/// waitlist in position order, then the lifecycle status.
fn activity_snapshot(state: &ActivityState, events: &mut Vec<Event>) {
    events.push(Event::ActivityCreated {
        id: state.id,
        organizer_id: state.organizer_id,
        capacity: state.capacity,
        skill_min: state.skill_min,
        skill_max: state.skill_max,
    });

    let mut rows: Vec<&Participant> = state.participants.values().collect();
    rows.sort_by_key(|p| (p.joined_at, p.user_id));
    for row in rows {
        events.push(Event::ParticipantJoined {
            activity_id: state.id,
            user_id: row.user_id,
            at: row.joined_at,
        });
        if row.status != ParticipantStatus::Joined {
            events.push(Event::ParticipantRemoved {
                activity_id: state.id,
                user_id: row.user_id,
                kicked_by: row.removed_by,
                promoted: None,
                at: row.left_at.unwrap_or(row.joined_at),
            });
        }
    }

    for entry in state.waitlist.iter() {
        events.push(Event::Waitlisted {
            activity_id: state.id,
            user_id: entry.user_id,
            position: entry.position,
            at: entry.added_at,
        });
    }

    if state.status != ActivityStatus::Scheduled {
        events.push(Event::ActivityStatusChanged {
            id: state.id,
            status: state.status,
        });
    }
}

fn court_snapshot(court: &CourtState, events: &mut Vec<Event>) {
    events.push(Event::CourtCreated {
        id: court.id,
        name: court.name.clone(),
        is_bookable: court.is_bookable,
        hourly_rate: court.hourly_rate,
    });
    for w in &court.windows {
        events.push(Event::WindowAdded {
            id: w.id,
            court_id: court.id,
            day_of_week: w.day_of_week,
            start: w.start,
            end: w.end,
        });
    }
    for r in &court.reservations {
        events.push(Event::ReservationPlaced {
            id: r.id,
            court_id: court.id,
            span: r.span,
            status: r.status,
            label: r.label.clone(),
        });
    }
}
