//! Roster transitions as pure planners.
//!
//! Each planner checks preconditions against a locked `ActivityState` in a
//! fixed order (first failure wins) and returns the single event that commits
//! the transition. Nothing here mutates state; the caller persists the event
//! and applies it under the same lock.

use ulid::Ulid;

use crate::limits::MAX_WAITLIST_LEN;
use crate::model::*;

use super::waitlist::plan_promotion;
use super::EngineError;

pub(crate) fn plan_join(
    state: &ActivityState,
    user_id: Ulid,
    skill_level: Option<SkillLevel>,
    now: Ms,
) -> Result<(Event, JoinOutcome), EngineError> {
    if state.status != ActivityStatus::Scheduled {
        return Err(EngineError::State("activity is not open for joining"));
    }
    if state.is_joined(&user_id) {
        return Err(EngineError::Conflict("already joined".into()));
    }
    if state.waitlist.contains(&user_id) {
        return Err(EngineError::Conflict("already waitlisted".into()));
    }
    let skill = skill_level.ok_or(EngineError::NotFound("user", user_id))?;
    if !state.accepts_skill(skill) {
        return Err(EngineError::Validation(format!(
            "skill level {skill} is outside the allowed range {}..={}",
            state.skill_min, state.skill_max
        )));
    }

    if !state.is_full() {
        let event = Event::ParticipantJoined {
            activity_id: state.id,
            user_id,
            at: now,
        };
        return Ok((event, JoinOutcome::Joined));
    }

    if state.waitlist.len() >= MAX_WAITLIST_LEN {
        return Err(EngineError::Validation("waitlist is full".into()));
    }
    let position = state.waitlist.next_position();
    let event = Event::Waitlisted {
        activity_id: state.id,
        user_id,
        position,
        at: now,
    };
    Ok((event, JoinOutcome::Waitlisted { position }))
}

pub(crate) fn plan_leave(
    state: &ActivityState,
    user_id: Ulid,
    now: Ms,
) -> Result<(Event, LeaveOutcome), EngineError> {
    if !state.is_joined(&user_id) {
        return Err(EngineError::State("not a participant"));
    }
    if state.status != ActivityStatus::Scheduled {
        return Err(EngineError::State("activity has already started"));
    }
    if user_id == state.organizer_id {
        return Err(EngineError::Authorization("organizer cannot leave own activity"));
    }

    let promoted = plan_promotion(state)?;
    let event = Event::ParticipantRemoved {
        activity_id: state.id,
        user_id,
        kicked_by: None,
        promoted,
        at: now,
    };
    Ok((event, LeaveOutcome { promoted }))
}

pub(crate) fn plan_kick(
    state: &ActivityState,
    requester_id: Ulid,
    target_id: Ulid,
    now: Ms,
) -> Result<(Event, KickOutcome), EngineError> {
    if requester_id != state.organizer_id {
        return Err(EngineError::Authorization("only the organizer can remove participants"));
    }
    if state.status != ActivityStatus::Scheduled {
        return Err(EngineError::State("activity has already started"));
    }
    if !state.is_joined(&target_id) {
        return Err(EngineError::NotFound("participant", target_id));
    }
    if target_id == state.organizer_id {
        return Err(EngineError::Authorization("organizer cannot remove themselves"));
    }

    let promoted = plan_promotion(state)?;
    let event = Event::ParticipantRemoved {
        activity_id: state.id,
        user_id: target_id,
        kicked_by: Some(requester_id),
        promoted,
        at: now,
    };
    Ok((event, KickOutcome { promoted }))
}

pub(crate) fn plan_withdraw(
    state: &ActivityState,
    user_id: Ulid,
) -> Result<(Event, WaitlistWithdrawal), EngineError> {
    let Some(former_position) = state.waitlist.position_of(&user_id) else {
        return Err(EngineError::State("not on the waitlist"));
    };
    if state.status != ActivityStatus::Scheduled {
        return Err(EngineError::State("activity has already started"));
    }
    let event = Event::WaitlistWithdrawn {
        activity_id: state.id,
        user_id,
    };
    Ok((event, WaitlistWithdrawal { former_position }))
}
