use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::Waitlist;

/// Milliseconds. The only instant type inside the engine.
///
/// Audit stamps are wall-clock unix ms. Court calendars use court-local ms:
/// a naive local date-time read as if it were UTC (see [`local_ms`]).
pub type Ms = i64;

/// Player skill rating used for eligibility checks.
pub type SkillLevel = u8;

/// Money in minor currency units.
pub type Cents = u64;

pub const MINUTE_MS: Ms = 60_000;

/// Court-local date-time → court-local ms.
pub fn local_ms(dt: NaiveDateTime) -> Ms {
    dt.and_utc().timestamp_millis()
}

/// Inverse of [`local_ms`]. `None` only for out-of-range values.
pub fn from_local_ms(ms: Ms) -> Option<NaiveDateTime> {
    DateTime::from_timestamp_millis(ms).map(|dt| dt.naive_utc())
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        crate::engine::overlaps(self.start, self.end, other.start, other.end)
    }
}

// ── Activities ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Scheduled => "scheduled",
            ActivityStatus::InProgress => "in_progress",
            ActivityStatus::Completed => "completed",
            ActivityStatus::Cancelled => "cancelled",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ActivityStatus) -> bool {
        use ActivityStatus::*;
        matches!(
            (self, next),
            (Scheduled, InProgress) | (Scheduled, Cancelled) | (InProgress, Completed) | (InProgress, Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantStatus {
    Joined,
    Left,
    Kicked,
}

/// Membership row for one (activity, user) pair. Updated in place, never deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: Ulid,
    pub status: ParticipantStatus,
    pub joined_at: Ms,
    pub left_at: Option<Ms>,
    /// Organizer who kicked this participant, if any.
    pub removed_by: Option<Ulid>,
}

#[derive(Debug, Clone)]
pub struct ActivityState {
    pub id: Ulid,
    pub organizer_id: Ulid,
    /// Max concurrently joined participants.
    pub capacity: u32,
    pub skill_min: SkillLevel,
    pub skill_max: SkillLevel,
    pub status: ActivityStatus,
    pub participants: HashMap<Ulid, Participant>,
    /// Cached count of rows with status Joined.
    pub joined_count: u32,
    pub waitlist: Waitlist,
}

impl ActivityState {
    pub fn new(
        id: Ulid,
        organizer_id: Ulid,
        capacity: u32,
        skill_min: SkillLevel,
        skill_max: SkillLevel,
    ) -> Self {
        Self {
            id,
            organizer_id,
            capacity,
            skill_min,
            skill_max,
            status: ActivityStatus::Scheduled,
            participants: HashMap::new(),
            joined_count: 0,
            waitlist: Waitlist::default(),
        }
    }

    pub fn is_joined(&self, user_id: &Ulid) -> bool {
        self.participants
            .get(user_id)
            .is_some_and(|p| p.status == ParticipantStatus::Joined)
    }

    pub fn is_full(&self) -> bool {
        self.joined_count >= self.capacity
    }

    pub fn accepts_skill(&self, level: SkillLevel) -> bool {
        (self.skill_min..=self.skill_max).contains(&level)
    }

    /// Insert or reactivate the participant row as Joined.
    pub fn mark_joined(&mut self, user_id: Ulid, at: Ms) {
        let row = self.participants.entry(user_id).or_insert(Participant {
            user_id,
            status: ParticipantStatus::Left,
            joined_at: at,
            left_at: None,
            removed_by: None,
        });
        if row.status != ParticipantStatus::Joined {
            self.joined_count += 1;
        }
        row.status = ParticipantStatus::Joined;
        row.joined_at = at;
        row.left_at = None;
        row.removed_by = None;
    }

    /// Move a Joined participant to Left or Kicked. No-op for other rows.
    pub fn mark_departed(&mut self, user_id: &Ulid, kicked_by: Option<Ulid>, at: Ms) {
        let Some(row) = self.participants.get_mut(user_id) else {
            return;
        };
        if row.status != ParticipantStatus::Joined {
            return;
        }
        row.status = if kicked_by.is_some() {
            ParticipantStatus::Kicked
        } else {
            ParticipantStatus::Left
        };
        row.left_at = Some(at);
        row.removed_by = kicked_by;
        self.joined_count -= 1;
    }

    /// Joined participants, earliest joiner first.
    pub fn roster(&self) -> Vec<Participant> {
        let mut joined: Vec<Participant> = self
            .participants
            .values()
            .filter(|p| p.status == ParticipantStatus::Joined)
            .cloned()
            .collect();
        joined.sort_by_key(|p| (p.joined_at, p.user_id));
        joined
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Ulid,
    pub skill_level: SkillLevel,
}

// ── Courts ───────────────────────────────────────────────────────

/// Recurring weekly opening window in court-local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    /// 0 = Sunday .. 6 = Saturday.
    pub day_of_week: u8,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl ReservationStatus {
    /// Pending and Confirmed reservations block the court.
    pub fn is_active(&self) -> bool {
        !matches!(self, ReservationStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub court_id: Ulid,
    /// Court-local ms.
    pub span: Span,
    pub status: ReservationStatus,
    pub label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CourtState {
    pub id: Ulid,
    pub name: Option<String>,
    pub is_bookable: bool,
    pub hourly_rate: Cents,
    /// Sorted by `(day_of_week, start, id)`.
    pub windows: Vec<AvailabilityWindow>,
    /// Sorted by `span.start`. Cancelled rows are retained.
    pub reservations: Vec<Reservation>,
}

impl CourtState {
    pub fn new(id: Ulid, name: Option<String>, is_bookable: bool, hourly_rate: Cents) -> Self {
        Self {
            id,
            name,
            is_bookable,
            hourly_rate,
            windows: Vec::new(),
            reservations: Vec::new(),
        }
    }

    pub fn insert_window(&mut self, window: AvailabilityWindow) {
        let key = (window.day_of_week, window.start, window.id);
        let pos = self
            .windows
            .binary_search_by_key(&key, |w| (w.day_of_week, w.start, w.id))
            .unwrap_or_else(|e| e);
        self.windows.insert(pos, window);
    }

    pub fn remove_window(&mut self, id: Ulid) -> Option<AvailabilityWindow> {
        let pos = self.windows.iter().position(|w| w.id == id)?;
        Some(self.windows.remove(pos))
    }

    /// Windows for one weekday, in start order.
    pub fn windows_on(&self, day_of_week: u8) -> impl Iterator<Item = &AvailabilityWindow> {
        self.windows.iter().filter(move |w| w.day_of_week == day_of_week)
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    pub fn set_reservation_status(&mut self, id: &Ulid, status: ReservationStatus) {
        if let Some(r) = self.reservations.iter_mut().find(|r| r.id == *id) {
            r.status = status;
        }
    }

    /// Active reservations overlapping the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn active_overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.status.is_active() && r.span.overlaps(query))
    }
}

/// The event types: flat, no nesting. This is the WAL record format.
///
/// Every committed engine transaction is exactly one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserUpserted {
        id: Ulid,
        skill_level: SkillLevel,
    },
    ActivityCreated {
        id: Ulid,
        organizer_id: Ulid,
        capacity: u32,
        skill_min: SkillLevel,
        skill_max: SkillLevel,
    },
    ActivityStatusChanged {
        id: Ulid,
        status: ActivityStatus,
    },
    ParticipantJoined {
        activity_id: Ulid,
        user_id: Ulid,
        at: Ms,
    },
    Waitlisted {
        activity_id: Ulid,
        user_id: Ulid,
        position: u32,
        at: Ms,
    },
    /// Leave or kick, together with the promotion it triggered.
    ParticipantRemoved {
        activity_id: Ulid,
        user_id: Ulid,
        kicked_by: Option<Ulid>,
        promoted: Option<Ulid>,
        at: Ms,
    },
    WaitlistWithdrawn {
        activity_id: Ulid,
        user_id: Ulid,
    },
    CourtCreated {
        id: Ulid,
        name: Option<String>,
        is_bookable: bool,
        hourly_rate: Cents,
    },
    CourtUpdated {
        id: Ulid,
        name: Option<String>,
        is_bookable: bool,
        hourly_rate: Cents,
    },
    WindowAdded {
        id: Ulid,
        court_id: Ulid,
        day_of_week: u8,
        start: NaiveTime,
        end: NaiveTime,
    },
    WindowRemoved {
        id: Ulid,
        court_id: Ulid,
    },
    ReservationPlaced {
        id: Ulid,
        court_id: Ulid,
        span: Span,
        status: ReservationStatus,
        label: Option<String>,
    },
    ReservationStatusChanged {
        id: Ulid,
        court_id: Ulid,
        status: ReservationStatus,
    },
}

// ── Operation results ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    Waitlisted { position: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub promoted: Option<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KickOutcome {
    pub promoted: Option<Ulid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitlistWithdrawal {
    pub former_position: u32,
}

/// A discretized, conflict-free candidate reservation interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub duration_minutes: u32,
    pub cost: Cents,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityReport {
    pub slots: Vec<Slot>,
    /// Active reservations overlapping the queried range, by start.
    pub reservations: Vec<Reservation>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityInfo {
    pub id: Ulid,
    pub organizer_id: Ulid,
    pub capacity: u32,
    pub skill_min: SkillLevel,
    pub skill_max: SkillLevel,
    pub status: ActivityStatus,
    pub joined_count: u32,
    pub waitlist_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CourtInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub is_bookable: bool,
    pub hourly_rate: Cents,
    pub window_count: usize,
}
