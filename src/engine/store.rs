use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedActivityState = Arc<RwLock<ActivityState>>;
pub type SharedCourtState = Arc<RwLock<CourtState>>;

/// Which lock an event belongs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    Activity(Ulid),
    Court(Ulid),
    User(Ulid),
}

impl EventTarget {
    pub fn id(&self) -> Ulid {
        match *self {
            EventTarget::Activity(id) | EventTarget::Court(id) | EventTarget::User(id) => id,
        }
    }
}

pub fn event_target(event: &Event) -> EventTarget {
    match event {
        Event::UserUpserted { id, .. } => EventTarget::User(*id),
        Event::ActivityCreated { id, .. } | Event::ActivityStatusChanged { id, .. } => {
            EventTarget::Activity(*id)
        }
        Event::ParticipantJoined { activity_id, .. }
        | Event::Waitlisted { activity_id, .. }
        | Event::ParticipantRemoved { activity_id, .. }
        | Event::WaitlistWithdrawn { activity_id, .. } => EventTarget::Activity(*activity_id),
        Event::CourtCreated { id, .. } | Event::CourtUpdated { id, .. } => EventTarget::Court(*id),
        Event::WindowAdded { court_id, .. }
        | Event::WindowRemoved { court_id, .. }
        | Event::ReservationPlaced { court_id, .. }
        | Event::ReservationStatusChanged { court_id, .. } => EventTarget::Court(*court_id),
    }
}

/// In-memory state behind the write-ahead log, sharded per activity and per court.
pub struct InMemoryStore {
    activities: DashMap<Ulid, SharedActivityState>,
    courts: DashMap<Ulid, SharedCourtState>,
    users: DashMap<Ulid, UserProfile>,
    /// Reverse lookup: window / reservation id → court id
    entity_to_court: DashMap<Ulid, Ulid>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            activities: DashMap::new(),
            courts: DashMap::new(),
            users: DashMap::new(),
            entity_to_court: DashMap::new(),
        }
    }

    // ── Activities ───────────────────────────────────────────

    pub fn activity_count(&self) -> usize {
        self.activities.len()
    }

    pub fn contains_activity(&self, id: &Ulid) -> bool {
        self.activities.contains_key(id)
    }

    pub fn get_activity(&self, id: &Ulid) -> Option<SharedActivityState> {
        self.activities.get(id).map(|e| e.value().clone())
    }

    pub fn activity_ids(&self) -> Vec<Ulid> {
        self.activities.iter().map(|e| *e.key()).collect()
    }

    // ── Courts ───────────────────────────────────────────────

    pub fn court_count(&self) -> usize {
        self.courts.len()
    }

    pub fn contains_court(&self, id: &Ulid) -> bool {
        self.courts.contains_key(id)
    }

    pub fn get_court(&self, id: &Ulid) -> Option<SharedCourtState> {
        self.courts.get(id).map(|e| e.value().clone())
    }

    pub fn court_ids(&self) -> Vec<Ulid> {
        self.courts.iter().map(|e| *e.key()).collect()
    }

    pub fn court_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_court.get(entity_id).map(|e| *e.value())
    }

    // ── Users ────────────────────────────────────────────────

    pub fn user(&self, id: &Ulid) -> Option<UserProfile> {
        self.users.get(id).map(|e| *e.value())
    }

    pub fn users(&self) -> Vec<UserProfile> {
        self.users.iter().map(|e| *e.value()).collect()
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event that creates or replaces a top-level entry.
    /// Returns false for events that belong under an entity lock.
    pub fn apply_top_level(&self, event: &Event) -> bool {
        match event {
            Event::UserUpserted { id, skill_level } => {
                self.users.insert(
                    *id,
                    UserProfile {
                        id: *id,
                        skill_level: *skill_level,
                    },
                );
                true
            }
            Event::ActivityCreated {
                id,
                organizer_id,
                capacity,
                skill_min,
                skill_max,
            } => {
                let state = ActivityState::new(*id, *organizer_id, *capacity, *skill_min, *skill_max);
                self.activities.insert(*id, Arc::new(RwLock::new(state)));
                true
            }
            Event::CourtCreated {
                id,
                name,
                is_bookable,
                hourly_rate,
            } => {
                let court = CourtState::new(*id, name.clone(), *is_bookable, *hourly_rate);
                self.courts.insert(*id, Arc::new(RwLock::new(court)));
                true
            }
            _ => false,
        }
    }

    /// Apply an activity-scoped event (no locking; caller holds the lock).
    pub fn apply_activity_event(&self, state: &mut ActivityState, event: &Event) {
        match event {
            Event::ActivityStatusChanged { status, .. } => state.status = *status,
            Event::ParticipantJoined { user_id, at, .. } => state.mark_joined(*user_id, *at),
            Event::Waitlisted {
                user_id,
                position,
                at,
                ..
            } => {
                let assigned = state.waitlist.push(*user_id, *at);
                debug_assert_eq!(assigned, *position, "waitlist position drift");
            }
            Event::ParticipantRemoved {
                user_id,
                kicked_by,
                promoted,
                at,
                ..
            } => {
                state.mark_departed(user_id, *kicked_by, *at);
                if let Some(next) = promoted {
                    state.waitlist.remove(next);
                    state.mark_joined(*next, *at);
                }
            }
            Event::WaitlistWithdrawn { user_id, .. } => {
                state.waitlist.remove(user_id);
            }
            _ => {}
        }
    }

    /// Apply a court-scoped event (no locking; caller holds the lock).
    pub fn apply_court_event(&self, court: &mut CourtState, event: &Event) {
        match event {
            Event::CourtUpdated {
                name,
                is_bookable,
                hourly_rate,
                ..
            } => {
                court.name = name.clone();
                court.is_bookable = *is_bookable;
                court.hourly_rate = *hourly_rate;
            }
            Event::WindowAdded {
                id,
                court_id,
                day_of_week,
                start,
                end,
            } => {
                court.insert_window(AvailabilityWindow {
                    id: *id,
                    day_of_week: *day_of_week,
                    start: *start,
                    end: *end,
                });
                self.entity_to_court.insert(*id, *court_id);
            }
            Event::WindowRemoved { id, .. } => {
                court.remove_window(*id);
                self.entity_to_court.remove(id);
            }
            Event::ReservationPlaced {
                id,
                court_id,
                span,
                status,
                label,
            } => {
                court.insert_reservation(Reservation {
                    id: *id,
                    court_id: *court_id,
                    span: *span,
                    status: *status,
                    label: label.clone(),
                });
                self.entity_to_court.insert(*id, *court_id);
            }
            Event::ReservationStatusChanged { id, status, .. } => {
                court.set_reservation_status(id, *status);
            }
            _ => {}
        }
    }

    /// Apply a replayed WAL event. We're the sole owner of every lock during
    /// replay, so `try_write` always succeeds; never block here because replay
    /// may run inside an async context.
    pub fn replay(&self, event: &Event) {
        if self.apply_top_level(event) {
            return;
        }
        match event_target(event) {
            EventTarget::Activity(id) => {
                if let Some(shared) = self.get_activity(&id)
                    && let Ok(mut guard) = shared.try_write()
                {
                    self.apply_activity_event(&mut guard, event);
                }
            }
            EventTarget::Court(id) => {
                if let Some(shared) = self.get_court(&id)
                    && let Ok(mut guard) = shared.try_write()
                {
                    self.apply_court_event(&mut guard, event);
                }
            }
            EventTarget::User(_) => {}
        }
    }
}
