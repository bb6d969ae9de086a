use std::collections::VecDeque;

use ulid::Ulid;

use crate::model::*;

use super::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitlistEntry {
    pub user_id: Ulid,
    /// 1-based queue position.
    pub position: u32,
    pub added_at: Ms,
}

/// FIFO overflow queue for one activity.
///
/// Entries are kept in position order and positions are always `1..=len`:
/// every removal shifts the entries behind it up by one.
#[derive(Debug, Clone, Default)]
pub struct Waitlist {
    entries: VecDeque<WaitlistEntry>,
}

impl Waitlist {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn head(&self) -> Option<&WaitlistEntry> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WaitlistEntry> {
        self.entries.iter()
    }

    pub fn contains(&self, user_id: &Ulid) -> bool {
        self.entries.iter().any(|e| e.user_id == *user_id)
    }

    pub fn position_of(&self, user_id: &Ulid) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.user_id == *user_id)
            .map(|e| e.position)
    }

    /// Position a new entry would receive.
    pub fn next_position(&self) -> u32 {
        self.entries.back().map_or(1, |e| e.position + 1)
    }

    /// Append at the tail and return the assigned position.
    pub fn push(&mut self, user_id: Ulid, added_at: Ms) -> u32 {
        let position = self.next_position();
        self.entries.push_back(WaitlistEntry {
            user_id,
            position,
            added_at,
        });
        position
    }

    /// Remove a user's entry and close the gap behind it.
    pub fn remove(&mut self, user_id: &Ulid) -> Option<WaitlistEntry> {
        let idx = self.entries.iter().position(|e| e.user_id == *user_id)?;
        self.remove_at(idx)
    }

    pub fn pop_head(&mut self) -> Option<WaitlistEntry> {
        self.remove_at(0)
    }

    fn remove_at(&mut self, idx: usize) -> Option<WaitlistEntry> {
        let removed = self.entries.remove(idx)?;
        for entry in self.entries.iter_mut().skip(idx) {
            entry.position -= 1;
        }
        Some(removed)
    }

    /// Check that positions form exactly `1..=len`.
    pub fn verify(&self) -> Result<(), EngineError> {
        for (idx, entry) in self.entries.iter().enumerate() {
            let expected = idx as u32 + 1;
            if entry.position != expected {
                return Err(EngineError::Internal(format!(
                    "waitlist not contiguous: entry {} has position {}, expected {expected}",
                    entry.user_id, entry.position
                )));
            }
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn from_entries(entries: Vec<WaitlistEntry>) -> Self {
        Self {
            entries: entries.into(),
        }
    }
}

/// Decide who, if anyone, takes the slot a departing participant frees.
///
/// Called with the state *before* the departure is applied. Returns the
/// waitlist head when the departure drops the joined count below capacity.
pub(crate) fn plan_promotion(state: &ActivityState) -> Result<Option<Ulid>, EngineError> {
    let remaining = state.joined_count.saturating_sub(1);
    if remaining >= state.capacity {
        return Ok(None);
    }
    state.waitlist.verify()?;
    let Some(head) = state.waitlist.head() else {
        return Ok(None);
    };
    if state.is_joined(&head.user_id) {
        return Err(EngineError::Internal(format!(
            "waitlist head {} is already joined",
            head.user_id
        )));
    }
    Ok(Some(head.user_id))
}
