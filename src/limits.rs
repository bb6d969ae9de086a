//! Hard caps enforced at the engine boundary.

use crate::model::Ms;

pub const MAX_ACTIVITIES: usize = 100_000;
pub const MAX_COURTS: usize = 10_000;
pub const MAX_ACTIVITY_CAPACITY: u32 = 1_000;
pub const MAX_WAITLIST_LEN: usize = 1_000;
pub const MAX_WINDOWS_PER_COURT: usize = 7 * 48;
pub const MAX_RESERVATIONS_PER_COURT: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LABEL_LEN: usize = 1024;

/// Widest availability query, in calendar days.
pub const MAX_QUERY_DAYS: i64 = 92;

/// Longest single reservation: one week.
pub const MAX_RESERVATION_MS: Ms = 7 * 24 * 3_600_000;

pub const MIN_SLOT_MINUTES: u32 = 5;
pub const MAX_SLOT_MINUTES: u32 = 24 * 60;
