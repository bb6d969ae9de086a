use std::path::PathBuf;
use std::time::Duration;

use crate::limits::{MAX_SLOT_MINUTES, MIN_SLOT_MINUTES};

pub const DEFAULT_SLOT_MINUTES: u32 = 60;
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_COMPACT_THRESHOLD: u64 = 1_000;

const WAL_FILE_NAME: &str = "courtside.wal";

/// Engine settings. `from_env` reads `COURTSIDE_*` variables and falls back
/// to the defaults for anything missing or unparsable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    /// Availability slot length.
    pub slot_minutes: u32,
    /// Longest wait for a per-activity or per-court lock before giving up
    /// with a retryable conflict.
    pub lock_timeout: Duration,
    /// WAL appends after which `maybe_compact` rewrites the log.
    pub compact_threshold: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            slot_minutes: DEFAULT_SLOT_MINUTES,
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let data_dir = lookup("COURTSIDE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        let slot_minutes = lookup("COURTSIDE_SLOT_MINUTES")
            .and_then(|s| s.parse().ok())
            .filter(|m| (MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(m))
            .unwrap_or(defaults.slot_minutes);
        let lock_timeout = lookup("COURTSIDE_LOCK_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.lock_timeout);
        let compact_threshold = lookup("COURTSIDE_COMPACT_THRESHOLD")
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.compact_threshold);

        Self {
            data_dir,
            slot_minutes,
            lock_timeout,
            compact_threshold,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WAL_FILE_NAME)
    }

    pub fn validate(&self) -> std::io::Result<()> {
        if !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&self.slot_minutes) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "slot_minutes must be within {MIN_SLOT_MINUTES}..={MAX_SLOT_MINUTES}, got {}",
                    self.slot_minutes
                ),
            ));
        }
        if self.lock_timeout.is_zero() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "lock_timeout must be positive",
            ));
        }
        Ok(())
    }
}
