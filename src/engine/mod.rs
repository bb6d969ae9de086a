mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod roster;
mod store;
mod waitlist;
#[cfg(test)]
mod tests;

pub use availability::{compute_slots, day_of_week, prorated_cost, AvailabilityQuery};
pub use conflict::overlaps;
pub use error::EngineError;
pub use store::{event_target, EventTarget, InMemoryStore, SharedActivityState, SharedCourtState};
pub use waitlist::{Waitlist, WaitlistEntry};

use std::future::Future;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::config::Config;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::*;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

pub(super) enum WalCommand {
    Append(PendingAppend),
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
///
/// Every append already queued when the first one arrives rides the same
/// fsync. A non-append command ends the batch window and runs after the
/// batch is durable.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut batch: Vec<PendingAppend> = Vec::new();
    while let Some(cmd) = rx.recv().await {
        let control = match cmd {
            WalCommand::Append(pending) => {
                batch.push(pending);
                let mut control = None;
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append(pending) => batch.push(pending),
                        other => {
                            control = Some(other);
                            break;
                        }
                    }
                }
                commit_batch(&mut wal, &mut batch);
                control
            }
            other => Some(other),
        };
        if let Some(cmd) = control {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes don't
    // leak into the next batch; every caller in this batch sees the failure.
    let flushed = wal.flush_sync();
    let result = result.and(flushed);
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        tracing::error!(batch = batch.len(), "WAL commit failed: {e}");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append(pending) => {
            let mut batch = vec![pending];
            commit_batch(wal, &mut batch);
        }
    }
}

// ── Transaction guards ───────────────────────────────────

/// Exclusive access to one activity or court for the length of a transaction.
///
/// Also holds a shared commit permit so WAL compaction never snapshots state
/// between a transaction's append and its in-memory apply.
pub(super) struct Locked<T> {
    guard: OwnedRwLockWriteGuard<T>,
    _commit: OwnedRwLockReadGuard<()>,
}

impl<T> Deref for Locked<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for Locked<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) config: Config,
    /// Shared by every commit, taken exclusively by compaction.
    pub(super) commit_gate: Arc<RwLock<()>>,
    /// Serializes creation of top-level entries (existence check + insert).
    pub(super) create_lock: Mutex<()>,
}

impl Engine {
    /// Open an engine on `wal_path` with default settings.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_config(wal_path, notify, Config::default())
    }

    /// Open an engine under `config.data_dir`, creating the directory if needed.
    pub fn open(config: Config, notify: Arc<NotifyHub>) -> io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        Self::with_config(config.wal_path(), notify, config)
    }

    /// Replay the WAL at `wal_path` and start its group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn with_config(wal_path: PathBuf, notify: Arc<NotifyHub>, config: Config) -> io::Result<Self> {
        config.validate()?;
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = InMemoryStore::new();
        for event in &events {
            store.replay(event);
        }
        tracing::info!(
            wal = %wal_path.display(),
            events = events.len(),
            activities = store.activity_count(),
            courts = store.court_count(),
            "engine ready"
        );

        Ok(Self {
            store,
            wal_tx,
            notify,
            config,
            commit_gate: Arc::new(RwLock::new(())),
            create_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append((event.clone(), tx)))
            .await
            .map_err(|_| EngineError::Internal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Internal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Internal(format!("WAL append failed: {e}")))
    }

    /// Bound a lock wait by the configured timeout. A timeout is a retryable conflict.
    async fn bounded<F: Future>(&self, kind: &'static str, id: Ulid, fut: F) -> Result<F::Output, EngineError> {
        tokio::time::timeout(self.config.lock_timeout, fut)
            .await
            .map_err(|_| {
                metrics::counter!(LOCK_TIMEOUTS_TOTAL, "entity" => kind).increment(1);
                tracing::warn!(%id, kind, "lock wait timed out");
                EngineError::Conflict(format!("{kind} {id} is busy, retry"))
            })
    }

    async fn lock_for_commit<T>(
        &self,
        kind: &'static str,
        id: Ulid,
        shared: Arc<RwLock<T>>,
    ) -> Result<Locked<T>, EngineError> {
        let gate = self.commit_gate.clone();
        self.bounded(kind, id, async move {
            let commit = gate.read_owned().await;
            let guard = shared.write_owned().await;
            Locked {
                guard,
                _commit: commit,
            }
        })
        .await
    }

    pub(super) async fn lock_activity(&self, id: &Ulid) -> Result<Locked<ActivityState>, EngineError> {
        let shared = self
            .store
            .get_activity(id)
            .ok_or(EngineError::NotFound("activity", *id))?;
        self.lock_for_commit("activity", *id, shared).await
    }

    pub(super) async fn lock_court(&self, id: &Ulid) -> Result<Locked<CourtState>, EngineError> {
        let shared = self
            .store
            .get_court(id)
            .ok_or(EngineError::NotFound("court", *id))?;
        self.lock_for_commit("court", *id, shared).await
    }

    /// Consistent read of a court; writers wait until the guard drops.
    pub(super) async fn read_court(&self, id: &Ulid) -> Result<OwnedRwLockReadGuard<CourtState>, EngineError> {
        let shared = self
            .store
            .get_court(id)
            .ok_or(EngineError::NotFound("court", *id))?;
        self.bounded("court", *id, shared.read_owned()).await
    }

    pub(super) async fn read_activity(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockReadGuard<ActivityState>, EngineError> {
        let shared = self
            .store
            .get_activity(id)
            .ok_or(EngineError::NotFound("activity", *id))?;
        self.bounded("activity", *id, shared.read_owned()).await
    }

    /// Commit permit plus the creation lock, for events that add top-level entries.
    pub(super) async fn lock_for_create(
        &self,
        kind: &'static str,
        id: Ulid,
    ) -> Result<(OwnedRwLockReadGuard<()>, tokio::sync::MutexGuard<'_, ()>), EngineError> {
        let gate = self.commit_gate.clone();
        self.bounded(kind, id, async move {
            let commit = gate.read_owned().await;
            let create = self.create_lock.lock().await;
            (commit, create)
        })
        .await
    }

    /// WAL-append + apply + notify for an activity-scoped event.
    pub(super) async fn commit_activity(&self, state: &mut ActivityState, event: Event) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.store.apply_activity_event(state, &event);
        self.notify.send(state.id, &event);
        Ok(())
    }

    /// WAL-append + apply + notify for a court-scoped event.
    pub(super) async fn commit_court(&self, court: &mut CourtState, event: Event) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.store.apply_court_event(court, &event);
        self.notify.send(court.id, &event);
        Ok(())
    }

    /// WAL-append + apply + notify for a user upsert or entity creation.
    /// Caller holds `lock_for_create`.
    pub(super) async fn commit_top_level(&self, event: Event) -> Result<(), EngineError> {
        self.wal_append(&event).await?;
        self.store.apply_top_level(&event);
        self.notify.send(event_target(&event).id(), &event);
        Ok(())
    }
}
