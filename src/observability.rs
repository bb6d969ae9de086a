// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: roster operations. Labels: op, outcome.
pub const ROSTER_OPS_TOTAL: &str = "courtside_roster_ops_total";

/// Counter: waitlist promotions committed. Labels: trigger (leave, kick).
pub const PROMOTIONS_TOTAL: &str = "courtside_promotions_total";

/// Counter: availability queries. Labels: outcome.
pub const AVAILABILITY_QUERIES_TOTAL: &str = "courtside_availability_queries_total";

/// Histogram: availability computation latency in seconds.
pub const AVAILABILITY_DURATION_SECONDS: &str = "courtside_availability_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Counter: lock waits that hit the configured timeout. Labels: entity.
pub const LOCK_TIMEOUTS_TOTAL: &str = "courtside_lock_timeouts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "courtside_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "courtside_wal_flush_batch_size";

/// Install a default fmt subscriber unless the host already set one.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt().try_init();
}

/// Metrics outcome label for a fallible result.
pub fn outcome_label<T>(result: &Result<T, crate::engine::EngineError>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    }
}
