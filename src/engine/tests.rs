use super::*;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("courtside_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), Arc::new(NotifyHub::new())).unwrap()
}

fn time(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

/// 2024-01-01 is a Monday.
fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
}

fn at(day: NaiveDate, h: u32, m: u32) -> NaiveDateTime {
    day.and_time(time(h, m))
}

async fn users(engine: &Engine, n: usize, skill: SkillLevel) -> Vec<Ulid> {
    let mut ids = Vec::with_capacity(n);
    for _ in 0..n {
        let id = Ulid::new();
        engine.upsert_user(id, skill).await.unwrap();
        ids.push(id);
    }
    ids
}

/// Activity with skill range 1..=10 and a registered organizer.
async fn activity(engine: &Engine, capacity: u32) -> (Ulid, Ulid) {
    let organizer = users(engine, 1, 5).await[0];
    let aid = Ulid::new();
    engine
        .create_activity(aid, organizer, capacity, 1, 10)
        .await
        .unwrap();
    (aid, organizer)
}

fn roster_ids(roster: &[Participant]) -> Vec<Ulid> {
    roster.iter().map(|p| p.user_id).collect()
}

fn waitlist_view(entries: &[WaitlistEntry]) -> Vec<(Ulid, u32)> {
    entries.iter().map(|e| (e.user_id, e.position)).collect()
}

// ── Activities ───────────────────────────────────────────

#[tokio::test]
async fn create_activity_validates_input() {
    let engine = new_engine("create_activity_validation.wal");
    let org = Ulid::new();

    let err = engine.create_activity(Ulid::new(), org, 0, 1, 5).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    let err = engine.create_activity(Ulid::new(), org, 4, 6, 5).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let aid = Ulid::new();
    engine.create_activity(aid, org, 4, 1, 5).await.unwrap();
    let err = engine.create_activity(aid, org, 4, 1, 5).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));

    let info = engine.get_activity(aid).await.unwrap();
    assert_eq!(info.status, ActivityStatus::Scheduled);
    assert_eq!(info.joined_count, 0);
    assert_eq!(info.waitlist_len, 0);
}

#[tokio::test]
async fn unknown_activity_is_not_found() {
    let engine = new_engine("unknown_activity.wal");
    let aid = Ulid::new();
    let user = users(&engine, 1, 5).await[0];
    assert_eq!(engine.join(aid, user).await, Err(EngineError::NotFound("activity", aid)));
    assert_eq!(
        engine.get_activity(aid).await.unwrap_err(),
        EngineError::NotFound("activity", aid)
    );
}

#[tokio::test]
async fn status_transitions_follow_lifecycle() {
    let engine = new_engine("status_transitions.wal");
    let (aid, _) = activity(&engine, 2).await;

    let err = engine
        .set_activity_status(aid, ActivityStatus::Completed)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::State(_)));

    engine.set_activity_status(aid, ActivityStatus::InProgress).await.unwrap();
    engine.set_activity_status(aid, ActivityStatus::Completed).await.unwrap();
    let err = engine
        .set_activity_status(aid, ActivityStatus::Cancelled)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::State(_)));
    assert_eq!(engine.get_activity(aid).await.unwrap().status, ActivityStatus::Completed);
}

// ── Roster ───────────────────────────────────────────────

#[tokio::test]
async fn leave_promotes_waitlist_head() {
    let engine = new_engine("leave_promotes.wal");
    let (aid, _) = activity(&engine, 2).await;
    let u = users(&engine, 3, 5).await;
    let (a, b, c) = (u[0], u[1], u[2]);

    assert_eq!(engine.join(aid, a).await.unwrap(), JoinOutcome::Joined);
    assert_eq!(engine.join(aid, b).await.unwrap(), JoinOutcome::Joined);
    assert_eq!(engine.join(aid, c).await.unwrap(), JoinOutcome::Waitlisted { position: 1 });

    let outcome = engine.leave(aid, a).await.unwrap();
    assert_eq!(outcome.promoted, Some(c));

    let roster = engine.roster(aid).await.unwrap();
    assert_eq!(roster.len(), 2);
    assert!(roster_ids(&roster).contains(&b));
    assert!(roster_ids(&roster).contains(&c));
    assert!(engine.waitlist(aid).await.unwrap().is_empty());
    engine.check_invariants(aid).await.unwrap();
}

#[tokio::test]
async fn join_after_promotion_restarts_waitlist_at_one() {
    let engine = new_engine("join_after_promotion.wal");
    let (aid, _) = activity(&engine, 2).await;
    let u = users(&engine, 4, 5).await;

    engine.join(aid, u[0]).await.unwrap();
    engine.join(aid, u[1]).await.unwrap();
    engine.join(aid, u[2]).await.unwrap();
    engine.leave(aid, u[0]).await.unwrap();

    assert_eq!(engine.join(aid, u[3]).await.unwrap(), JoinOutcome::Waitlisted { position: 1 });
    assert_eq!(engine.get_activity(aid).await.unwrap().joined_count, 2);
    engine.check_invariants(aid).await.unwrap();
}

#[tokio::test]
async fn leave_shifts_remaining_waitlist_up() {
    let engine = new_engine("leave_shifts_waitlist.wal");
    let (aid, _) = activity(&engine, 1).await;
    let u = users(&engine, 4, 5).await;

    engine.join(aid, u[0]).await.unwrap();
    for (i, user) in u[1..].iter().enumerate() {
        let outcome = engine.join(aid, *user).await.unwrap();
        assert_eq!(outcome, JoinOutcome::Waitlisted { position: i as u32 + 1 });
    }

    assert_eq!(engine.leave(aid, u[0]).await.unwrap().promoted, Some(u[1]));
    let waitlist = engine.waitlist(aid).await.unwrap();
    assert_eq!(waitlist_view(&waitlist), vec![(u[2], 1), (u[3], 2)]);
}

#[tokio::test]
async fn leave_twice_is_state_error() {
    let engine = new_engine("leave_twice.wal");
    let (aid, _) = activity(&engine, 3).await;
    let u = users(&engine, 2, 5).await;
    engine.join(aid, u[0]).await.unwrap();
    engine.join(aid, u[1]).await.unwrap();

    assert_eq!(engine.leave(aid, u[0]).await.unwrap().promoted, None);
    let err = engine.leave(aid, u[0]).await.unwrap_err();
    assert_eq!(err, EngineError::State("not a participant"));
    assert_eq!(engine.roster(aid).await.unwrap().len(), 1);
    assert_eq!(engine.get_activity(aid).await.unwrap().joined_count, 1);
}

#[tokio::test]
async fn duplicate_join_is_conflict() {
    let engine = new_engine("duplicate_join.wal");
    let (aid, _) = activity(&engine, 1).await;
    let u = users(&engine, 2, 5).await;
    engine.join(aid, u[0]).await.unwrap();
    engine.join(aid, u[1]).await.unwrap();

    let err = engine.join(aid, u[0]).await.unwrap_err();
    assert_eq!(err, EngineError::Conflict("already joined".into()));
    let err = engine.join(aid, u[1]).await.unwrap_err();
    assert_eq!(err, EngineError::Conflict("already waitlisted".into()));
    assert_eq!(engine.waitlist(aid).await.unwrap().len(), 1);
}

#[tokio::test]
async fn join_checks_eligibility() {
    let engine = new_engine("join_eligibility.wal");
    let org = Ulid::new();
    let aid = Ulid::new();
    engine.create_activity(aid, org, 4, 3, 6).await.unwrap();

    let low = users(&engine, 1, 2).await[0];
    let err = engine.join(aid, low).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(!err.is_retryable());

    let stranger = Ulid::new();
    assert_eq!(engine.join(aid, stranger).await, Err(EngineError::NotFound("user", stranger)));

    // Raising the skill level makes the same user eligible.
    engine.upsert_user(low, 4).await.unwrap();
    assert_eq!(engine.join(aid, low).await.unwrap(), JoinOutcome::Joined);
}

#[tokio::test]
async fn rejoin_reuses_participant_row() {
    let engine = new_engine("rejoin_row.wal");
    let (aid, _) = activity(&engine, 2).await;
    let user = users(&engine, 1, 5).await[0];

    engine.join(aid, user).await.unwrap();
    engine.leave(aid, user).await.unwrap();
    let rows = engine.participants(aid).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ParticipantStatus::Left);
    assert!(rows[0].left_at.is_some());

    assert_eq!(engine.join(aid, user).await.unwrap(), JoinOutcome::Joined);
    let rows = engine.participants(aid).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, ParticipantStatus::Joined);
    assert_eq!(rows[0].left_at, None);
}

#[tokio::test]
async fn roster_changes_rejected_once_started() {
    let engine = new_engine("roster_after_start.wal");
    let (aid, org) = activity(&engine, 1).await;
    let u = users(&engine, 3, 5).await;
    engine.join(aid, u[0]).await.unwrap();
    engine.join(aid, u[1]).await.unwrap();
    engine.set_activity_status(aid, ActivityStatus::InProgress).await.unwrap();

    assert_eq!(
        engine.join(aid, u[2]).await,
        Err(EngineError::State("activity is not open for joining"))
    );
    assert_eq!(
        engine.leave(aid, u[0]).await,
        Err(EngineError::State("activity has already started"))
    );
    assert_eq!(
        engine.kick(aid, org, u[0]).await,
        Err(EngineError::State("activity has already started"))
    );
    assert_eq!(
        engine.leave_waitlist(aid, u[1]).await,
        Err(EngineError::State("activity has already started"))
    );
}

#[tokio::test]
async fn organizer_stays_on_own_activity() {
    let engine = new_engine("organizer_stays.wal");
    let (aid, org) = activity(&engine, 2).await;
    engine.join(aid, org).await.unwrap();

    assert_eq!(
        engine.leave(aid, org).await,
        Err(EngineError::Authorization("organizer cannot leave own activity"))
    );
    assert_eq!(
        engine.kick(aid, org, org).await,
        Err(EngineError::Authorization("organizer cannot remove themselves"))
    );
}

#[tokio::test]
async fn kick_records_remover_and_promotes() {
    let engine = new_engine("kick_promotes.wal");
    let (aid, org) = activity(&engine, 1).await;
    let u = users(&engine, 2, 5).await;
    engine.join(aid, u[0]).await.unwrap();
    engine.join(aid, u[1]).await.unwrap();

    let err = engine.kick(aid, u[1], u[0]).await.unwrap_err();
    assert!(matches!(err, EngineError::Authorization(_)));

    let outcome = engine.kick(aid, org, u[0]).await.unwrap();
    assert_eq!(outcome.promoted, Some(u[1]));

    let rows = engine.participants(aid).await.unwrap();
    let kicked = rows.iter().find(|p| p.user_id == u[0]).unwrap();
    assert_eq!(kicked.status, ParticipantStatus::Kicked);
    assert_eq!(kicked.removed_by, Some(org));
    assert_eq!(roster_ids(&engine.roster(aid).await.unwrap()), vec![u[1]]);

    assert_eq!(
        engine.kick(aid, org, u[0]).await,
        Err(EngineError::NotFound("participant", u[0]))
    );
}

#[tokio::test]
async fn leave_waitlist_renumbers() {
    let engine = new_engine("leave_waitlist.wal");
    let (aid, _) = activity(&engine, 1).await;
    let u = users(&engine, 4, 5).await;
    for user in &u {
        engine.join(aid, *user).await.unwrap();
    }

    let withdrawal = engine.leave_waitlist(aid, u[2]).await.unwrap();
    assert_eq!(withdrawal.former_position, 2);
    let waitlist = engine.waitlist(aid).await.unwrap();
    assert_eq!(waitlist_view(&waitlist), vec![(u[1], 1), (u[3], 2)]);

    assert_eq!(
        engine.leave_waitlist(aid, u[0]).await,
        Err(EngineError::State("not on the waitlist"))
    );
    engine.check_invariants(aid).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_joins_on_last_seat() {
    let engine = Arc::new(new_engine("concurrent_last_seat.wal"));
    let (aid, _) = activity(&engine, 1).await;
    let u = users(&engine, 2, 5).await;

    let handles: Vec<_> = u
        .iter()
        .map(|user| {
            let eng = engine.clone();
            let user = *user;
            tokio::spawn(async move { eng.join(aid, user).await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for h in handles {
        outcomes.push(h.await.unwrap().unwrap());
    }
    outcomes.sort_by_key(|o| matches!(o, JoinOutcome::Waitlisted { .. }));
    assert_eq!(
        outcomes,
        vec![JoinOutcome::Joined, JoinOutcome::Waitlisted { position: 1 }]
    );
    engine.check_invariants(aid).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_churn_keeps_invariants() {
    let engine = Arc::new(new_engine("concurrent_churn.wal"));
    let (aid, _) = activity(&engine, 3).await;
    let u = users(&engine, 12, 5).await;

    let handles: Vec<_> = u
        .iter()
        .enumerate()
        .map(|(i, user)| {
            let eng = engine.clone();
            let user = *user;
            tokio::spawn(async move {
                eng.join(aid, user).await.unwrap();
                if i % 2 == 0 {
                    // Either a seat holder leaving or a waitlisted user withdrawing.
                    if eng.leave(aid, user).await.is_err() {
                        let _ = eng.leave_waitlist(aid, user).await;
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.await.unwrap();
    }

    engine.check_invariants(aid).await.unwrap();
    let info = engine.get_activity(aid).await.unwrap();
    assert!(info.joined_count <= 3);
}

#[tokio::test]
async fn lock_wait_times_out_as_conflict() {
    let config = Config {
        lock_timeout: Duration::from_millis(50),
        ..Config::default()
    };
    let engine = Engine::with_config(
        test_wal_path("lock_timeout.wal"),
        Arc::new(NotifyHub::new()),
        config,
    )
    .unwrap();
    let (aid, _) = activity(&engine, 2).await;
    let user = users(&engine, 1, 5).await[0];

    let held = engine.lock_activity(&aid).await.unwrap();
    let err = engine.join(aid, user).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    assert!(err.is_retryable());
    drop(held);

    assert_eq!(engine.join(aid, user).await.unwrap(), JoinOutcome::Joined);
}

#[tokio::test]
async fn committed_events_are_broadcast() {
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::new(test_wal_path("broadcast.wal"), notify.clone()).unwrap();
    let (aid, _) = activity(&engine, 1).await;
    let u = users(&engine, 2, 5).await;
    let mut rx = notify.subscribe(aid);

    engine.join(aid, u[0]).await.unwrap();
    engine.join(aid, u[1]).await.unwrap();
    engine.leave(aid, u[0]).await.unwrap();

    assert!(matches!(rx.recv().await.unwrap(), Event::ParticipantJoined { user_id, .. } if user_id == u[0]));
    assert!(matches!(rx.recv().await.unwrap(), Event::Waitlisted { position: 1, .. }));
    match rx.recv().await.unwrap() {
        Event::ParticipantRemoved { user_id, promoted, kicked_by, .. } => {
            assert_eq!(user_id, u[0]);
            assert_eq!(promoted, Some(u[1]));
            assert_eq!(kicked_by, None);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

// ── Courts & availability ────────────────────────────────

async fn court_with_window(engine: &Engine, rate: Cents) -> Ulid {
    let cid = Ulid::new();
    engine.create_court(cid, Some("Court 1".into()), true, rate).await.unwrap();
    engine
        .add_window(Ulid::new(), cid, 1, time(9, 0), time(11, 0))
        .await
        .unwrap();
    cid
}

#[tokio::test]
async fn huge_hourly_rate_prices_full_slot() {
    let engine = new_engine("huge_rate.wal");
    let rate = u64::MAX / 2;
    let cid = Ulid::new();
    engine.create_court(cid, None, true, rate).await.unwrap();
    engine
        .add_window(Ulid::new(), cid, 1, time(9, 0), time(10, 0))
        .await
        .unwrap();

    let report = engine
        .compute_available_slots(cid, AvailabilityQuery::Day(monday()))
        .await
        .unwrap();
    let costs: Vec<Cents> = report.slots.iter().map(|s| s.cost).collect();
    assert_eq!(costs, vec![rate]);
}

#[tokio::test]
async fn availability_on_last_calendar_day_is_validation() {
    let engine = new_engine("last_calendar_day.wal");
    let cid = court_with_window(&engine, 1000).await;
    let err = engine
        .compute_available_slots(cid, AvailabilityQuery::Day(NaiveDate::MAX))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)), "{err}");
}

#[tokio::test]
async fn confirmed_booking_leaves_one_slot() {
    let engine = new_engine("monday_slot.wal");
    let cid = court_with_window(&engine, 1500).await;
    let rid = Ulid::new();
    engine
        .place_reservation(
            rid,
            cid,
            at(monday(), 9, 0),
            at(monday(), 10, 0),
            ReservationStatus::Confirmed,
            None,
        )
        .await
        .unwrap();

    let report = engine
        .compute_available_slots(cid, AvailabilityQuery::Day(monday()))
        .await
        .unwrap();
    assert_eq!(
        report.slots,
        vec![Slot {
            start: at(monday(), 10, 0),
            end: at(monday(), 11, 0),
            duration_minutes: 60,
            cost: 1500,
        }]
    );
    assert_eq!(report.reservations.len(), 1);
    assert_eq!(report.reservations[0].id, rid);
}

#[tokio::test]
async fn cancelled_booking_frees_its_slot() {
    let engine = new_engine("cancel_frees_slot.wal");
    let cid = court_with_window(&engine, 1000).await;
    let rid = Ulid::new();
    engine
        .place_reservation(rid, cid, at(monday(), 9, 0), at(monday(), 10, 0), ReservationStatus::Pending, None)
        .await
        .unwrap();
    assert_eq!(engine.cancel_reservation(rid).await.unwrap(), cid);

    let report = engine
        .compute_available_slots(cid, AvailabilityQuery::Day(monday()))
        .await
        .unwrap();
    assert_eq!(report.slots.len(), 2);
    assert!(report.reservations.is_empty());
    // Cancelled rows stay listed.
    assert_eq!(engine.list_reservations(cid, None).await.unwrap().len(), 1);
}

#[tokio::test]
async fn availability_over_range_repeats_weekly() {
    let engine = new_engine("range_weekly.wal");
    let cid = court_with_window(&engine, 600).await;
    let query = AvailabilityQuery::range(monday(), NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()).unwrap();

    let report = engine.compute_available_slots(cid, query).await.unwrap();
    let starts: Vec<NaiveDateTime> = report.slots.iter().map(|s| s.start).collect();
    let next_monday = NaiveDate::from_ymd_opt(2024, 1, 8).unwrap();
    assert_eq!(
        starts,
        vec![
            at(monday(), 9, 0),
            at(monday(), 10, 0),
            at(next_monday, 9, 0),
            at(next_monday, 10, 0),
        ]
    );
}

#[tokio::test]
async fn availability_rejects_bad_queries() {
    let engine = new_engine("availability_errors.wal");
    let cid = Ulid::new();
    engine.create_court(cid, None, false, 100).await.unwrap();

    let err = engine
        .compute_available_slots(cid, AvailabilityQuery::Day(monday()))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Validation("court is not bookable".into()));

    let missing = Ulid::new();
    let err = engine
        .compute_available_slots(missing, AvailabilityQuery::Day(monday()))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::NotFound("court", missing));

    let wide = AvailabilityQuery::Range {
        start: monday(),
        end: monday() + chrono::TimeDelta::days(400),
    };
    let err = engine.compute_available_slots(cid, wide).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn update_court_changes_rate_and_bookability() {
    let engine = new_engine("update_court.wal");
    let cid = court_with_window(&engine, 1000).await;
    engine.update_court(cid, Some("Center".into()), true, 2400).await.unwrap();

    let report = engine
        .compute_available_slots(cid, AvailabilityQuery::Day(monday()))
        .await
        .unwrap();
    assert!(report.slots.iter().all(|s| s.cost == 2400));

    engine.update_court(cid, None, false, 2400).await.unwrap();
    let info = engine.get_court(cid).await.unwrap();
    assert_eq!(info.name, None);
    assert!(!info.is_bookable);
    assert_eq!(info.window_count, 1);
}

#[tokio::test]
async fn window_validation() {
    let engine = new_engine("window_validation.wal");
    let cid = court_with_window(&engine, 1000).await;

    let err = engine
        .add_window(Ulid::new(), cid, 7, time(9, 0), time(10, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    // Crossing midnight
    let err = engine
        .add_window(Ulid::new(), cid, 5, time(22, 0), time(2, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let err = engine
        .add_window(Ulid::new(), cid, 1, time(10, 30), time(12, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    // Touching windows are fine, as is the same hour on another weekday.
    engine.add_window(Ulid::new(), cid, 1, time(11, 0), time(12, 0)).await.unwrap();
    engine.add_window(Ulid::new(), cid, 2, time(9, 0), time(11, 0)).await.unwrap();
    assert_eq!(engine.windows(cid).await.unwrap().len(), 3);
}

#[tokio::test]
async fn remove_window_closes_slots() {
    let engine = new_engine("remove_window.wal");
    let cid = Ulid::new();
    engine.create_court(cid, None, true, 1000).await.unwrap();
    let wid = Ulid::new();
    engine.add_window(wid, cid, 1, time(9, 0), time(11, 0)).await.unwrap();

    assert_eq!(engine.remove_window(wid).await.unwrap(), cid);
    assert_eq!(engine.remove_window(wid).await, Err(EngineError::NotFound("window", wid)));
    let report = engine
        .compute_available_slots(cid, AvailabilityQuery::Day(monday()))
        .await
        .unwrap();
    assert!(report.slots.is_empty());
}

#[tokio::test]
async fn overlapping_reservation_is_conflict() {
    let engine = new_engine("reservation_conflict.wal");
    let cid = court_with_window(&engine, 1000).await;
    let day = monday();
    engine
        .place_reservation(Ulid::new(), cid, at(day, 9, 0), at(day, 10, 0), ReservationStatus::Pending, None)
        .await
        .unwrap();

    let err = engine
        .place_reservation(Ulid::new(), cid, at(day, 9, 30), at(day, 10, 30), ReservationStatus::Confirmed, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));

    // Back-to-back is allowed.
    engine
        .place_reservation(Ulid::new(), cid, at(day, 10, 0), at(day, 11, 0), ReservationStatus::Confirmed, Some("league".into()))
        .await
        .unwrap();

    let err = engine
        .place_reservation(Ulid::new(), cid, at(day, 12, 0), at(day, 12, 0), ReservationStatus::Pending, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn reservation_status_rules() {
    let engine = new_engine("reservation_status.wal");
    let cid = court_with_window(&engine, 1000).await;
    let rid = Ulid::new();
    engine
        .place_reservation(rid, cid, at(monday(), 9, 0), at(monday(), 10, 0), ReservationStatus::Pending, None)
        .await
        .unwrap();

    engine.confirm_reservation(rid).await.unwrap();
    assert!(matches!(engine.confirm_reservation(rid).await, Err(EngineError::State(_))));
    engine.cancel_reservation(rid).await.unwrap();
    assert!(matches!(engine.cancel_reservation(rid).await, Err(EngineError::State(_))));

    let missing = Ulid::new();
    assert_eq!(
        engine.confirm_reservation(missing).await,
        Err(EngineError::NotFound("reservation", missing))
    );
    let err = engine
        .place_reservation(Ulid::new(), cid, at(monday(), 9, 0), at(monday(), 10, 0), ReservationStatus::Cancelled, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn list_reservations_filters_by_span() {
    let engine = new_engine("list_reservations.wal");
    let cid = court_with_window(&engine, 1000).await;
    let day = monday();
    let early = Ulid::new();
    let late = Ulid::new();
    engine
        .place_reservation(late, cid, at(day, 15, 0), at(day, 16, 0), ReservationStatus::Pending, None)
        .await
        .unwrap();
    engine
        .place_reservation(early, cid, at(day, 8, 0), at(day, 9, 0), ReservationStatus::Pending, None)
        .await
        .unwrap();

    let all = engine.list_reservations(cid, None).await.unwrap();
    assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![early, late]);

    let morning = Span::new(local_ms(at(day, 0, 0)), local_ms(at(day, 12, 0)));
    let some = engine.list_reservations(cid, Some(morning)).await.unwrap();
    assert_eq!(some.len(), 1);
    assert_eq!(some[0].id, early);
}

#[tokio::test]
async fn reservation_times_round_trip_through_local_ms() {
    let engine = new_engine("reservation_round_trip.wal");
    let cid = court_with_window(&engine, 1200).await;
    let day = monday();
    engine
        .place_reservation(Ulid::new(), cid, at(day, 9, 30), at(day, 10, 45), ReservationStatus::Confirmed, None)
        .await
        .unwrap();

    let stored = engine.list_reservations(cid, None).await.unwrap();
    assert_eq!(from_local_ms(stored[0].span.start), Some(at(day, 9, 30)));
    assert_eq!(from_local_ms(stored[0].span.end), Some(at(day, 10, 45)));

    let report = engine
        .compute_available_slots(cid, AvailabilityQuery::Day(day))
        .await
        .unwrap();
    assert_eq!(report.reservations[0].span, stored[0].span);
    assert!(report.slots.is_empty());
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_roster_and_courts() {
    let path = test_wal_path("replay_restores.wal");
    let notify = Arc::new(NotifyHub::new());
    let (aid, cid, u, roster_before, waitlist_before) = {
        let engine = Engine::new(path.clone(), notify.clone()).unwrap();
        let (aid, _) = activity(&engine, 2).await;
        let u = users(&engine, 5, 5).await;
        for user in &u {
            engine.join(aid, *user).await.unwrap();
        }
        engine.leave(aid, u[0]).await.unwrap();
        engine.leave_waitlist(aid, u[3]).await.unwrap();
        let cid = court_with_window(&engine, 900).await;
        engine
            .place_reservation(Ulid::new(), cid, at(monday(), 9, 0), at(monday(), 10, 0), ReservationStatus::Confirmed, None)
            .await
            .unwrap();
        (
            aid,
            cid,
            u,
            engine.participants(aid).await.unwrap(),
            engine.waitlist(aid).await.unwrap(),
        )
    };

    let engine = Engine::new(path, notify).unwrap();
    assert_eq!(engine.participants(aid).await.unwrap(), roster_before);
    assert_eq!(engine.waitlist(aid).await.unwrap(), waitlist_before);
    assert_eq!(waitlist_view(&waitlist_before), vec![(u[4], 1)]);
    engine.check_invariants(aid).await.unwrap();
    assert_eq!(engine.get_user(u[0]).unwrap().skill_level, 5);

    let report = engine
        .compute_available_slots(cid, AvailabilityQuery::Day(monday()))
        .await
        .unwrap();
    assert_eq!(report.slots.len(), 1);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction_preserves.wal");
    let notify = Arc::new(NotifyHub::new());

    let engine = Engine::new(path.clone(), notify.clone()).unwrap();
    let (aid, org) = activity(&engine, 2).await;
    let u = users(&engine, 5, 5).await;
    for user in &u {
        engine.join(aid, *user).await.unwrap();
    }
    engine.leave(aid, u[0]).await.unwrap();
    engine.kick(aid, org, u[1]).await.unwrap();
    engine.join(aid, u[0]).await.unwrap();
    let (done, _) = activity(&engine, 4).await;
    engine.set_activity_status(done, ActivityStatus::Cancelled).await.unwrap();

    let cid = court_with_window(&engine, 1200).await;
    let kept = Ulid::new();
    let dropped = Ulid::new();
    engine
        .place_reservation(kept, cid, at(monday(), 9, 0), at(monday(), 10, 0), ReservationStatus::Pending, Some("lesson".into()))
        .await
        .unwrap();
    engine
        .place_reservation(dropped, cid, at(monday(), 10, 0), at(monday(), 11, 0), ReservationStatus::Pending, None)
        .await
        .unwrap();
    engine.cancel_reservation(dropped).await.unwrap();

    let participants = engine.participants(aid).await.unwrap();
    let waitlist = engine.waitlist(aid).await.unwrap();
    let reservations = engine.list_reservations(cid, None).await.unwrap();
    let windows = engine.windows(cid).await.unwrap();

    assert!(engine.wal_appends_since_compact().await > 0);
    engine.compact_wal().await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);

    // Appends after compaction land in the rewritten log.
    engine.confirm_reservation(kept).await.unwrap();
    drop(engine);

    let engine = Engine::new(path, notify).unwrap();
    assert_eq!(engine.participants(aid).await.unwrap(), participants);
    assert_eq!(engine.waitlist(aid).await.unwrap(), waitlist);
    assert_eq!(engine.windows(cid).await.unwrap(), windows);
    assert_eq!(engine.get_activity(done).await.unwrap().status, ActivityStatus::Cancelled);
    engine.check_invariants(aid).await.unwrap();

    let after = engine.list_reservations(cid, None).await.unwrap();
    assert_eq!(after.len(), reservations.len());
    assert_eq!(after[0].status, ReservationStatus::Confirmed);
    assert_eq!(after[0].label, Some("lesson".into()));
    assert_eq!(after[1].status, ReservationStatus::Cancelled);
}

#[tokio::test]
async fn maybe_compact_waits_for_threshold() {
    let config = Config {
        compact_threshold: 3,
        ..Config::default()
    };
    let engine = Engine::with_config(
        test_wal_path("maybe_compact.wal"),
        Arc::new(NotifyHub::new()),
        config,
    )
    .unwrap();

    users(&engine, 2, 5).await;
    assert!(!engine.maybe_compact().await.unwrap());
    users(&engine, 1, 5).await;
    assert!(engine.maybe_compact().await.unwrap());
    assert_eq!(engine.wal_appends_since_compact().await, 0);
}

#[tokio::test]
async fn group_commit_batches_creations() {
    let path = test_wal_path("group_commit_batch.wal");
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(path.clone(), notify.clone()).unwrap());
    let org = Ulid::new();

    let n = 20;
    let ids: Vec<Ulid> = (0..n).map(|_| Ulid::new()).collect();
    let mut handles = Vec::new();
    for id in &ids {
        let eng = engine.clone();
        let id = *id;
        handles.push(tokio::spawn(async move {
            eng.create_activity(id, org, 4, 1, 5).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.wal_appends_since_compact().await, n as u64);

    let engine2 = Engine::new(path, notify).unwrap();
    for id in ids {
        assert_eq!(engine2.get_activity(id).await.unwrap().capacity, 4);
    }
}
