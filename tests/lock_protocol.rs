use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast;
use ulid::Ulid;

use courtbook::engine::Engine;
use courtbook::model::*;
use courtbook::notify::{Broadcast, NotifyHub};
use courtbook::protocol::{self, LockClient, Reply};
use courtbook::store::{BookingLedger, BookingStore};

// ── Test infrastructure ──────────────────────────────────────

fn wal_path() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("courtbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir.join("courtbook.wal")
}

struct Harness {
    engine: Arc<Engine>,
    notify: Arc<NotifyHub>,
    ledger: Arc<BookingLedger>,
    client: LockClient,
    court: Ulid,
}

fn start(path: &PathBuf) -> Harness {
    let ledger = Arc::new(BookingLedger::open(path).unwrap());
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(ledger.clone(), notify.clone(), 300_000));
    let court = Ulid::from_parts(1_700_000_000_000, 1);
    engine
        .register_resource(Resource {
            id: court,
            facility_id: Ulid::nil(),
            name: Some("Centre Court".into()),
            hours: WeeklyHours::every_day(Span::new(8 * 60, 22 * 60)),
            active: true,
        })
        .unwrap();
    let client = protocol::spawn(engine.clone(), Duration::from_secs(2));
    Harness {
        engine,
        notify,
        ledger,
        client,
        court,
    }
}

fn day() -> chrono::NaiveDate {
    "2026-06-01".parse().unwrap()
}

async fn next(rx: &mut broadcast::Receiver<Broadcast>) -> Broadcast {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for broadcast")
        .expect("channel closed")
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn lock_hold_confirm_reaches_watchers() {
    let h = start(&wal_path());
    let key = SlotKey::new(h.court, day(), Span::new(600, 690));
    let mut watcher = h.notify.subscribe(h.court);

    let reply = h.client.lock(key, "session-a").await.unwrap();
    assert!(matches!(reply, Reply::Granted { .. }));
    assert!(matches!(next(&mut watcher).await, Broadcast::Locked { ref owner_id, .. } if owner_id == "session-a"));

    let hold = h.engine.hold_slot(key, "session-a").await.unwrap();
    assert_eq!(
        next(&mut watcher).await,
        Broadcast::Held {
            resource_id: h.court,
            date: key.date,
            timeslot: key.timeslot,
        }
    );
    // The lock is gone; the hold now keeps others out.
    let reply = h.client.lock(key, "session-b").await.unwrap();
    assert!(matches!(reply, Reply::Denied { .. }));

    h.engine.confirm_booking(hold.id, "session-a").await.unwrap();
    assert_eq!(
        next(&mut watcher).await,
        Broadcast::ScheduleConfirmed {
            resource_id: h.court,
            date: key.date,
            timeslots: vec![key.timeslot],
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lock_requests_grant_exactly_one() {
    let h = start(&wal_path());
    let key = SlotKey::new(h.court, day(), Span::new(600, 690));

    let replies = join_all((0..24).map(|i| {
        let client = h.client.clone();
        async move { client.lock(key, &format!("session-{i}")).await.unwrap() }
    }))
    .await;

    let granted = replies.iter().filter(|r| matches!(r, Reply::Granted { .. })).count();
    let denied = replies.iter().filter(|r| matches!(r, Reply::Denied { .. })).count();
    assert_eq!(granted, 1);
    assert_eq!(denied, 23);
    assert_eq!(h.engine.active_locks(h.court, day()).len(), 1);
}

#[tokio::test]
async fn departing_client_frees_everything() {
    let h = start(&wal_path());
    let mut firehose = h.notify.subscribe_all();
    for start_min in [600, 700, 800] {
        let key = SlotKey::new(h.court, day(), Span::new(start_min, start_min + 60));
        h.client.lock(key, "session-a").await.unwrap();
        assert!(matches!(next(&mut firehose).await, Broadcast::Locked { .. }));
    }

    let reply = h.client.unlock_all("session-a").await.unwrap();
    assert_eq!(reply, Reply::UnlockAck { released: 3 });
    for _ in 0..3 {
        assert!(matches!(next(&mut firehose).await, Broadcast::Unlocked { .. }));
    }
    assert!(h.engine.active_locks(h.court, day()).is_empty());
}

#[tokio::test]
async fn bookings_survive_reopen() {
    let path = wal_path();
    let key = SlotKey::new(Ulid::from_parts(1_700_000_000_000, 1), day(), Span::new(600, 690));
    let hold_id = {
        let h = start(&path);
        h.client.lock(key, "session-a").await.unwrap();
        let hold = h.engine.hold_slot(key, "session-a").await.unwrap();
        h.engine.confirm_booking(hold.id, "session-a").await.unwrap();
        hold.id
    };

    let h = start(&path);
    let bookings = h.ledger.bookings_on(h.court, day()).await.unwrap();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].id, hold_id);
    assert_eq!(bookings[0].status, BookingStatus::Confirmed);
    // Locks are not journaled, but the booking still blocks the slot.
    assert!(matches!(h.client.lock(key, "session-b").await.unwrap(), Reply::Denied { .. }));
}

#[tokio::test]
async fn tournament_run_end_to_end() {
    let h = start(&wal_path());
    let teams: Vec<TeamId> = (1..=4).map(|i| format!("team-{i}")).collect();
    let tid = h
        .engine
        .create_tournament(Tournament::new("Open", "organizer", TournamentFormat::RoundRobin, teams))
        .unwrap();

    let matches = h.engine.draw_matches(tid, None, false, Some(7)).await.unwrap();
    assert_eq!(matches.len(), 6);

    let outcome = h
        .engine
        .auto_schedule(
            tid,
            ScheduleRequest {
                start_date: day(),
                end_date: day(),
                match_duration: 90,
                break_duration: 30,
                matches_per_day: None,
                matches_per_round: None,
                window: Span::new(8 * 60, 22 * 60),
                courts: vec![],
                strict_teams: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.scheduled.len(), 6);
    assert!(outcome.failed.is_empty());

    let confirmed = h.engine.confirm_schedule(tid).await.unwrap();
    assert_eq!(confirmed.confirmed.len(), 6);
    assert!(confirmed.failed.is_empty());

    let sheet = h.ledger.bookings_on(h.court, day()).await.unwrap();
    assert_eq!(sheet.len(), 6);
    assert!(sheet.iter().all(|b| b.status == BookingStatus::Confirmed));
    for pair in sheet.windows(2) {
        assert!(!pair[0].span.overlaps(&pair[1].span));
    }
}
