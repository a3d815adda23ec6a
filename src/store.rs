use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::MAX_BOOKINGS_PER_DAY;
use crate::model::*;
use crate::wal::Wal;

/// Durable booking persistence consumed by the engine.
///
/// Implementations must keep hold and confirmed bookings on one resource and
/// date free of overlap: `insert`, `promote` and `apply_batch` fail with
/// `EngineError::Conflict` rather than write an overlapping booking.
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Hold and confirmed bookings on a resource for one date, by start time.
    async fn bookings_on(&self, resource_id: Ulid, date: NaiveDate) -> Result<Vec<Booking>, EngineError>;

    async fn get(&self, id: Ulid) -> Result<Option<Booking>, EngineError>;

    async fn insert(&self, booking: Booking) -> Result<(), EngineError>;

    /// Hold → confirmed.
    async fn promote(&self, id: Ulid) -> Result<Booking, EngineError>;

    /// Returns the booking as it was removed, with status `Cancelled`.
    async fn cancel(&self, id: Ulid) -> Result<Booking, EngineError>;

    /// Cancel and insert as one unit. All-or-nothing.
    async fn apply_batch(&self, batch: BookingBatch) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, Default)]
pub struct BookingBatch {
    pub cancel: Vec<Ulid>,
    pub insert: Vec<Booking>,
}

// ── Per-court state ──────────────────────────────────────────────

/// All live bookings of one court, per date, sorted by start.
#[derive(Debug)]
pub struct CourtSheet {
    pub resource_id: Ulid,
    days: BTreeMap<NaiveDate, Vec<Booking>>,
}

pub type SharedSheet = Arc<RwLock<CourtSheet>>;

impl CourtSheet {
    fn new(resource_id: Ulid) -> Self {
        Self {
            resource_id,
            days: BTreeMap::new(),
        }
    }

    fn day(&self, date: NaiveDate) -> &[Booking] {
        self.days.get(&date).map(Vec::as_slice).unwrap_or(&[])
    }

    fn insert(&mut self, booking: Booking) {
        let day = self.days.entry(booking.date).or_default();
        let pos = day
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        day.insert(pos, booking);
    }

    fn remove(&mut self, id: Ulid, date: NaiveDate) -> Option<Booking> {
        let day = self.days.get_mut(&date)?;
        let pos = day.iter().position(|b| b.id == id)?;
        let removed = day.remove(pos);
        if day.is_empty() {
            self.days.remove(&date);
        }
        Some(removed)
    }

    fn get_mut(&mut self, id: Ulid, date: NaiveDate) -> Option<&mut Booking> {
        self.days.get_mut(&date)?.iter_mut().find(|b| b.id == id)
    }

    /// First blocking booking overlapping `span`, skipping `ignore`.
    fn first_overlap(&self, date: NaiveDate, span: &Span, ignore: &HashSet<Ulid>) -> Option<Ulid> {
        let day = self.day(date);
        // Everything from right_bound on starts at or after span.end.
        let right_bound = day.partition_point(|b| b.span.start < span.end);
        day[..right_bound]
            .iter()
            .find(|b| b.is_blocking() && b.span.overlaps(span) && !ignore.contains(&b.id))
            .map(|b| b.id)
    }
}

// ── Group-commit journal writer ──────────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the journal. Appends that arrive together share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut deferred = None;
    loop {
        let cmd = match deferred.take() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => batch.push((event, response)),
                        other => {
                            deferred = Some(other);
                            break;
                        }
                    }
                }
                commit_batch(&mut wal, batch);
            }
            WalCommand::Compact { events, response } => {
                let _ = response.send(wal.compact(&events));
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(wal.appends_since_compact());
            }
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let appended = batch.iter().try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stray bytes don't leak into the next batch.
    let flushed = wal.flush_sync();
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    let outcome = appended.and(flushed);
    for (_, tx) in batch {
        let reply = match &outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

// ── Ledger ───────────────────────────────────────────────────────

/// Journaled in-memory `BookingStore`.
pub struct BookingLedger {
    sheets: DashMap<Ulid, SharedSheet>,
    /// booking id → (resource id, date)
    index: DashMap<Ulid, (Ulid, NaiveDate)>,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Shared by every journaled mutation, exclusive for compaction, so no
    /// append can land between the compaction snapshot and the rewrite.
    journal_gate: RwLock<()>,
}

fn apply_event(sheet: &mut CourtSheet, event: &Event, index: &DashMap<Ulid, (Ulid, NaiveDate)>) {
    match event {
        Event::BookingPlaced { booking } => {
            index.insert(booking.id, (booking.resource_id, booking.date));
            sheet.insert(booking.clone());
        }
        Event::BookingPromoted { id, .. } => {
            if let Some(&(_, date)) = index.get(id).as_deref()
                && let Some(b) = sheet.get_mut(*id, date)
            {
                b.status = BookingStatus::Confirmed;
            }
        }
        Event::BookingCancelled { id, .. } => {
            if let Some((_, (_, date))) = index.remove(id) {
                sheet.remove(*id, date);
            }
        }
    }
}

impl BookingLedger {
    /// Replay the journal at `path` and start its writer task.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let ledger = Self {
            sheets: DashMap::new(),
            index: DashMap::new(),
            wal_tx,
            journal_gate: RwLock::new(()),
        };
        // Sole owner of every sheet during replay: try_write cannot contend.
        for event in &events {
            let sheet = ledger.sheet(event.resource_id());
            if let Ok(mut guard) = sheet.try_write() {
                apply_event(&mut guard, event, &ledger.index);
            }
        }
        tracing::debug!("ledger replayed {} events from {}", events.len(), path.display());
        Ok(ledger)
    }

    fn sheet(&self, resource_id: Ulid) -> SharedSheet {
        self.sheets
            .entry(resource_id)
            .or_insert_with(|| Arc::new(RwLock::new(CourtSheet::new(resource_id))))
            .clone()
    }

    fn locate(&self, id: &Ulid) -> Result<(Ulid, NaiveDate), EngineError> {
        self.index
            .get(id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*id))
    }

    async fn send(&self, cmd: WalCommand) -> Result<(), EngineError> {
        self.wal_tx
            .send(cmd)
            .await
            .map_err(|_| EngineError::WalError("journal writer shut down".into()))
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(WalCommand::Append { event: event.clone(), response: tx }).await?;
        rx.await
            .map_err(|_| EngineError::WalError("journal writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    async fn persist_and_apply(&self, sheet: &mut CourtSheet, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_event(sheet, event, &self.index);
        Ok(())
    }

    /// Every live booking, for audits and compaction.
    pub async fn snapshot(&self) -> Vec<Booking> {
        let sheets: Vec<SharedSheet> = self.sheets.iter().map(|e| e.value().clone()).collect();
        let mut all = Vec::new();
        for sheet in sheets {
            let guard = sheet.read().await;
            for day in guard.days.values() {
                all.extend(day.iter().cloned());
            }
        }
        all
    }

    /// Rewrite the journal with only the events that recreate current state.
    pub async fn compact(&self) -> Result<(), EngineError> {
        let _exclusive = self.journal_gate.write().await;
        let events = self
            .snapshot()
            .await
            .into_iter()
            .map(|booking| Event::BookingPlaced { booking })
            .collect();
        let (tx, rx) = oneshot::channel();
        self.send(WalCommand::Compact { events, response: tx }).await?;
        rx.await
            .map_err(|_| EngineError::WalError("journal writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self.send(WalCommand::AppendsSinceCompact { response: tx }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn check_insertable(sheet: &CourtSheet, booking: &Booking, ignore: &HashSet<Ulid>) -> Result<(), EngineError> {
    if !booking.is_blocking() {
        return Err(EngineError::InvalidTransition {
            id: booking.id,
            status: booking.status,
        });
    }
    if Span::try_new(booking.span.start, booking.span.end).is_none() {
        return Err(EngineError::invalid(format!("booking span {} is empty or inverted", booking.span)));
    }
    if sheet.day(booking.date).len() >= MAX_BOOKINGS_PER_DAY {
        return Err(EngineError::LimitExceeded("too many bookings on one day"));
    }
    match sheet.first_overlap(booking.date, &booking.span, ignore) {
        Some(existing) => Err(EngineError::Conflict(existing)),
        None => Ok(()),
    }
}

#[async_trait]
impl BookingStore for BookingLedger {
    async fn bookings_on(&self, resource_id: Ulid, date: NaiveDate) -> Result<Vec<Booking>, EngineError> {
        let Some(sheet) = self.sheets.get(&resource_id).map(|e| e.value().clone()) else {
            return Ok(Vec::new());
        };
        let guard = sheet.read().await;
        Ok(guard.day(date).to_vec())
    }

    async fn get(&self, id: Ulid) -> Result<Option<Booking>, EngineError> {
        let Ok((resource_id, date)) = self.locate(&id) else {
            return Ok(None);
        };
        let sheet = self.sheet(resource_id);
        let guard = sheet.read().await;
        Ok(guard.day(date).iter().find(|b| b.id == id).cloned())
    }

    async fn insert(&self, booking: Booking) -> Result<(), EngineError> {
        if self.index.contains_key(&booking.id) {
            return Err(EngineError::AlreadyExists(booking.id));
        }
        let _journal = self.journal_gate.read().await;
        let sheet = self.sheet(booking.resource_id);
        let mut guard = sheet.write().await;
        check_insertable(&guard, &booking, &HashSet::new())?;
        self.persist_and_apply(&mut guard, &Event::BookingPlaced { booking }).await
    }

    async fn promote(&self, id: Ulid) -> Result<Booking, EngineError> {
        let (resource_id, date) = self.locate(&id)?;
        let _journal = self.journal_gate.read().await;
        let sheet = self.sheet(resource_id);
        let mut guard = sheet.write().await;
        let current = guard
            .day(date)
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if current.status != BookingStatus::Hold {
            return Err(EngineError::InvalidTransition { id, status: current.status });
        }
        if let Some(other) = guard.first_overlap(date, &current.span, &HashSet::from([id])) {
            return Err(EngineError::Conflict(other));
        }
        self.persist_and_apply(&mut guard, &Event::BookingPromoted { id, resource_id })
            .await?;
        Ok(Booking {
            status: BookingStatus::Confirmed,
            ..current
        })
    }

    async fn cancel(&self, id: Ulid) -> Result<Booking, EngineError> {
        let (resource_id, date) = self.locate(&id)?;
        let _journal = self.journal_gate.read().await;
        let sheet = self.sheet(resource_id);
        let mut guard = sheet.write().await;
        let current = guard
            .day(date)
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        self.persist_and_apply(&mut guard, &Event::BookingCancelled { id, resource_id })
            .await?;
        Ok(Booking {
            status: BookingStatus::Cancelled,
            ..current
        })
    }

    async fn apply_batch(&self, batch: BookingBatch) -> Result<(), EngineError> {
        if batch.cancel.is_empty() && batch.insert.is_empty() {
            return Ok(());
        }
        let mut cancels = Vec::with_capacity(batch.cancel.len());
        for id in &batch.cancel {
            let (rid, date) = self.locate(id)?;
            cancels.push((*id, rid, date));
        }

        let _journal = self.journal_gate.read().await;
        // Write-lock every touched court in sorted order to prevent deadlocks.
        let mut resource_ids: Vec<Ulid> = cancels
            .iter()
            .map(|(_, rid, _)| *rid)
            .chain(batch.insert.iter().map(|b| b.resource_id))
            .collect();
        resource_ids.sort();
        resource_ids.dedup();
        let mut guards = HashMap::with_capacity(resource_ids.len());
        for rid in resource_ids {
            guards.insert(rid, self.sheet(rid).write_owned().await);
        }

        // Phase 1: validate against current state minus the cancelled ids, and intra-batch.
        let ignore: HashSet<Ulid> = batch.cancel.iter().copied().collect();
        for (i, booking) in batch.insert.iter().enumerate() {
            if self.index.contains_key(&booking.id) {
                return Err(EngineError::AlreadyExists(booking.id));
            }
            check_insertable(&guards[&booking.resource_id], booking, &ignore)?;
            for other in &batch.insert[..i] {
                if other.resource_id == booking.resource_id
                    && other.date == booking.date
                    && other.span.overlaps(&booking.span)
                {
                    return Err(EngineError::Conflict(other.id));
                }
            }
        }

        // Phase 2: commit.
        for (id, resource_id, _) in cancels {
            let guard = guards.get_mut(&resource_id).ok_or(EngineError::NotFound(resource_id))?;
            self.persist_and_apply(guard, &Event::BookingCancelled { id, resource_id })
                .await?;
        }
        for booking in batch.insert {
            let guard = guards
                .get_mut(&booking.resource_id)
                .ok_or(EngineError::NotFound(booking.resource_id))?;
            self.persist_and_apply(guard, &Event::BookingPlaced { booking }).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_wal_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("courtbook_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn day() -> NaiveDate {
        "2026-06-01".parse().unwrap()
    }

    #[tokio::test]
    async fn overlapping_hold_rejected() {
        let ledger = BookingLedger::open(&test_wal_path("overlap.wal")).unwrap();
        let court = Ulid::new();
        let first = Booking::hold(court, day(), Span::new(600, 690), "a");
        let first_id = first.id;
        ledger.insert(first).await.unwrap();

        let clash = Booking::hold(court, day(), Span::new(660, 750), "b");
        let err = ledger.insert(clash).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(id) if id == first_id));

        // Adjacent is fine, and so is the same time on another date or court.
        ledger.insert(Booking::hold(court, day(), Span::new(690, 780), "b")).await.unwrap();
        ledger
            .insert(Booking::hold(court, day().succ_opt().unwrap(), Span::new(600, 690), "c"))
            .await
            .unwrap();
        ledger.insert(Booking::hold(Ulid::new(), day(), Span::new(600, 690), "d")).await.unwrap();
    }

    #[tokio::test]
    async fn inverted_span_rejected() {
        let ledger = BookingLedger::open(&test_wal_path("inverted.wal")).unwrap();
        let court = Ulid::new();
        let inverted = Booking {
            span: Span { start: 480, end: 379 },
            ..Booking::hold(court, day(), Span::new(480, 540), "a")
        };
        assert!(matches!(ledger.insert(inverted).await, Err(EngineError::Validation(_))));
        let empty = Booking {
            span: Span { start: 480, end: 480 },
            ..Booking::hold(court, day(), Span::new(480, 540), "a")
        };
        assert!(matches!(
            ledger.apply_batch(BookingBatch { cancel: vec![], insert: vec![empty] }).await,
            Err(EngineError::Validation(_))
        ));
        assert!(ledger.snapshot().await.is_empty());
        assert_eq!(ledger.appends_since_compact().await, 0);
    }

    #[tokio::test]
    async fn promote_and_cancel_lifecycle() {
        let ledger = BookingLedger::open(&test_wal_path("lifecycle.wal")).unwrap();
        let court = Ulid::new();
        let hold = Booking::hold(court, day(), Span::new(600, 690), "a");
        let id = hold.id;
        ledger.insert(hold).await.unwrap();

        let confirmed = ledger.promote(id).await.unwrap();
        assert_eq!(confirmed.status, BookingStatus::Confirmed);
        assert!(matches!(
            ledger.promote(id).await,
            Err(EngineError::InvalidTransition { status: BookingStatus::Confirmed, .. })
        ));

        let cancelled = ledger.cancel(id).await.unwrap();
        assert_eq!(cancelled.status, BookingStatus::Cancelled);
        assert!(ledger.get(id).await.unwrap().is_none());
        assert!(ledger.bookings_on(court, day()).await.unwrap().is_empty());
        assert!(matches!(ledger.cancel(id).await, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn batch_is_all_or_nothing() {
        let ledger = BookingLedger::open(&test_wal_path("batch.wal")).unwrap();
        let court = Ulid::new();
        let existing = Booking::hold(court, day(), Span::new(600, 690), "x");
        let existing_id = existing.id;
        ledger.insert(existing).await.unwrap();

        let ok = Booking::hold(court, day(), Span::new(800, 890), "t");
        let bad = Booking::hold(court, day(), Span::new(630, 720), "t");
        let err = ledger
            .apply_batch(BookingBatch { cancel: vec![], insert: vec![ok.clone(), bad] })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        assert_eq!(ledger.bookings_on(court, day()).await.unwrap().len(), 1);

        // Moving a booking onto an overlapping time works when the old one is cancelled in the same batch.
        let moved = Booking::hold(court, day(), Span::new(630, 720), "x");
        ledger
            .apply_batch(BookingBatch { cancel: vec![existing_id], insert: vec![moved.clone(), ok] })
            .await
            .unwrap();
        let on_day = ledger.bookings_on(court, day()).await.unwrap();
        assert_eq!(on_day.len(), 2);
        assert_eq!(on_day[0].id, moved.id);
    }

    #[tokio::test]
    async fn batch_rejects_intra_batch_overlap() {
        let ledger = BookingLedger::open(&test_wal_path("batch_intra.wal")).unwrap();
        let court = Ulid::new();
        let a = Booking::hold(court, day(), Span::new(600, 690), "t");
        let b = Booking::hold(court, day(), Span::new(660, 750), "t");
        assert!(matches!(
            ledger.apply_batch(BookingBatch { cancel: vec![], insert: vec![a, b] }).await,
            Err(EngineError::Conflict(_))
        ));
        assert!(ledger.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn replay_restores_state() {
        let path = test_wal_path("replay.wal");
        let court = Ulid::new();
        let (kept, promoted) = {
            let ledger = BookingLedger::open(&path).unwrap();
            let kept = Booking::hold(court, day(), Span::new(600, 690), "a");
            let promoted = Booking::hold(court, day(), Span::new(700, 790), "b");
            let gone = Booking::hold(court, day(), Span::new(800, 890), "c");
            ledger.insert(kept.clone()).await.unwrap();
            ledger.insert(promoted.clone()).await.unwrap();
            ledger.insert(gone.clone()).await.unwrap();
            ledger.promote(promoted.id).await.unwrap();
            ledger.cancel(gone.id).await.unwrap();
            (kept, promoted)
        };

        let reopened = BookingLedger::open(&path).unwrap();
        let on_day = reopened.bookings_on(court, day()).await.unwrap();
        assert_eq!(on_day.len(), 2);
        assert_eq!(on_day[0], kept);
        assert_eq!(on_day[1].id, promoted.id);
        assert_eq!(on_day[1].status, BookingStatus::Confirmed);
    }

    #[tokio::test]
    async fn compact_keeps_live_bookings() {
        let path = test_wal_path("compact.wal");
        let court = Ulid::new();
        let ledger = BookingLedger::open(&path).unwrap();
        for i in 0..10 {
            let b = Booking::hold(court, day(), Span::new(60 * i, 60 * i + 30), "churn");
            let id = b.id;
            ledger.insert(b).await.unwrap();
            ledger.cancel(id).await.unwrap();
        }
        let keep = Booking::hold(court, day(), Span::new(900, 990), "keep");
        ledger.insert(keep.clone()).await.unwrap();
        assert_eq!(ledger.appends_since_compact().await, 21);

        ledger.compact().await.unwrap();
        assert_eq!(ledger.appends_since_compact().await, 0);

        let reopened = BookingLedger::open(&path).unwrap();
        assert_eq!(reopened.snapshot().await, vec![keep]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn compact_during_inserts_loses_nothing() {
        let path = test_wal_path("compact_race.wal");
        let ledger = Arc::new(BookingLedger::open(&path).unwrap());

        // Fresh courts keep appearing while compactions run.
        let mut handles = Vec::new();
        for _ in 0..4 {
            let court = Ulid::new();
            for i in 0..20 {
                let ledger = ledger.clone();
                let b = Booking::hold(court, day(), Span::new(60 * i, 60 * i + 30), "race");
                handles.push(tokio::spawn(async move { ledger.insert(b).await }));
            }
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move { ledger.compact().await }));
        }
        for result in futures::future::join_all(handles).await {
            result.unwrap().unwrap();
        }

        let mut live = ledger.snapshot().await;
        assert_eq!(live.len(), 80);
        live.sort_by_key(|b| b.id);
        let mut replayed = BookingLedger::open(&path).unwrap().snapshot().await;
        replayed.sort_by_key(|b| b.id);
        assert_eq!(replayed, live);
    }
}
