use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Broadcast;
use crate::observability::BATCH_CONFLICTS_TOTAL;
use crate::store::BookingBatch;

use super::conflict::{checked_span, detect, now_ms, validate_owner, Probe, Sources, Warning};
use super::{Engine, EngineError, LockGrant};

impl Engine {
    // ── Registry ─────────────────────────────────────────────────

    pub fn register_resource(&self, resource: Resource) -> Result<(), EngineError> {
        if let Some(ref n) = resource.name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("court name too long"));
        }
        if self.resources.contains_key(&resource.id) {
            return Err(EngineError::AlreadyExists(resource.id));
        }
        debug!("registered court {}", resource.id);
        self.resources.insert(resource.id, resource);
        Ok(())
    }

    /// Inactive courts keep their bookings but take no new ones.
    pub fn set_resource_active(&self, id: Ulid, active: bool) -> Result<(), EngineError> {
        let mut resource = self.resources.get_mut(&id).ok_or(EngineError::NotFound(id))?;
        resource.active = active;
        Ok(())
    }

    pub fn remove_resource(&self, id: Ulid) -> Result<Resource, EngineError> {
        let (_, resource) = self.resources.remove(&id).ok_or(EngineError::NotFound(id))?;
        self.notify.prune(&id);
        Ok(resource)
    }

    pub fn create_tournament(&self, tournament: Tournament) -> Result<Ulid, EngineError> {
        if tournament.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("tournament name too long"));
        }
        validate_owner(&tournament.organizer_id)?;
        if tournament.teams.len() > MAX_TEAMS_PER_TOURNAMENT {
            return Err(EngineError::LimitExceeded("too many teams"));
        }
        let mut seen = HashSet::with_capacity(tournament.teams.len());
        for team in &tournament.teams {
            if team.is_empty() {
                return Err(EngineError::invalid("team id is empty"));
            }
            if team.len() > MAX_TEAM_ID_LEN {
                return Err(EngineError::LimitExceeded("team id too long"));
            }
            if !seen.insert(team) {
                return Err(EngineError::invalid(format!("team {team} listed twice")));
            }
        }
        if tournament.team_size == 0 {
            return Err(EngineError::invalid("team size must be at least 1"));
        }
        if self.tournaments.contains_key(&tournament.id) {
            return Err(EngineError::AlreadyExists(tournament.id));
        }

        let id = tournament.id;
        self.index_matches(&tournament);
        self.tournaments.insert(id, Arc::new(RwLock::new(tournament)));
        info!("tournament {id} created");
        Ok(id)
    }

    // ── Ad-hoc booking flow ──────────────────────────────────────

    /// Claim a slot while the user completes a booking. Denied outright if a
    /// hold or confirmed booking already covers it.
    pub async fn acquire_slot(&self, key: SlotKey, owner: &str) -> Result<LockGrant, EngineError> {
        validate_owner(owner)?;
        checked_span(key.timeslot.start, key.timeslot.end)?;
        let resource = self.active_resource(key.resource_id)?;
        if !resource
            .hours
            .on(key.date)
            .is_some_and(|hours| hours.contains_span(&key.timeslot))
        {
            return Err(EngineError::invalid(format!("{key} is outside operating hours")));
        }

        let bookings = self.bookings.bookings_on(key.resource_id, key.date).await?;
        if let Some(taken) = bookings.iter().find(|b| b.span.overlaps(&key.timeslot)) {
            return Err(EngineError::SlotUnavailable {
                key,
                booking_id: taken.id,
            });
        }
        self.locks.acquire(key, owner, now_ms())
    }

    /// Owner-only; anything else is a silent no-op.
    pub fn release_slot(&self, key: &SlotKey, owner: &str) -> Option<TimeSlotLock> {
        self.locks.release(key, owner)
    }

    pub fn release_all_slots(&self, owner: &str) -> Vec<TimeSlotLock> {
        let released = self.locks.release_all(owner);
        if !released.is_empty() {
            debug!("released {} locks of {owner}", released.len());
        }
        released
    }

    /// Turn the caller's live lock into a hold booking. The lock is
    /// superseded by the booking and watchers see a hold, not an unlock.
    pub async fn hold_slot(&self, key: SlotKey, owner: &str) -> Result<Booking, EngineError> {
        self.locks.ensure_held(&key, owner, now_ms())?;
        let hold = Booking::hold(key.resource_id, key.date, key.timeslot, owner);
        self.bookings.insert(hold.clone()).await?;
        self.locks.supersede(&key, owner);
        self.notify.send(Broadcast::Held {
            resource_id: key.resource_id,
            date: key.date,
            timeslot: key.timeslot,
        });
        Ok(hold)
    }

    pub async fn confirm_booking(&self, booking_id: Ulid, owner: &str) -> Result<Booking, EngineError> {
        self.owned_booking(booking_id, owner).await?;
        let confirmed = self.bookings.promote(booking_id).await?;
        self.notify.send(Broadcast::ScheduleConfirmed {
            resource_id: confirmed.resource_id,
            date: confirmed.date,
            timeslots: vec![confirmed.span],
        });
        Ok(confirmed)
    }

    pub async fn cancel_booking(&self, booking_id: Ulid, owner: &str) -> Result<Booking, EngineError> {
        self.owned_booking(booking_id, owner).await?;
        let cancelled = self.bookings.cancel(booking_id).await?;
        self.notify.send(Broadcast::Unlocked {
            resource_id: cancelled.resource_id,
            date: cancelled.date,
            timeslot: cancelled.span,
        });
        Ok(cancelled)
    }

    async fn owned_booking(&self, booking_id: Ulid, owner: &str) -> Result<Booking, EngineError> {
        let booking = self
            .bookings
            .get(booking_id)
            .await?
            .ok_or(EngineError::NotFound(booking_id))?;
        if booking.owner_id != owner {
            return Err(EngineError::Forbidden(booking_id));
        }
        Ok(booking)
    }

    // ── Manual schedule edits ────────────────────────────────────

    /// Move matches to organizer-chosen slots as one unit.
    ///
    /// Every entry is checked against current bookings and the rest of the
    /// tournament, with the batch's own entries treated as already placed.
    /// Any hard conflict rejects the whole batch and nothing is written.
    /// Otherwise old bookings are swapped for new holds atomically and the
    /// warnings are returned.
    pub async fn update_match_schedule(
        &self,
        tournament_id: Ulid,
        entries: Vec<ScheduleEntry>,
    ) -> Result<Vec<Warning>, EngineError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        if entries.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        for e in &entries {
            checked_span(e.span.start, e.span.end)?;
            let court = self.active_resource(e.court_id)?;
            if !court.hours.on(e.date).is_some_and(|hours| hours.contains_span(&e.span)) {
                return Err(EngineError::invalid(format!(
                    "{:?} #{} at {} {} is outside operating hours of {}",
                    e.stage, e.match_number, e.date, e.span, e.court_id
                )));
            }
        }

        let shared = self.tournament(tournament_id)?;
        let mut t = shared.write().await;
        let owner = t.hold_owner();

        // Resolve entries to match indices.
        let mut targets = Vec::with_capacity(entries.len());
        let mut seen = HashSet::with_capacity(entries.len());
        for e in &entries {
            let idx = t
                .matches
                .iter()
                .position(|m| m.stage == e.stage && m.match_number == e.match_number)
                .ok_or(EngineError::MatchNotFound {
                    stage: e.stage,
                    match_number: e.match_number,
                })?;
            let m = &t.matches[idx];
            if m.is_bye() {
                return Err(EngineError::invalid(format!(
                    "{:?} #{} is a walkover and takes no court",
                    e.stage, e.match_number
                )));
            }
            if !seen.insert(idx) {
                return Err(EngineError::invalid(format!(
                    "{:?} #{} appears twice in the batch",
                    e.stage, e.match_number
                )));
            }
            targets.push(idx);
        }

        let proposed: Vec<Placement> = entries
            .iter()
            .zip(&targets)
            .map(|(e, &idx)| Placement {
                match_id: t.matches[idx].id,
                stage: e.stage,
                match_number: e.match_number,
                court_id: e.court_id,
                date: e.date,
                span: e.span,
                teams: t.matches[idx].teams(),
            })
            .collect();
        let moving: HashSet<Ulid> = proposed.iter().map(|p| p.match_id).collect();
        let mut placed: Vec<Placement> = t
            .placements()
            .into_iter()
            .filter(|p| !moving.contains(&p.match_id))
            .collect();
        placed.extend(proposed.iter().cloned());

        let now = now_ms();
        let mut conflicts = Vec::new();
        let mut warnings = Vec::new();
        for p in &proposed {
            let bookings = self.bookings.bookings_on(p.court_id, p.date).await?;
            let locks = self.locks.active_on(p.court_id, p.date, now);
            let report = detect(
                &Probe {
                    resource_id: p.court_id,
                    date: p.date,
                    span: p.span,
                    match_id: Some(p.match_id),
                    teams: &p.teams,
                    owner_id: Some(owner.as_str()),
                },
                &Sources {
                    bookings: &bookings,
                    locks: &locks,
                    placed: &placed,
                    now,
                },
            );
            conflicts.extend(report.conflicts);
            warnings.extend(report.warnings);
        }
        if !conflicts.is_empty() {
            metrics::counter!(BATCH_CONFLICTS_TOTAL).increment(1);
            info!(
                "schedule edit for {tournament_id} rejected: {} conflicts",
                conflicts.len()
            );
            return Err(EngineError::BatchConflict(conflicts));
        }

        let mut batch = BookingBatch::default();
        let mut vacated = Vec::new();
        for &idx in &targets {
            if let Some(old) = Placement::of(&t.matches[idx]) {
                vacated.push(old);
            }
            if let Some(id) = t.matches[idx].slot.as_ref().and_then(|s| s.booking_id)
                && self.bookings.get(id).await?.is_some()
            {
                batch.cancel.push(id);
            }
        }
        let holds: Vec<Booking> = proposed
            .iter()
            .map(|p| Booking::hold(p.court_id, p.date, p.span, owner.as_str()).for_match(p.match_id))
            .collect();
        batch.insert = holds.clone();
        self.bookings.apply_batch(batch).await?;

        for ((&idx, p), hold) in targets.iter().zip(&proposed).zip(&holds) {
            t.matches[idx].slot = Some(MatchSlot {
                date: p.date,
                span: p.span,
                court_id: p.court_id,
                booking_id: Some(hold.id),
            });
        }
        for old in vacated {
            self.notify.send(Broadcast::Unlocked {
                resource_id: old.court_id,
                date: old.date,
                timeslot: old.span,
            });
        }
        for hold in &holds {
            self.notify.send(Broadcast::Held {
                resource_id: hold.resource_id,
                date: hold.date,
                timeslot: hold.span,
            });
        }
        info!("schedule edit for {tournament_id}: {} matches moved", holds.len());
        Ok(warnings)
    }
}
