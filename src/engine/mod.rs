mod bracket;
mod conflict;
mod confirm;
mod error;
mod locks;
mod mutations;
mod queries;
mod scheduler;

pub use bracket::{bracket_size, bye_count, draw_round_robin, draw_single_elimination};
pub use confirm::ConfirmOutcome;
pub use conflict::{detect, Conflict, ConflictReport, Probe, Sources, Warning};
pub use error::EngineError;
pub use locks::{LockGrant, SlotLockManager};
pub use scheduler::ScheduleOutcome;

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::store::BookingStore;

pub type SharedTournament = Arc<RwLock<Tournament>>;

/// Why a single match did not make it. Reported, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// No candidate in the requested dates, courts and hours passed every check.
    SchedulingInfeasible,
    /// The tentative slot is now taken by something else.
    ConfirmationFailure { conflicts: Vec<Conflict> },
    /// The hold vanished and the slot was re-taken before it could be rebooked.
    HoldMissing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchFailure {
    pub match_id: Ulid,
    pub stage: Stage,
    pub match_number: u32,
    pub reason: FailureReason,
}

impl MatchFailure {
    fn of(m: &Match, reason: FailureReason) -> Self {
        Self {
            match_id: m.id,
            stage: m.stage,
            match_number: m.match_number,
            reason,
        }
    }
}

pub struct Engine {
    pub bookings: Arc<dyn BookingStore>,
    pub locks: SlotLockManager,
    pub notify: Arc<NotifyHub>,
    pub(super) resources: DashMap<Ulid, Resource>,
    pub(super) tournaments: DashMap<Ulid, SharedTournament>,
    /// Reverse lookup: match id → tournament id
    pub(super) match_index: DashMap<Ulid, Ulid>,
}

impl Engine {
    pub fn new(bookings: Arc<dyn BookingStore>, notify: Arc<NotifyHub>, lock_ttl_ms: Ms) -> Self {
        Self {
            bookings,
            locks: SlotLockManager::new(lock_ttl_ms, notify.clone()),
            notify,
            resources: DashMap::new(),
            tournaments: DashMap::new(),
            match_index: DashMap::new(),
        }
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<Resource> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn get_tournament(&self, id: &Ulid) -> Option<SharedTournament> {
        self.tournaments.get(id).map(|e| e.value().clone())
    }

    pub fn tournament_for_match(&self, match_id: &Ulid) -> Option<Ulid> {
        self.match_index.get(match_id).map(|e| *e.value())
    }

    pub(super) fn tournament(&self, id: Ulid) -> Result<SharedTournament, EngineError> {
        self.get_tournament(&id).ok_or(EngineError::NotFound(id))
    }

    pub(super) fn active_resource(&self, id: Ulid) -> Result<Resource, EngineError> {
        let resource = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        if !resource.active {
            return Err(EngineError::invalid(format!("court {id} is inactive")));
        }
        Ok(resource)
    }

    /// Courts for a scheduling run, ascending by id.
    pub(super) fn courts_for(&self, requested: &[Ulid]) -> Result<Vec<Resource>, EngineError> {
        if requested.is_empty() {
            return Ok(self.active_resources());
        }
        let mut courts = requested
            .iter()
            .map(|id| self.active_resource(*id))
            .collect::<Result<Vec<_>, _>>()?;
        courts.sort_by_key(|r| r.id);
        courts.dedup_by_key(|r| r.id);
        Ok(courts)
    }

    /// Refresh the match → tournament index after a draw.
    pub(super) fn index_matches(&self, tournament: &Tournament) {
        self.match_index.retain(|_, tid| *tid != tournament.id);
        for m in &tournament.matches {
            self.match_index.insert(m.id, tournament.id);
        }
    }
}
