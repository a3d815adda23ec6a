use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::conflict::{checked_span, detect, now_ms, ConflictReport, Probe, Sources};
use super::{Engine, EngineError};

impl Engine {
    /// Check a proposed placement without touching anything.
    ///
    /// With `exclude_match_id`, that match's own booking is ignored and the
    /// rest of its tournament counts as placed, so team clashes show up as
    /// warnings.
    pub async fn check_conflicts(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        start: Minute,
        end: Minute,
        exclude_match_id: Option<Ulid>,
    ) -> Result<ConflictReport, EngineError> {
        let span = checked_span(start, end)?;
        if !self.resources.contains_key(&resource_id) {
            return Err(EngineError::NotFound(resource_id));
        }

        let (placed, teams) = match exclude_match_id.and_then(|id| self.tournament_for_match(&id)) {
            Some(tid) => {
                let shared = self.tournament(tid)?;
                let t = shared.read().await;
                let teams = t
                    .matches
                    .iter()
                    .find(|m| Some(m.id) == exclude_match_id)
                    .map(Match::teams)
                    .unwrap_or_default();
                (t.placements(), teams)
            }
            None => (Vec::new(), Vec::new()),
        };

        let now = now_ms();
        let bookings = self.bookings.bookings_on(resource_id, date).await?;
        let locks = self.locks.active_on(resource_id, date, now);
        Ok(detect(
            &Probe {
                resource_id,
                date,
                span,
                match_id: exclude_match_id,
                teams: &teams,
                owner_id: None,
            },
            &Sources {
                bookings: &bookings,
                locks: &locks,
                placed: &placed,
                now,
            },
        ))
    }

    pub async fn tournament_snapshot(&self, tournament_id: Ulid) -> Result<Tournament, EngineError> {
        let shared = self.tournament(tournament_id)?;
        let t = shared.read().await;
        Ok(t.clone())
    }

    /// Matches organizers see, optionally one stage only. BYE walkovers are hidden.
    pub async fn list_matches(&self, tournament_id: Ulid, stage: Option<Stage>) -> Result<Vec<Match>, EngineError> {
        let shared = self.tournament(tournament_id)?;
        let t = shared.read().await;
        Ok(t.visible_matches()
            .filter(|m| stage.is_none_or(|s| m.stage == s))
            .cloned()
            .collect())
    }

    /// The tournament's placed matches in playing order.
    pub async fn schedule(&self, tournament_id: Ulid) -> Result<Vec<Placement>, EngineError> {
        let shared = self.tournament(tournament_id)?;
        let mut placed = shared.read().await.placements();
        placed.sort_by_key(|p| (p.date, p.span.start, p.court_id));
        Ok(placed)
    }

    pub fn active_locks(&self, resource_id: Ulid, date: NaiveDate) -> Vec<TimeSlotLock> {
        self.locks.active_on(resource_id, date, now_ms())
    }

    pub fn active_resources(&self) -> Vec<Resource> {
        let mut all: Vec<Resource> = self
            .resources
            .iter()
            .filter(|e| e.value().active)
            .map(|e| e.value().clone())
            .collect();
        all.sort_by_key(|r| r.id);
        all
    }
}
