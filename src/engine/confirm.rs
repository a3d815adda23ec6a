use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::Broadcast;
use crate::observability::CONFIRMATIONS_TOTAL;

use super::conflict::{detect, now_ms, Conflict, Probe, Sources};
use super::{Engine, EngineError, FailureReason, MatchFailure};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmOutcome {
    pub confirmed: Vec<Placement>,
    pub failed: Vec<MatchFailure>,
    /// Matches whose booking was confirmed by an earlier run.
    pub already_confirmed: usize,
}

enum Verdict {
    Confirmed(Ulid),
    Failed(FailureReason),
}

impl Engine {
    /// Promote every tentative placement of a tournament, one match at a time.
    ///
    /// Each match is re-checked against the current bookings first. A match
    /// that fails keeps its slot and hold untouched; the others still go
    /// through. Re-running after fixing failures is safe.
    pub async fn confirm_schedule(&self, tournament_id: Ulid) -> Result<ConfirmOutcome, EngineError> {
        let shared = self.tournament(tournament_id)?;
        let mut t = shared.write().await;
        let owner = t.hold_owner();
        let placed = t.placements();
        let mut outcome = ConfirmOutcome::default();
        let mut confirmed_by_day: BTreeMap<(Ulid, NaiveDate), Vec<Span>> = BTreeMap::new();

        for placement in &placed {
            let Some(m) = t.matches.iter_mut().find(|m| m.id == placement.match_id) else {
                continue;
            };
            let Some(slot) = m.slot.as_mut() else { continue };
            let existing = match slot.booking_id {
                Some(id) => self.bookings.get(id).await?,
                None => None,
            };
            if existing.as_ref().is_some_and(|b| b.status == BookingStatus::Confirmed) {
                outcome.already_confirmed += 1;
                continue;
            }

            let bookings = self.bookings.bookings_on(placement.court_id, placement.date).await?;
            let report = detect(
                &Probe {
                    resource_id: placement.court_id,
                    date: placement.date,
                    span: placement.span,
                    match_id: Some(placement.match_id),
                    teams: &placement.teams,
                    owner_id: Some(owner.as_str()),
                },
                &Sources {
                    bookings: &bookings,
                    locks: &[],
                    placed: &placed,
                    now: now_ms(),
                },
            );

            let verdict = if !report.is_clear() {
                Verdict::Failed(FailureReason::ConfirmationFailure {
                    conflicts: report.conflicts,
                })
            } else {
                match existing {
                    Some(hold) => self.promote_hold(hold.id).await?,
                    None => {
                        let booking = Booking {
                            status: BookingStatus::Confirmed,
                            ..Booking::hold(placement.court_id, placement.date, placement.span, owner.as_str())
                        }
                        .for_match(placement.match_id);
                        let id = booking.id;
                        match self.bookings.insert(booking).await {
                            Ok(()) => Verdict::Confirmed(id),
                            Err(EngineError::Conflict(_)) => Verdict::Failed(FailureReason::HoldMissing),
                            Err(e) => return Err(e),
                        }
                    }
                }
            };

            match verdict {
                Verdict::Confirmed(booking_id) => {
                    slot.booking_id = Some(booking_id);
                    metrics::counter!(CONFIRMATIONS_TOTAL, "status" => "confirmed").increment(1);
                    confirmed_by_day
                        .entry((placement.court_id, placement.date))
                        .or_default()
                        .push(placement.span);
                    outcome.confirmed.push(placement.clone());
                }
                Verdict::Failed(reason) => {
                    metrics::counter!(CONFIRMATIONS_TOTAL, "status" => "failed").increment(1);
                    debug!("match {} not confirmed: {reason:?}", m.id);
                    outcome.failed.push(MatchFailure::of(m, reason));
                }
            }
        }

        for ((resource_id, date), timeslots) in confirmed_by_day {
            self.notify.send(Broadcast::ScheduleConfirmed {
                resource_id,
                date,
                timeslots,
            });
        }
        if !outcome.failed.is_empty() {
            warn!(
                "confirm {tournament_id}: {} of {} matches need rescheduling",
                outcome.failed.len(),
                placed.len()
            );
        }
        info!(
            "confirm {tournament_id}: {} confirmed, {} failed, {} already confirmed",
            outcome.confirmed.len(),
            outcome.failed.len(),
            outcome.already_confirmed
        );
        Ok(outcome)
    }

    async fn promote_hold(&self, id: Ulid) -> Result<Verdict, EngineError> {
        match self.bookings.promote(id).await {
            Ok(_) => Ok(Verdict::Confirmed(id)),
            Err(EngineError::Conflict(other)) => {
                let conflicts = self
                    .bookings
                    .get(other)
                    .await?
                    .map(|b| vec![Conflict::from(&b)])
                    .unwrap_or_default();
                Ok(Verdict::Failed(FailureReason::ConfirmationFailure { conflicts }))
            }
            Err(EngineError::NotFound(_)) => Ok(Verdict::Failed(FailureReason::HoldMissing)),
            Err(e) => Err(e),
        }
    }

    /// Take one match off the schedule, cancelling its booking.
    pub async fn cancel_match_schedule(
        &self,
        tournament_id: Ulid,
        stage: Stage,
        match_number: u32,
    ) -> Result<Option<Placement>, EngineError> {
        let shared = self.tournament(tournament_id)?;
        let mut t = shared.write().await;
        let m = t
            .find_match_mut(stage, match_number)
            .ok_or(EngineError::MatchNotFound { stage, match_number })?;
        self.vacate_slot(m).await
    }

    /// Take every match of a tournament off the schedule.
    pub async fn cancel_all_schedule(&self, tournament_id: Ulid) -> Result<Vec<Placement>, EngineError> {
        let shared = self.tournament(tournament_id)?;
        let mut t = shared.write().await;
        let mut cleared = Vec::new();
        for m in t.matches.iter_mut() {
            if let Some(p) = self.vacate_slot(m).await? {
                cleared.push(p);
            }
        }
        info!("cancelled {} scheduled matches of {tournament_id}", cleared.len());
        Ok(cleared)
    }

    /// Clear a match's slot and cancel the booking behind it. A booking that
    /// is already gone is not an error.
    pub(super) async fn vacate_slot(&self, m: &mut Match) -> Result<Option<Placement>, EngineError> {
        let Some(placement) = Placement::of(m) else { return Ok(None) };
        if let Some(slot) = m.slot.take()
            && let Some(booking_id) = slot.booking_id
        {
            match self.bookings.cancel(booking_id).await {
                Ok(_) | Err(EngineError::NotFound(_)) => {}
                Err(e) => {
                    m.slot = Some(slot);
                    return Err(e);
                }
            }
        }
        self.notify.send(Broadcast::Unlocked {
            resource_id: placement.court_id,
            date: placement.date,
            timeslot: placement.span,
        });
        Ok(Some(placement))
    }
}
