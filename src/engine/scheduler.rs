use std::time::Instant;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{MATCHES_SCHEDULED_TOTAL, MATCHES_UNPLACED_TOTAL, SCHEDULE_RUN_SECONDS};

use super::conflict::{checked_span, detect, now_ms, Probe, Sources};
use super::{Engine, EngineError, FailureReason, MatchFailure};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleOutcome {
    pub scheduled: Vec<Placement>,
    pub failed: Vec<MatchFailure>,
    /// Matches waiting on an earlier result (a TBD side).
    pub skipped: Vec<Ulid>,
}

fn validate_request(request: &ScheduleRequest) -> Result<Vec<NaiveDate>, EngineError> {
    if request.end_date < request.start_date {
        return Err(EngineError::invalid("end date is before start date"));
    }
    if (request.end_date - request.start_date).num_days() >= MAX_SCHEDULE_DAYS {
        return Err(EngineError::LimitExceeded("date range too long"));
    }
    if request.match_duration == 0 {
        return Err(EngineError::invalid("match duration must be positive"));
    }
    let window = checked_span(request.window.start, request.window.end)?;
    if request.match_duration > window.end - window.start {
        return Err(EngineError::invalid("match duration does not fit the window"));
    }
    if request
        .match_duration
        .checked_add(request.break_duration)
        .is_none_or(|step| step > MINUTES_PER_DAY)
    {
        return Err(EngineError::invalid("match plus break must fit in one day"));
    }
    if request.courts.len() > MAX_COURTS_PER_REQUEST {
        return Err(EngineError::LimitExceeded("too many courts"));
    }
    if request.matches_per_day == Some(0) || request.matches_per_round == Some(0) {
        return Err(EngineError::invalid("caps must be at least 1"));
    }
    Ok(request
        .start_date
        .iter_days()
        .take_while(|d| *d <= request.end_date)
        .collect())
}

/// Room left under the per-day and per-round caps on `date`.
fn under_caps(request: &ScheduleRequest, placed: &[Placement], stage: Stage, date: NaiveDate) -> bool {
    let on_day = placed.iter().filter(|p| p.date == date);
    if let Some(cap) = request.matches_per_day
        && on_day.clone().count() >= cap as usize
    {
        return false;
    }
    if let Some(cap) = request.matches_per_round
        && on_day.filter(|p| p.stage == stage).count() >= cap as usize
    {
        return false;
    }
    true
}

impl Engine {
    /// Greedy placement of every unplaced, playable match of a tournament.
    ///
    /// Matches go in stage order, then by number. Each takes the first
    /// candidate (date, then court id, then start time) with no hard conflict
    /// and room under the caps, and reserves it at once as a hold so later
    /// matches in the run see it. Placed matches are never revisited.
    pub async fn auto_schedule(
        &self,
        tournament_id: Ulid,
        request: ScheduleRequest,
    ) -> Result<ScheduleOutcome, EngineError> {
        let dates = validate_request(&request)?;
        let courts = self.courts_for(&request.courts)?;
        let shared = self.tournament(tournament_id)?;
        let mut t = shared.write().await;
        let started = Instant::now();
        let owner = t.hold_owner();
        let step = request.match_duration + request.break_duration;

        let mut order: Vec<usize> = (0..t.matches.len()).collect();
        order.sort_by_key(|&i| (t.matches[i].stage, t.matches[i].match_number));

        let mut placed = t.placements();
        let mut outcome = ScheduleOutcome::default();

        for idx in order {
            let m = &t.matches[idx];
            if m.is_bye() || m.result.is_some() || m.slot.is_some() {
                continue;
            }
            if !m.participants_known() {
                outcome.skipped.push(m.id);
                continue;
            }
            let (match_id, stage, teams) = (m.id, m.stage, m.teams());

            let mut slot = None;
            'search: for &date in &dates {
                if !under_caps(&request, &placed, stage, date) {
                    continue;
                }
                for court in &courts {
                    let Some(window) = court.hours.on(date).and_then(|h| h.intersect(&request.window)) else {
                        continue;
                    };
                    let bookings = self.bookings.bookings_on(court.id, date).await?;
                    let locks = self.locks.active_on(court.id, date, now_ms());

                    let mut next = Some(window.start);
                    while let Some(start) = next
                        && let Some(span) = start
                            .checked_add(request.match_duration)
                            .and_then(|end| Span::try_new(start, end))
                            .filter(|span| span.end <= window.end)
                    {
                        next = start.checked_add(step);

                        let probe = Probe {
                            resource_id: court.id,
                            date,
                            span,
                            match_id: Some(match_id),
                            teams: &teams,
                            owner_id: Some(owner.as_str()),
                        };
                        let sources = Sources {
                            bookings: &bookings,
                            locks: &locks,
                            placed: &placed,
                            now: now_ms(),
                        };
                        let report = detect(&probe, &sources);
                        if !report.is_clear() || (request.strict_teams && report.has_team_warnings()) {
                            continue;
                        }

                        let hold = Booking::hold(court.id, date, span, owner.as_str()).for_match(match_id);
                        let booking_id = hold.id;
                        match self.bookings.insert(hold).await {
                            Ok(()) => {
                                slot = Some(MatchSlot {
                                    date,
                                    span,
                                    court_id: court.id,
                                    booking_id: Some(booking_id),
                                });
                                break 'search;
                            }
                            // Taken since the snapshot; keep looking.
                            Err(EngineError::Conflict(_)) => {
                                debug!("candidate {} {date} {span} taken during run", court.id);
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
            }

            let m = &mut t.matches[idx];
            match slot {
                Some(slot) => {
                    m.slot = Some(slot);
                    if let Some(p) = Placement::of(m) {
                        placed.push(p.clone());
                        outcome.scheduled.push(p);
                    }
                }
                None => outcome
                    .failed
                    .push(MatchFailure::of(m, FailureReason::SchedulingInfeasible)),
            }
        }

        metrics::counter!(MATCHES_SCHEDULED_TOTAL).increment(outcome.scheduled.len() as u64);
        metrics::counter!(MATCHES_UNPLACED_TOTAL).increment(outcome.failed.len() as u64);
        metrics::histogram!(SCHEDULE_RUN_SECONDS).record(started.elapsed().as_secs_f64());
        info!(
            "auto-schedule {tournament_id}: {} placed, {} failed, {} waiting",
            outcome.scheduled.len(),
            outcome.failed.len(),
            outcome.skipped.len()
        );
        Ok(outcome)
    }
}
