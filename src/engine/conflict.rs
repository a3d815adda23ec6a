use std::collections::HashSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::MAX_OWNER_ID_LEN;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn checked_span(start: Minute, end: Minute) -> Result<Span, EngineError> {
    Span::try_new(start, end).ok_or_else(|| {
        EngineError::invalid(format!(
            "time range {}-{} must start before it ends and stay within one day",
            format_hhmm(start),
            format_hhmm(end)
        ))
    })
}

pub(crate) fn validate_owner(owner: &str) -> Result<(), EngineError> {
    if owner.is_empty() {
        return Err(EngineError::invalid("owner id is required"));
    }
    if owner.len() > MAX_OWNER_ID_LEN {
        return Err(EngineError::LimitExceeded("owner id too long"));
    }
    Ok(())
}

/// Hard violation: the placement cannot be written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Conflict {
    Booking {
        resource_id: Ulid,
        date: NaiveDate,
        span: Span,
        booking_id: Ulid,
        status: BookingStatus,
    },
    PlacedMatch {
        resource_id: Ulid,
        date: NaiveDate,
        span: Span,
        match_id: Ulid,
    },
}

impl From<&Booking> for Conflict {
    fn from(b: &Booking) -> Self {
        Conflict::Booking {
            resource_id: b.resource_id,
            date: b.date,
            span: b.span,
            booking_id: b.id,
            status: b.status,
        }
    }
}

/// Soft issue: reported, never blocks on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// Someone else is mid-booking; their lock will expire if abandoned.
    LockHeld {
        resource_id: Ulid,
        date: NaiveDate,
        span: Span,
        expires_at: Ms,
    },
    /// The same team plays an overlapping match on another court.
    TeamDoubleBooked {
        team: TeamId,
        match_id: Ulid,
        resource_id: Ulid,
        date: NaiveDate,
        span: Span,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub conflicts: Vec<Conflict>,
    pub warnings: Vec<Warning>,
}

impl ConflictReport {
    pub fn is_clear(&self) -> bool {
        self.conflicts.is_empty()
    }

    pub fn has_team_warnings(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, Warning::TeamDoubleBooked { .. }))
    }
}

/// What is being placed.
#[derive(Debug, Clone, Copy)]
pub struct Probe<'a> {
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    /// The match being placed; its own booking and placement are ignored.
    pub match_id: Option<Ulid>,
    pub teams: &'a [TeamId],
    /// Locks held by this owner are not reported.
    pub owner_id: Option<&'a str>,
}

/// Everything the probe is checked against.
#[derive(Debug, Clone, Copy)]
pub struct Sources<'a> {
    /// Bookings on the probe's resource and date.
    pub bookings: &'a [Booking],
    pub locks: &'a [TimeSlotLock],
    /// Matches already placed (this run, this tournament), any court.
    pub placed: &'a [Placement],
    pub now: Ms,
}

/// Check one placement. Never mutates, never fails: disagreements are data.
///
/// A booking that backs a match in `placed` is judged through the placement
/// instead, so a match being moved does not collide with its own old slot.
pub fn detect(probe: &Probe<'_>, sources: &Sources<'_>) -> ConflictReport {
    let mut report = ConflictReport::default();
    let placed_ids: HashSet<Ulid> = sources.placed.iter().map(|p| p.match_id).collect();

    for b in sources.bookings {
        if b.resource_id != probe.resource_id
            || b.date != probe.date
            || !b.is_blocking()
            || !b.span.overlaps(&probe.span)
        {
            continue;
        }
        if let Some(mid) = b.match_id
            && (Some(mid) == probe.match_id || placed_ids.contains(&mid))
        {
            continue;
        }
        report.conflicts.push(Conflict::from(b));
    }

    for p in sources.placed {
        if Some(p.match_id) == probe.match_id || p.date != probe.date || !p.span.overlaps(&probe.span) {
            continue;
        }
        if p.court_id == probe.resource_id {
            report.conflicts.push(Conflict::PlacedMatch {
                resource_id: p.court_id,
                date: p.date,
                span: p.span,
                match_id: p.match_id,
            });
            continue;
        }
        for team in probe.teams.iter().filter(|t| p.teams.contains(t)) {
            report.warnings.push(Warning::TeamDoubleBooked {
                team: team.clone(),
                match_id: p.match_id,
                resource_id: p.court_id,
                date: p.date,
                span: p.span,
            });
        }
    }

    for lock in sources.locks {
        let k = &lock.key;
        if k.resource_id == probe.resource_id
            && k.date == probe.date
            && lock.is_live(sources.now)
            && k.timeslot.overlaps(&probe.span)
            && probe.owner_id != Some(lock.owner_id.as_str())
        {
            report.warnings.push(Warning::LockHeld {
                resource_id: k.resource_id,
                date: k.date,
                span: k.timeslot,
                expires_at: lock.expires_at,
            });
        }
    }

    report
}
