use std::fmt;

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::MINUTES_PER_DAY;

/// Unix milliseconds. Used for lock expiry only.
pub type Ms = i64;

/// Minutes since local midnight.
pub type Minute = u32;

pub type TeamId = String;
pub type OwnerId = String;

/// Half-open interval `[start, end)` within one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    #[serde(with = "hhmm")]
    pub start: Minute,
    #[serde(with = "hhmm")]
    pub end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for caller-supplied ranges.
    pub fn try_new(start: Minute, end: Minute) -> Option<Self> {
        (start < end && end <= MINUTES_PER_DAY).then_some(Self { start, end })
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn intersect(&self, other: &Span) -> Option<Span> {
        Span::try_new(self.start.max(other.start), self.end.min(other.end))
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", format_hhmm(self.start), format_hhmm(self.end))
    }
}

pub fn format_hhmm(m: Minute) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

pub fn parse_hhmm(s: &str) -> Option<Minute> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    if m >= 60 || h > 24 || (h == 24 && m != 0) {
        return None;
    }
    Some(h * 60 + m)
}

/// `"HH:MM"` on the wire, minutes in memory.
pub mod hhmm {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::{format_hhmm, parse_hhmm, Minute};

    pub fn serialize<S: Serializer>(m: &Minute, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_hhmm(*m))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Minute, D::Error> {
        let s = String::deserialize(d)?;
        parse_hhmm(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid time of day: {s}")))
    }
}

/// The unit of locking: one timeslot of one resource on one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotKey {
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub timeslot: Span,
}

impl SlotKey {
    pub fn new(resource_id: Ulid, date: NaiveDate, timeslot: Span) -> Self {
        Self { resource_id, date, timeslot }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} {}", self.resource_id, self.date, self.timeslot)
    }
}

// ── Resources ────────────────────────────────────────────────────

/// Operating window per weekday, Monday first. `None` means closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyHours {
    days: [Option<Span>; 7],
}

impl WeeklyHours {
    pub fn every_day(span: Span) -> Self {
        Self { days: [Some(span); 7] }
    }

    pub fn closed() -> Self {
        Self { days: [None; 7] }
    }

    pub fn with_day(mut self, weekday: Weekday, span: Option<Span>) -> Self {
        self.days[weekday.num_days_from_monday() as usize] = span;
        self
    }

    pub fn on(&self, date: NaiveDate) -> Option<Span> {
        self.days[date.weekday().num_days_from_monday() as usize]
    }
}

/// A bookable court.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub facility_id: Ulid,
    #[serde(default)]
    pub name: Option<String>,
    pub hours: WeeklyHours,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

// ── Locks ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Active,
    Released,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlotLock {
    pub key: SlotKey,
    pub owner_id: OwnerId,
    pub acquired_at: Ms,
    pub expires_at: Ms,
    pub state: LockState,
}

impl TimeSlotLock {
    pub fn is_live(&self, now: Ms) -> bool {
        self.state == LockState::Active && self.expires_at > now
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Hold,
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub status: BookingStatus,
    pub owner_id: OwnerId,
    /// Set when the booking backs a tournament match.
    pub match_id: Option<Ulid>,
}

impl Booking {
    pub fn hold(resource_id: Ulid, date: NaiveDate, span: Span, owner_id: impl Into<OwnerId>) -> Self {
        Self {
            id: Ulid::new(),
            resource_id,
            date,
            span,
            status: BookingStatus::Hold,
            owner_id: owner_id.into(),
            match_id: None,
        }
    }

    pub fn for_match(mut self, match_id: Ulid) -> Self {
        self.match_id = Some(match_id);
        self
    }

    /// Hold and confirmed bookings occupy the resource.
    pub fn is_blocking(&self) -> bool {
        matches!(self.status, BookingStatus::Hold | BookingStatus::Confirmed)
    }
}

// ── Tournaments ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamRef {
    Team(TeamId),
    Bye,
    Tbd,
}

impl TeamRef {
    pub fn team(&self) -> Option<&TeamId> {
        match self {
            TeamRef::Team(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_bye(&self) -> bool {
        matches!(self, TeamRef::Bye)
    }
}

/// A named phase of a tournament.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Knockout round, 1-based.
    Knockout(u32),
    /// Round-robin round, 1-based.
    RoundRobin(u32),
}

impl Stage {
    pub fn round(&self) -> u32 {
        match self {
            Stage::Knockout(r) | Stage::RoundRobin(r) => *r,
        }
    }

    /// Human label. Knockout labels depend on how many rounds the bracket has.
    pub fn label(&self, total_rounds: u32) -> String {
        match *self {
            Stage::Knockout(r) => match total_rounds.saturating_sub(r) {
                0 => "final".into(),
                1 => "semifinal".into(),
                2 => "quarterfinal".into(),
                _ => format!("round{r}"),
            },
            Stage::RoundRobin(r) => format!("round-robin {r}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSlot {
    pub date: NaiveDate,
    pub span: Span,
    pub court_id: Ulid,
    /// The hold or confirmed booking reserving the court.
    pub booking_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResult {
    pub winner: TeamId,
    /// Advanced without playing (BYE).
    pub walkover: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    pub id: Ulid,
    pub tournament_id: Ulid,
    pub stage: Stage,
    pub match_number: u32,
    pub team1: TeamRef,
    pub team2: TeamRef,
    pub slot: Option<MatchSlot>,
    pub result: Option<MatchResult>,
}

impl Match {
    pub fn new(tournament_id: Ulid, stage: Stage, match_number: u32, team1: TeamRef, team2: TeamRef) -> Self {
        Self {
            id: Ulid::new(),
            tournament_id,
            stage,
            match_number,
            team1,
            team2,
            slot: None,
            result: None,
        }
    }

    pub fn is_bye(&self) -> bool {
        self.team1.is_bye() || self.team2.is_bye()
    }

    pub fn participants_known(&self) -> bool {
        self.team1.team().is_some() && self.team2.team().is_some()
    }

    /// Needs a court: real opponents on both sides, unplayed, unplaced.
    pub fn is_schedulable(&self) -> bool {
        !self.is_bye() && self.participants_known() && self.result.is_none() && self.slot.is_none()
    }

    pub fn teams(&self) -> Vec<TeamId> {
        [&self.team1, &self.team2]
            .into_iter()
            .filter_map(|t| t.team().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TournamentFormat {
    SingleElimination,
    RoundRobin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tournament {
    pub id: Ulid,
    pub name: String,
    pub organizer_id: OwnerId,
    pub format: TournamentFormat,
    pub teams: Vec<TeamId>,
    pub matches: Vec<Match>,
    pub registration_deadline: Option<NaiveDate>,
    pub team_size: u32,
    /// Seed of the last draw; re-drawing with it reproduces the bracket.
    pub draw_seed: Option<u64>,
}

impl Tournament {
    pub fn new(
        name: impl Into<String>,
        organizer_id: impl Into<OwnerId>,
        format: TournamentFormat,
        teams: Vec<TeamId>,
    ) -> Self {
        Self {
            id: Ulid::new(),
            name: name.into(),
            organizer_id: organizer_id.into(),
            format,
            teams,
            matches: Vec::new(),
            registration_deadline: None,
            team_size: 1,
            draw_seed: None,
        }
    }

    /// Owner id stamped on the tournament's court bookings.
    pub fn hold_owner(&self) -> OwnerId {
        format!("tournament:{}", self.id)
    }

    pub fn find_match(&self, stage: Stage, match_number: u32) -> Option<&Match> {
        self.matches
            .iter()
            .find(|m| m.stage == stage && m.match_number == match_number)
    }

    pub fn find_match_mut(&mut self, stage: Stage, match_number: u32) -> Option<&mut Match> {
        self.matches
            .iter_mut()
            .find(|m| m.stage == stage && m.match_number == match_number)
    }

    /// Matches organizers see: everything except BYE walkovers.
    pub fn visible_matches(&self) -> impl Iterator<Item = &Match> {
        self.matches.iter().filter(|m| !m.is_bye())
    }

    pub fn total_rounds(&self) -> u32 {
        self.matches.iter().map(|m| m.stage.round()).max().unwrap_or(0)
    }

    pub fn placements(&self) -> Vec<Placement> {
        self.matches.iter().filter_map(Placement::of).collect()
    }
}

// ── Scheduling I/O ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub match_duration: Minute,
    pub break_duration: Minute,
    #[serde(default)]
    pub matches_per_day: Option<u32>,
    /// Cap per (stage, date) bucket.
    #[serde(default)]
    pub matches_per_round: Option<u32>,
    /// Operating window the run may use, intersected with each court's hours.
    pub window: Span,
    /// Courts to use; empty means every active registered resource.
    #[serde(default)]
    pub courts: Vec<Ulid>,
    /// Treat a team playing two overlapping matches as a hard conflict.
    #[serde(default)]
    pub strict_teams: bool,
}

/// A match placed on a court at a date and time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub match_id: Ulid,
    pub stage: Stage,
    pub match_number: u32,
    pub court_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub teams: Vec<TeamId>,
}

impl Placement {
    pub fn of(m: &Match) -> Option<Self> {
        let slot = m.slot.as_ref()?;
        Some(Self {
            match_id: m.id,
            stage: m.stage,
            match_number: m.match_number,
            court_id: slot.court_id,
            date: slot.date,
            span: slot.span,
            teams: m.teams(),
        })
    }
}

/// One row of a manual schedule edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub stage: Stage,
    pub match_number: u32,
    pub date: NaiveDate,
    pub span: Span,
    pub court_id: Ulid,
}

/// Journal record. Flat on purpose: one variant per booking transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingPlaced { booking: Booking },
    BookingPromoted { id: Ulid, resource_id: Ulid },
    BookingCancelled { id: Ulid, resource_id: Ulid },
}

impl Event {
    pub fn resource_id(&self) -> Ulid {
        match self {
            Event::BookingPlaced { booking } => booking.resource_id,
            Event::BookingPromoted { resource_id, .. } | Event::BookingCancelled { resource_id, .. } => {
                *resource_id
            }
        }
    }
}
