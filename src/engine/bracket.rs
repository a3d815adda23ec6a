use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// Next power of two ≥ `teams`, never below a single final.
pub fn bracket_size(teams: usize) -> usize {
    teams.next_power_of_two().max(2)
}

pub fn bye_count(teams: usize) -> usize {
    bracket_size(teams) - teams
}

/// Full knockout skeleton. Round one pairs shuffled teams; BYEs fill the last
/// round-one slots so every BYE faces a real team, and those matches are
/// resolved as walkovers with the winner already moved up.
pub fn draw_single_elimination<R: Rng + ?Sized>(tournament_id: Ulid, teams: &[TeamId], rng: &mut R) -> Vec<Match> {
    let mut order = teams.to_vec();
    order.shuffle(rng);

    let size = bracket_size(order.len());
    let first_round = size / 2;
    let full_pairs = first_round - bye_count(order.len());
    let mut slots = order.into_iter();
    let mut matches = Vec::with_capacity(size - 1);

    for number in 1..=first_round {
        let team1 = slots.next().map_or(TeamRef::Tbd, TeamRef::Team);
        let team2 = if number <= full_pairs {
            slots.next().map_or(TeamRef::Tbd, TeamRef::Team)
        } else {
            TeamRef::Bye
        };
        matches.push(Match::new(tournament_id, Stage::Knockout(1), number as u32, team1, team2));
    }

    let (mut round, mut count) = (2, first_round / 2);
    while count >= 1 {
        for number in 1..=count {
            matches.push(Match::new(tournament_id, Stage::Knockout(round), number as u32, TeamRef::Tbd, TeamRef::Tbd));
        }
        round += 1;
        count /= 2;
    }

    for i in 0..first_round {
        if !matches[i].team2.is_bye() {
            continue;
        }
        let Some(winner) = matches[i].team1.team().cloned() else { continue };
        let number = matches[i].match_number;
        matches[i].result = Some(MatchResult {
            winner: winner.clone(),
            walkover: true,
        });
        advance(&mut matches, Stage::Knockout(1), number, winner);
    }
    matches
}

/// Circle method: the first team stays put, the rest rotate one place per
/// round. An odd roster gets an idle marker so one team sits out each round.
pub fn draw_round_robin<R: Rng + ?Sized>(tournament_id: Ulid, teams: &[TeamId], rng: &mut R) -> Vec<Match> {
    let mut ring: Vec<Option<TeamId>> = teams.iter().cloned().map(Some).collect();
    ring.shuffle(rng);
    if ring.len() % 2 == 1 {
        ring.push(None);
    }
    if ring.len() < 2 {
        return Vec::new();
    }

    let n = ring.len();
    let mut matches = Vec::with_capacity(n * (n - 1) / 2);
    for round in 1..n as u32 {
        let mut number = 0;
        for i in 0..n / 2 {
            let (Some(a), Some(b)) = (&ring[i], &ring[n - 1 - i]) else { continue };
            number += 1;
            // Alternate sides for the fixed team.
            let (home, away) = if i == 0 && round % 2 == 0 { (b, a) } else { (a, b) };
            matches.push(Match::new(
                tournament_id,
                Stage::RoundRobin(round),
                number,
                TeamRef::Team(home.clone()),
                TeamRef::Team(away.clone()),
            ));
        }
        ring[1..].rotate_right(1);
    }
    matches
}

/// Put a knockout winner into the next round. Odd match numbers feed team1,
/// even ones team2. Returns the index of the receiving match.
pub(super) fn advance(matches: &mut [Match], from: Stage, match_number: u32, winner: TeamId) -> Option<usize> {
    let Stage::Knockout(round) = from else { return None };
    let next = Stage::Knockout(round + 1);
    let number = match_number.div_ceil(2);
    let idx = matches
        .iter()
        .position(|m| m.stage == next && m.match_number == number)?;
    let side = if match_number % 2 == 1 {
        &mut matches[idx].team1
    } else {
        &mut matches[idx].team2
    };
    *side = TeamRef::Team(winner);
    Some(idx)
}

impl Engine {
    /// Draw the whole tournament and return what organizers see: every match
    /// except BYE walkovers, narrowed to `stage` when given.
    ///
    /// An existing draw is only replaced with `clear_existing`, and never
    /// once a real result has been recorded. Clearing cancels the old
    /// matches' court bookings.
    pub async fn draw_matches(
        &self,
        tournament_id: Ulid,
        stage: Option<Stage>,
        clear_existing: bool,
        seed: Option<u64>,
    ) -> Result<Vec<Match>, EngineError> {
        let shared = self.tournament(tournament_id)?;
        let mut t = shared.write().await;
        if t.teams.len() < 2 {
            return Err(EngineError::invalid("a draw needs at least two teams"));
        }

        if !t.matches.is_empty() {
            if !clear_existing {
                return Err(EngineError::invalid("tournament already drawn; pass clear_existing to redraw"));
            }
            if t.matches.iter().any(|m| m.result.as_ref().is_some_and(|r| !r.walkover)) {
                return Err(EngineError::invalid("results already recorded; the draw is final"));
            }
            for m in t.matches.iter_mut() {
                self.vacate_slot(m).await?;
            }
        }

        let seed = seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);
        let drawn = match t.format {
            TournamentFormat::SingleElimination => draw_single_elimination(t.id, &t.teams, &mut rng),
            TournamentFormat::RoundRobin => draw_round_robin(t.id, &t.teams, &mut rng),
        };
        t.matches = drawn;
        t.draw_seed = Some(seed);
        self.index_matches(&t);
        info!(
            "tournament {} drawn: {} matches over {} rounds (seed {seed})",
            t.id,
            t.matches.len(),
            t.total_rounds()
        );

        Ok(t
            .visible_matches()
            .filter(|m| stage.is_none_or(|s| m.stage == s))
            .cloned()
            .collect())
    }

    /// Record the winner of a played match. Knockout winners move into their
    /// next-round slot, which is returned so callers can schedule it.
    pub async fn record_result(
        &self,
        tournament_id: Ulid,
        stage: Stage,
        match_number: u32,
        winner: TeamId,
    ) -> Result<Option<Match>, EngineError> {
        let shared = self.tournament(tournament_id)?;
        let mut t = shared.write().await;
        let m = t
            .find_match_mut(stage, match_number)
            .ok_or(EngineError::MatchNotFound { stage, match_number })?;
        if m.result.is_some() {
            return Err(EngineError::invalid("result already recorded"));
        }
        if !m.participants_known() {
            return Err(EngineError::invalid("participants not decided yet"));
        }
        if !m.teams().contains(&winner) {
            return Err(EngineError::invalid(format!("{winner} does not play in this match")));
        }
        m.result = Some(MatchResult {
            winner: winner.clone(),
            walkover: false,
        });

        let next = advance(&mut t.matches, stage, match_number, winner);
        Ok(next.map(|idx| t.matches[idx].clone()))
    }
}
