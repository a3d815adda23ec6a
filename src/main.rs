use std::path::PathBuf;
use std::sync::Arc;

use chrono::Weekday;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;
use ulid::Ulid;

use courtbook::config::Config;
use courtbook::engine::{ConfirmOutcome, Engine, ScheduleOutcome};
use courtbook::model::*;
use courtbook::notify::NotifyHub;
use courtbook::reaper;
use courtbook::store::BookingLedger;

/// Draw, schedule and confirm a tournament from a JSON plan.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Tournament plan (JSON)
    #[arg(index = 1, value_name = "plan.json")]
    plan: PathBuf,
}

/// One court of the plan. Open the same hours every day except `closed_on`.
#[derive(Debug, Deserialize)]
struct CourtPlan {
    #[serde(default)]
    name: Option<String>,
    hours: Span,
    #[serde(default)]
    closed_on: Vec<Weekday>,
}

#[derive(Debug, Deserialize)]
struct TournamentPlan {
    name: String,
    organizer_id: OwnerId,
    format: TournamentFormat,
    teams: Vec<TeamId>,
}

#[derive(Debug, Deserialize)]
struct Plan {
    courts: Vec<CourtPlan>,
    tournament: TournamentPlan,
    request: ScheduleRequest,
    #[serde(default)]
    seed: Option<u64>,
}

#[derive(Debug, Serialize)]
struct Report {
    tournament_id: Ulid,
    courts: Vec<Ulid>,
    matches: Vec<Match>,
    scheduling: ScheduleOutcome,
    confirmation: ConfirmOutcome,
    schedule: Vec<Placement>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    courtbook::observability::init(config.metrics_port)?;
    std::fs::create_dir_all(&config.data_dir)?;
    info!("courtbook starting");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  lock_ttl: {:?}", config.lock_ttl);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let plan: Plan = serde_json::from_str(&std::fs::read_to_string(&args.plan)?)?;

    let ledger = Arc::new(BookingLedger::open(&config.wal_path())?);
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(ledger.clone(), notify, config.lock_ttl_ms()));
    tokio::spawn(reaper::run_lock_sweeper(engine.clone(), config.sweep_interval));
    tokio::spawn(reaper::run_compactor(ledger, config.compact_threshold));

    let facility_id = Ulid::new();
    let mut courts = Vec::with_capacity(plan.courts.len());
    for court in plan.courts {
        let hours = court
            .closed_on
            .iter()
            .fold(WeeklyHours::every_day(court.hours), |hours, day| {
                hours.with_day(*day, None)
            });
        let id = Ulid::new();
        engine.register_resource(Resource {
            id,
            facility_id,
            name: court.name,
            hours,
            active: true,
        })?;
        courts.push(id);
    }

    let t = plan.tournament;
    let tournament_id = engine.create_tournament(Tournament::new(t.name, t.organizer_id, t.format, t.teams))?;
    let matches = engine.draw_matches(tournament_id, None, false, plan.seed).await?;
    let scheduling = engine.auto_schedule(tournament_id, plan.request).await?;
    let confirmation = engine.confirm_schedule(tournament_id).await?;
    let schedule = engine.schedule(tournament_id).await?;

    let report = Report {
        tournament_id,
        courts,
        matches,
        scheduling,
        confirmation,
        schedule,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
