use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gym_presence::replay::{load_log, ReplaySource};
use gym_presence::{
    CheckinSession, GymTarget, PresenceConfig, SessionError, SessionSnapshot, SystemClock,
};

#[derive(Parser, Debug)]
#[command(name = "gym_presence")]
#[command(about = "Replay a recorded location log through a gym check-in session", long_about = None)]
struct Args {
    /// Path to a recorded log (*.json or *.json.gz)
    #[arg(long)]
    log: PathBuf,

    /// Gym latitude (overrides the log's gym)
    #[arg(long, requires = "gym_lon", allow_hyphen_values = true)]
    gym_lat: Option<f64>,

    /// Gym longitude (overrides the log's gym)
    #[arg(long, requires = "gym_lat", allow_hyphen_values = true)]
    gym_lon: Option<f64>,

    /// Check-in radius in meters
    #[arg(long)]
    radius: Option<f64>,

    /// Presence config JSON file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Playback speed for recorded gaps (0 = no pacing)
    #[arg(long, default_value = "1.0")]
    speed: f64,

    /// Write the latest session snapshot to this JSON file
    #[arg(long)]
    status_out: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => PresenceConfig::load(path)?,
        None => PresenceConfig::default(),
    };
    let log = load_log(&args.log)?;
    let target = resolve_target(&args, log.gym, &config)?;

    println!("[{}] Gym Presence Replay Starting", ts_now());
    println!("  Log: {} ({} readings)", args.log.display(), log.readings.len());
    println!(
        "  Gym: {:.6}, {:.6} (radius {:.0}m)",
        target.latitude, target.longitude, target.checkin_radius_meters
    );
    println!("  Speed: {}x", args.speed);

    let source = ReplaySource::from_log(&log)
        .with_speed(args.speed)
        .rebased_to(Arc::new(SystemClock));

    let mut session = CheckinSession::new(target, config);
    session.start()?;

    println!("[{}] Acquiring location...", ts_now());
    match session.acquire(&source).await {
        Ok(_) => report(&session.snapshot(), args.status_out.as_deref()),
        Err(SessionError::Location(err)) => {
            report(&session.snapshot(), args.status_out.as_deref());
            println!("[{}] Acquisition failed: {}", ts_now(), err);
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    }

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            log::warn!("Ctrl-C handler unavailable: {}", err);
            std::future::pending::<()>().await;
        }
    };
    let status_out = args.status_out.clone();
    let end = session
        .track(&source, shutdown, |snapshot| {
            report(snapshot, status_out.as_deref())
        })
        .await
        .context("tracking location")?;

    let final_snapshot = session.snapshot();
    println!("\n=== Final Presence ({:?}) ===", end);
    println!(
        "Samples: {} ingested, {} rejected",
        final_snapshot.samples_ingested, final_snapshot.samples_rejected
    );
    println!("{}", final_snapshot.summary());
    if let Some((lat, lon)) = session.checkin_coordinates() {
        println!("Check-in coordinates: {:.6}, {:.6}", lat, lon);
    }

    Ok(())
}

fn resolve_target(
    args: &Args,
    logged: Option<GymTarget>,
    config: &PresenceConfig,
) -> Result<GymTarget> {
    let (latitude, longitude, logged_radius) = match (args.gym_lat, args.gym_lon, logged) {
        (Some(lat), Some(lon), _) => (lat, lon, None),
        (_, _, Some(gym)) => (gym.latitude, gym.longitude, Some(gym.checkin_radius_meters)),
        _ => bail!("no gym coordinates: pass --gym-lat/--gym-lon or include \"gym\" in the log"),
    };
    let radius = args
        .radius
        .or(logged_radius)
        .unwrap_or(config.default_checkin_radius_meters);
    Ok(GymTarget::new(latitude, longitude, radius))
}

fn report(snapshot: &SessionSnapshot, status_out: Option<&Path>) {
    println!("[{}] {}", ts_now(), snapshot.summary());
    if let Some(path) = status_out {
        if let Err(err) = snapshot.save(path) {
            log::warn!("Failed to write status to {}: {}", path.display(), err);
        }
    }
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
