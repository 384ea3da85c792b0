use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;

use bump_tracker_rs::config::{DetectorConfig, SegmentMode, SweepPolicy};
use bump_tracker_rs::source::{simulate, ReplayLog, SimulationConfig};
use bump_tracker_rs::{GpxMarkerSink, JsonlStore, LocationFeed, MotionFeed, Tracker};

#[derive(Parser, Debug)]
#[command(name = "bump_tracker")]
#[command(about = "Detect and record road bumps from accelerometer + GPS streams", long_about = None)]
struct Args {
    /// Duration in seconds (0 = until the replay ends or Ctrl-C)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// Replay a recorded log (.json or .json.gz) instead of simulating
    #[arg(long)]
    log: Option<PathBuf>,

    /// Replay speed multiplier (0 = as fast as possible)
    #[arg(long, default_value = "1.0")]
    speed: f64,

    /// Detector configuration JSON (missing keys use defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override detection threshold
    #[arg(long)]
    threshold: Option<f64>,

    /// Override consecutive quiet samples needed to close a span
    #[arg(long)]
    quiet_count: Option<usize>,

    /// Treat every crossing as a point event with fixed pre/post windows
    #[arg(long)]
    point_mode: bool,

    /// End-of-session sweep: off, drop-normal, or decimate:<K>
    #[arg(long)]
    sweep: Option<String>,

    /// Output directory
    #[arg(long, default_value = "bump_tracker_sessions")]
    output_dir: PathBuf,
}

fn parse_sweep(s: &str) -> Result<SweepPolicy> {
    match s {
        "off" => Ok(SweepPolicy::Off),
        "drop-normal" => Ok(SweepPolicy::DropNormal),
        other => {
            let every = other
                .strip_prefix("decimate:")
                .and_then(|k| k.parse::<usize>().ok())
                .with_context(|| format!("unknown sweep policy '{other}'"))?;
            Ok(SweepPolicy::Decimate { every })
        }
    }
}

fn load_config(args: &Args) -> Result<DetectorConfig> {
    let mut config = match &args.config {
        Some(path) => DetectorConfig::from_json_file(path)?,
        None => DetectorConfig::default(),
    };
    if let Some(threshold) = args.threshold {
        config.threshold = threshold;
    }
    if let Some(quiet_count) = args.quiet_count {
        config.quiet_count = quiet_count;
    }
    if args.point_mode {
        config.segment_mode = SegmentMode::Point;
    }
    if let Some(sweep) = &args.sweep {
        config.sweep = parse_sweep(sweep)?;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = load_config(&args)?;

    println!("[{}] Bump Tracker Starting", ts_now());
    println!("  Duration: {} seconds (0=until done)", args.duration);
    let source = args
        .log
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "simulated".to_string());
    println!("  Source: {}", source);
    println!("  Threshold: {} (quiet {})", config.threshold, config.quiet_count);
    println!("  Mode: {:?}, sweep {:?}", config.segment_mode, config.sweep);
    println!("  Output Dir: {}", args.output_dir.display());

    std::fs::create_dir_all(&args.output_dir)?;
    let replay = args.log.as_deref().map(ReplayLog::load).transpose()?;

    let motion = MotionFeed::new();
    let location = LocationFeed::new();
    let store = Arc::new(JsonlStore::new(args.output_dir.join("records"))?);
    let markers = Arc::new(GpxMarkerSink::new(
        args.output_dir.join(format!("markers_{}.gpx", ts_now_clean())),
        "bump markers",
    ));
    let markers_path = markers.path().to_path_buf();

    let mut tracker = Tracker::new(
        config,
        Arc::new(motion.clone()),
        Arc::new(location.clone()),
        store.clone(),
        markers,
    );
    let session_id = tracker.start_session()?;
    println!("[{}] Session {} started", ts_now(), session_id);

    let producer_cancel = CancellationToken::new();
    let mut producer = match replay {
        Some(log) => {
            println!(
                "[{}] Replaying {} readings ({:.1}s recorded)",
                ts_now(),
                log.readings.len(),
                log.duration()
            );
            let speed = (args.speed > 0.0).then_some(args.speed);
            let handle = log.replay(
                motion.clone(),
                location.clone(),
                speed,
                producer_cancel.clone(),
            );
            tokio::spawn(async move { handle.await.map(|n| n as u64).unwrap_or(0) })
        }
        None => simulate(
            motion.clone(),
            location.clone(),
            SimulationConfig::default(),
            producer_cancel.clone(),
        ),
    };

    let status_path = args.output_dir.join("live_status.json");
    let start = Instant::now();
    let mut last_status_update = Instant::now();

    loop {
        if args.duration > 0 && start.elapsed() >= Duration::from_secs(args.duration) {
            println!("[{}] Duration reached, stopping...", ts_now());
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("[{}] Interrupted, stopping...", ts_now());
                break;
            }
            produced = &mut producer => {
                println!("[{}] Source finished after {} readings", ts_now(), produced.unwrap_or(0));
                break;
            }
            _ = sleep(Duration::from_millis(200)) => {}
        }

        if last_status_update.elapsed() >= Duration::from_secs(2) {
            if let Err(e) = tracker.status().save(&status_path) {
                log::warn!("failed to write {}: {}", status_path.display(), e);
            }
            last_status_update = Instant::now();
        }
    }

    producer_cancel.cancel();
    let summary = tracker.stop_session().await?;

    let status_path = args.output_dir.join("live_status_final.json");
    tracker.status().save(&status_path)?;
    let summary_path = args.output_dir.join(format!("summary_{}.json", summary.session_id));
    std::fs::write(&summary_path, serde_json::to_string_pretty(&summary)?)?;

    println!("\n=== Final Stats ({}) ===", Utc::now().format("%Y-%m-%d %H:%M:%S"));
    println!("Samples: {} ({} malformed)", summary.engine.samples, summary.engine.malformed);
    println!(
        "Events detected: {} ({} gated)",
        summary.engine.spans_opened, summary.engine.gate_rejections
    );
    println!(
        "Records written: {} ({} failed)",
        summary.persistence.written, summary.persistence.failed_writes
    );
    println!("Markers placed: {}", summary.persistence.markers_placed);
    if let Some(sweep) = &summary.sweep {
        println!(
            "Sweep: kept {}, deleted {}, failed {}",
            sweep.kept, sweep.deleted, sweep.failed
        );
    }
    println!("Records: {}", store.session_path(&summary.session_id).display());
    println!("Markers: {}", markers_path.display());

    Ok(())
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
