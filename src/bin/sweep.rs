use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};

use bump_tracker_rs::config::SweepPolicy;
use bump_tracker_rs::reconciler::{plan_sweep, sweep_session};
use bump_tracker_rs::{JsonlStore, RecordStore, SessionId};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Policy {
    Off,
    DropNormal,
    Decimate,
}

#[derive(Parser, Debug)]
#[command(about = "Re-run the end-of-session sweep over a JSON-lines record store")]
struct Args {
    /// Directory holding <session_id>.jsonl files
    #[arg(long)]
    records: PathBuf,

    /// Session to sweep (e.g. sess_1700000000123)
    #[arg(long)]
    session: String,

    #[arg(long, value_enum, default_value = "decimate")]
    policy: Policy,

    /// Keep every K-th record of each Normal run (decimate only)
    #[arg(long, default_value = "8")]
    every: usize,

    /// Print the keep/delete partition without deleting anything
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let policy = match args.policy {
        Policy::Off => SweepPolicy::Off,
        Policy::DropNormal => SweepPolicy::DropNormal,
        Policy::Decimate if args.every == 0 => bail!("--every must be at least 1"),
        Policy::Decimate => SweepPolicy::Decimate { every: args.every },
    };

    let store = JsonlStore::new(&args.records)?;
    let session = SessionId::from(args.session.as_str());
    if !store.session_path(&session).exists() {
        bail!("no records for {} in {}", session, args.records.display());
    }

    if args.dry_run {
        let records = store.read_all(&session).await?;
        let plan = plan_sweep(&records, policy);
        println!(
            "{} records, keep {}, delete {}",
            records.len(),
            plan.keep.len(),
            plan.delete.len()
        );
        println!("delete: {:?}", plan.delete);
        return Ok(());
    }

    let report = sweep_session(&store, &session, policy).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
