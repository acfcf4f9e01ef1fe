//! Roadmap Storage CLI
//!
//! Maintenance entry point for the roadmap database.
//!
//! ## Usage
//!
//! ```bash
//! # Create the database and a default config
//! roadmap-storage init
//!
//! # Row counts
//! roadmap-storage stats
//!
//! # Check every career's orders are exactly 1..=steps_count
//! roadmap-storage verify
//!
//! # Print a learner's roadmap as JSON
//! roadmap-storage render --career <id> --user <id>
//!
//! # Use a custom storage directory
//! roadmap-storage --storage-dir /data/roadmaps stats
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use roadmap_storage::services::{response, spawn_logging_listener};
use roadmap_storage::{Config, RoadmapDb, Services};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "roadmap-storage")]
#[command(about = "Career roadmap ordering and progress storage")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "ROADMAP_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "ROADMAP_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the storage directory, database and default config
    Init,
    /// Print row counts
    Stats,
    /// Check the order invariant of every career
    Verify,
    /// Print a user's roadmap for a career as JSON
    Render {
        #[arg(long)]
        career: String,
        #[arg(long)]
        user: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("roadmap_storage=info".parse()?))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    config.validate()?;

    tokio::fs::create_dir_all(&config.storage_dir).await?;

    let db = RoadmapDb::open(&config)?;
    let services = Services::new(db.clone(), &config);
    let _listener = spawn_logging_listener(services.events.clone());

    match args.command {
        Command::Init => {
            let config_path = config.config_path();
            if !config_path.exists() {
                config.save(&config_path)?;
                info!(path = %config_path.display(), "Created default config");
            }
            info!(
                database = %config.database_path().display(),
                "Roadmap storage initialized"
            );
        }
        Command::Stats => {
            let stats = db.stats()?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Verify => {
            let reports = services.roadmap.verify_all()?;
            let broken: Vec<_> = reports.iter().filter(|r| !r.is_valid()).collect();
            for report in &broken {
                warn!(
                    career = %report.career_id,
                    steps_count = report.steps_count,
                    rows = report.row_count,
                    missing = ?report.missing,
                    unexpected = ?report.unexpected,
                    "Order invariant violated"
                );
            }
            info!(careers = reports.len(), broken = broken.len(), "Verification finished");
            if !broken.is_empty() {
                bail!("{} of {} careers violate the order invariant", broken.len(), reports.len());
            }
        }
        Command::Render { career, user } => {
            let result = services.roadmap.render_roadmap(&career, &user);
            println!("{}", serde_json::to_string_pretty(&response::envelope(&result))?);
        }
    }

    Ok(())
}
