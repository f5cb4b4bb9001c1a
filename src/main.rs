use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use callgauge::deliver::{latest_snapshot, snapshot_dir};
use callgauge::error::Error;
use callgauge::json::{load_snapshot, JsonRenderer};
use callgauge::outline::OutlineRenderer;
use callgauge_runtime::{RenderOptions, Renderer};

#[derive(Parser)]
#[command(
    name = "callgauge",
    about = "Inspect call-graph snapshots delivered by callgauge-runtime",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the latest snapshot (or a specific one).
    Report {
        /// Path to a snapshot file. If omitted, shows the latest.
        snapshot: Option<PathBuf>,

        /// Directory to search for the latest snapshot. Defaults to
        /// $CALLGAUGE_SNAPSHOT_DIR, then ~/.callgauge/snapshots.
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Print JSON instead of an outline.
        #[arg(long)]
        json: bool,

        /// Prefix methods with their class.
        #[arg(long)]
        class_names: bool,

        /// Mark the most expensive call at every level.
        #[arg(long)]
        highlight: bool,

        /// Show per-method min and max.
        #[arg(long)]
        min_max: bool,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    match cli.command {
        Commands::Report {
            snapshot,
            dir,
            json,
            class_names,
            highlight,
            min_max,
        } => cmd_report(
            snapshot,
            dir,
            json,
            RenderOptions {
                class_names,
                highlight_critical: highlight,
                min_max,
                pretty: true,
            },
        ),
    }
}

fn cmd_report(
    snapshot: Option<PathBuf>,
    dir: Option<PathBuf>,
    json: bool,
    options: RenderOptions,
) -> Result<(), Error> {
    let path = match snapshot {
        Some(path) => path,
        None => {
            let dir = dir
                .or_else(snapshot_dir)
                .ok_or_else(|| Error::NoSnapshots(PathBuf::from("~/.callgauge/snapshots")))?;
            latest_snapshot(&dir)?
        }
    };
    log::debug!("reporting {}", path.display());
    let snapshot = load_snapshot(&path)?;
    let renderer: &dyn Renderer = if json { &JsonRenderer } else { &OutlineRenderer };
    let mut out = renderer.render(&snapshot, &options)?;
    if !out.ends_with('\n') {
        out.push('\n');
    }
    anstream::print!("{out}");
    Ok(())
}
