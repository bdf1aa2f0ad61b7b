mod output;
mod root;
mod run;

use chrono::{DateTime, Utc};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "dead-mans-switch",
    about = "Send your final messages if your repository stops seeing commits",
    version
)]
struct Cli {
    /// Hours without a commit before the first warning (minimum 24)
    heartbeat_interval_hours: Option<u32>,

    /// Warnings sent to you before the final messages go out
    number_of_warnings: Option<u32>,

    /// Deliver to the real recipients. Without this flag, DMS_ARMED or `armed:` in
    /// .dms/config.yaml decide; if neither is set the run is in test mode and
    /// everything goes to MY_EMAIL
    #[arg(long)]
    armed: bool,

    /// Label this run as manually dispatched rather than scheduled
    #[arg(long)]
    manual_dispatch: bool,

    /// Evaluate and render, but send nothing and write no marker
    #[arg(long)]
    dry_run: bool,

    /// Push the marker commit to the default remote
    #[arg(long)]
    push: bool,

    /// Write messages as .eml files into DIR instead of sending them
    #[arg(long, value_name = "DIR", env = "DMS_OUTBOX_DIR")]
    outbox: Option<PathBuf>,

    /// Repository root (default: nearest directory containing .git/)
    #[arg(long, env = "DMS_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, short = 'j')]
    json: bool,

    /// Evaluate as if the current time were this RFC 3339 instant
    #[arg(long, env = "DMS_NOW", hide = true)]
    now: Option<DateTime<Utc>>,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let json = cli.json;

    let args = run::RunArgs {
        heartbeat_interval_hours: cli.heartbeat_interval_hours,
        number_of_warnings: cli.number_of_warnings,
        armed: cli.armed,
        manual_dispatch: cli.manual_dispatch,
        dry_run: cli.dry_run,
        push: cli.push,
        outbox: cli.outbox,
        now: cli.now,
    };

    if let Err(e) = run::run(&root, args, json) {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
