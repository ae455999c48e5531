//! autorun-watch: follow a task's progress from another terminal.

mod monitor;
mod render;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use autorun::context::RunContext;
use autorun::core::clock::{Clock, SystemClock};
use autorun::core::types::SessionStatus;
use autorun::exit_codes;
use autorun::io::config::load_config;
use autorun::io::paths::AutorunPaths;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use crate::monitor::{MonitorExit, MonitorOptions, Observation, observe, run_monitor};
use crate::render::render_frame;

#[derive(Parser)]
#[command(name = "autorun-watch")]
#[command(about = "Follow an autorun task until it finishes")]
struct Args {
    /// Task to follow.
    task: String,

    /// State directory (default: ~/.autorun)
    #[arg(long, env = "AUTORUN_HOME")]
    home: Option<PathBuf>,

    /// Poll interval in seconds (default: watch.interval_secs from config.toml)
    #[arg(long)]
    interval: Option<u64>,

    /// Also exit when the task pauses or fails
    #[arg(long)]
    exit_on_stop: bool,

    /// Print the current status once and exit
    #[arg(long)]
    once: bool,

    /// Emit one JSON object per change instead of text
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("autorun_watch=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let paths = AutorunPaths::resolve(args.home.clone())?;
    let config = load_config(&paths.config_path)?;
    let clock = SystemClock;
    let ctx = RunContext::new(&paths, &config, &clock);

    if args.once {
        print_observation(&observe(ctx, &args.task)?, &args, &clock)?;
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; stopping");
            let _ = shutdown_tx.send(true);
        }
    });

    let options = MonitorOptions {
        interval: Duration::from_secs(args.interval.unwrap_or(config.watch.interval_secs).max(1)),
        exit_on_stop: args.exit_on_stop,
    };
    let mut print_error = None;
    let exit = run_monitor(ctx, &args.task, options, shutdown_rx, |observation| {
        if print_error.is_none()
            && let Err(err) = print_observation(observation, &args, &clock)
        {
            print_error = Some(err);
        }
    })
    .await?;
    if let Some(err) = print_error {
        return Err(err);
    }

    let code = match exit {
        MonitorExit::Shutdown => exit_codes::OK,
        MonitorExit::Finished(SessionStatus::Completed) => exit_codes::COMPLETE,
        MonitorExit::Finished(SessionStatus::Paused) => exit_codes::PAUSED,
        MonitorExit::Finished(_) => exit_codes::FAILED,
    };
    std::process::exit(code);
}

fn print_observation(observation: &Observation, args: &Args, clock: &dyn Clock) -> Result<()> {
    match observation {
        Observation::Waiting if args.json => {
            println!("{}", serde_json::json!({ "task": args.task, "status": null }));
        }
        Observation::Waiting => println!("{}: waiting for the first hook run", args.task),
        Observation::Status(status) if args.json => println!("{}", serde_json::to_string(status)?),
        Observation::Status(status) => println!("{}", render_frame(status, clock.now())),
    }
    Ok(())
}
