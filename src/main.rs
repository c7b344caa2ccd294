mod app;
mod cache;
mod clock;
mod commands;
mod config;
mod connectivity;
mod db;
mod engine;
mod event;
mod logging;
mod remote;
mod sync;
mod tasks;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::time::Duration;

use crate::commands::Command;
use crate::connectivity::{ConnectivityProbe, HttpProbe};

#[derive(Parser, Debug)]
#[command(name = "tripsync")]
#[command(about = "Offline-first cache and sync engine for trips, bookings and emergency contacts")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tripsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Mirror log output to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log, args.verbose)?;

  let engine = engine::OfflineEngine::open(&config)?;

  match args.command {
    Command::Run => {
      let mut app = app::App::new(engine, config);
      app.run().await?;
    }
    command => {
      // One-shot commands that talk to the remote need a connectivity reading first
      if matches!(command, Command::Sync | Command::Status) {
        let probe = HttpProbe::new(
          config.probe_url()?,
          Duration::from_secs(config.remote.timeout_secs),
        )?;
        engine.monitor().report(probe.is_reachable().await);
      }
      commands::execute(&engine, command).await?;
    }
  }

  Ok(())
}
