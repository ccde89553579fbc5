use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use updown::config::{ConfigStore, FileConfigStore, TrainingConfig};
use updown::controller::SessionController;
use updown::devices::{Button, HardwareStatus};
use updown::monitor::ReconnectMonitor;
use updown::safety::spawn_signal_guard;
use updown::sim::SimWorld;

/// Unattended position-training session controller
#[derive(Parser, Debug)]
#[clap(version, about)]
struct Cli {
    /// config file to use instead of the per-user default
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// print the effective configuration as JSON
    Config {
        /// write the default configuration to the config path first
        #[clap(long)]
        write_default: bool,
    },
    /// run a whole session against the simulated rig and print its report
    Simulate {
        /// rng seed for every random draw
        #[clap(long, default_value_t = 7)]
        seed: u64,

        /// use the shortened testing timings
        #[clap(long)]
        testing: bool,

        /// let the simulated subject drift out of position every N seconds
        #[clap(long)]
        lapse_every: Option<u64>,

        /// length of each drift in seconds
        #[clap(long, default_value_t = 15)]
        lapse_secs: u64,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let store = match &cli.config {
        Some(path) => FileConfigStore::with_path(path),
        None => FileConfigStore::new(),
    };

    match cli.command {
        Command::Config { write_default } => {
            if write_default {
                store.save(&TrainingConfig::default())?;
                info!(path = %store.path().display(), "default config written");
            }
            let cfg = store.load()?;
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
        Command::Simulate {
            seed,
            testing,
            lapse_every,
            lapse_secs,
        } => {
            let cfg = if testing {
                TrainingConfig::testing()
            } else {
                store.load()?
            };

            let world = SimWorld::new();
            world.press(Duration::from_secs(1), Button::Extension);
            if let Some(every) = lapse_every {
                world.lapse_every(Duration::from_secs(every), Duration::from_secs(lapse_secs));
            }

            let status = Arc::new(HardwareStatus::new());
            let monitor = ReconnectMonitor::spawn(
                world.device_check(),
                status.clone(),
                Duration::from_secs_f64(cfg.polling.hardware_monitor_secs.max(0.1)),
            )?;

            let rig = world.threaded_rig(status)?;
            let mut session = SessionController::new(cfg, rig, StdRng::seed_from_u64(seed))?;
            spawn_signal_guard(session.rig().switchboard.clone())?;
            let report = session.run()?;
            monitor.stop();

            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
