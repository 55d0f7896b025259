//! Demo supervisor: start workers, wait for SIGINT/SIGTERM, stop them cleanly.

use std::time::Duration;

use clap::{ArgAction, Parser};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

use coop_shutdown::config::{DEFAULT_MAX_SLEEP, DEFAULT_WORKER_COUNT};
use coop_shutdown::error::Result;
use coop_shutdown::signal::SignalListener;
use coop_shutdown::{ShutdownConfig, ShutdownCoordinator, SignalOptions};

#[derive(Debug, Parser)]
#[command(
    name = "coop-shutdown",
    about = "Run background workers until SIGINT/SIGTERM, then stop them cooperatively"
)]
struct Cli {
    /// Number of worker threads
    #[arg(long, env = "COOP_WORKERS", default_value_t = DEFAULT_WORKER_COUNT)]
    workers: usize,

    /// Exclusive upper bound of the random sleep between iterations (ms)
    #[arg(long, env = "COOP_MAX_SLEEP_MS", value_name = "MILLIS",
          default_value_t = DEFAULT_MAX_SLEEP.as_millis() as u64)]
    max_sleep_ms: u64,

    /// Give up waiting for workers after this long (ms); waits forever if unset
    #[arg(long, env = "COOP_SHUTDOWN_TIMEOUT_MS", value_name = "MILLIS")]
    shutdown_timeout_ms: Option<u64>,

    /// Exit immediately with status 1 on a second signal
    #[arg(long)]
    force_exit_on_repeat: bool,

    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn shutdown_config(&self) -> ShutdownConfig {
        ShutdownConfig::default()
            .with_workers(self.workers)
            .with_max_sleep(Duration::from_millis(self.max_sleep_ms))
            .with_shutdown_timeout(self.shutdown_timeout_ms.map(Duration::from_millis))
    }

    fn signal_options(&self) -> SignalOptions {
        SignalOptions {
            force_exit_on_repeat: self.force_exit_on_repeat,
            ..SignalOptions::default()
        }
    }
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    fmt().with_env_filter(filter).with_thread_names(true).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = cli.shutdown_config();
    config.validate()?;

    // Install handlers before any worker exists so an early signal is not lost
    let listener = SignalListener::install(&cli.signal_options())?;

    let workers = config.workers;
    let mut coordinator = ShutdownCoordinator::new(config);
    coordinator.spawn_workers(workers)?;
    coordinator.run_until_signal(&listener)?;

    listener.close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_hook::consts::signal::{SIGINT, SIGTERM};

    #[test]
    fn test_flags_map_into_shutdown_config() {
        let cli = Cli::try_parse_from([
            "coop-shutdown",
            "--workers",
            "7",
            "--max-sleep-ms",
            "250",
            "--shutdown-timeout-ms",
            "1500",
        ])
        .unwrap();

        let config = cli.shutdown_config();
        assert_eq!(config.workers, 7);
        assert_eq!(config.max_sleep, Duration::from_millis(250));
        assert_eq!(config.shutdown_timeout, Some(Duration::from_millis(1500)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_force_exit_flag_maps_into_signal_options() {
        let cli = Cli::try_parse_from(["coop-shutdown", "--force-exit-on-repeat", "-vv"]).unwrap();

        let options = cli.signal_options();
        assert!(options.force_exit_on_repeat);
        assert_eq!(options.signals, vec![SIGINT, SIGTERM]);
        assert_eq!(cli.verbose, 2);

        let cli = Cli::try_parse_from(["coop-shutdown"]).unwrap();
        assert!(!cli.signal_options().force_exit_on_repeat);
    }

    // Defaults and env fallbacks share one test since both read the process env
    #[test]
    fn test_defaults_and_env_fallbacks() {
        for var in ["COOP_WORKERS", "COOP_MAX_SLEEP_MS", "COOP_SHUTDOWN_TIMEOUT_MS"] {
            std::env::remove_var(var);
        }
        let config = Cli::try_parse_from(["coop-shutdown"]).unwrap().shutdown_config();
        assert_eq!(config, ShutdownConfig::default());

        std::env::set_var("COOP_WORKERS", "5");
        std::env::set_var("COOP_MAX_SLEEP_MS", "40");
        std::env::set_var("COOP_SHUTDOWN_TIMEOUT_MS", "900");
        let from_env = Cli::try_parse_from(["coop-shutdown"]).unwrap().shutdown_config();
        let overridden = Cli::try_parse_from(["coop-shutdown", "--workers", "2"])
            .unwrap()
            .shutdown_config();
        for var in ["COOP_WORKERS", "COOP_MAX_SLEEP_MS", "COOP_SHUTDOWN_TIMEOUT_MS"] {
            std::env::remove_var(var);
        }

        assert_eq!(from_env.workers, 5);
        assert_eq!(from_env.max_sleep, Duration::from_millis(40));
        assert_eq!(from_env.shutdown_timeout, Some(Duration::from_millis(900)));
        assert_eq!(overridden.workers, 2);
    }

    #[test]
    fn test_zero_workers_parses_but_fails_validation() {
        let cli = Cli::try_parse_from(["coop-shutdown", "--workers", "0"]).unwrap();
        assert!(cli.shutdown_config().validate().is_err());
    }

    #[test]
    fn test_non_numeric_value_rejected() {
        assert!(Cli::try_parse_from(["coop-shutdown", "--workers", "three"]).is_err());
    }
}
