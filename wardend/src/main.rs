//! Daemon entry point.
//!
//! Two verbs: `static` runs one analysis pass over a log file, `live`
//! serves the framed ingest and detects continuously. Exit codes: 0 on
//! success, 1 on usage or runtime errors, 2 on configuration validation
//! failures.

mod config;
mod live;
mod run_static;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use log::error;

use cidrwarden::report::RenderMode;

use crate::config::WardenConfig;

#[derive(Parser)]
#[command(
    name = "wardend",
    version,
    about = "Detect and jail abusive CIDR ranges in access-log traffic"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// One-shot analysis of an access-log file
    Static {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: PathBuf,
        /// Access log to analyse
        log_file: PathBuf,
        /// Report rendering
        #[arg(long, value_enum, default_value_t = OutputMode::Pretty)]
        format: OutputMode,
        /// Write the report here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Serve the framed ingest and detect continuously
    Live {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputMode {
    Pretty,
    Compact,
    Plain,
}

impl From<OutputMode> for RenderMode {
    fn from(mode: OutputMode) -> Self {
        match mode {
            OutputMode::Pretty => RenderMode::Pretty,
            OutputMode::Compact => RenderMode::Compact,
            OutputMode::Plain => RenderMode::Plain,
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Command::Static {
            config,
            log_file,
            format,
            output,
        } => {
            let config = match load_config(&config, false) {
                Ok(config) => config,
                Err(code) => return code,
            };
            match run_static::run(&config, &log_file, format.into(), output.as_ref()) {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    error!("{err:#}");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Live { config } => {
            let config = match load_config(&config, true) {
                Ok(config) => config,
                Err(code) => return code,
            };
            let shutdown = Arc::new(AtomicBool::new(false));
            for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
                if let Err(err) = signal_hook::flag::register(signal, Arc::clone(&shutdown)) {
                    error!("cannot register signal handler: {err}");
                    return ExitCode::FAILURE;
                }
            }
            match live::run(&config, shutdown) {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    error!("{err:#}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn load_config(path: &PathBuf, live: bool) -> Result<WardenConfig, ExitCode> {
    let config = match WardenConfig::load(path) {
        Ok(config) => config,
        Err(err) => {
            error!("{err:#}");
            return Err(ExitCode::from(2));
        }
    };
    if let Err(errors) = config.validate(live) {
        error!("{errors}");
        return Err(ExitCode::from(2));
    }
    Ok(config)
}
