//! CLI entry point for the mm-wave transmission bench.
//!
//! # Usage
//!
//! Sweep the source across 225–275 GHz and save the result:
//! ```bash
//! mmw-daq sweep frequency --start 225 --stop 275 --step 0.5 --output empty_path.csv
//! ```
//!
//! Watch the lock-in for ten minutes:
//! ```bash
//! mmw-daq monitor --interval 30s --duration 10m --output drift.csv
//! ```
//!
//! Talk to one instrument directly:
//! ```bash
//! mmw-daq query lock-in "SENS?"
//! mmw-daq snap x y r theta
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mmw_core::DaqError;
use mmw_driver_srs::{SnapParam, Sr830Driver};
use mmw_experiment::{
    frequency_steps, monitor, sweep, BenchConfig, Session, SweepResult, SweptParameter,
};
use mmw_hardware::{Command, Instrument, InstrumentDriver, Prologix};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mmw-daq")]
#[command(about = "Lock-in transmission measurements on the mm-wave bench", long_about = None)]
struct Cli {
    /// Bench configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log every wire exchange
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Step one parameter and record X/Y at each value
    Sweep {
        /// frequency, power, chopper-frequency, chopper-amplitude or phase
        parameter: SweptParameter,
        /// First value
        #[arg(long)]
        start: f64,
        /// Last value (included)
        #[arg(long)]
        stop: f64,
        /// Increment
        #[arg(long)]
        step: f64,
        /// Write the result here
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Record X/Y at a fixed interval with every setting held
    Monitor {
        /// Time between samples, e.g. "30s"
        #[arg(long, value_parser = parse_duration)]
        interval: Duration,
        /// Total time, e.g. "10m"
        #[arg(long, value_parser = parse_duration)]
        duration: Duration,
        /// Write the result here
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Send one command to one instrument and print the reply
    Query {
        /// Instrument to address
        target: Target,
        /// Command text; anything containing '?' waits for a reply
        command: String,
    },

    /// Print lock-in outputs captured at one instant
    Snap {
        /// Values to capture (x, y, r, theta, ...); defaults to x y
        params: Vec<SnapParam>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Target {
    LockIn,
    FunctionGenerator,
    Synthesizer,
}

fn parse_duration(s: &str) -> Result<Duration, humantime_serde::re::humantime::DurationError> {
    humantime_serde::re::humantime::parse_duration(s)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    finish(run(cli).await)
}

/// Log a failure once and turn it into the process status.
fn finish(outcome: Result<()>) -> ExitCode {
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(DaqError::TransportOpen { resource, .. }) = e.downcast_ref::<DaqError>() {
                error!("Cannot reach {}; check the cable and device permissions", resource);
            }
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = BenchConfig::load(cli.config.as_deref()).context("loading bench configuration")?;

    match cli.command {
        Commands::Sweep {
            parameter,
            start,
            stop,
            step,
            output,
        } => {
            let values = frequency_steps(start, stop, step)?;
            info!("Sweeping {} over {} values", parameter, values.len());
            let mut session = Session::open(&config).await?;
            let result = sweep(
                &mut session,
                &parameter,
                &values,
                &config.sweep,
                output.as_deref(),
            )
            .await?;
            print_result(&result);
        }
        Commands::Monitor {
            interval,
            duration,
            output,
        } => {
            let mut session = Session::open(&config).await?;
            let result = monitor(
                &mut session,
                &config.sweep,
                interval,
                duration,
                output.as_deref(),
            )
            .await?;
            print_result(&result);
        }
        Commands::Query { target, command } => query(&config, target, &command).await?,
        Commands::Snap { params } => snap(&config, &params).await?,
    }
    Ok(())
}

async fn query(config: &BenchConfig, target: Target, command: &str) -> Result<()> {
    let mut instrument = match target {
        Target::LockIn => Instrument::gpib(
            Prologix::open(&config.bus).await?,
            config.instruments.lock_in_address,
        )
        .with_name("Lock-In"),
        Target::FunctionGenerator => Instrument::gpib(
            Prologix::open(&config.bus).await?,
            config.instruments.function_generator_address,
        )
        .with_name("Function Generator"),
        Target::Synthesizer => Instrument::usb(
            config.instruments.synthesizer_path.clone(),
            config.instruments.usb_timeout,
        )
        .with_name("Frequency Synthesizer"),
    };
    instrument.open().await?;

    let command = if command.contains('?') {
        Command::query(command)
    } else {
        Command::write(command)
    };
    match instrument.execute(&command).await? {
        Some(reply) => println!("{}", reply),
        None => println!("ok"),
    }

    instrument.close().await?;
    Ok(())
}

async fn snap(config: &BenchConfig, params: &[SnapParam]) -> Result<()> {
    let bus = Prologix::open(&config.bus).await?;
    let mut lock_in = Sr830Driver::new(
        Instrument::gpib(bus, config.instruments.lock_in_address).with_name("Lock-In"),
    );
    lock_in.open().await?;
    lock_in.initialize_instrument().await?;

    let params = if params.is_empty() {
        &[SnapParam::X, SnapParam::Y][..]
    } else {
        params
    };
    for (param, value) in lock_in.snap_values(params).await? {
        println!("{:>6} = {}", param.name(), value);
    }

    lock_in.close().await?;
    Ok(())
}

fn print_result(result: &SweepResult) {
    println!("{:>16} {:>16} {:>16}", result.parameter, "x", "y");
    for row in &result.rows {
        println!("{:>16} {:>16e} {:>16e}", row.value, row.x, row.y);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn failure_is_reported_once() {
        let err = anyhow::Error::new(DaqError::TransportOpen {
            resource: "/dev/ttyUSB9".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such device"),
        })
        .context("opening the bus");

        let code = finish(Err(err));

        assert_eq!(format!("{:?}", code), format!("{:?}", ExitCode::FAILURE));
        assert!(logs_contain("Cannot reach /dev/ttyUSB9"));
        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|l| l.contains("opening the bus")).count() {
                1 => Ok(()),
                n => Err(format!("error logged {} times", n)),
            }
        });
    }

    #[test]
    fn success_exits_cleanly() {
        assert_eq!(
            format!("{:?}", finish(Ok(()))),
            format!("{:?}", ExitCode::SUCCESS)
        );
    }
}
