//! CLI entry point for fluor-daq
//!
//! Provides command-line interface for:
//! - Running the fluorescence-induction protocol against the simulated
//!   instrument
//! - Printing the protocol plan (timeline and sample counts) for a config
//!
//! # Usage
//!
//! Run a protocol:
//! ```bash
//! fluor-daq run --config config/fluor.toml --filename leaf_01.csv
//! ```
//!
//! Inspect the plan:
//! ```bash
//! fluor-daq plan --config config/fluor.toml
//! ```
//!
//! Ctrl-C during a run cancels it; the partial waveform is still saved.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fluor_core::{Clock, MonotonicClock, SimulatedClock};
use fluor_daq::config::{AppConfig, DEFAULT_CONFIG_PATH};
use fluor_daq::experiment::ensure_csv_suffix;
use fluor_daq::led::{intensity_to_voltage, Led};
use fluor_daq::{logging, CsvRunSink, ProtocolOrchestrator, Timeline};
use fluor_driver_mock::MockPort;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "fluor-daq")]
#[command(about = "Sample-synchronized fluorescence-induction protocol controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the protocol against the simulated instrument
    Run {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Override the output directory
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Override the waveform file name
        #[arg(long)]
        filename: Option<String>,

        /// Pace the run on the wall clock instead of simulated time
        #[arg(long)]
        realtime: bool,
    },

    /// Validate the experiment and print its timeline
    Plan {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            output_dir,
            filename,
            realtime,
        } => {
            let mut app = load_config(&config)?;
            if let Some(dir) = output_dir {
                app.storage.output_dir = dir;
            }
            if let Some(name) = filename {
                app.experiment.filename = ensure_csv_suffix(&name);
            }
            app.validate().map_err(anyhow::Error::msg)?;
            run_protocol(app, realtime).await
        }
        Commands::Plan { config } => {
            let app = load_config(&config)?;
            app.validate().map_err(anyhow::Error::msg)?;
            print_plan(&app)
        }
    }
}

fn load_config(path: &Path) -> Result<AppConfig> {
    let app = AppConfig::load_from(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    logging::init_from_config(&app).map_err(anyhow::Error::msg)?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(app)
}

async fn run_protocol(app: AppConfig, realtime: bool) -> Result<()> {
    let clock: Arc<dyn Clock> = if realtime {
        Arc::new(MonotonicClock::new())
    } else {
        Arc::new(SimulatedClock::new())
    };

    let simulator = &app.simulator;
    let mut port = MockPort::builder(clock.clone())
        .startup_delay(simulator.startup_delay())
        .noise(simulator.noise_v);
    if let Some(seed) = simulator.seed {
        port = port.seed(seed);
    }

    let sink = CsvRunSink::new(&app.storage.output_dir);
    let mut orchestrator = ProtocolOrchestrator::new(port.build(), sink, clock)
        .with_options(app.acquisition.options());
    let cancel = orchestrator.cancel_handle();

    println!("🔬 {} - fluorescence induction", app.application.name);
    println!(
        "   {} Hz, output {}",
        app.experiment.recording_hz,
        app.storage.output_dir.join(&app.experiment.filename).display()
    );
    if !realtime {
        println!("   Simulated time (use --realtime to pace on the wall clock)");
    }
    println!();

    let experiment = app.experiment.clone();
    let mut task = tokio::task::spawn_blocking(move || orchestrator.run_protocol(&experiment));

    let outcome = tokio::select! {
        joined = &mut task => joined?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Ctrl-C received, cancelling protocol");
            cancel.cancel();
            task.await?
        }
    }?;

    let report = &outcome.report;
    if report.lost || report.corrupted {
        println!(
            "⚠️  Sample faults: {} lost, {} corrupted",
            report.lost_samples, report.corrupted_samples
        );
    }
    if report.overrun {
        println!("⚠️  Acquisition buffer overrun");
    }
    println!(
        "   {} of {} samples, events in {}",
        report.true_sample_count,
        report.nominal_sample_count,
        outcome.events_path.display()
    );
    println!("✅ {}", outcome.message());
    Ok(())
}

fn print_plan(app: &AppConfig) -> Result<()> {
    let experiment = &app.experiment;
    let counts = experiment.sample_counts()?;
    let timeline = Timeline::from_config(experiment);

    println!("📋 Protocol plan");
    println!(
        "   Ared {}% ({:.3} V), Agreen {}% ({:.3} V)",
        experiment.actinic_led_intensity,
        intensity_to_voltage(Led::Red, experiment.actinic_led_intensity)?,
        experiment.measurement_led_intensity,
        intensity_to_voltage(Led::Green, experiment.measurement_led_intensity)?,
    );
    println!(
        "   {} Hz, protocol {:.4} s, {} samples saved, {} requested",
        experiment.recording_hz,
        counts.protocol_duration_s,
        counts.nominal,
        counts.acquisition_budget
    );
    println!();
    println!("{}", timeline);
    Ok(())
}
