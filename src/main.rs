//! CLI Entry Point for ple_daq
//!
//! Runs one acquisition against the simulated instruments and saves the result
//! under the configured output directory.
//!
//! # Usage
//!
//! ```bash
//! ple_daq monitor --duration 10s
//! ple_daq tuning-curve 450 500 10 --samples 100
//! ple_daq spectrum 500 450 10 --no-power-meter --output runs/scan.json
//! ```

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ple_daq::acquisition::excitation::SpectrumRequest;
use ple_daq::acquisition::monitor::MonitorRequest;
use ple_daq::acquisition::plan::ScanPlan;
use ple_daq::acquisition::tuning_curve::TuningCurveRequest;
use ple_daq::config::DaqConfig;
use ple_daq::data::storage::{sink_for, DatasetSink};
use ple_daq::hardware::capabilities::DeviceProxy;
use ple_daq::hardware::mock::{MockCamera, MockOpo, MockPowerMeter};
use ple_daq::operator::{AutoConfirm, ConsolePrompt, OperatorGate};
use ple_daq::orchestrator::{Instruments, Orchestrator};
use ple_daq::tracing_init::{self, OutputFormat, TracingConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "ple_daq")]
#[command(about = "Synchronized excitation-scan acquisition", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, default_value = "config/ple_daq.toml")]
    config: PathBuf,

    /// Log output format: pretty, compact or json
    #[arg(long)]
    log_format: Option<OutputFormat>,

    /// Confirm operator steps automatically instead of waiting for Enter
    #[arg(long)]
    yes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sample the power meter for a fixed duration
    Monitor {
        /// How long to sample, e.g. "30s" or "2m"
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration, default_value = "10s")]
        duration: Duration,

        /// Readings per sample
        #[arg(long, default_value_t = 5)]
        samples: usize,

        /// Output file; defaults to <output_dir>/<dataset name>
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Mean source power at each wavelength of a scan
    TuningCurve {
        start: f64,
        stop: f64,
        step: f64,

        /// Readings averaged per wavelength
        #[arg(long, default_value_t = 100)]
        samples: usize,

        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// One camera frame per excitation wavelength, with power sampled during each exposure
    Spectrum {
        start: f64,
        stop: f64,
        step: f64,

        /// Camera exposure, e.g. "100ms"
        #[arg(long, value_parser = humantime_serde::re::humantime::parse_duration, default_value = "100ms")]
        exposure: Duration,

        /// Readings per power sample
        #[arg(long, default_value_t = 5)]
        samples: usize,

        /// Run without the power reference
        #[arg(long)]
        no_power_meter: bool,

        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = DaqConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let mut tracing_config = TracingConfig::from_config(&config).map_err(anyhow::Error::msg)?;
    if let Some(format) = cli.log_format {
        tracing_config = tracing_config.with_format(format);
    }
    tracing_init::init(tracing_config).map_err(anyhow::Error::msg)?;
    info!(app = %config.application.name, "Starting");

    let gate: Arc<dyn OperatorGate> = if cli.yes {
        Arc::new(AutoConfirm::new())
    } else {
        Arc::new(ConsolePrompt)
    };
    let sink: Arc<dyn DatasetSink> = Arc::from(sink_for(config.storage.format)?);

    match cli.command {
        Commands::Monitor {
            duration,
            samples,
            output,
        } => {
            let orchestrator = Orchestrator::new(instruments(&config, None, true), config, gate, sink);
            let request = MonitorRequest::new(duration).with_samples_per_point(samples);
            let series = orchestrator.monitor_power(&request, output.as_deref()).await?;
            info!(samples = series.series.len(), "Monitoring finished");
        }
        Commands::TuningCurve {
            start,
            stop,
            step,
            samples,
            output,
        } => {
            let orchestrator = Orchestrator::new(instruments(&config, None, true), config, gate, sink);
            let request =
                TuningCurveRequest::new(ScanPlan::new(start, stop, step)?).with_samples_per_point(samples);
            let curve = orchestrator.tuning_curve(&request, output.as_deref()).await?;
            info!(points = curve.points.len(), truncated = curve.truncated(), "Tuning curve finished");
        }
        Commands::Spectrum {
            start,
            stop,
            step,
            exposure,
            samples,
            no_power_meter,
            output,
        } => {
            let instruments = instruments(&config, Some(exposure), !no_power_meter);
            let orchestrator = Orchestrator::new(instruments, config, gate, sink);
            let request =
                SpectrumRequest::new(ScanPlan::new(start, stop, step)?).with_samples_per_point(samples);
            let outcome = orchestrator
                .excitation_spectrum(&request, output.as_deref())
                .await?;
            info!(
                frames = outcome.images.frames.len(),
                power_trace = outcome.power.is_some(),
                "Excitation spectrum finished"
            );
        }
    }

    Ok(())
}

/// Simulated instruments matching the configured source range.
fn instruments(config: &DaqConfig, exposure: Option<Duration>, with_meter: bool) -> Instruments {
    let source = MockOpo::new().with_range(config.source.min_nm, config.source.max_nm);
    let mut camera = MockCamera::default();
    if let Some(exposure) = exposure {
        camera = camera.with_exposure(exposure);
    }
    let power_meter = with_meter
        .then(|| Arc::new(MockPowerMeter::default()) as Arc<dyn DeviceProxy>);
    Instruments {
        source: Arc::new(source),
        camera: Arc::new(camera),
        power_meter,
    }
}
