//! Tracing Infrastructure
//!
//! Structured, async-aware logging for the acquisition scheduler, built on the
//! `tracing` and `tracing-subscriber` crates:
//! - Structured events with fields (`setpoint`, `elapsed_ms`, `device`)
//! - Spans around each acquisition routine
//! - Multiple output formats (pretty, compact, JSON)
//! - Environment-based filtering (`RUST_LOG` wins over the configured level)
//!
//! # Example
//! ```no_run
//! use ple_daq::{config::DaqConfig, tracing_init};
//! use tracing::{info, warn};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DaqConfig::load()?;
//! tracing_init::init_from_config(&config)?;
//!
//! info!("Scheduler started");
//! warn!(device = "power_meter", setpoint = 480.0, "Reference timed out");
//! # Ok(())
//! # }
//! ```

use crate::config::DaqConfig;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Output format for tracing
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Pretty-printed format with colors (for development)
    Pretty,
    /// Compact format without colors (for production)
    Compact,
    /// JSON format for structured logging (for log aggregation)
    Json,
}

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Whether to include span events (ENTER, EXIT, CLOSE)
    pub with_span_events: bool,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to include thread IDs
    pub with_thread_ids: bool,
    /// Whether to include thread names
    pub with_thread_names: bool,
    /// Whether to enable ANSI colors (only for Pretty format)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Pretty,
            with_span_events: true,
            with_file_and_line: true,
            with_thread_ids: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Create tracing config from the loaded configuration
    pub fn from_config(config: &DaqConfig) -> Result<Self, String> {
        let level = parse_log_level(&config.application.log_level)?;

        Ok(Self {
            level,
            ..Default::default()
        })
    }

    /// Create tracing config with custom settings
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize tracing from the loaded configuration
///
/// Reads the log level from `application.log_level`.
pub fn init_from_config(config: &DaqConfig) -> Result<(), String> {
    let tracing_config = TracingConfig::from_config(config)?;
    init(tracing_config)
}

/// Initialize tracing with custom configuration
///
/// This allows more fine-grained control over tracing initialization.
///
/// This function is idempotent - if tracing is already initialized, it will
/// return Ok(()) without error. This makes it safe to call in tests and libraries.
///
/// # Example
/// ```no_run
/// use ple_daq::tracing_init::{self, TracingConfig, OutputFormat};
/// use tracing::Level;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = TracingConfig::new(Level::DEBUG)
///     .with_format(OutputFormat::Json)
///     .with_span_events(false);
///
/// tracing_init::init(config)?;
/// # Ok(())
/// # }
/// ```
pub fn init(config: TracingConfig) -> Result<(), String> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    // RUST_LOG takes precedence over the configured level
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_ids(config.with_thread_ids)
        .with_thread_names(config.with_thread_names);

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        OutputFormat::Pretty => base.pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(false).boxed(),
        OutputFormat::Json => base.json().with_ansi(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init()
        .or_else(|e| {
            // Already initialized is expected in tests and embedding applications
            if e
                .to_string()
                .contains("a global default trace dispatcher has already been set")
            {
                Ok(())
            } else {
                Err(format!("Failed to initialize tracing: {}", e))
            }
        })
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!(
                "Invalid log format '{}'. Must be one of: pretty, compact, json",
                other
            )),
        }
    }
}

/// Parse log level string into tracing Level
fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}

/// Convert Level to env filter string
fn level_to_filter_string(level: Level) -> String {
    level.as_str().to_lowercase()
}
