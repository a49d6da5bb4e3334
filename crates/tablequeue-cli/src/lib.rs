//! # Table Queue CLI
//!
//! Command-line front end for the table queue receive pipeline.
//!
//! This module provides CLI commands for:
//! - Running a message pump against a seeded in-memory queue
//! - Validating and printing the resolved transport settings

use clap::{Parser, Subcommand};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tablequeue_core::{
    InMemoryStorage, LogCriticalError, MessagePump, PumpStatsSnapshot, TransportError,
    TransportSettings,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod demo;

use demo::{DemoHandler, DemoRecoverability};

// ============================================================================
// CLI Structure
// ============================================================================

/// Table queue CLI - receive pipeline for table-backed message queues
#[derive(Parser)]
#[command(name = "tablequeue")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Receive pipeline for table-backed message queues")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "TQ_CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Logging level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Pump an in-memory queue seeded with generated messages
    Run {
        /// Input queue name (overrides configuration)
        #[arg(short, long)]
        queue: Option<String>,

        /// Number of valid messages to seed
        #[arg(short, long, default_value = "100")]
        messages: usize,

        /// Number of malformed rows to seed
        #[arg(long, default_value = "0")]
        poison: usize,

        /// Fail every Nth delivery to exercise recoverability
        #[arg(long)]
        fail_every: Option<u64>,

        /// Maximum receives in flight (overrides configuration)
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(short, long)]
        duration: Option<u64>,
    },

    /// Validate configuration and print the resolved settings
    Config {
        /// Output format for configuration
        #[arg(short = 'f', long, default_value = "toml")]
        format: ConfigFormat,
    },
}

/// Configuration format options
#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// JSON format
    Json,
    /// TOML format
    Toml,
}

// ============================================================================
// Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Transport(_) => 2,
            Self::CommandFailed { .. } => 3,
            Self::InvalidArgument { .. } => 4,
            Self::Io(_) => 5,
        }
    }
}

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(TransportError),

    #[error("Failed to render configuration as TOML: {0}")]
    RenderToml(#[from] toml::ser::Error),

    #[error("Failed to render configuration as JSON: {0}")]
    RenderJson(#[from] serde_json::Error),
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli.log_level, cli.json_logs)?;

    let settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            queue,
            messages,
            poison,
            fail_every,
            max_concurrency,
            duration,
        } => {
            let options = RunOptions {
                queue,
                messages,
                poison,
                fail_every,
                max_concurrency,
            };

            let summary = match duration {
                Some(seconds) => {
                    execute_run_command(settings, options, tokio::time::sleep(Duration::from_secs(seconds)))
                        .await?
                }
                None => {
                    execute_run_command(settings, options, async {
                        if let Err(e) = tokio::signal::ctrl_c().await {
                            tracing::warn!(error = %e, "Failed to listen for Ctrl-C; stopping");
                        }
                    })
                    .await?
                }
            };

            println!("{}", serde_json::to_string_pretty(&summary).map_err(ConfigError::from)?);
            Ok(())
        }
        Commands::Config { format } => {
            println!("{}", execute_config_command(&settings, format)?);
            Ok(())
        }
    }
}

/// Install the tracing subscriber
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn initialize_logging(level: &str, json: bool) -> Result<(), CliError> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("tablequeue_core={level},tablequeue_cli={level}").into()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .try_init()
        .map_err(|e| CliError::CommandFailed {
            message: format!("failed to initialize logging: {}", e),
        })
}

/// Resolve transport settings from files and the environment
///
/// Sources, later ones overriding earlier ones:
///  1. `/etc/tablequeue/transport.{toml,yaml,json}` (optional)
///  2. `config/transport.{toml,yaml,json}` (optional)
///  3. `explicit_path` (required when given)
///  4. Environment variables prefixed `TQ__`, e.g. `TQ__MAX_CONCURRENCY=4`
///     or `TQ__CIRCUIT_BREAKER__FAILURE_BACKOFF_MS=500`
///
/// Every field has a default; the result is not validated here.
pub fn load_settings(explicit_path: Option<&Path>) -> Result<TransportSettings, ConfigError> {
    let mut builder = config::Config::builder()
        .add_source(config::File::with_name("/etc/tablequeue/transport").required(false))
        .add_source(config::File::with_name("config/transport").required(false));

    if let Some(path) = explicit_path {
        info!(path = %path.display(), "Loading configuration from explicit path");
        builder = builder.add_source(config::File::from(path).required(true));
    }

    let settings = builder
        .add_source(
            config::Environment::with_prefix("TQ")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    Ok(settings)
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Options of the `run` command
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub queue: Option<String>,
    pub messages: usize,
    pub poison: usize,
    pub fail_every: Option<u64>,
    pub max_concurrency: Option<usize>,
}

/// What a `run` left behind
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct RunSummary {
    pub input_queue: String,
    pub remaining: usize,
    pub error_queue_depth: usize,
    pub stats: PumpStatsSnapshot,
}

/// Seed an in-memory queue and pump it until `shutdown` completes
pub async fn execute_run_command(
    mut settings: TransportSettings,
    options: RunOptions,
    shutdown: impl Future<Output = ()>,
) -> Result<RunSummary, CliError> {
    if let Some(queue) = options.queue {
        settings.input_queue = queue;
    }
    if settings.input_queue.is_empty() {
        settings.input_queue = "tablequeue.demo".to_string();
    }
    if let Some(max_concurrency) = options.max_concurrency {
        if max_concurrency == 0 {
            return Err(CliError::InvalidArgument {
                arg: "max-concurrency".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        settings.max_concurrency = max_concurrency;
    }
    if options.fail_every == Some(0) {
        return Err(CliError::InvalidArgument {
            arg: "fail-every".to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    settings.validate().map_err(ConfigError::Invalid)?;

    let input_queue = settings.input_queue_address()?;
    let error_queue = settings.error_queue_address()?;
    let storage = Arc::new(InMemoryStorage::with_queues([&input_queue, &error_queue]));
    demo::seed(&storage, &input_queue, options.messages, options.poison)?;

    info!(
        queue = %input_queue,
        messages = options.messages,
        poison = options.poison,
        "Seeded input queue"
    );

    let max_concurrency = settings.max_concurrency;
    let mut pump = MessagePump::new(Arc::clone(&storage));
    pump.initialize(
        Arc::new(DemoHandler::new(options.fail_every)),
        Arc::new(DemoRecoverability::default()),
        Arc::new(LogCriticalError),
        settings,
    )
    .await?;
    pump.start(max_concurrency)?;

    shutdown.await;
    pump.stop().await;

    Ok(RunSummary {
        input_queue: input_queue.to_string(),
        remaining: storage.depth(&input_queue),
        error_queue_depth: storage.depth(&error_queue),
        stats: pump.stats(),
    })
}

/// Validate settings and render them in the requested format
pub fn execute_config_command(
    settings: &TransportSettings,
    format: ConfigFormat,
) -> Result<String, CliError> {
    settings.validate().map_err(ConfigError::Invalid)?;

    let rendered = match format {
        ConfigFormat::Json => serde_json::to_string_pretty(settings).map_err(ConfigError::from)?,
        ConfigFormat::Toml => toml::to_string_pretty(settings).map_err(ConfigError::from)?,
    };
    Ok(rendered)
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
