//! # Queue Broker CLI
//!
//! Command-line interface for the embedded queue broker.
//!
//! This module provides CLI commands for:
//! - Printing the resolved configuration
//! - One-shot queue operations (useful with the file backend)
//! - An interactive line shell driving a single broker instance
//!
//! Every command prints JSON on stdout; logs go to stderr.

use bytes::Bytes;
use clap::{Parser, Subcommand};
use queue_broker_core::{
    spawn_sweeper, BrokerConfig, BrokerError, ConfigurationError, LoggingConfig, QueueCoordinator,
    QueueName, ReceiptHandle, ReceiveOptions, ReceivedMessage,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// ============================================================================
// CLI Structure
// ============================================================================

/// Queue Broker CLI - SQS-style message queues with visibility-timeout leases
#[derive(Parser)]
#[command(name = "queue-broker")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Embedded message-queue broker with visibility-timeout leases")]
#[command(
    long_about = "Queue Broker stores messages per queue, leases them to one consumer at a time and deletes them by receipt handle"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "QUEUE_BROKER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level (overrides logging.level)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the resolved configuration
    Config {
        /// Output format
        #[arg(short, long, default_value = "toml")]
        format: ConfigFormat,
    },

    /// Create a queue
    CreateQueue {
        /// Queue name or URL
        queue: String,
    },

    /// List queues
    Queues,

    /// Send one message
    Send {
        /// Queue name or URL
        queue: String,

        /// Message body; multiple words are joined with single spaces
        #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
        body: Vec<String>,
    },

    /// Show the approximate number of available messages
    Count {
        /// Queue name or URL
        queue: String,
    },

    /// Read broker commands line by line from stdin
    Shell,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::CreateQueue { .. } => "create-queue",
            Self::Queues => "queues",
            Self::Send { .. } => "send",
            Self::Count { .. } => "count",
            Self::Shell => "shell",
        }
    }
}

/// Configuration format options
#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// TOML format
    Toml,
    /// JSON format
    Json,
}

/// Commands accepted by the interactive shell, one per line
#[derive(Parser, Debug)]
#[command(name = "queue-broker shell", no_binary_name = true)]
#[command(disable_version_flag = true)]
pub struct ShellLine {
    #[command(subcommand)]
    pub command: ShellCommand,
}

/// Interactive shell commands
#[derive(Subcommand, Debug)]
pub enum ShellCommand {
    /// Create a queue
    Create { queue: String },

    /// Delete a queue with all of its messages
    Drop { queue: String },

    /// List queues
    Queues,

    /// Send a message; the remaining words form the body
    Send {
        queue: String,
        #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
        body: Vec<String>,
    },

    /// Receive and lease messages
    Receive {
        queue: String,

        /// Maximum number of messages
        #[arg(short = 'n', long = "max", default_value = "1")]
        max_messages: u32,

        /// Visibility timeout in seconds
        #[arg(short = 'v', long = "visibility", allow_negative_numbers = true)]
        visibility_seconds: Option<i64>,

        /// Long-poll wait in seconds
        #[arg(short = 'w', long = "wait", default_value = "0", allow_negative_numbers = true)]
        wait_seconds: i64,
    },

    /// Delete a received message by receipt handle
    Delete { queue: String, receipt: String },

    /// Change the visibility timeout of a received message
    Visibility {
        queue: String,
        receipt: String,
        #[arg(allow_negative_numbers = true)]
        seconds: i64,
    },

    /// Approximate number of available messages
    Count { queue: String },

    /// Available and in-flight counts
    Stats { queue: String },

    /// Reclaim expired leases and apply retention now
    Sweep,

    /// Leave the shell
    #[command(alias = "exit")]
    Quit,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

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
            Self::Broker(BrokerError::Configuration(_)) => 1,
            Self::Broker(_) => 2,
            Self::Io(_) => 3,
            Self::InvalidArgument { .. } => 4,
        }
    }
}

fn parse_queue(queue: &str) -> Result<QueueName, CliError> {
    queue.parse().map_err(|e: queue_broker_core::ValidationError| {
        CliError::InvalidArgument {
            arg: "queue".to_string(),
            message: e.to_string(),
        }
    })
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli(cli: Cli) -> Result<(), CliError> {
    let mut config = BrokerConfig::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if cli.json_logs {
        config.logging.json_format = true;
    }

    initialize_logging(&config.logging);
    info!(command = cli.command.name(), "Running command");

    let mut stdout = tokio::io::stdout();
    match cli.command {
        Commands::Config { format } => {
            let rendered = render_config(&config, &format)?;
            write_line(&mut stdout, rendered.trim_end()).await?;
        }
        Commands::Shell => {
            let coordinator = Arc::new(QueueCoordinator::open(&config).await?);
            let sweeper = config
                .sweeper
                .enabled
                .then(|| spawn_sweeper(Arc::clone(&coordinator), config.sweeper.interval()));

            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let result = run_shell(&coordinator, stdin, &mut stdout).await;

            coordinator.shutdown();
            if let Some(sweeper) = sweeper {
                // A panicked sweeper has already been reported by the runtime
                let _ = sweeper.await;
            }
            result?;
        }
        command => {
            let coordinator = QueueCoordinator::open(&config).await?;
            let output = execute_command(&coordinator, command).await?;
            write_line(&mut stdout, &output.to_string()).await?;
        }
    }

    Ok(())
}

/// Install the global tracing subscriber, writing to stderr
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn initialize_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "queue_broker_core={level},queue_broker_cli={level}",
            level = config.level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);

    // A subscriber may already be installed when embedded in tests
    let _ = if config.json_format {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
}

/// Render the configuration with the receipt secret redacted
pub fn render_config(config: &BrokerConfig, format: &ConfigFormat) -> Result<String, CliError> {
    let mut shown = config.clone();
    if shown.receipts.secret.is_some() {
        shown.receipts.secret = Some("<REDACTED>".to_string());
    }

    match format {
        ConfigFormat::Toml => toml::to_string_pretty(&shown).map_err(|e| {
            CliError::Configuration(ConfigurationError::Invalid {
                message: format!("Failed to render configuration as TOML: {}", e),
            })
        }),
        ConfigFormat::Json => serde_json::to_string_pretty(&shown).map_err(|e| {
            CliError::Configuration(ConfigurationError::Invalid {
                message: format!("Failed to render configuration as JSON: {}", e),
            })
        }),
    }
}

/// Execute a one-shot command and return its JSON output
async fn execute_command(
    coordinator: &QueueCoordinator,
    command: Commands,
) -> Result<Value, CliError> {
    match command {
        Commands::CreateQueue { queue } => {
            let queue = parse_queue(&queue)?;
            let created = coordinator.create_queue(&queue).await?;
            Ok(json!({ "queue": queue.as_str(), "created": created }))
        }
        Commands::Queues => Ok(queues_output(coordinator)),
        Commands::Send { queue, body } => {
            let queue = parse_queue(&queue)?;
            let message_id = coordinator
                .send(&queue, Bytes::from(body.join(" ")))
                .await?;
            Ok(json!({ "message_id": message_id.as_str() }))
        }
        Commands::Count { queue } => {
            let queue = parse_queue(&queue)?;
            let available = coordinator.count_available(&queue).await?;
            Ok(json!({ "queue": queue.as_str(), "available": available }))
        }
        Commands::Config { .. } | Commands::Shell => Err(CliError::InvalidArgument {
            arg: "command".to_string(),
            message: "not a one-shot broker command".to_string(),
        }),
    }
}

fn queues_output(coordinator: &QueueCoordinator) -> Value {
    let names: Vec<String> = coordinator
        .list_queues()
        .into_iter()
        .map(String::from)
        .collect();
    json!({ "queues": names })
}

// ============================================================================
// Interactive Shell
// ============================================================================

/// Whether the shell keeps reading after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellFlow {
    Continue,
    Quit,
}

/// Run shell commands from `input` until `quit` or end of input
///
/// Each command writes exactly one JSON line to `output`. Failed commands
/// write `{"error": <kind>, "message": <text>}` and the shell carries on.
pub async fn run_shell<R, W>(
    coordinator: &QueueCoordinator,
    input: R,
    output: &mut W,
) -> Result<(), CliError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let (response, flow) = execute_shell_line(coordinator, trimmed).await;
        write_line(output, &response.to_string()).await?;
        if flow == ShellFlow::Quit {
            break;
        }
    }

    debug!("Shell input finished");
    Ok(())
}

/// Execute one shell line and produce its JSON response
pub async fn execute_shell_line(coordinator: &QueueCoordinator, line: &str) -> (Value, ShellFlow) {
    let parsed = match ShellLine::try_parse_from(line.split_whitespace()) {
        Ok(parsed) => parsed,
        Err(e) => {
            let response = match e.kind() {
                clap::error::ErrorKind::DisplayHelp
                | clap::error::ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                    json!({ "help": e.render().to_string() })
                }
                _ => json!({
                    "error": "invalid_request",
                    "message": e.render().to_string().trim_end(),
                }),
            };
            return (response, ShellFlow::Continue);
        }
    };

    if matches!(parsed.command, ShellCommand::Quit) {
        return (json!({ "quit": true }), ShellFlow::Quit);
    }

    let response = match execute_shell_command(coordinator, parsed.command).await {
        Ok(value) => value,
        Err(CliError::Broker(e)) => json!({ "error": e.kind().as_str(), "message": e.to_string() }),
        Err(e) => json!({ "error": "invalid_request", "message": e.to_string() }),
    };
    (response, ShellFlow::Continue)
}

async fn execute_shell_command(
    coordinator: &QueueCoordinator,
    command: ShellCommand,
) -> Result<Value, CliError> {
    match command {
        ShellCommand::Create { queue } => {
            let queue = parse_queue(&queue)?;
            let created = coordinator.create_queue(&queue).await?;
            Ok(json!({ "queue": queue.as_str(), "created": created }))
        }
        ShellCommand::Drop { queue } => {
            let queue = parse_queue(&queue)?;
            coordinator.delete_queue(&queue).await?;
            Ok(json!({ "queue": queue.as_str(), "deleted": true }))
        }
        ShellCommand::Queues => Ok(queues_output(coordinator)),
        ShellCommand::Send { queue, body } => {
            let queue = parse_queue(&queue)?;
            let message_id = coordinator
                .send(&queue, Bytes::from(body.join(" ")))
                .await?;
            Ok(json!({ "message_id": message_id.as_str() }))
        }
        ShellCommand::Receive {
            queue,
            max_messages,
            visibility_seconds,
            wait_seconds,
        } => {
            let queue = parse_queue(&queue)?;
            let mut options = ReceiveOptions::new()
                .with_max_messages(max_messages)
                .with_wait_time(parse_seconds("wait", wait_seconds)?);
            if let Some(seconds) = visibility_seconds {
                options = options.with_visibility_timeout(parse_seconds("visibility", seconds)?);
            }

            let messages = coordinator.receive(&queue, options).await?;
            let messages: Vec<Value> = messages.iter().map(received_output).collect();
            Ok(json!({ "messages": messages }))
        }
        ShellCommand::Delete { queue, receipt } => {
            let queue = parse_queue(&queue)?;
            let receipt = parse_receipt(&receipt)?;
            coordinator.delete(&queue, &receipt).await?;
            Ok(json!({ "deleted": true }))
        }
        ShellCommand::Visibility {
            queue,
            receipt,
            seconds,
        } => {
            let queue = parse_queue(&queue)?;
            let receipt = parse_receipt(&receipt)?;
            let timeout = parse_seconds("seconds", seconds)?;
            let deadline = coordinator
                .change_visibility(&queue, &receipt, timeout)
                .await?;
            Ok(json!({ "visible_again_at": deadline.as_datetime().to_rfc3339() }))
        }
        ShellCommand::Count { queue } => {
            let queue = parse_queue(&queue)?;
            let available = coordinator.count_available(&queue).await?;
            Ok(json!({ "queue": queue.as_str(), "available": available }))
        }
        ShellCommand::Stats { queue } => {
            let queue = parse_queue(&queue)?;
            let stats = coordinator.stats(&queue).await?;
            Ok(json!({
                "queue": queue.as_str(),
                "available": stats.available,
                "in_flight": stats.in_flight,
            }))
        }
        ShellCommand::Sweep => {
            let report = coordinator.sweep().await;
            Ok(json!({
                "returned": report.returned,
                "purged": report.purged,
                "failed": report.failed,
            }))
        }
        ShellCommand::Quit => Ok(json!({ "quit": true })),
    }
}

fn parse_receipt(receipt: &str) -> Result<ReceiptHandle, CliError> {
    receipt.parse().map_err(|e: queue_broker_core::ValidationError| {
        CliError::InvalidArgument {
            arg: "receipt".to_string(),
            message: e.to_string(),
        }
    })
}

fn parse_seconds(arg: &str, seconds: i64) -> Result<chrono::Duration, CliError> {
    chrono::Duration::try_seconds(seconds).ok_or_else(|| CliError::InvalidArgument {
        arg: arg.to_string(),
        message: format!("{} seconds is out of range", seconds),
    })
}

fn received_output(message: &ReceivedMessage) -> Value {
    json!({
        "message_id": message.message_id.as_str(),
        "body": String::from_utf8_lossy(&message.body),
        "receipt_handle": message.receipt_handle.as_str(),
        "delivery_count": message.delivery_count,
        "enqueued_at": message.enqueued_at.as_datetime().to_rfc3339(),
        "visible_again_at": message.visible_again_at.as_datetime().to_rfc3339(),
    })
}

async fn write_line<W>(output: &mut W, line: &str) -> Result<(), CliError>
where
    W: AsyncWrite + Unpin,
{
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}
