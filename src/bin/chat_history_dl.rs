// src/bin/chat_history_dl.rs
use clap::{Parser, ValueEnum};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use chat_history_dl::source::CodePrompt;
use chat_history_dl::types::PauseReason;
use chat_history_dl::{
    Direction, Error, ExportConfig, ExportEvent, ExportOutcome, ExportPipeline, ExportSummary,
    HttpSource, PartialReason, Result,
};

#[derive(Parser)]
#[command(
    name = "chat-history-dl",
    version,
    about = "Export a chat's message history to JSON lines"
)]
struct Cli {
    /// Chat to export: numeric id, @username or invite link
    chat: Option<String>,

    /// TOML configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output file (base name for part files when batching)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Download attachments into this directory
    #[arg(long)]
    media_dir: Option<PathBuf>,

    /// Export order
    #[arg(long, value_enum)]
    order: Option<Order>,

    /// Stop after this many messages
    #[arg(long)]
    max_messages: Option<u64>,

    /// Records per part file
    #[arg(long)]
    batch_size: Option<u64>,

    /// Seconds to sleep after every message
    #[arg(long)]
    sleep_per_message: Option<f64>,

    /// Pause every N messages
    #[arg(long)]
    sleep_every: Option<u64>,

    /// Seconds to pause every N messages
    #[arg(long)]
    sleep_every_seconds: Option<f64>,

    /// Flood waits at or above this many seconds count as escalations
    #[arg(long)]
    flood_threshold: Option<f64>,

    /// Longest single flood wait to sleep through, in seconds
    #[arg(long)]
    flood_wait_ceiling: Option<f64>,

    /// Escalated flood waits tolerated before stopping with a partial export
    #[arg(long)]
    max_throttle_escalations: Option<u32>,

    /// Flood waits tolerated in a row without progress before stopping with a partial export
    #[arg(long)]
    max_flood_waits: Option<u32>,

    /// Attachment download retries
    #[arg(long)]
    max_retries: Option<u32>,

    /// First retry delay in seconds
    #[arg(long)]
    retry_backoff: Option<f64>,

    /// Randomize retry delays
    #[arg(long)]
    jitter: bool,

    /// History gateway URL
    #[arg(long)]
    api_url: Option<String>,

    /// Log level for this tool (RUST_LOG takes precedence)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum Order {
    Newest,
    Oldest,
}

impl From<Order> for Direction {
    fn from(order: Order) -> Self {
        match order {
            Order::Newest => Direction::NewestFirst,
            Order::Oldest => Direction::OldestFirst,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(1);
        }
    };

    let source = match HttpSource::new(&config.source) {
        Ok(source) => source.with_code_prompt(stdin_prompt()),
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::from(1);
        }
    };

    let output = config.output.clone();
    let pipeline = ExportPipeline::new(Arc::new(source), config);
    tokio::spawn(chat_history_dl::cancel_on_signal(pipeline.cancel_token()));
    tokio::spawn(log_progress(pipeline.subscribe()));

    match pipeline.run().await {
        Ok(summary) => {
            print_summary(&summary, &output);
            match summary.outcome {
                ExportOutcome::Complete => ExitCode::SUCCESS,
                ExportOutcome::Partial(_) => ExitCode::from(2),
            }
        }
        Err(failure) => {
            eprintln!("Error: {failure}");
            ExitCode::from(1)
        }
    }
}

fn build_config(cli: &Cli) -> Result<ExportConfig> {
    let mut config = match &cli.config {
        Some(path) => ExportConfig::from_toml_file(path)?,
        None => ExportConfig::new(""),
    };
    config.apply_env()?;

    if let Some(chat) = &cli.chat {
        config.chat.0 = chat.clone();
    }
    if config.chat.0.trim().is_empty() {
        return Err(Error::config(
            "chat",
            "no chat given (pass it as an argument or set `chat` in the config file)",
        ));
    }
    if let Some(output) = &cli.output {
        config.output = output.clone();
    }
    if let Some(dir) = &cli.media_dir {
        config.media_dir = Some(dir.clone());
    }
    if let Some(order) = cli.order {
        config.direction = order.into();
    }
    if let Some(max) = cli.max_messages {
        config.max_messages = Some(max);
    }
    if let Some(size) = cli.batch_size {
        config.batch_size = Some(size);
    }
    if let Some(secs) = cli.sleep_per_message {
        config.pacing.sleep_per_message = seconds("sleep_per_message", secs)?;
    }
    if let Some(every) = cli.sleep_every {
        config.pacing.sleep_every = every;
    }
    if let Some(secs) = cli.sleep_every_seconds {
        config.pacing.sleep_every_duration = seconds("sleep_every_seconds", secs)?;
    }
    if let Some(secs) = cli.flood_threshold {
        config.pacing.flood_threshold = seconds("flood_threshold", secs)?;
    }
    if let Some(secs) = cli.flood_wait_ceiling {
        config.pacing.flood_wait_ceiling = seconds("flood_wait_ceiling", secs)?;
    }
    if let Some(max) = cli.max_throttle_escalations {
        config.pacing.max_throttle_escalations = max;
    }
    if let Some(max) = cli.max_flood_waits {
        config.pacing.max_consecutive_flood_waits = max;
    }
    if let Some(retries) = cli.max_retries {
        config.retry.max_retries = retries;
    }
    if let Some(secs) = cli.retry_backoff {
        config.retry.initial_backoff = seconds("retry_backoff", secs)?;
    }
    if cli.jitter {
        config.retry.jitter = true;
    }
    if let Some(url) = &cli.api_url {
        config.source.base_url = url.clone();
    }

    config.validate()?;
    Ok(config)
}

fn seconds(key: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| Error::config(key, format!("invalid number of seconds {secs}: {e}")))
}

fn stdin_prompt() -> CodePrompt {
    Arc::new(|hint: &str| -> Result<String> {
        tokio::task::block_in_place(|| -> Result<String> {
            let mut stdout = std::io::stdout();
            if hint.is_empty() {
                write!(stdout, "Enter the login code: ")?;
            } else {
                write!(stdout, "Enter the login code sent to {hint}: ")?;
            }
            stdout.flush()?;

            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            Ok(line.trim().to_string())
        })
    })
}

async fn log_progress(mut events: tokio::sync::broadcast::Receiver<ExportEvent>) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match events.recv().await {
            Ok(ExportEvent::Started { chat, total }) => {
                tracing::info!(chat_id = chat.id, title = ?chat.title, total = ?total, "export started");
            }
            Ok(ExportEvent::Exported { id, count }) => {
                if count % 100 == 0 {
                    tracing::info!(count, last_id = %id, "progress");
                }
            }
            Ok(ExportEvent::Paused {
                reason: PauseReason::FloodWait,
                duration,
            }) => {
                tracing::warn!(seconds = duration.as_secs_f64(), "flood wait");
            }
            Ok(ExportEvent::FileRotated { path }) => {
                tracing::info!(path = %path.display(), "part file written");
            }
            Ok(ExportEvent::Finished { .. }) | Err(RecvError::Closed) => break,
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "progress logger lagged");
            }
        }
    }
}

fn print_summary(summary: &ExportSummary, output: &std::path::Path) {
    let user = summary
        .account
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown".to_string());
    let written = if summary.files.is_empty() {
        output.display().to_string()
    } else {
        summary
            .files
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    println!(
        "Done. Messages: {}. User: {}. Output: {}",
        summary.exported, user, written
    );
    if summary.skipped > 0 || summary.media_failed > 0 {
        println!(
            "Skipped messages: {}. Failed attachments: {}",
            summary.skipped, summary.media_failed
        );
    }
    let last_id = summary
        .last_id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "none".to_string());
    match &summary.outcome {
        ExportOutcome::Complete => {}
        ExportOutcome::Partial(PartialReason::ThrottleEscalated {
            escalations,
            last_wait,
        }) => {
            println!(
                "Stopped early after {} long flood waits (last: {}s). Last id: {}",
                escalations,
                last_wait.as_secs(),
                last_id
            );
        }
        ExportOutcome::Partial(PartialReason::ThrottleStalled { waits, last_wait }) => {
            println!(
                "Stopped early after {} flood waits in a row (last: {}s). Last id: {}",
                waits,
                last_wait.as_secs(),
                last_id
            );
        }
        ExportOutcome::Partial(PartialReason::Cancelled) => {
            println!("Interrupted. Last id: {last_id}");
        }
    }
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("chat_history_dl={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .init();
}
