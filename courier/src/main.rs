//! courier - operator CLI for the courier event client
//!
//! This tool provides commands for:
//! - Checking configuration and the on-disk queue
//! - Enqueueing test events
//! - Uploading persisted batches
//! - Inspecting and clearing retry state
//!
//! Uses XDG Base Directory specification for file locations:
//! - Batches: $XDG_DATA_HOME/courier/<write_key>/ (~/.local/share/courier/<write_key>/)
//! - Logs: $XDG_STATE_HOME/courier/courier.log (~/.local/state/courier/courier.log)
//! - Config: $XDG_CONFIG_HOME/courier/config.toml (~/.config/courier/config.toml)

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use courier_core::retry::{clear_retry_state, load_retry_state, PipelineState};
use courier_core::storage::{Storage, StorageProvider};
use courier_core::{Analytics, Config, Configuration, JsonMap};

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Inspect and drive the courier event queue")]
#[command(version)]
struct Args {
    /// Write key (overrides config.toml)
    #[arg(long, global = true)]
    write_key: Option<String>,

    /// Storage directory (overrides config.toml)
    #[arg(long, global = true)]
    storage_dir: Option<PathBuf>,

    /// Do not fetch remote settings before sending
    #[arg(long, global = true)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration, pending batches and retry state
    Status,

    /// Enqueue a track event and flush
    Track {
        /// Event name
        event: String,

        /// Properties as a JSON object
        #[arg(short, long)]
        properties: Option<String>,
    },

    /// Identify a user and flush
    Identify {
        user_id: String,

        /// Traits as a JSON object
        #[arg(short, long)]
        traits: Option<String>,
    },

    /// Upload every persisted batch the retry policy allows
    Flush,

    /// Print the persisted retry state as JSON
    RetryState,

    /// Forget all retry and rate-limit bookkeeping
    ClearRetryState,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load().context("failed to load configuration")?;
    if let Some(write_key) = args.write_key {
        config.write_key = write_key;
    }
    if let Some(storage_dir) = args.storage_dir {
        config.storage_dir = Some(storage_dir);
    }
    if args.offline {
        config.fetch_settings = false;
    }

    let _log_guard =
        courier_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!(command = command_name(&args.command), "courier starting");

    config.validate().context("invalid configuration")?;

    match args.command {
        Command::Status => cmd_status(&config),
        Command::Track { event, properties } => {
            let properties = parse_object(properties.as_deref(), "properties")?;
            let analytics = connect(&config).await?;
            analytics.track(event, properties);
            finish(&analytics).await
        }
        Command::Identify { user_id, traits } => {
            let traits = parse_object(traits.as_deref(), "traits")?;
            let analytics = connect(&config).await?;
            analytics.identify(user_id, traits);
            finish(&analytics).await
        }
        Command::Flush => {
            let analytics = connect(&config).await?;
            finish(&analytics).await
        }
        Command::RetryState => cmd_retry_state(&config),
        Command::ClearRetryState => cmd_clear_retry_state(&config),
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Status => "status",
        Command::Track { .. } => "track",
        Command::Identify { .. } => "identify",
        Command::Flush => "flush",
        Command::RetryState => "retry-state",
        Command::ClearRetryState => "clear-retry-state",
    }
}

fn parse_object(raw: Option<&str>, what: &str) -> Result<JsonMap> {
    let Some(raw) = raw else {
        return Ok(JsonMap::new());
    };
    match serde_json::from_str::<serde_json::Value>(raw)
        .with_context(|| format!("{what} must be valid JSON"))?
    {
        serde_json::Value::Object(map) => Ok(map),
        _ => bail!("{what} must be a JSON object"),
    }
}

fn open_storage(config: &Config) -> Result<Arc<dyn Storage>> {
    StorageProvider::File(config.resolved_storage_dir())
        .create(&config.write_key)
        .context("failed to open storage")
}

/// Build a client, refreshing settings first unless offline.
async fn connect(config: &Config) -> Result<Analytics> {
    let mut configuration = Configuration::from_config(config);
    configuration.fetch_settings = false;

    let analytics = Analytics::new(configuration).context("failed to start client")?;
    if config.fetch_settings {
        if let Err(e) = analytics.check_settings().await {
            tracing::warn!(error = %e, "Settings fetch failed");
            eprintln!("Warning: could not fetch settings ({e}), using cached settings");
        }
    }
    Ok(analytics)
}

async fn finish(analytics: &Analytics) -> Result<()> {
    analytics
        .flush_and_wait()
        .await
        .context("flush did not complete")?;

    let pending = analytics
        .storage()
        .read_event_files()
        .context("failed to list batches")?
        .len();
    analytics.shutdown();

    println!("Flush complete: {pending} batch(es) pending");
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    let storage = open_storage(config)?;
    let pending = storage
        .read_event_files()
        .context("failed to list batches")?;
    let state = load_retry_state(storage.as_ref());

    println!("Courier Status");
    println!("==============");
    println!();
    println!("Write key:       {}", config.write_key);
    println!("API host:        {}", config.api_host);
    println!("CDN host:        {}", config.cdn_host);
    println!("Storage:         {}", config.resolved_storage_dir().display());
    println!("Pending batches: {}", pending.len());

    let pipeline_state = match state.pipeline_state {
        PipelineState::Ready => "READY".to_string(),
        PipelineState::RateLimited => match state.wait_until_time {
            Some(until) => format!(
                "RATE_LIMITED until {}",
                chrono::DateTime::<chrono::Utc>::from_timestamp_millis(until)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| until.to_string())
            ),
            None => "RATE_LIMITED".to_string(),
        },
    };
    println!("Retry state:     {pipeline_state}");
    println!("Backing off:     {} batch(es)", state.batch_metadata.len());
    Ok(())
}

fn cmd_retry_state(config: &Config) -> Result<()> {
    let storage = open_storage(config)?;
    let state = load_retry_state(storage.as_ref());
    let rendered = serde_json::to_string_pretty(&state).context("failed to render retry state")?;
    println!("{rendered}");
    Ok(())
}

fn cmd_clear_retry_state(config: &Config) -> Result<()> {
    let storage = open_storage(config)?;
    if !clear_retry_state(storage.as_ref()) {
        bail!("failed to clear retry state");
    }
    tracing::info!(write_key = %config.write_key, "Retry state cleared");
    println!("Retry state cleared");
    Ok(())
}
