//! Courier CLI Binary
//!
//! Runs both sides of the boundary in one process: the service behind a
//! transport endpoint, and the commands below as the unprivileged client.

use anyhow::{anyhow, Context as _, Result};
use clap::{Parser, Subcommand};
use courier::config::{ConfigLoader, CourierConfig};
use courier::logging::{init_logging, LoggingConfig};
use courier::protocol::Request;
use courier::service::{Context, ServiceBackend};
use courier::transport::{self, RouterListener, TransportClient};
use courier::watch::{FsSubtreeSource, SubtreeWatcher};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Courier - typed cross-context messaging runtime
#[derive(Parser)]
#[command(name = "courier", version)]
#[command(about = "Send typed requests to the Courier service runtime")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (layered over defaults and ./courier.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Enable debug logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the service answers
    Ping,
    /// Send a raw JSON request and print the response
    Send {
        /// Request body, e.g. '{"type":"GET_SETTINGS"}'
        json: String,
    },
    /// Fetch a URL through the service
    Fetch {
        url: String,
        #[arg(long, default_value = "GET")]
        method: String,
        /// Extra header as NAME:VALUE (repeatable)
        #[arg(long = "header")]
        headers: Vec<String>,
        #[arg(long)]
        body: Option<String>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Print coalesced change notifications for a directory tree
    Watch {
        dir: PathBuf,
        #[arg(long)]
        debounce_ms: Option<u64>,
    },
    /// Print the effective configuration
    Config,
}

fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{:#}", e);
            process::exit(1);
        }
    };

    let logging_config = build_logging_config(&cli, &config);
    if let Err(e) = init_logging(Some(&logging_config)) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start async runtime: {}", e);
            process::exit(1);
        }
    };

    match runtime.block_on(execute(cli.command, config)) {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("{:#}", e);
            process::exit(1);
        }
    }
}

fn load_config(cli: &Cli) -> Result<CourierConfig> {
    let root = std::env::current_dir().context("Failed to resolve working directory")?;
    ConfigLoader::load(&root, cli.config.as_deref()).map_err(|e| anyhow!(e))
}

/// CLI flags override the loaded logging section
fn build_logging_config(cli: &Cli, config: &CourierConfig) -> LoggingConfig {
    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    if let Some(ref level) = cli.log_level {
        logging.level = level.clone();
    }
    if let Some(ref format) = cli.log_format {
        logging.format = format.clone();
    }
    logging
}

/// Start the service side and return a connected client
fn connect(config: &CourierConfig) -> Result<TransportClient> {
    let ctx = Arc::new(Context::new(config.clone()).context("Failed to initialize service")?);
    let router = Arc::new(ServiceBackend::router(ctx));
    let (client, endpoint) = transport::channel(config.transport.capacity);
    endpoint.spawn(RouterListener::new(router));
    Ok(client)
}

async fn execute(command: Commands, config: CourierConfig) -> Result<String> {
    match command {
        Commands::Ping => {
            let response = connect(&config)?.send(&Request::Ping).await;
            render(&response.to_value())
        }
        Commands::Send { json } => {
            let body: Value = serde_json::from_str(&json).context("Request is not valid JSON")?;
            let response = connect(&config)?.send_value(body).await;
            render(&response)
        }
        Commands::Fetch {
            url,
            method,
            headers,
            body,
            timeout_ms,
        } => {
            let request = Request::FetchJson {
                url,
                method: Some(method),
                headers: parse_headers(&headers)?,
                body: body.map(Value::String),
                timeout_ms,
            };
            let response = connect(&config)?.send(&request).await;
            render(&response.to_value())
        }
        Commands::Watch { dir, debounce_ms } => {
            let debounce = Duration::from_millis(debounce_ms.unwrap_or(config.watch.debounce_ms));
            watch(dir, debounce).await?;
            Ok(String::new())
        }
        Commands::Config => ConfigLoader::render(&config).map_err(|e| anyhow!(e)),
    }
}

fn parse_headers(raw: &[String]) -> Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|header| {
            let (name, value) = header
                .split_once(':')
                .ok_or_else(|| anyhow!("Header must be NAME:VALUE, got '{}'", header))?;
            Ok((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

async fn watch(dir: PathBuf, debounce: Duration) -> Result<()> {
    let changes = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&changes);
    let root = dir.clone();
    let subtree = SubtreeWatcher::new(debounce, move || {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        println!("change #{} under {}", n, root.display());
    })?;
    let _source = FsSubtreeSource::watch(&dir, subtree.clone())?;

    info!(dir = ?dir, debounce_ms = debounce.as_millis() as u64, "Watching; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    subtree.disconnect();
    info!(changes = changes.load(Ordering::SeqCst), "Watch stopped");
    Ok(())
}

fn render(value: &Value) -> Result<String> {
    serde_json::to_string_pretty(value).context("Failed to render response")
}
