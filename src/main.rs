//! pubgate - HTTP to MQTT publish gateway
//!
//! Usage:
//!   pubgate [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>       Configuration file path
//!   -b, --bind <ADDR>         HTTP bind address (default: 0.0.0.0:8080)
//!   -u, --broker-url <URL>    Broker URL (default: mqtt://localhost:1883)
//!   -n, --client-name <NAME>  Client display name (default: publisher)
//!   -l, --log-level           Log level (error, warn, info, debug, trace)
//!   -h, --help                Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use pubgate::config::Config;
use pubgate::http::{self, AppState, HttpServer};
use pubgate::lifecycle;
use pubgate::pool::ConnectionPool;
use pubgate::MqttConnector;

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages, including per-identity connection events
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// pubgate - HTTP to MQTT publish gateway
#[derive(Parser, Debug)]
#[command(name = "pubgate")]
#[command(author = "Pubgate Contributors")]
#[command(version)]
#[command(about = "HTTP gateway that publishes to an MQTT broker over per-identity pooled connections")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Broker URL
    #[arg(short = 'u', long)]
    broker_url: Option<String>,

    /// Client display name presented to the broker
    #[arg(short = 'n', long)]
    client_name: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum)]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise defaults plus environment
    let loaded = match &args.config {
        Some(config_path) => Config::load(config_path),
        None => Config::from_env(),
    };
    let mut config = match loaded {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            std::process::exit(1);
        }
    };

    // CLI args override file config
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(url) = args.broker_url {
        config.broker.url = url;
    }
    if let Some(name) = args.client_name {
        config.broker.client_name = name;
    }
    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    // Setup logging - CLI overrides config, config overrides default (info)
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    http::install_panic_hook();

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    info!("Starting pubgate");
    info!("  HTTP address: {}", config.server.bind);
    info!("  Broker: {}", config.broker.url);
    info!("  Client name: {}", config.broker.client_name);
    info!(
        "  Protocol: {:?}, QoS {}",
        config.broker.protocol, config.broker.qos
    );
    info!("  Request timeout: {:?}", config.server.request_timeout);

    let connector = Arc::new(MqttConnector::new(config.broker.client_config()));
    let pool = Arc::new(ConnectionPool::new(config.broker.pool_config(), connector));

    let state = AppState::new(pool.clone(), config.server.request_timeout);
    let server = HttpServer::bind(config.server.bind, state, config.server.shutdown_timeout).await?;

    lifecycle::run_until_shutdown(server, pool, lifecycle::shutdown_signal()).await?;

    Ok(())
}
