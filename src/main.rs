//! mqttdb - snapshot and configuration tool
//!
//! Usage:
//!   mqttdb [OPTIONS] <COMMAND>
//!
//! Commands:
//!   dump <FILE> [--stats]   Print a snapshot file chunk by chunk
//!   check [-c <FILE>]       Load configuration and restore the configured snapshot
//!
//! Options:
//!   -l, --log-level         Log level (error, warn, info, debug, trace)
//!   -h, --help              Print help

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mqttdb::broker::{Broker, BrokerConfig};
use mqttdb::config::Config;
use mqttdb::persistence::{codec, Chunk};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    #[default]
    Warn,
    /// Informational messages
    Info,
    /// Debug messages
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
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Warn,
        }
    }
}

/// mqttdb - MQTT message store tooling
#[derive(Parser, Debug)]
#[command(name = "mqttdb")]
#[command(author = "mqttdb Contributors")]
#[command(version)]
#[command(about = "Inspect and validate mqttdb snapshots")]
struct Args {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a snapshot file chunk by chunk
    Dump {
        /// Snapshot file
        file: PathBuf,

        /// Print chunk counts instead of chunk contents
        #[arg(long)]
        stats: bool,
    },
    /// Load configuration and restore the configured snapshot
    Check {
        /// Configuration file path (TOML format)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn init_logging(level: LogLevel) -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level.to_tracing_level())
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Command::Dump { file, stats } => {
            init_logging(args.log_level.unwrap_or_default())?;
            dump(&file, stats)
        }
        Command::Check { config } => {
            let file_config = match &config {
                Some(path) => Config::load(path),
                None => Config::from_env(),
            };
            let file_config = match file_config {
                Ok(cfg) => cfg,
                Err(e) => {
                    eprintln!("Error loading config file: {}", e);
                    std::process::exit(1);
                }
            };

            // CLI overrides config
            let level = args
                .log_level
                .unwrap_or_else(|| LogLevel::from_config(&file_config.log.level));
            init_logging(level)?;
            if let Some(path) = &config {
                info!("Loaded configuration from {:?}", path);
            }

            check(&file_config)
        }
    }
}

fn dump(path: &Path, stats: bool) -> Result<(), Box<dyn std::error::Error>> {
    let data = std::fs::read(path)?;
    let snapshot = codec::decode(Bytes::from(data))?;

    if stats {
        let mut counts: BTreeMap<u16, (&'static str, usize)> = BTreeMap::new();
        for chunk in &snapshot.chunks {
            let name = match chunk {
                Chunk::Config(_) => "DB_CHUNK_CFG",
                Chunk::Entry(_) => "DB_CHUNK_MSG_STORE",
                Chunk::ClientMessage(_) => "DB_CHUNK_CLIENT_MSG",
                Chunk::Retain(_) => "DB_CHUNK_RETAIN",
                Chunk::Subscription(_) => "DB_CHUNK_SUB",
                Chunk::Client(_) => "DB_CHUNK_CLIENT",
                Chunk::Unknown { .. } => "UNKNOWN",
            };
            counts.entry(chunk.chunk_type()).or_insert((name, 0)).1 += 1;
        }
        for (name, count) in counts.values() {
            println!("{}: {}", name, count);
        }
        return Ok(());
    }

    println!("Snapshot dump of {}", path.display());
    println!("DB version: {}", snapshot.version);
    for chunk in &snapshot.chunks {
        println!("{}", chunk);
    }
    Ok(())
}

fn check(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut broker = Broker::new(BrokerConfig::from(config));
    if !config.persistence.enabled {
        println!("Configuration OK (persistence disabled)");
        return Ok(());
    }

    let restored = broker.restore(Instant::now())?;
    let stats = broker.stats();
    println!(
        "Configuration OK; snapshot {} {}",
        config.persistence.path.display(),
        if restored { "restored" } else { "not found" }
    );
    println!("  sessions:      {}", stats.sessions);
    println!("  messages:      {}", stats.stored_messages);
    println!("  queued:        {}", stats.queued_messages);
    println!("  inflight:      {}", stats.inflight_messages);
    println!("  subscriptions: {}", stats.subscriptions);
    println!("  retained:      {}", stats.retained_messages);
    Ok(())
}
