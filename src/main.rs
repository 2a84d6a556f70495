//! chainward - TTL-bounded iptables allow-lists
//!
//! # Usage
//!
//! ```bash
//! # Manage the chain interactively (or from a pipe), one command per line
//! chainward run --chain ALLOWLIST --ttl 300
//! > add 203.0.113.7
//! > iface wg0
//! > keepalive 203.0.113.7
//! > list
//! > del 203.0.113.7
//!
//! # One-shot operations
//! chainward flush --chain ALLOWLIST
//! chainward config --save
//! chainward audit --count 20
//! ```
//!
//! The chain must already exist (`iptables -N ALLOWLIST`) and be jumped to
//! from wherever the allow-list should apply.

use chainward::command;
use chainward::config::{self, SyncConfig};
use chainward::core::error::{Error, IptablesErrorPattern};
use chainward::{ChainSync, IptablesRunner, SyncEvent};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "chainward", version)]
#[command(about = "Keeps a TTL-bounded allow-list in an iptables chain", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.config/chainward/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Managed chain, overriding the configuration
    #[arg(long, global = true)]
    chain: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read commands from stdin and keep the chain in sync until EOF
    Run {
        /// Entry lifetime in seconds
        #[arg(long, value_name = "SECONDS")]
        ttl: Option<u64>,
        /// Default jump target for admitted addresses
        #[arg(long)]
        target: Option<String>,
        /// Path to the iptables binary
        #[arg(long, value_name = "PATH")]
        iptables: Option<PathBuf>,
        /// Serialize mutating operations on the chain
        #[arg(long)]
        serialize: bool,
        /// Flush the chain before accepting commands
        #[arg(long)]
        flush_on_start: bool,
    },
    /// Flush the managed chain once and exit
    Flush {
        /// Path to the iptables binary
        #[arg(long, value_name = "PATH")]
        iptables: Option<PathBuf>,
    },
    /// Print the effective configuration
    Config {
        /// Write it to the configuration file
        #[arg(long)]
        save: bool,
    },
    /// Show recent audit log entries
    Audit {
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,
    },
    /// Show build information
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            print_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn print_error(err: &Error) {
    eprintln!("Error: {err}");
    if let Error::Iptables { message, .. } = err {
        let translation = IptablesErrorPattern::match_error(message);
        eprintln!("  {}", translation.user_message);
        for suggestion in translation.suggestions {
            eprintln!("  - {suggestion}");
        }
    }
}

async fn load_effective_config(cli: &Cli) -> chainward::Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => config::load_config_from(path).await?,
        None => config::load_config().await?,
    };
    if let Some(chain) = &cli.chain {
        config.chain.clone_from(chain);
    }
    Ok(config)
}

async fn handle_cli(cli: Cli) -> chainward::Result<()> {
    let mut config = load_effective_config(&cli).await?;

    match cli.command {
        Commands::Run {
            ttl,
            target,
            iptables,
            serialize,
            flush_on_start,
        } => {
            if let Some(ttl) = ttl {
                config.ttl_secs = ttl;
            }
            if let Some(target) = target {
                config.default_target = target;
            }
            if iptables.is_some() {
                config.iptables_path = iptables;
            }
            config.serialize_mutations |= serialize;
            config.validate()?;

            if (config.snapshot || config.audit)
                && let Err(e) = chainward::utils::ensure_dirs()
            {
                warn!("Failed to create state directories: {e}");
            }

            let runner = IptablesRunner::locate(config.iptables_path.as_deref(), config.elevation);
            info!("Using {}", runner.binary().display());
            let sync = ChainSync::new(config.to_settings(), runner)?;

            if flush_on_start {
                sync.flush(false).await?;
            }
            if let Some(path) = &sync.settings().snapshot_path {
                sync.restore(path).await?;
            }

            run_loop(&sync).await
        }
        Commands::Flush { iptables } => {
            if iptables.is_some() {
                config.iptables_path = iptables;
            }
            config.validate()?;

            let runner = IptablesRunner::locate(config.iptables_path.as_deref(), config.elevation);
            let sync = ChainSync::new(config.to_settings(), runner)?;
            sync.flush(false).await?;
            println!("Flushed {}", sync.chain());
            Ok(())
        }
        Commands::Config { save } => {
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                let path = cli
                    .config
                    .or_else(config::default_config_path)
                    .ok_or_else(|| Error::Internal("No configuration directory".to_string()))?;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                config::save_config(&config, &path).await?;
                println!("Saved to {}", path.display());
            }
            Ok(())
        }
        Commands::Audit { count } => {
            let path = chainward::audit::AuditLog::default_path()
                .ok_or_else(|| Error::Internal("No state directory".to_string()))?;
            let audit = chainward::audit::AuditLog::new(path);
            for event in audit.read_recent(count).await? {
                println!(
                    "{} {:<14} {:<10} {} {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    serde_json::to_value(event.event_type)?
                        .as_str()
                        .unwrap_or_default(),
                    event.chain,
                    if event.success { "ok" } else { "FAILED" },
                    event.details
                );
            }
            Ok(())
        }
        Commands::Version => {
            println!("chainward {}", build::PKG_VERSION);
            let dirty = if build::GIT_CLEAN { "" } else { "-dirty" };
            println!("commit:  {}{dirty}", build::SHORT_COMMIT);
            println!("built:   {}", build::BUILD_TIME);
            println!("rustc:   {}", build::RUST_VERSION);
            Ok(())
        }
    }
}

async fn run_loop(sync: &ChainSync<IptablesRunner>) -> chainward::Result<()> {
    let mut events = sync.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SyncEvent::Expired { key, target }) => println!("expired {key} ({target})"),
                Ok(SyncEvent::Error(e)) => print_error(&e),
                Err(RecvError::Lagged(missed)) => warn!("Dropped {missed} notifications"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!(
        "Managing chain {}; commands: add, keepalive, iface, del, list, flush, flush-all",
        sync.chain()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match command::execute(sync, line).await {
            Ok(output) => println!("{output}"),
            Err(e) => print_error(&e),
        }
    }

    info!("stdin closed, {} entries still active", sync.list().len());
    Ok(())
}
