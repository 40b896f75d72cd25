//! # tor-manager
//!
//! Command-line entry point for tor-manager-rs.
//!
//! Starts an embedded Tor client, reports where its SOCKS proxy listens and
//! keeps it supervised until CTRL+C.
//!
//! # Execution Flow
//!
//! ```text
//!   ┌─────────────────┐
//!   │  Parse CLI args │ ◄── clap derive, env fallbacks
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │ One-shot modes  │ ◄── --generate-config, --hash-password
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │ Load config +   │ ◄── defaults → TOML → env/CLI
//!   │ init logging    │
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │  Start Tor      │ ◄── TorManager::start
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │ Status loop     │ ◄── until CTRL+C, then TorManager::stop
//!   └─────────────────┘
//! ```
//!
//! # Usage Examples
//!
//! ```bash
//! # Run with defaults
//! tor-manager
//!
//! # Custom ports and data directory
//! tor-manager --socks-port 9150 --control-port 9151 --data-dir ./tor-data
//!
//! # Exit through German or Dutch relays only
//! tor-manager --exit-country de --exit-country nl
//!
//! # Start, print one JSON status snapshot and exit
//! tor-manager --status-json
//!
//! # Produce a HashedControlPassword value
//! tor-manager --hash-password 'correct horse'
//! ```
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | Error (see stderr for details) |

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use tor_manager::{config, logger, process, CliArgs, Config, Error, LogLevel, TorManager, VERSION};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> tor_manager::Result<()> {
    let args = CliArgs::parse();

    if let Some(ref output_path) = args.generate_config {
        let toml = Config::default().to_toml()?;
        std::fs::write(output_path, toml)?;
        println!("Wrote default config to {}", output_path.display());
        return Ok(());
    }

    let config = config::load_config(&args)?;

    if let Some(ref plaintext) = args.hash_password {
        let binary = process::resolve_binary(&config)?;
        println!("{}", process::hash_password(&binary, plaintext).await?);
        return Ok(());
    }

    logger::init(config.loglevel, config.logfile.as_deref())?;
    logger::plog(
        LogLevel::Notice,
        &format!("tor-manager-rs {} starting", VERSION),
    );
    logger::plog(
        LogLevel::Debug,
        &format!("Data directory: {}", config.data_dir.display()),
    );

    let manager = TorManager::new(config)?;
    let started = manager.start().await;
    if !started.success {
        return Err(Error::Process(started.message));
    }
    println!("SOCKS proxy: {}", manager.get_proxy_config().uri());

    if args.status_json {
        let snapshot = serde_json::to_string_pretty(&manager.get_status())
            .map_err(|e| Error::Protocol(e.to_string()))?;
        println!("{}", snapshot);
        manager.stop().await;
        return Ok(());
    }

    run_until_shutdown(&manager, Duration::from_secs(args.status_interval.max(1))).await;

    let stopped = manager.stop().await;
    if stopped.success {
        Ok(())
    } else {
        Err(Error::Process(stopped.message))
    }
}

async fn run_until_shutdown(manager: &TorManager, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    logger::plog(LogLevel::Notice, "Got CTRL+C. Exiting.");
                }
                return;
            }
            _ = ticker.tick() => {
                let status = manager.get_status();
                tracing::info!(
                    state = %status.state,
                    bootstrap = status.bootstrap_progress,
                    circuits = status.built_circuits,
                    exit = status.current_exit.as_deref().unwrap_or("-"),
                    read = status.bytes_read,
                    written = status.bytes_written,
                    restarts = status.restart_count,
                    "status"
                );
                if status.fatal {
                    logger::plog(
                        LogLevel::Error,
                        &format!(
                            "Tor cannot be recovered: {}",
                            status.last_error.as_deref().unwrap_or("unknown error")
                        ),
                    );
                    return;
                }
            }
        }
    }
}
