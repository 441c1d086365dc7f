//! SpellVault Server: headless daemon that keeps vault records current
//!
//! Refreshes every vault's status on a timer, settles broadcasts that were
//! never reported back by watching the chain over Electrum, and logs the
//! fee rate the configured priority would pay.
//!
//! # Usage
//!
//! ```bash
//! spellvault-server --config /path/to/spellvault-server.toml
//! spellvault-server --check     # Run one check cycle and exit
//! spellvault-server --validate  # Validate config and exit
//! spellvault-server --status    # Print vault statuses and exit
//! ```

mod config;
mod daemon;
mod store;

use anyhow::{Context, Result};
use std::path::PathBuf;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let mut config_path = PathBuf::from("/config/spellvault-server.toml");
    let mut one_shot = false;
    let mut validate_only = false;
    let mut status_only = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                if i < args.len() {
                    config_path = PathBuf::from(&args[i]);
                } else {
                    anyhow::bail!("--config requires a path argument");
                }
            }
            "--check" | "--once" => {
                one_shot = true;
            }
            "--validate" => {
                validate_only = true;
            }
            "--status" => {
                status_only = true;
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--version" | "-V" => {
                println!("spellvault-server {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            other => {
                anyhow::bail!("Unknown argument: {}", other);
            }
        }
        i += 1;
    }

    let mut server_config = config::ServerConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    server_config.apply_env_overrides();

    server_config
        .validate()
        .context("Configuration validation failed")?;

    std::env::set_var("RUST_LOG", &server_config.server.log_level);
    env_logger::init();

    if validate_only {
        println!("✅ Configuration is valid.");
        println!("  Network:        {}", server_config.network());
        println!("  Electrum:       {}", server_config.bitcoin.electrum_url);
        println!("  Store:          {}", server_config.store_path().display());
        println!(
            "  Check interval: {} secs",
            server_config.server.check_interval_secs
        );
        println!("  Fee priority:   {}", server_config.fees.priority);
        println!(
            "  Spell ceiling:  {} bytes",
            daemon::builder_for(&server_config).codec().max_len()
        );
        println!(
            "  Reconcile:      {}",
            server_config.watch.reconcile_anchors
        );
        return Ok(());
    }

    if status_only {
        let now = chrono::Utc::now().timestamp();
        let reports = daemon::status_reports(&server_config, now)?;
        if reports.is_empty() {
            println!("No vaults in {}", server_config.store_path().display());
        }
        for report in reports {
            println!(
                "{:<10} {:<24} {} ({})",
                report.status.to_string(),
                report.name,
                report.vault_id,
                format_remaining(report.seconds_remaining)
            );
        }
        return Ok(());
    }

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;

    if one_shot {
        log::info!("Running single check cycle…");
        rt.block_on(daemon::run_check_cycle(&server_config))?;
        log::info!("Done.");
    } else {
        // Install Ctrl-C handler for graceful shutdown
        let shutdown = rt.block_on(async {
            tokio::select! {
                result = daemon::run(server_config) => result,
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Received shutdown signal. Exiting…");
                    Ok(())
                }
            }
        });

        if let Err(e) = shutdown {
            log::error!("Server error: {:#}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn format_remaining(seconds: i64) -> String {
    if seconds <= 0 {
        return "claimable".to_string();
    }
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    format!("{}d {}h left", days, hours)
}

fn print_help() {
    println!(
        r#"SpellVault Server: headless vault monitoring daemon

USAGE:
    spellvault-server [OPTIONS]

OPTIONS:
    -c, --config <PATH>   Config file path (default: /config/spellvault-server.toml)
    --check, --once       Run a single check cycle and exit
    --validate            Validate config file and exit
    --status              Print every vault's status and exit
    -h, --help            Show this help message
    -V, --version         Show version

ENVIRONMENT VARIABLES (override config file):
    SPELLVAULT_DATA_DIR         Data directory path
    SPELLVAULT_CHECK_INTERVAL   Check interval in seconds
    SPELLVAULT_LOG_LEVEL        Log level (error/warn/info/debug/trace)
    SPELLVAULT_NETWORK          Bitcoin network (bitcoin/testnet/signet/regtest)
    SPELLVAULT_ELECTRUM_URL     Electrum server URL
    SPELLVAULT_FEE_PRIORITY     Fee tier (low/medium/high)

EXAMPLES:
    # Run as daemon with config file
    spellvault-server --config /path/to/config.toml

    # Single check (useful for cron jobs)
    spellvault-server --config config.toml --check

    # Show which vaults need attention
    spellvault-server --config config.toml --status
"#
    );
}
