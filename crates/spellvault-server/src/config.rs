//! Server configuration, parsed from a TOML file plus environment overrides.
//!
//! Priority: environment variables > config file > defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use spellvault_core::fees::FeePriority;
use spellvault_core::spell::MAX_FRAMED_SPELL_LEN;
use std::path::{Path, PathBuf};

/// Top-level server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// General server settings
    #[serde(default)]
    pub server: ServerSection,

    /// Bitcoin / Electrum settings
    #[serde(default)]
    pub bitcoin: BitcoinSection,

    /// Fee selection
    #[serde(default)]
    pub fees: FeeSection,

    /// Chain reconciliation
    #[serde(default)]
    pub watch: WatchSection,
}

/// General server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Data directory (holds vaults.json)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Check interval in seconds (default: 1 hour)
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            check_interval_secs: default_check_interval(),
            log_level: default_log_level(),
        }
    }
}

/// Bitcoin network settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitcoinSection {
    /// Bitcoin network: "bitcoin", "testnet", "signet", "regtest"
    #[serde(default = "default_network")]
    pub network: String,

    /// Electrum server URL
    #[serde(default = "default_electrum_url")]
    pub electrum_url: String,
}

impl Default for BitcoinSection {
    fn default() -> Self {
        Self {
            network: default_network(),
            electrum_url: default_electrum_url(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeeSection {
    /// Tier used for logged and suggested rates
    #[serde(default)]
    pub priority: FeePriority,

    /// Largest framed spell the daemon will decode or build
    #[serde(default)]
    pub max_spell_len: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSection {
    /// Settle pending actions whose transaction shows up on chain
    #[serde(default = "default_reconcile")]
    pub reconcile_anchors: bool,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            reconcile_anchors: default_reconcile(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data")
}

fn default_check_interval() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_network() -> String {
    "testnet".to_string()
}

fn default_electrum_url() -> String {
    spellvault_electrum::default_server(bitcoin::Network::Testnet).to_string()
}

fn default_reconcile() -> bool {
    true
}

// ============================================================================
// Loading & environment override
// ============================================================================

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: ServerConfig =
            toml::from_str(&contents).with_context(|| "Failed to parse TOML config")?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `SPELLVAULT_DATA_DIR`
    /// - `SPELLVAULT_CHECK_INTERVAL`
    /// - `SPELLVAULT_LOG_LEVEL`
    /// - `SPELLVAULT_NETWORK`
    /// - `SPELLVAULT_ELECTRUM_URL`
    /// - `SPELLVAULT_FEE_PRIORITY`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SPELLVAULT_DATA_DIR") {
            self.server.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("SPELLVAULT_CHECK_INTERVAL") {
            if let Ok(secs) = v.parse::<u64>() {
                self.server.check_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("SPELLVAULT_LOG_LEVEL") {
            self.server.log_level = v;
        }
        if let Ok(v) = std::env::var("SPELLVAULT_NETWORK") {
            self.bitcoin.network = v;
        }
        if let Ok(v) = std::env::var("SPELLVAULT_ELECTRUM_URL") {
            self.bitcoin.electrum_url = v;
        }
        if let Ok(v) = std::env::var("SPELLVAULT_FEE_PRIORITY") {
            match v.parse::<FeePriority>() {
                Ok(priority) => self.fees.priority = priority,
                Err(e) => eprintln!("Ignoring SPELLVAULT_FEE_PRIORITY: {}", e),
            }
        }
    }

    /// Parse the bitcoin network string to a `bitcoin::Network`.
    pub fn network(&self) -> bitcoin::Network {
        match self.bitcoin.network.as_str() {
            "bitcoin" | "mainnet" => bitcoin::Network::Bitcoin,
            "signet" => bitcoin::Network::Signet,
            "regtest" => bitcoin::Network::Regtest,
            _ => bitcoin::Network::Testnet,
        }
    }

    /// Path of the vault store inside the data directory.
    pub fn store_path(&self) -> PathBuf {
        self.server.data_dir.join(crate::store::STORE_FILE)
    }

    /// Validate that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            matches!(
                self.bitcoin.network.as_str(),
                "bitcoin" | "mainnet" | "testnet" | "testnet3" | "signet" | "regtest"
            ),
            "bitcoin.network must be one of bitcoin, testnet, signet, regtest (got {:?})",
            self.bitcoin.network
        );

        anyhow::ensure!(
            !self.bitcoin.electrum_url.is_empty(),
            "bitcoin.electrum_url must not be empty"
        );

        // Check interval must be at least 60 seconds
        anyhow::ensure!(
            self.server.check_interval_secs >= 60,
            "server.check_interval_secs must be >= 60"
        );

        if let Some(len) = self.fees.max_spell_len {
            anyhow::ensure!(
                (1..=MAX_FRAMED_SPELL_LEN).contains(&len),
                "fees.max_spell_len must be in 1..={}",
                MAX_FRAMED_SPELL_LEN
            );
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn full_toml() -> &'static str {
        r#"
[server]
data_dir = "/custom/data"
check_interval_secs = 600
log_level = "debug"

[bitcoin]
network = "signet"
electrum_url = "ssl://mempool.space:60602"

[fees]
priority = "high"
max_spell_len = 2048

[watch]
reconcile_anchors = false
"#
    }

    fn load(toml: &str) -> ServerConfig {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", toml).unwrap();
        ServerConfig::from_file(file.path()).unwrap()
    }

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = load("");
        assert_eq!(config.server.check_interval_secs, 3600);
        assert_eq!(config.server.data_dir, PathBuf::from("/data"));
        assert_eq!(config.network(), bitcoin::Network::Testnet);
        assert_eq!(config.fees.priority, FeePriority::Medium);
        assert_eq!(config.fees.max_spell_len, None);
        assert!(config.watch.reconcile_anchors);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let config = load(full_toml());

        assert_eq!(config.server.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.server.check_interval_secs, 600);
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.network(), bitcoin::Network::Signet);
        assert_eq!(config.fees.priority, FeePriority::High);
        assert_eq!(config.fees.max_spell_len, Some(2048));
        assert!(!config.watch.reconcile_anchors);
        assert_eq!(config.store_path(), PathBuf::from("/custom/data/vaults.json"));
    }

    #[test]
    fn test_unknown_priority_is_a_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[fees]\npriority = \"urgent\"\n").unwrap();
        assert!(ServerConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = load("");

        std::env::set_var("SPELLVAULT_DATA_DIR", "/env/data");
        std::env::set_var("SPELLVAULT_CHECK_INTERVAL", "1800");
        std::env::set_var("SPELLVAULT_NETWORK", "regtest");
        std::env::set_var("SPELLVAULT_FEE_PRIORITY", "LOW");

        config.apply_env_overrides();

        assert_eq!(config.server.data_dir, PathBuf::from("/env/data"));
        assert_eq!(config.server.check_interval_secs, 1800);
        assert_eq!(config.network(), bitcoin::Network::Regtest);
        assert_eq!(config.fees.priority, FeePriority::Low);

        std::env::remove_var("SPELLVAULT_DATA_DIR");
        std::env::remove_var("SPELLVAULT_CHECK_INTERVAL");
        std::env::remove_var("SPELLVAULT_NETWORK");
        std::env::remove_var("SPELLVAULT_FEE_PRIORITY");
    }

    #[test]
    fn test_validation_check_interval_too_low() {
        let config = load("[server]\ncheck_interval_secs = 30\n");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_unknown_network() {
        let config = load("[bitcoin]\nnetwork = \"litecoin\"\n");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_spell_ceiling() {
        assert!(load("[fees]\nmax_spell_len = 0\n").validate().is_err());
        assert!(load("[fees]\nmax_spell_len = 70000\n").validate().is_err());
        assert!(load("[fees]\nmax_spell_len = 65535\n").validate().is_ok());
    }

    #[test]
    fn test_serde_roundtrip() {
        let config = load(full_toml());
        let serialized = toml::to_string_pretty(&config).unwrap();

        let reparsed: ServerConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(reparsed.fees.priority, config.fees.priority);
        assert_eq!(reparsed.bitcoin.network, config.bitcoin.network);
        assert_eq!(
            reparsed.watch.reconcile_anchors,
            config.watch.reconcile_anchors
        );
    }
}
