//! SpellVault Electrum Client
//!
//! Bitcoin network access over the Electrum protocol for:
//! - UTXO discovery (funding vaults, locating anchors)
//! - Fee estimation (per-priority confirmation targets)
//! - Transaction broadcasting
//! - Anchor tracking (has the vault's last transaction reached the chain?)
//!
//! [`ElectrumClient`] implements the core's [`UtxoIndex`], [`FeeSource`] and
//! [`Broadcaster`] traits.
//!
//! # Security
//!
//! - Always use SSL/TLS connections (ssl:// or tcp+tls://)
//! - Never send private keys over the wire
//!
//! # Example
//!
//! ```ignore
//! use spellvault_electrum::{default_server, ElectrumClient};
//! use bitcoin::Network;
//!
//! let client = ElectrumClient::new(default_server(Network::Testnet), Network::Testnet)?;
//! let height = client.get_height()?;
//! println!("Current block height: {}", height);
//! ```

use bitcoin::{Address, Network, Script, Transaction, Txid};
use electrum_client::{ElectrumApi, Error as ElectrumError};
use std::str::FromStr;
use thiserror::Error;

use spellvault_core::collab::{BroadcastError, Broadcaster, CollabError, UtxoIndex};
use spellvault_core::fees::{FeeError, FeePriority, FeeSource, TieredFeeRates};
use spellvault_core::model::Utxo;

// Re-export the raw client for direct usage
pub use electrum_client::Client as RawClient;

const SATS_PER_BTC: f64 = 100_000_000.0;

/// Errors from Electrum operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Electrum protocol error: {0}")]
    Protocol(#[from] ElectrumError),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("No fee estimate for a {0}-block target")]
    NoFeeEstimate(usize),
}

/// Where a vault's anchor transaction stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorState {
    /// Not in the script's history.
    Unknown,
    /// Seen in the mempool.
    Mempool,
    /// Confirmed at this height.
    Confirmed(u32),
}

impl AnchorState {
    pub fn is_seen(self) -> bool {
        self != AnchorState::Unknown
    }
}

/// Electrum client for Bitcoin network operations
pub struct ElectrumClient {
    client: electrum_client::Client,
    network: Network,
}

impl ElectrumClient {
    /// Create a new Electrum client
    ///
    /// # Security
    /// Always use SSL URLs in production. Plaintext connections can be MITM'd.
    pub fn new(url: &str, network: Network) -> Result<Self, Error> {
        if !url.starts_with("ssl://") && !url.contains("tls") {
            log::warn!("Connecting to Electrum without SSL - insecure for mainnet!");
        }

        let client = electrum_client::Client::new(url)
            .map_err(|e: ElectrumError| Error::Connection(e.to_string()))?;

        Ok(Self { client, network })
    }

    /// Get the network this client is configured for
    pub fn network(&self) -> Network {
        self.network
    }

    /// Get current blockchain height
    pub fn get_height(&self) -> Result<u32, Error> {
        let header = self.client.block_headers_subscribe()?;
        Ok(header.height as u32)
    }

    /// Parse an address and require it to be on this client's network.
    pub fn parse_address(&self, address: &str) -> Result<Address, Error> {
        Address::from_str(address)
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", address, e)))?
            .require_network(self.network)
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", address, e)))
    }

    /// Get UTXOs locked to a script. Height 0 means unconfirmed.
    pub fn get_utxos_for_script(&self, script: &Script) -> Result<Vec<Utxo>, Error> {
        let unspent = self.client.script_list_unspent(script)?;

        Ok(unspent
            .into_iter()
            .map(|u| Utxo {
                txid: u.tx_hash,
                output_index: u.tx_pos as u32,
                value_sats: u.value,
                confirmed: u.height > 0,
            })
            .collect())
    }

    /// Fee rate in whole sat/vB for confirmation within `target` blocks.
    pub fn fee_rate_for_target(&self, target: usize) -> Result<u64, Error> {
        let btc_per_kvb = self.client.estimate_fee(target)?;
        btc_per_kvb_to_sat_per_vb(btc_per_kvb).ok_or(Error::NoFeeEstimate(target))
    }

    /// Look for `txid` in the history of `address`.
    pub fn anchor_state(&self, address: &str, txid: &Txid) -> Result<AnchorState, Error> {
        let script = self.parse_address(address)?.script_pubkey();
        self.tx_state_for_script(&script, txid)
    }

    /// Look for `txid` in the history of `script`.
    pub fn tx_state_for_script(&self, script: &Script, txid: &Txid) -> Result<AnchorState, Error> {
        let history = self.client.script_get_history(script)?;

        Ok(history
            .iter()
            .find(|h| h.tx_hash == *txid)
            .map_or(AnchorState::Unknown, |h| {
                if h.height > 0 {
                    AnchorState::Confirmed(h.height as u32)
                } else {
                    AnchorState::Mempool
                }
            }))
    }
}

impl UtxoIndex for ElectrumClient {
    fn utxos_for_address(&self, address: &str) -> Result<Vec<Utxo>, CollabError> {
        let address = self
            .parse_address(address)
            .map_err(|e| CollabError::InvalidAddress(e.to_string()))?;
        self.get_utxos_for_script(address.script_pubkey().as_script())
            .map_err(|e| CollabError::Unavailable(e.to_string()))
    }
}

impl FeeSource for ElectrumClient {
    fn tiered_rates(&self) -> Result<TieredFeeRates, FeeError> {
        let rate = |priority: FeePriority| {
            self.fee_rate_for_target(priority.confirmation_target())
                .map_err(|e| FeeError::Unavailable(e.to_string()))
        };
        Ok(TieredFeeRates {
            low: rate(FeePriority::Low)?,
            medium: rate(FeePriority::Medium)?,
            high: rate(FeePriority::High)?,
        })
    }
}

impl Broadcaster for ElectrumClient {
    fn broadcast(&self, tx: &Transaction) -> Result<Txid, BroadcastError> {
        self.client.transaction_broadcast(tx).map_err(|e| match e {
            // The server answered: the transaction itself was refused
            ElectrumError::Protocol(reason) => BroadcastError::Rejected(reason.to_string()),
            other => BroadcastError::Unavailable(other.to_string()),
        })
    }
}

/// Convert an Electrum estimate (BTC/kvB) to whole sat/vB, rounding up.
///
/// Electrum answers `-1` when it has no estimate.
pub fn btc_per_kvb_to_sat_per_vb(btc_per_kvb: f64) -> Option<u64> {
    if !btc_per_kvb.is_finite() || btc_per_kvb <= 0.0 {
        return None;
    }
    // Whole sat/kvB first so float noise cannot push an exact rate up a step
    let sat_per_kvb = (btc_per_kvb * SATS_PER_BTC).round() as u64;
    Some(sat_per_kvb.div_ceil(1_000).max(1))
}

/// Default Electrum servers for each network
pub fn default_server(network: Network) -> &'static str {
    match network {
        Network::Bitcoin => "ssl://electrum.blockstream.info:60002",
        Network::Testnet => "ssl://electrum.blockstream.info:60004",
        Network::Signet => "ssl://mempool.space:60602",
        Network::Regtest => "tcp://127.0.0.1:60401",
        _ => "ssl://electrum.blockstream.info:60002",
    }
}
