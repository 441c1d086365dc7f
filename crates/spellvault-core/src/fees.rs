//! Fee rates and transaction size estimation.
//!
//! Rates are whole sat/vB. They come from a [`FeeSource`] (an Electrum
//! server in production) and fall back to a fixed per-network rate when the
//! source fails, so building a transaction never depends on the network.
//!
//! # Size model
//!
//! | Component                         | Weight (WU)                          |
//! |-----------------------------------|--------------------------------------|
//! | Version, locktime, counts, marker | 42                                   |
//! | Wallet input (P2WPKH)             | 272                                  |
//! | Vault input (P2TR key path)       | 230                                  |
//! | Value output (P2TR)               | 172                                  |
//! | Spell output (`OP_RETURN`)        | `(8 + cs(len + 1) + len + 1) * 4`    |
//!
//! `len` is the framed spell length and `cs` its compact-size width.

use bitcoin::{Network, Weight};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::error::{VaultError, VaultResult};
use crate::model::ActionKind;

/// Lowest accepted rate (sat/vB).
pub const MIN_FEE_RATE: u64 = 1;

/// Highest accepted rate (sat/vB). Guards against fat-finger fees.
pub const MAX_FEE_RATE: u64 = 500;

/// Static fallback on mainnet (sat/vB).
pub const MAINNET_FALLBACK_RATE: u64 = 5;

/// Static fallback on test networks (sat/vB).
pub const TESTNET_FALLBACK_RATE: u64 = 1;

pub const TX_OVERHEAD_WU: u64 = 42;
pub const WALLET_INPUT_WU: u64 = 272;
pub const VAULT_INPUT_WU: u64 = 230;
pub const VALUE_OUTPUT_WU: u64 = 172;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeeError {
    #[error("Fee source unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid fee rate: {0}")]
    InvalidRate(String),

    #[error("Unknown fee priority: {0}")]
    UnknownPriority(String),
}

/// Confirmation urgency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeePriority {
    Low,
    #[default]
    Medium,
    High,
}

impl FeePriority {
    /// Target confirmation depth in blocks.
    pub fn confirmation_target(self) -> usize {
        match self {
            FeePriority::High => 1,
            FeePriority::Medium => 3,
            FeePriority::Low => 6,
        }
    }
}

impl fmt::Display for FeePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FeePriority::Low => "low",
            FeePriority::Medium => "medium",
            FeePriority::High => "high",
        };
        f.write_str(s)
    }
}

impl FromStr for FeePriority {
    type Err = FeeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(FeePriority::Low),
            "medium" => Ok(FeePriority::Medium),
            "high" => Ok(FeePriority::High),
            other => Err(FeeError::UnknownPriority(other.to_string())),
        }
    }
}

/// One rate per priority tier, in sat/vB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TieredFeeRates {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
}

impl TieredFeeRates {
    /// The same rate for every tier.
    pub fn flat(rate: u64) -> Self {
        Self {
            low: rate,
            medium: rate,
            high: rate,
        }
    }

    pub fn rate(&self, priority: FeePriority) -> u64 {
        match priority {
            FeePriority::Low => self.low,
            FeePriority::Medium => self.medium,
            FeePriority::High => self.high,
        }
    }
}

/// Source of live fee rates.
pub trait FeeSource {
    fn tiered_rates(&self) -> Result<TieredFeeRates, FeeError>;
}

impl<S: FeeSource + ?Sized> FeeSource for &S {
    fn tiered_rates(&self) -> Result<TieredFeeRates, FeeError> {
        (**self).tiered_rates()
    }
}

/// Fixed rates. Useful offline and in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticFeeSource(pub TieredFeeRates);

impl FeeSource for StaticFeeSource {
    fn tiered_rates(&self) -> Result<TieredFeeRates, FeeError> {
        Ok(self.0)
    }
}

/// A source that always fails; every lookup uses the network fallback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoFeeSource;

impl FeeSource for NoFeeSource {
    fn tiered_rates(&self) -> Result<TieredFeeRates, FeeError> {
        Err(FeeError::Unavailable("no fee source configured".into()))
    }
}

/// Static rate used when the source cannot answer.
pub fn fallback_rate(network: Network) -> u64 {
    match network {
        Network::Bitcoin => MAINNET_FALLBACK_RATE,
        _ => TESTNET_FALLBACK_RATE,
    }
}

/// Clamp a source rate into `[MIN_FEE_RATE, MAX_FEE_RATE]`.
pub fn clamp_rate(rate: u64) -> u64 {
    rate.clamp(MIN_FEE_RATE, MAX_FEE_RATE)
}

/// Reject rates outside `[MIN_FEE_RATE, MAX_FEE_RATE]`.
pub fn check_fee_rate(sat_per_vb: u64) -> VaultResult<()> {
    if !(MIN_FEE_RATE..=MAX_FEE_RATE).contains(&sat_per_vb) {
        return Err(VaultError::Validation(format!(
            "fee rate {} sat/vB outside [{}, {}]",
            sat_per_vb, MIN_FEE_RATE, MAX_FEE_RATE
        )));
    }
    Ok(())
}

/// Resolves priorities to rates, falling back per network.
#[derive(Debug, Clone)]
pub struct FeeEstimator<S> {
    source: S,
    network: Network,
}

impl FeeEstimator<NoFeeSource> {
    /// An estimator that always uses the network fallback.
    pub fn offline(network: Network) -> Self {
        Self::new(NoFeeSource, network)
    }
}

impl<S: FeeSource> FeeEstimator<S> {
    pub fn new(source: S, network: Network) -> Self {
        Self { source, network }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Rates for every tier, clamped, or the flat fallback if the source fails.
    pub fn rates(&self) -> TieredFeeRates {
        match self.source.tiered_rates() {
            Ok(rates) => TieredFeeRates {
                low: clamp_rate(rates.low),
                medium: clamp_rate(rates.medium),
                high: clamp_rate(rates.high),
            },
            Err(e) => {
                let fallback = fallback_rate(self.network);
                log::warn!(
                    "Fee source failed ({}), using fallback {} sat/vB on {}",
                    e,
                    fallback,
                    self.network
                );
                TieredFeeRates::flat(fallback)
            }
        }
    }

    pub fn rate_for_priority(&self, priority: FeePriority) -> u64 {
        self.rates().rate(priority)
    }
}

/// Compact-size width of `n`.
fn compact_size_len(n: u64) -> u64 {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Weight of the spell output for a framed payload of `len` bytes.
pub fn spell_output_weight(len: usize) -> u64 {
    let script_len = len as u64 + 1;
    (8 + compact_size_len(script_len) + script_len) * 4
}

/// Virtual size of a transaction for `action`.
///
/// `output_count` counts value-bearing outputs only; the spell output is
/// sized from `aux_payload_len`. `CreateVault` spends wallet inputs, every
/// other action spends vault inputs.
pub fn estimate_vsize(
    action: ActionKind,
    input_count: usize,
    output_count: usize,
    aux_payload_len: usize,
) -> u64 {
    let input_wu = match action {
        ActionKind::CreateVault => WALLET_INPUT_WU,
        _ => VAULT_INPUT_WU,
    };
    let weight = TX_OVERHEAD_WU
        + input_wu * input_count as u64
        + VALUE_OUTPUT_WU * output_count as u64
        + spell_output_weight(aux_payload_len);
    Weight::from_wu(weight).to_vbytes_ceil()
}

/// Fee in sats for the given shape at `sat_per_vb`.
pub fn estimate_fee(
    action: ActionKind,
    input_count: usize,
    output_count: usize,
    aux_payload_len: usize,
    sat_per_vb: u64,
) -> u64 {
    estimate_vsize(action, input_count, output_count, aux_payload_len).saturating_mul(sat_per_vb)
}
