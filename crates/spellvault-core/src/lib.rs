//! SpellVault Core
//!
//! Bitcoin inheritance vaults driven by an inactivity timer. A vault locks a
//! UTXO's value for a fixed set of percentage-weighted beneficiaries; the
//! owner resets the timer by checking in, and once it runs out the
//! beneficiaries may claim.
//!
//! # Concepts
//!
//! - **Status**: derived from elapsed time (`Active` → `Warning` → `Triggered`),
//!   or terminal (`Claimed`, `Cancelled`)
//! - **Spell**: a versioned action payload carried in an `OP_RETURN` output
//! - **Anchor**: the single unspent output holding the vault's value
//!
//! # Flow
//!
//! ```text
//! request action -> ledger checks status -> builder assembles balanced tx
//!                -> ledger holds it pending -> caller broadcasts
//!                -> record_broadcast applies the transition, moves the anchor
//! ```
//!
//! Everything here is synchronous and free of I/O except [`prover`], whose
//! trait is async. Chain access lives behind the traits in [`collab`] and
//! [`fees::FeeSource`].

pub mod builder;
pub mod collab;
pub mod error;
pub mod fees;
pub mod ledger;
pub mod model;
pub mod prover;
pub mod spell;
pub mod status;

#[cfg(test)]
pub(crate) mod test_utils;

pub use builder::{BuiltTransaction, TransactionBuilder, DUST_THRESHOLD_SATS};
pub use error::{VaultError, VaultResult};
pub use fees::{FeeEstimator, FeePriority, FeeSource, TieredFeeRates};
pub use ledger::{claimable_vaults, BroadcastOutcome, LedgerSnapshot, VaultLedger};
pub use model::{Beneficiary, ChainAnchor, Utxo, Vault, VaultId, VaultStatus};
pub use spell::{decode_spell, encode_spell, SpellCodec, SpellError, SpellPayload};
pub use status::compute_status;
