//! Error taxonomy for vault operations.

use thiserror::Error;

use crate::model::{ActionKind, VaultId, VaultStatus};
use crate::spell::SpellError;

/// Every failure the core can return. Construction is all-or-nothing: an
/// error means no transaction candidate was produced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    /// Bad shares, non-positive amounts, malformed addresses, bad fee rates.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Insufficient funds: need {needed} sat, have {available} sat")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("Spell payload is {len} bytes, ceiling is {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Cannot {action} a vault that is {status}")]
    InvalidStateTransition {
        status: VaultStatus,
        action: ActionKind,
    },

    #[error("{0} is not a beneficiary of this vault")]
    NotABeneficiary(String),

    #[error("{0} has already claimed from this vault")]
    AlreadyClaimed(String),

    /// The anchor is already referenced by an in-flight transaction, or the
    /// supplied UTXO is not the vault's current anchor.
    #[error("Vault {vault_id} anchor is stale or already in use")]
    StaleAnchor { vault_id: VaultId },

    #[error("Vault not found: {0}")]
    VaultNotFound(VaultId),

    #[error("No pending transaction for vault {0}")]
    NothingPending(VaultId),

    #[error("Spell error: {0}")]
    Spell(SpellError),
}

impl From<SpellError> for VaultError {
    fn from(err: SpellError) -> Self {
        match err {
            SpellError::PayloadTooLarge { len, max } => VaultError::PayloadTooLarge { len, max },
            other => VaultError::Spell(other),
        }
    }
}

/// Result alias for vault operations.
pub type VaultResult<T> = Result<T, VaultError>;
