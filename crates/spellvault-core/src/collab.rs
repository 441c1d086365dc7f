//! External collaborators the core consumes but does not implement.
//!
//! Chain access is synchronous, matching the Electrum client the server
//! uses. Fee rates live in [`crate::fees::FeeSource`], proving in
//! [`crate::prover`].

use bitcoin::{Transaction, Txid};
use thiserror::Error;

use crate::model::Utxo;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollabError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// Looks up unspent outputs.
pub trait UtxoIndex {
    fn utxos_for_address(&self, address: &str) -> Result<Vec<Utxo>, CollabError>;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    /// The network refused the transaction.
    #[error("Transaction rejected: {0}")]
    Rejected(String),

    /// The signer declined to sign.
    #[error("Signing declined by user")]
    UserRejected,

    #[error("Broadcast service unavailable: {0}")]
    Unavailable(String),
}

/// Submits signed transactions.
pub trait Broadcaster {
    fn broadcast(&self, tx: &Transaction) -> Result<Txid, BroadcastError>;
}
