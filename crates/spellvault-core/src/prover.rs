//! Spell proving.
//!
//! A prover attests that a candidate transaction carries the spell it claims
//! and that its value is conserved. [`LocalProver`] does this in-process;
//! [`DelayedProver`] wraps any prover with a fixed latency to stand in for a
//! remote proving service.

use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::builder::{BuiltTransaction, OutputRole};
use crate::model::VaultId;
use crate::spell::{decode_spell, spell_script};

/// Domain separator for attestations.
const PROOF_TAG: &[u8] = b"spellvault/proof";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProverError {
    #[error("Transaction does not balance")]
    Unbalanced,

    #[error("Spell output does not match the payload: {0}")]
    SpellMismatch(String),

    #[error("Prover unavailable: {0}")]
    Unavailable(String),
}

/// Attestation over a candidate's txid and spell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpellProof {
    pub vault_id: VaultId,
    pub txid: Txid,
    pub spell_hex: String,
    pub attestation: sha256::Hash,
}

#[allow(async_fn_in_trait)]
pub trait SpellProver {
    async fn prove(&self, built: &BuiltTransaction) -> Result<SpellProof, ProverError>;
}

/// `SHA-256(tag || txid || framed spell)`.
pub fn attestation(txid: &Txid, spell_bytes: &[u8]) -> sha256::Hash {
    let mut engine = sha256::Hash::engine();
    engine.input(PROOF_TAG);
    engine.input(txid.as_byte_array());
    engine.input(spell_bytes);
    sha256::Hash::from_engine(engine)
}

/// Check a proof against the candidate it claims to cover.
pub fn verify_proof(proof: &SpellProof, built: &BuiltTransaction) -> bool {
    let txid = built.unsigned_tx.txid();
    proof.txid == txid
        && proof.vault_id == built.vault_id
        && proof.spell_hex == hex::encode(&built.spell_bytes)
        && proof.attestation == attestation(&txid, &built.spell_bytes)
}

/// Deterministic in-process prover.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalProver;

impl LocalProver {
    fn check(built: &BuiltTransaction) -> Result<(), ProverError> {
        if !built.unsigned_tx.is_balanced() {
            return Err(ProverError::Unbalanced);
        }

        let decoded = decode_spell(&built.spell_bytes)
            .map_err(|e| ProverError::SpellMismatch(e.to_string()))?;
        if decoded != built.spell {
            return Err(ProverError::SpellMismatch(
                "framed bytes decode to a different payload".into(),
            ));
        }

        let output = built
            .unsigned_tx
            .output(OutputRole::Spell)
            .ok_or_else(|| ProverError::SpellMismatch("no spell output".into()))?;
        if output.script_pubkey != spell_script(&built.spell_bytes) {
            return Err(ProverError::SpellMismatch(
                "spell output script differs from payload".into(),
            ));
        }
        Ok(())
    }
}

impl SpellProver for LocalProver {
    async fn prove(&self, built: &BuiltTransaction) -> Result<SpellProof, ProverError> {
        Self::check(built)?;
        let txid = built.unsigned_tx.txid();
        Ok(SpellProof {
            vault_id: built.vault_id.clone(),
            txid,
            spell_hex: hex::encode(&built.spell_bytes),
            attestation: attestation(&txid, &built.spell_bytes),
        })
    }
}

/// Adds a fixed latency before delegating.
#[derive(Debug, Clone)]
pub struct DelayedProver<P> {
    inner: P,
    latency: Duration,
}

impl<P> DelayedProver<P> {
    pub fn new(inner: P, latency: Duration) -> Self {
        Self { inner, latency }
    }

    pub fn latency(&self) -> Duration {
        self.latency
    }
}

impl<P: SpellProver> SpellProver for DelayedProver<P> {
    async fn prove(&self, built: &BuiltTransaction) -> Result<SpellProof, ProverError> {
        log::debug!(
            "Proving {} for vault {} (simulated latency {:?})",
            built.action(),
            built.vault_id,
            self.latency
        );
        tokio::time::sleep(self.latency).await;
        self.inner.prove(built).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::TransactionBuilder;
    use crate::test_utils::{anchor_utxo, make_test_vault};
    use bitcoin::Network;

    fn check_in_candidate() -> BuiltTransaction {
        let vault = make_test_vault(90, 1_700_000_000);
        TransactionBuilder::new(Network::Testnet)
            .build_check_in(&vault, &anchor_utxo(&vault), 1, 1_700_000_100)
            .unwrap()
    }

    #[tokio::test]
    async fn test_local_proof_is_deterministic_and_verifies() {
        let built = check_in_candidate();
        let first = LocalProver.prove(&built).await.unwrap();
        let second = LocalProver.prove(&built).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.txid, built.unsigned_tx.txid());
        assert!(verify_proof(&first, &built));
    }

    #[tokio::test]
    async fn test_local_prover_rejects_unbalanced() {
        let mut built = check_in_candidate();
        built.unsigned_tx.fee_sats += 1;
        assert_eq!(
            LocalProver.prove(&built).await,
            Err(ProverError::Unbalanced)
        );
    }

    #[tokio::test]
    async fn test_local_prover_rejects_swapped_spell() {
        let mut built = check_in_candidate();
        // Flip a timestamp byte: still decodes, but to another payload
        let last = built.spell_bytes.len() - 1;
        built.spell_bytes[last] ^= 0x01;
        assert!(matches!(
            LocalProver.prove(&built).await,
            Err(ProverError::SpellMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_proof_does_not_verify_other_candidate() {
        let built = check_in_candidate();
        let proof = LocalProver.prove(&built).await.unwrap();

        let vault = make_test_vault(90, 1_700_000_000);
        let other = TransactionBuilder::new(Network::Testnet)
            .build_check_in(&vault, &anchor_utxo(&vault), 2, 1_700_000_100)
            .unwrap();
        assert!(!verify_proof(&proof, &other));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_prover_waits_then_delegates() {
        let built = check_in_candidate();
        let prover = DelayedProver::new(LocalProver, Duration::from_secs(3));

        let start = tokio::time::Instant::now();
        let proof = prover.prove(&built).await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(proof, LocalProver.prove(&built).await.unwrap());
    }
}
