//! Shared test utilities for spellvault-core tests.
//!
//! Provides deterministic keypairs, testnet addresses and vault construction
//! helpers used across multiple test modules.

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{Address, Network, Txid};

use crate::model::{Beneficiary, ChainAnchor, Utxo, Vault, VaultId, SECS_PER_DAY};

/// Generate a deterministic keypair from a seed byte.
///
/// The secret key is `[0x01, 0x00, ..., 0x00, seed]` (32 bytes).
pub fn test_keypair(seed_byte: u8) -> (SecretKey, PublicKey) {
    let secp = Secp256k1::new();
    let mut secret_bytes = [0u8; 32];
    secret_bytes[31] = seed_byte;
    secret_bytes[0] = 0x01;
    let sk = SecretKey::from_slice(&secret_bytes).unwrap();
    let pk = sk.public_key(&secp);
    (sk, pk)
}

/// Testnet P2TR address for a seed byte (62 characters).
pub fn test_address(seed_byte: u8) -> String {
    let secp = Secp256k1::new();
    let (_sk, pk) = test_keypair(seed_byte);
    let (xonly, _parity) = pk.x_only_public_key();
    Address::p2tr(&secp, xonly, None, Network::Testnet).to_string()
}

/// A txid filled with one byte.
pub fn test_txid(byte: u8) -> Txid {
    Txid::from_byte_array([byte; 32])
}

/// A confirmed UTXO.
pub fn test_utxo(txid_byte: u8, output_index: u32, value_sats: u64) -> Utxo {
    Utxo {
        txid: test_txid(txid_byte),
        output_index,
        value_sats,
        confirmed: true,
    }
}

/// Beneficiaries with the given shares and addresses from seeds 10, 11, ...
pub fn test_beneficiaries(shares: &[u8]) -> Vec<Beneficiary> {
    shares
        .iter()
        .enumerate()
        .map(|(i, &share)| {
            Beneficiary::new(
                format!("b{}", i + 1),
                format!("Heir {}", i + 1),
                test_address(10 + i as u8),
                share,
            )
        })
        .collect()
}

/// A 100,000,000-sat vault with beneficiaries [50, 30, 20], anchored on-chain
/// at `test_txid(0xA0):0`.
pub fn make_test_vault(period_days: u64, last_check_in: i64) -> Vault {
    Vault::create(
        VaultId::new("ab".repeat(32)),
        "Family vault",
        test_address(1),
        100_000_000,
        test_beneficiaries(&[50, 30, 20]),
        period_days * SECS_PER_DAY,
        last_check_in,
        ChainAnchor::broadcast(test_txid(0xA0), 0),
    )
}

/// The UTXO a test vault is anchored at.
pub fn anchor_utxo(vault: &Vault) -> Utxo {
    Utxo {
        txid: vault.anchor.txid,
        output_index: vault.anchor.output_index,
        value_sats: vault.amount_sats,
        confirmed: true,
    }
}
