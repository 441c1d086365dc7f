//! Vault records and the values they are built from.
//!
//! Everything here is plain serializable data. Lifecycle rules live in
//! [`crate::status`], transaction assembly in [`crate::builder`].

use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::{Address, Network, OutPoint, Txid};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{VaultError, VaultResult};

/// Seconds in one day.
pub const SECS_PER_DAY: u64 = 86_400;

/// Domain separator for vault id derivation.
const VAULT_ID_TAG: &[u8] = b"spellvault/vault-id";

/// Opaque vault identifier (hex-encoded SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VaultId(String);

impl VaultId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive a vault id from the first outpoint funding the vault.
    ///
    /// `SHA-256(tag || txid || vout_le)`. An outpoint can only be spent once,
    /// so two vaults never share an id.
    pub fn from_funding_outpoint(outpoint: &OutPoint) -> Self {
        let mut engine = sha256::Hash::engine();
        engine.input(VAULT_ID_TAG);
        engine.input(outpoint.txid.as_byte_array());
        engine.input(&outpoint.vout.to_le_bytes());
        Self(sha256::Hash::from_engine(engine).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VaultId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a vault.
///
/// `Active`, `Warning` and `Triggered` are derived from elapsed time.
/// `Claimed` and `Cancelled` are terminal and sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VaultStatus {
    Active,
    Warning,
    Triggered,
    Claimed,
    Cancelled,
}

impl VaultStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, VaultStatus::Claimed | VaultStatus::Cancelled)
    }

    /// Wire code used in spells.
    pub fn code(self) -> u8 {
        match self {
            VaultStatus::Active => 0,
            VaultStatus::Warning => 1,
            VaultStatus::Triggered => 2,
            VaultStatus::Claimed => 3,
            VaultStatus::Cancelled => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(VaultStatus::Active),
            1 => Some(VaultStatus::Warning),
            2 => Some(VaultStatus::Triggered),
            3 => Some(VaultStatus::Claimed),
            4 => Some(VaultStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for VaultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VaultStatus::Active => "active",
            VaultStatus::Warning => "warning",
            VaultStatus::Triggered => "triggered",
            VaultStatus::Claimed => "claimed",
            VaultStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The four actions a spell can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    CreateVault,
    CheckIn,
    Claim,
    Cancel,
}

impl ActionKind {
    /// Wire code used in spells.
    pub fn code(self) -> u8 {
        match self {
            ActionKind::CreateVault => 1,
            ActionKind::CheckIn => 2,
            ActionKind::Claim => 3,
            ActionKind::Cancel => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ActionKind::CreateVault),
            2 => Some(ActionKind::CheckIn),
            3 => Some(ActionKind::Claim),
            4 => Some(ActionKind::Cancel),
            _ => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::CreateVault => "create",
            ActionKind::CheckIn => "check in",
            ActionKind::Claim => "claim",
            ActionKind::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

/// A beneficiary entitled to a fixed percentage of the vault once triggered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beneficiary {
    pub id: String,
    pub name: String,
    pub address: String,
    /// Whole percent, 0–100.
    pub percentage_share: u8,
}

impl Beneficiary {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        percentage_share: u8,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            percentage_share,
        }
    }
}

/// An unspent output supplied by the UTXO index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub txid: Txid,
    pub output_index: u32,
    pub value_sats: u64,
    pub confirmed: bool,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: self.output_index,
        }
    }
}

/// Where the vault's value currently lives on-chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainAnchor {
    pub txid: Txid,
    pub output_index: u32,
    /// False until the transaction creating this output has been broadcast.
    pub is_on_chain: bool,
}

impl ChainAnchor {
    pub fn pending(txid: Txid, output_index: u32) -> Self {
        Self {
            txid,
            output_index,
            is_on_chain: false,
        }
    }

    pub fn broadcast(txid: Txid, output_index: u32) -> Self {
        Self {
            txid,
            output_index,
            is_on_chain: true,
        }
    }

    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.txid,
            vout: self.output_index,
        }
    }
}

/// A settled claim by one beneficiary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub beneficiary_address: String,
    pub amount_sats: u64,
    pub txid: Txid,
    pub claimed_at: i64,
}

/// An inheritance vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vault {
    pub id: VaultId,
    pub name: String,
    pub owner_address: String,
    /// Value currently locked at the anchor.
    pub amount_sats: u64,
    pub beneficiaries: Vec<Beneficiary>,
    pub inactivity_period_secs: u64,
    /// Unix seconds.
    pub last_check_in: i64,
    /// Unix seconds.
    pub created_at: i64,
    /// Last persisted status. Read through [`crate::status::compute_status`].
    pub status: VaultStatus,
    pub anchor: ChainAnchor,
    #[serde(default)]
    pub claims: Vec<ClaimRecord>,
    /// Value the beneficiary percentages apply to, fixed by the first claim.
    #[serde(default)]
    pub claim_basis_sats: Option<u64>,
}

impl Vault {
    /// A freshly created vault: `Active`, clock started at creation.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        id: VaultId,
        name: impl Into<String>,
        owner_address: impl Into<String>,
        amount_sats: u64,
        beneficiaries: Vec<Beneficiary>,
        inactivity_period_secs: u64,
        created_at: i64,
        anchor: ChainAnchor,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            owner_address: owner_address.into(),
            amount_sats,
            beneficiaries,
            inactivity_period_secs,
            last_check_in: created_at,
            created_at,
            status: VaultStatus::Active,
            anchor,
            claims: Vec::new(),
            claim_basis_sats: None,
        }
    }

    pub fn beneficiary(&self, address: &str) -> Option<&Beneficiary> {
        self.beneficiaries.iter().find(|b| b.address == address)
    }

    /// Combined share of every entry paying `address`.
    pub fn share_of(&self, address: &str) -> u8 {
        let total: u32 = self
            .beneficiaries
            .iter()
            .filter(|b| b.address == address)
            .map(|b| u32::from(b.percentage_share))
            .sum();
        total.min(100) as u8
    }

    pub fn is_beneficiary(&self, address: &str) -> bool {
        self.beneficiary(address).is_some()
    }

    pub fn has_claimed(&self, address: &str) -> bool {
        self.claims.iter().any(|c| c.beneficiary_address == address)
    }

    /// Beneficiaries with a non-zero share who have not claimed yet.
    pub fn outstanding_beneficiaries(&self) -> impl Iterator<Item = &Beneficiary> {
        self.beneficiaries
            .iter()
            .filter(|b| b.percentage_share > 0 && !self.has_claimed(&b.address))
    }

    pub fn total_claimed_sats(&self) -> u64 {
        self.claims.iter().map(|c| c.amount_sats).sum()
    }

    /// Check the record's invariants. Terminal vaults may hold nothing.
    pub fn validate(&self, network: Network) -> VaultResult<()> {
        if self.amount_sats == 0 && !self.status.is_terminal() {
            return Err(VaultError::Validation("vault amount must be positive".into()));
        }
        if self.inactivity_period_secs == 0 {
            return Err(VaultError::Validation(
                "inactivity period must be positive".into(),
            ));
        }
        parse_address(&self.owner_address, network)?;
        validate_beneficiaries(&self.beneficiaries, network)
    }
}

/// Parse an address string and require it to belong to `network`.
pub fn parse_address(address: &str, network: Network) -> VaultResult<Address> {
    Address::from_str(address)
        .map_err(|e| VaultError::Validation(format!("malformed address {}: {}", address, e)))?
        .require_network(network)
        .map_err(|e| VaultError::Validation(format!("address {} not valid on {}: {}", address, network, e)))
}

/// Shares must be in `[0, 100]` and sum to exactly 100; addresses must parse.
pub fn validate_beneficiaries(beneficiaries: &[Beneficiary], network: Network) -> VaultResult<()> {
    if beneficiaries.is_empty() {
        return Err(VaultError::Validation(
            "at least one beneficiary is required".into(),
        ));
    }

    let mut total: u32 = 0;
    for b in beneficiaries {
        if b.percentage_share > 100 {
            return Err(VaultError::Validation(format!(
                "beneficiary {} share {}% is out of range",
                b.id, b.percentage_share
            )));
        }
        parse_address(&b.address, network)?;
        total += u32::from(b.percentage_share);
    }

    if total != 100 {
        return Err(VaultError::Validation(format!(
            "beneficiary shares sum to {}%, expected 100%",
            total
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{make_test_vault, test_address, test_beneficiaries, test_txid};

    #[test]
    fn test_vault_id_is_sha256_hex() {
        let outpoint = OutPoint {
            txid: test_txid(0xAA),
            vout: 0,
        };
        let id = VaultId::from_funding_outpoint(&outpoint);
        assert_eq!(id.as_str().len(), 64);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));

        // Same outpoint, same id
        assert_eq!(id, VaultId::from_funding_outpoint(&outpoint));

        // Different vout, different id
        let other = OutPoint {
            txid: test_txid(0xAA),
            vout: 1,
        };
        assert_ne!(id, VaultId::from_funding_outpoint(&other));
    }

    #[test]
    fn test_status_codes_roundtrip() {
        for status in [
            VaultStatus::Active,
            VaultStatus::Warning,
            VaultStatus::Triggered,
            VaultStatus::Claimed,
            VaultStatus::Cancelled,
        ] {
            assert_eq!(VaultStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(VaultStatus::from_code(9), None);
        assert!(VaultStatus::Claimed.is_terminal());
        assert!(!VaultStatus::Triggered.is_terminal());
    }

    #[test]
    fn test_valid_beneficiaries() {
        let beneficiaries = test_beneficiaries(&[50, 30, 20]);
        assert!(validate_beneficiaries(&beneficiaries, Network::Testnet).is_ok());
    }

    #[test]
    fn test_shares_must_sum_to_100() {
        let beneficiaries = test_beneficiaries(&[50, 30, 10]);
        let err = validate_beneficiaries(&beneficiaries, Network::Testnet).unwrap_err();
        assert!(matches!(err, VaultError::Validation(ref m) if m.contains("90%")));
    }

    #[test]
    fn test_share_out_of_range() {
        let mut beneficiaries = test_beneficiaries(&[100]);
        beneficiaries[0].percentage_share = 101;
        assert!(validate_beneficiaries(&beneficiaries, Network::Testnet).is_err());
    }

    #[test]
    fn test_empty_beneficiaries_rejected() {
        assert!(validate_beneficiaries(&[], Network::Testnet).is_err());
    }

    #[test]
    fn test_malformed_address_rejected() {
        let beneficiaries = vec![Beneficiary::new("b1", "Alice", "not-an-address", 100)];
        let err = validate_beneficiaries(&beneficiaries, Network::Testnet).unwrap_err();
        assert!(matches!(err, VaultError::Validation(ref m) if m.contains("malformed")));
    }

    #[test]
    fn test_wrong_network_address_rejected() {
        // Testnet address on mainnet
        assert!(parse_address(&test_address(1), Network::Bitcoin).is_err());
        assert!(parse_address(&test_address(1), Network::Testnet).is_ok());
    }

    #[test]
    fn test_vault_validate() {
        let vault = make_test_vault(90, 0);
        assert!(vault.validate(Network::Testnet).is_ok());

        let mut zero = vault.clone();
        zero.amount_sats = 0;
        assert!(zero.validate(Network::Testnet).is_err());

        let mut no_period = vault;
        no_period.inactivity_period_secs = 0;
        assert!(no_period.validate(Network::Testnet).is_err());
    }

    #[test]
    fn test_outstanding_beneficiaries_skip_zero_shares_and_claimed() {
        let mut vault = make_test_vault(90, 0);
        vault.beneficiaries = test_beneficiaries(&[60, 40, 0]);
        assert_eq!(vault.outstanding_beneficiaries().count(), 2);

        let first = vault.beneficiaries[0].address.clone();
        vault.claims.push(ClaimRecord {
            beneficiary_address: first.clone(),
            amount_sats: 1_000,
            txid: test_txid(0x01),
            claimed_at: 10,
        });
        assert!(vault.has_claimed(&first));
        assert_eq!(vault.outstanding_beneficiaries().count(), 1);
        assert_eq!(vault.total_claimed_sats(), 1_000);
    }

    #[test]
    fn test_share_of_sums_repeated_address() {
        let mut vault = make_test_vault(90, 0);
        vault.beneficiaries = test_beneficiaries(&[50, 30, 20]);
        let repeated = vault.beneficiaries[0].address.clone();
        vault.beneficiaries[1].address = repeated.clone();

        assert_eq!(vault.share_of(&repeated), 80);
        assert_eq!(vault.share_of(&vault.beneficiaries[2].address), 20);
        assert_eq!(vault.share_of(&test_address(99)), 0);
    }

    #[test]
    fn test_vault_serde_roundtrip() {
        let vault = make_test_vault(90, 1_700_000_000);
        let json = serde_json::to_string(&vault).unwrap();
        let restored: Vault = serde_json::from_str(&json).unwrap();
        assert_eq!(vault, restored);
    }

    #[test]
    fn test_vault_deserializes_without_claim_fields() {
        let vault = make_test_vault(90, 1_700_000_000);
        let mut value = serde_json::to_value(&vault).unwrap();
        let obj = value.as_object_mut().unwrap();
        obj.remove("claims");
        obj.remove("claim_basis_sats");

        let restored: Vault = serde_json::from_value(value).unwrap();
        assert!(restored.claims.is_empty());
        assert_eq!(restored.claim_basis_sats, None);
    }
}
