//! The vault ledger: owns vault records and applies confirmed actions.
//!
//! Each action is two-phase. Building a candidate parks it as the vault's
//! *pending* action against the current anchor; the caller signs and
//! broadcasts, then reports the outcome through
//! [`VaultLedger::record_broadcast`]. Only an accepted broadcast mutates the
//! vault.
//!
//! A vault has at most one pending action. A second request, or a request
//! that spends anything other than the current anchor, fails with
//! [`VaultError::StaleAnchor`].

use bitcoin::{Network, Txid};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::builder::{
    BuiltTransaction, ClaimTerms, CreateVaultRequest, OutputRole, TransactionBuilder,
};
use crate::collab::BroadcastError;
use crate::error::{VaultError, VaultResult};
use crate::model::{
    ActionKind, ChainAnchor, ClaimRecord, Utxo, Vault, VaultId, VaultStatus, SECS_PER_DAY,
};
use crate::spell::SpellAction;
use crate::status::{self, compute_status};

/// A built candidate waiting for its broadcast result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAction {
    pub built: BuiltTransaction,
    pub txid: Txid,
    pub built_at: i64,
}

impl PendingAction {
    pub fn action(&self) -> ActionKind {
        self.built.action()
    }
}

/// What happened to a broadcast candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BroadcastOutcome {
    Accepted { txid: Txid },
    Rejected { reason: String },
}

impl From<Result<Txid, BroadcastError>> for BroadcastOutcome {
    fn from(result: Result<Txid, BroadcastError>) -> Self {
        match result {
            Ok(txid) => BroadcastOutcome::Accepted { txid },
            Err(e) => BroadcastOutcome::Rejected {
                reason: e.to_string(),
            },
        }
    }
}

/// A live status that moved during [`VaultLedger::refresh_statuses`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub vault_id: VaultId,
    pub name: String,
    pub from: VaultStatus,
    pub to: VaultStatus,
}

/// Serializable ledger state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub vaults: Vec<Vault>,
    #[serde(default)]
    pub pending: Vec<PendingAction>,
    /// Unix seconds of the last status refresh.
    #[serde(default)]
    pub last_refresh: Option<i64>,
}

/// Vaults claimable by `address` at `now`: triggered, with a non-zero share
/// for that address that has not been claimed yet.
pub fn claimable_vaults<'a>(
    vaults: impl IntoIterator<Item = &'a Vault>,
    address: &str,
    now: i64,
) -> Vec<&'a Vault> {
    vaults
        .into_iter()
        .filter(|vault| compute_status(vault, now) == VaultStatus::Triggered)
        .filter(|vault| vault.share_of(address) > 0)
        .filter(|vault| !vault.has_claimed(address))
        .collect()
}

#[derive(Debug, Clone)]
pub struct VaultLedger {
    builder: TransactionBuilder,
    vaults: BTreeMap<VaultId, Vault>,
    pending: HashMap<VaultId, PendingAction>,
    last_refresh: Option<i64>,
}

impl VaultLedger {
    pub fn new(builder: TransactionBuilder) -> Self {
        Self {
            builder,
            vaults: BTreeMap::new(),
            pending: HashMap::new(),
            last_refresh: None,
        }
    }

    pub fn for_network(network: Network) -> Self {
        Self::new(TransactionBuilder::new(network))
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot, builder: TransactionBuilder) -> Self {
        let vaults: BTreeMap<VaultId, Vault> = snapshot
            .vaults
            .into_iter()
            .map(|v| (v.id.clone(), v))
            .collect();
        let pending = snapshot
            .pending
            .into_iter()
            .filter(|p| {
                let known = vaults.contains_key(&p.built.vault_id);
                if !known {
                    log::warn!(
                        "Dropping pending {} {} for unknown vault {}",
                        p.action(),
                        p.txid,
                        p.built.vault_id
                    );
                }
                known
            })
            .map(|p| (p.built.vault_id.clone(), p))
            .collect();
        Self {
            builder,
            vaults,
            pending,
            last_refresh: snapshot.last_refresh,
        }
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut pending: Vec<PendingAction> = self.pending.values().cloned().collect();
        pending.sort_by(|a, b| a.built.vault_id.cmp(&b.built.vault_id));
        LedgerSnapshot {
            vaults: self.vaults.values().cloned().collect(),
            pending,
            last_refresh: self.last_refresh,
        }
    }

    pub fn builder(&self) -> &TransactionBuilder {
        &self.builder
    }

    pub fn get(&self, vault_id: &VaultId) -> Option<&Vault> {
        self.vaults.get(vault_id)
    }

    pub fn vaults(&self) -> impl Iterator<Item = &Vault> {
        self.vaults.values()
    }

    pub fn len(&self) -> usize {
        self.vaults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vaults.is_empty()
    }

    pub fn pending(&self, vault_id: &VaultId) -> Option<&PendingAction> {
        self.pending.get(vault_id)
    }

    /// Every action still waiting for a broadcast result.
    pub fn pending_actions(&self) -> impl Iterator<Item = &PendingAction> {
        self.pending.values()
    }

    pub fn last_refresh(&self) -> Option<i64> {
        self.last_refresh
    }

    pub fn status_of(&self, vault_id: &VaultId, now: i64) -> VaultResult<VaultStatus> {
        Ok(compute_status(self.require(vault_id)?, now))
    }

    /// The UTXO the ledger expects to find at the vault's anchor.
    pub fn anchor_utxo(&self, vault_id: &VaultId) -> VaultResult<Utxo> {
        let vault = self.require(vault_id)?;
        Ok(Utxo {
            txid: vault.anchor.txid,
            output_index: vault.anchor.output_index,
            value_sats: vault.amount_sats,
            confirmed: vault.anchor.is_on_chain,
        })
    }

    /// Build a vault-opening transaction and register the vault as pending.
    pub fn create_vault(
        &mut self,
        request: &CreateVaultRequest,
        utxos: &[Utxo],
        fee_rate: u64,
        now: i64,
    ) -> VaultResult<BuiltTransaction> {
        if let Some(holder) = self.pending_spender(utxos) {
            return Err(VaultError::StaleAnchor { vault_id: holder });
        }
        let built = self.builder.build_create(request, utxos, fee_rate, now)?;
        if self.vaults.contains_key(&built.vault_id) {
            return Err(VaultError::StaleAnchor {
                vault_id: built.vault_id,
            });
        }

        let txid = built.unsigned_tx.txid();
        let vault = Vault::create(
            built.vault_id.clone(),
            request.name.clone(),
            request.owner_address.clone(),
            request.amount_sats,
            request.beneficiaries.clone(),
            request.inactivity_period_days.saturating_mul(SECS_PER_DAY),
            now,
            ChainAnchor::pending(txid, 0),
        );

        log::debug!("Vault {} ({}) awaiting funding broadcast", vault.id, vault.name);
        self.vaults.insert(vault.id.clone(), vault);
        self.hold(built.clone(), txid, now);
        Ok(built)
    }

    pub fn check_in(
        &mut self,
        vault_id: &VaultId,
        vault_utxo: &Utxo,
        fee_rate: u64,
        now: i64,
    ) -> VaultResult<BuiltTransaction> {
        let vault = self.require_free_anchor(vault_id, vault_utxo)?;
        status::ensure_can_check_in(vault, now)?;

        let built = self.builder.build_check_in(vault, vault_utxo, fee_rate, now)?;
        let txid = built.unsigned_tx.txid();
        self.hold(built.clone(), txid, now);
        Ok(built)
    }

    /// Build `beneficiary_address`'s claim. The last outstanding beneficiary
    /// sweeps whatever is left.
    pub fn claim(
        &mut self,
        vault_id: &VaultId,
        beneficiary_address: &str,
        vault_utxo: &Utxo,
        fee_rate: u64,
        now: i64,
    ) -> VaultResult<BuiltTransaction> {
        let vault = self.require_free_anchor(vault_id, vault_utxo)?;
        let percentage = status::ensure_can_claim(vault, beneficiary_address, now)?;

        let sweep = vault
            .outstanding_beneficiaries()
            .all(|b| b.address == beneficiary_address);
        let terms = ClaimTerms {
            beneficiary_address: beneficiary_address.to_string(),
            percentage,
            basis_sats: vault.claim_basis_sats,
            sweep,
        };

        let built = self.builder.build_claim(vault, vault_utxo, &terms, fee_rate, now)?;
        let txid = built.unsigned_tx.txid();
        self.hold(built.clone(), txid, now);
        Ok(built)
    }

    pub fn cancel(
        &mut self,
        vault_id: &VaultId,
        vault_utxo: &Utxo,
        fee_rate: u64,
        now: i64,
    ) -> VaultResult<BuiltTransaction> {
        let vault = self.require_free_anchor(vault_id, vault_utxo)?;
        status::ensure_can_cancel(vault, now)?;

        let built = self.builder.build_cancel(vault, vault_utxo, fee_rate, now)?;
        let txid = built.unsigned_tx.txid();
        self.hold(built.clone(), txid, now);
        Ok(built)
    }

    /// Settle the vault's pending action.
    ///
    /// Returns the vault's stored status afterwards, or `None` when a
    /// rejected create removed the vault.
    pub fn record_broadcast(
        &mut self,
        vault_id: &VaultId,
        outcome: BroadcastOutcome,
        now: i64,
    ) -> VaultResult<Option<VaultStatus>> {
        let expected = self
            .pending
            .get(vault_id)
            .map(|p| p.txid)
            .ok_or_else(|| VaultError::NothingPending(vault_id.clone()))?;
        if let BroadcastOutcome::Accepted { txid } = &outcome {
            if *txid != expected {
                log::warn!(
                    "Vault {}: broadcast txid {} differs from candidate {}, keeping it pending",
                    vault_id,
                    txid,
                    expected
                );
                return Err(VaultError::StaleAnchor {
                    vault_id: vault_id.clone(),
                });
            }
        }

        let pending = self
            .pending
            .remove(vault_id)
            .ok_or_else(|| VaultError::NothingPending(vault_id.clone()))?;
        let action = pending.action();

        let txid = match outcome {
            BroadcastOutcome::Accepted { txid } => txid,
            BroadcastOutcome::Rejected { reason } => {
                log::warn!(
                    "Broadcast of {} for vault {} rejected: {}",
                    action,
                    vault_id,
                    reason
                );
                if action == ActionKind::CreateVault {
                    self.vaults.remove(vault_id);
                    return Ok(None);
                }
                return Ok(self.vaults.get(vault_id).map(|v| v.status));
            }
        };

        let vault = self
            .vaults
            .get_mut(vault_id)
            .ok_or_else(|| VaultError::VaultNotFound(vault_id.clone()))?;
        let tx = &pending.built.unsigned_tx;
        let spell_index = tx.output_index(OutputRole::Spell).unwrap_or(1);

        match &pending.built.spell.action {
            SpellAction::CreateVault(_) => {
                vault.anchor = ChainAnchor::broadcast(txid, 0);
            }
            SpellAction::CheckIn(s) => {
                status::apply_check_in(vault, s.checked_in_at);
                vault.amount_sats = tx.output(OutputRole::Vault).map_or(0, |o| o.value_sats);
                vault.anchor = ChainAnchor::broadcast(txid, 0);
            }
            SpellAction::Claim(s) => {
                let record = ClaimRecord {
                    beneficiary_address: s.beneficiary_address.clone(),
                    amount_sats: s.claimed_sats,
                    txid,
                    claimed_at: s.claimed_at,
                };
                let remainder = tx.output(OutputRole::Remainder).map_or(0, |o| o.value_sats);
                status::apply_claim(vault, record, remainder);
                vault.anchor = match tx.output_index(OutputRole::Remainder) {
                    Some(index) => ChainAnchor::broadcast(txid, index),
                    None => ChainAnchor::broadcast(txid, spell_index),
                };
            }
            SpellAction::Cancel(_) => {
                status::apply_cancel(vault);
                vault.amount_sats = 0;
                vault.anchor = ChainAnchor::broadcast(txid, spell_index);
            }
        }

        log::info!(
            "Vault {} ({}): {} accepted as {} after {}s, status {}",
            vault.id,
            vault.name,
            action,
            txid,
            now.saturating_sub(pending.built_at),
            vault.status
        );
        Ok(Some(vault.status))
    }

    /// Settle a pending action whose transaction was observed on chain.
    ///
    /// Returns `false` when `txid` is not the pending candidate.
    pub fn settle_observed(
        &mut self,
        vault_id: &VaultId,
        txid: Txid,
        now: i64,
    ) -> VaultResult<bool> {
        match self.pending.get(vault_id) {
            Some(p) if p.txid == txid => {
                self.record_broadcast(vault_id, BroadcastOutcome::Accepted { txid }, now)?;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(VaultError::NothingPending(vault_id.clone())),
        }
    }

    /// Vaults `address` can claim from now, excluding any with an action in
    /// flight.
    pub fn claimable_vaults(&self, address: &str, now: i64) -> Vec<&Vault> {
        claimable_vaults(self.vaults.values(), address, now)
            .into_iter()
            .filter(|v| !self.pending.contains_key(&v.id))
            .collect()
    }

    /// Persist computed statuses and report every change.
    pub fn refresh_statuses(&mut self, now: i64) -> Vec<StatusChange> {
        let mut changes = Vec::new();
        for vault in self.vaults.values_mut() {
            let current = compute_status(vault, now);
            if current != vault.status {
                changes.push(StatusChange {
                    vault_id: vault.id.clone(),
                    name: vault.name.clone(),
                    from: vault.status,
                    to: current,
                });
                vault.status = current;
            }
        }
        self.last_refresh = Some(now);
        changes
    }

    fn require(&self, vault_id: &VaultId) -> VaultResult<&Vault> {
        self.vaults
            .get(vault_id)
            .ok_or_else(|| VaultError::VaultNotFound(vault_id.clone()))
    }

    fn require_free_anchor(&self, vault_id: &VaultId, utxo: &Utxo) -> VaultResult<&Vault> {
        let vault = self.require(vault_id)?;
        if self.pending.contains_key(vault_id) || utxo.outpoint() != vault.anchor.outpoint() {
            return Err(VaultError::StaleAnchor {
                vault_id: vault_id.clone(),
            });
        }
        if utxo.value_sats != vault.amount_sats {
            return Err(VaultError::Validation(format!(
                "anchor holds {} sat, vault records {} sat",
                utxo.value_sats, vault.amount_sats
            )));
        }
        Ok(vault)
    }

    /// The vault whose pending candidate already spends one of `utxos`.
    fn pending_spender(&self, utxos: &[Utxo]) -> Option<VaultId> {
        self.pending.values().find_map(|p| {
            p.built
                .unsigned_tx
                .inputs
                .iter()
                .any(|input| utxos.iter().any(|u| u.outpoint() == input.outpoint))
                .then(|| p.built.vault_id.clone())
        })
    }

    fn hold(&mut self, built: BuiltTransaction, txid: Txid, now: i64) {
        log::debug!(
            "Vault {}: {} candidate {} pending",
            built.vault_id,
            built.action(),
            txid
        );
        self.pending.insert(
            built.vault_id.clone(),
            PendingAction {
                built,
                txid,
                built_at: now,
            },
        );
    }
}
