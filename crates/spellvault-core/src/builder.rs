//! Balanced unsigned transaction candidates for the four vault actions.
//!
//! Every candidate satisfies `sum(inputs) == sum(outputs) + fee` in whole
//! satoshis. Value outputs below [`DUST_THRESHOLD_SATS`] are never emitted;
//! their value goes to the fee instead. The spell output is a zero-value
//! `OP_RETURN` and is exempt.
//!
//! # Output layout
//!
//! | Action      | 0            | 1     | 2                       |
//! |-------------|--------------|-------|-------------------------|
//! | CreateVault | vault value  | spell | change (if not dust)    |
//! | CheckIn     | vault value  | spell |                         |
//! | Claim       | claim        | spell | remainder (if not dust) |
//! | Cancel      | owner return | spell |                         |
//!
//! Inputs use `ENABLE_RBF_NO_LOCKTIME`. This module does not sign; the caller
//! signs and broadcasts through [`crate::collab::Broadcaster`].

use bitcoin::transaction::Version;
use bitcoin::{
    absolute::LockTime, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Txid, Witness,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{VaultError, VaultResult};
use crate::fees::{check_fee_rate, estimate_fee};
use crate::model::{
    parse_address, validate_beneficiaries, ActionKind, Beneficiary, Utxo, Vault, VaultId,
    VaultStatus, SECS_PER_DAY,
};
use crate::spell::{
    spell_script, CancelSpell, CheckInSpell, ClaimSpell, CreateVaultSpell, SpellAction, SpellCodec,
    SpellPayload, MAX_FRAMED_SPELL_LEN,
};

/// Smallest value output we will create.
pub const DUST_THRESHOLD_SATS: u64 = 546;

/// What an output is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputRole {
    Vault,
    Spell,
    Change,
    Claim,
    Remainder,
    OwnerReturn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInput {
    pub outpoint: OutPoint,
    pub value_sats: u64,
}

impl From<&Utxo> for CandidateInput {
    fn from(utxo: &Utxo) -> Self {
        Self {
            outpoint: utxo.outpoint(),
            value_sats: utxo.value_sats,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateOutput {
    pub role: OutputRole,
    pub value_sats: u64,
    pub script_pubkey: ScriptBuf,
}

/// An unsigned transaction with explicit fee accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTx {
    pub inputs: Vec<CandidateInput>,
    pub outputs: Vec<CandidateOutput>,
    pub fee_sats: u64,
}

impl UnsignedTx {
    pub fn total_input_sats(&self) -> u64 {
        self.inputs.iter().map(|i| i.value_sats).sum()
    }

    pub fn total_output_sats(&self) -> u64 {
        self.outputs.iter().map(|o| o.value_sats).sum()
    }

    /// `sum(inputs) == sum(outputs) + fee`.
    pub fn is_balanced(&self) -> bool {
        self.total_output_sats()
            .checked_add(self.fee_sats)
            .is_some_and(|out| out == self.total_input_sats())
    }

    pub fn output_index(&self, role: OutputRole) -> Option<u32> {
        self.outputs
            .iter()
            .position(|o| o.role == role)
            .map(|i| i as u32)
    }

    pub fn output(&self, role: OutputRole) -> Option<&CandidateOutput> {
        self.outputs.iter().find(|o| o.role == role)
    }

    /// Version 2, locktime 0, RBF-enabled, empty witnesses.
    pub fn to_transaction(&self) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: self
                .inputs
                .iter()
                .map(|i| TxIn {
                    previous_output: i.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
                .collect(),
            output: self
                .outputs
                .iter()
                .map(|o| TxOut {
                    value: Amount::from_sat(o.value_sats),
                    script_pubkey: o.script_pubkey.clone(),
                })
                .collect(),
        }
    }

    /// The txid this candidate will have once signed (segwit inputs only).
    pub fn txid(&self) -> Txid {
        self.to_transaction().compute_txid()
    }
}

/// A candidate ready for signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltTransaction {
    pub unsigned_tx: UnsignedTx,
    pub estimated_fee: u64,
    pub vault_id: VaultId,
    pub spell: SpellPayload,
    /// The framed spell as carried in the `OP_RETURN`.
    pub spell_bytes: Vec<u8>,
}

impl BuiltTransaction {
    pub fn action(&self) -> ActionKind {
        self.spell.kind()
    }
}

/// Parameters for opening a vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVaultRequest {
    pub name: String,
    pub owner_address: String,
    pub amount_sats: u64,
    pub beneficiaries: Vec<Beneficiary>,
    pub inactivity_period_days: u64,
}

/// What one claim pays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimTerms {
    pub beneficiary_address: String,
    /// Whole percent, 1–100.
    pub percentage: u8,
    /// Value the percentage applies to. Defaults to the vault UTXO's value.
    pub basis_sats: Option<u64>,
    /// Pay everything left after fees, absorbing any rounding residue.
    pub sweep: bool,
}

/// Builds candidates for one network with one spell codec.
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    network: Network,
    codec: SpellCodec,
}

impl TransactionBuilder {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            codec: SpellCodec::default(),
        }
    }

    pub fn with_codec(mut self, codec: SpellCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn codec(&self) -> &SpellCodec {
        &self.codec
    }

    /// Lock `amount_sats` from the owner's UTXOs into a new vault.
    ///
    /// Consumes every supplied UTXO. The vault id is derived from the first
    /// one. Change below dust is folded into the fee.
    pub fn build_create(
        &self,
        request: &CreateVaultRequest,
        utxos: &[Utxo],
        fee_rate: u64,
        now: i64,
    ) -> VaultResult<BuiltTransaction> {
        check_fee_rate(fee_rate)?;
        let first = utxos
            .first()
            .ok_or_else(|| VaultError::Validation("no funding UTXOs supplied".into()))?;

        let mut seen = HashSet::new();
        if !utxos.iter().all(|u| seen.insert(u.outpoint())) {
            return Err(VaultError::Validation("duplicate funding UTXO".into()));
        }
        if request.amount_sats < DUST_THRESHOLD_SATS {
            return Err(VaultError::Validation(format!(
                "vault amount {} sat is below dust ({} sat)",
                request.amount_sats, DUST_THRESHOLD_SATS
            )));
        }
        if request.inactivity_period_days == 0 {
            return Err(VaultError::Validation(
                "inactivity period must be at least one day".into(),
            ));
        }
        let period_secs = request
            .inactivity_period_days
            .checked_mul(SECS_PER_DAY)
            .ok_or_else(|| VaultError::Validation("inactivity period too long".into()))?;

        let owner = parse_address(&request.owner_address, self.network)?;
        validate_beneficiaries(&request.beneficiaries, self.network)?;

        let available = utxos
            .iter()
            .try_fold(0u64, |acc, u| acc.checked_add(u.value_sats))
            .ok_or_else(|| VaultError::Validation("funding total overflows".into()))?;

        let vault_id = VaultId::from_funding_outpoint(&first.outpoint());
        let spell = SpellPayload::new(SpellAction::CreateVault(CreateVaultSpell {
            vault_id: vault_id.clone(),
            owner_address: request.owner_address.clone(),
            beneficiaries: request.beneficiaries.clone(),
            inactivity_period_secs: period_secs,
            amount_sats: request.amount_sats,
            created_at: now,
            last_check_in: now,
            status: VaultStatus::Active,
        }));
        let spell_bytes = self.codec.encode(&spell)?;

        let n = utxos.len();
        let fee_with_change =
            estimate_fee(ActionKind::CreateVault, n, 2, spell_bytes.len(), fee_rate);
        let fee_without_change =
            estimate_fee(ActionKind::CreateVault, n, 1, spell_bytes.len(), fee_rate);

        let mut outputs = vec![
            CandidateOutput {
                role: OutputRole::Vault,
                value_sats: request.amount_sats,
                script_pubkey: owner.script_pubkey(),
            },
            spell_output(&spell_bytes),
        ];

        let change = available
            .checked_sub(request.amount_sats)
            .and_then(|v| v.checked_sub(fee_with_change))
            .filter(|&c| c >= DUST_THRESHOLD_SATS);

        let fee = match change {
            Some(change) => {
                outputs.push(CandidateOutput {
                    role: OutputRole::Change,
                    value_sats: change,
                    script_pubkey: owner.script_pubkey(),
                });
                fee_with_change
            }
            None => {
                let needed = request.amount_sats.saturating_add(fee_without_change);
                if available < needed {
                    return Err(VaultError::InsufficientFunds { needed, available });
                }
                // Dust change goes to the miner
                available - request.amount_sats
            }
        };

        self.finish(
            vault_id,
            spell,
            spell_bytes,
            utxos.iter().map(CandidateInput::from).collect(),
            outputs,
            fee,
        )
    }

    /// Spend the vault anchor back to the vault, resetting the clock.
    pub fn build_check_in(
        &self,
        vault: &Vault,
        vault_utxo: &Utxo,
        fee_rate: u64,
        now: i64,
    ) -> VaultResult<BuiltTransaction> {
        check_fee_rate(fee_rate)?;
        let owner = parse_address(&vault.owner_address, self.network)?;

        let spell = SpellPayload::new(SpellAction::CheckIn(CheckInSpell {
            vault_id: vault.id.clone(),
            checked_in_at: now,
        }));
        let spell_bytes = self.codec.encode(&spell)?;

        let fee = estimate_fee(ActionKind::CheckIn, 1, 1, spell_bytes.len(), fee_rate);
        let value = spend_to_single_output(vault_utxo.value_sats, fee)?;

        let outputs = vec![
            CandidateOutput {
                role: OutputRole::Vault,
                value_sats: value,
                script_pubkey: owner.script_pubkey(),
            },
            spell_output(&spell_bytes),
        ];

        self.finish(
            vault.id.clone(),
            spell,
            spell_bytes,
            vec![CandidateInput::from(vault_utxo)],
            outputs,
            fee,
        )
    }

    /// Pay one beneficiary their share.
    ///
    /// `claim = floor(basis * percentage / 100)`. The fee comes out of the
    /// remainder, which returns to the vault script unless it is dust. A
    /// sweep pays the whole UTXO minus the fee to the beneficiary.
    pub fn build_claim(
        &self,
        vault: &Vault,
        vault_utxo: &Utxo,
        terms: &ClaimTerms,
        fee_rate: u64,
        now: i64,
    ) -> VaultResult<BuiltTransaction> {
        check_fee_rate(fee_rate)?;
        if terms.percentage == 0 || terms.percentage > 100 {
            return Err(VaultError::Validation(format!(
                "claim percentage {} outside [1, 100]",
                terms.percentage
            )));
        }
        let owner = parse_address(&vault.owner_address, self.network)?;
        let beneficiary = parse_address(&terms.beneficiary_address, self.network)?;
        let available = vault_utxo.value_sats;

        // Claimed amount is a fixed-width field, so the spell length does
        // not depend on it.
        let spell_for = |claimed_sats: u64| {
            SpellPayload::new(SpellAction::Claim(ClaimSpell {
                vault_id: vault.id.clone(),
                beneficiary_address: terms.beneficiary_address.clone(),
                claimed_sats,
                claimed_at: now,
            }))
        };
        let spell_len = self.codec.encode(&spell_for(0))?.len();
        let fee_with_remainder = estimate_fee(ActionKind::Claim, 1, 2, spell_len, fee_rate);
        let fee_without_remainder = estimate_fee(ActionKind::Claim, 1, 1, spell_len, fee_rate);

        let (claim, remainder, fee) = if terms.sweep {
            let claim = spend_to_single_output(available, fee_without_remainder)?;
            (claim, None, fee_without_remainder)
        } else {
            let basis = terms.basis_sats.unwrap_or(available);
            let claim = (u128::from(basis) * u128::from(terms.percentage) / 100) as u64;
            if claim < DUST_THRESHOLD_SATS {
                return Err(VaultError::Validation(format!(
                    "claim of {} sat is below dust ({} sat)",
                    claim, DUST_THRESHOLD_SATS
                )));
            }

            let remainder = available
                .checked_sub(claim)
                .and_then(|v| v.checked_sub(fee_with_remainder))
                .filter(|&r| r >= DUST_THRESHOLD_SATS);
            match remainder {
                Some(r) => (claim, Some(r), fee_with_remainder),
                None => {
                    let needed = claim.saturating_add(fee_without_remainder);
                    if available < needed {
                        return Err(VaultError::InsufficientFunds { needed, available });
                    }
                    (claim, None, available - claim)
                }
            }
        };

        let spell = spell_for(claim);
        let spell_bytes = self.codec.encode(&spell)?;

        let mut outputs = vec![
            CandidateOutput {
                role: OutputRole::Claim,
                value_sats: claim,
                script_pubkey: beneficiary.script_pubkey(),
            },
            spell_output(&spell_bytes),
        ];
        if let Some(remainder) = remainder {
            outputs.push(CandidateOutput {
                role: OutputRole::Remainder,
                value_sats: remainder,
                script_pubkey: owner.script_pubkey(),
            });
        }

        self.finish(
            vault.id.clone(),
            spell,
            spell_bytes,
            vec![CandidateInput::from(vault_utxo)],
            outputs,
            fee,
        )
    }

    /// Return the vault's value to its owner.
    pub fn build_cancel(
        &self,
        vault: &Vault,
        vault_utxo: &Utxo,
        fee_rate: u64,
        now: i64,
    ) -> VaultResult<BuiltTransaction> {
        check_fee_rate(fee_rate)?;
        let owner = parse_address(&vault.owner_address, self.network)?;

        let spell = SpellPayload::new(SpellAction::Cancel(CancelSpell {
            vault_id: vault.id.clone(),
            cancelled_at: now,
        }));
        let spell_bytes = self.codec.encode(&spell)?;

        let fee = estimate_fee(ActionKind::Cancel, 1, 1, spell_bytes.len(), fee_rate);
        let value = spend_to_single_output(vault_utxo.value_sats, fee)?;

        let outputs = vec![
            CandidateOutput {
                role: OutputRole::OwnerReturn,
                value_sats: value,
                script_pubkey: owner.script_pubkey(),
            },
            spell_output(&spell_bytes),
        ];

        self.finish(
            vault.id.clone(),
            spell,
            spell_bytes,
            vec![CandidateInput::from(vault_utxo)],
            outputs,
            fee,
        )
    }

    /// Pick confirmed UTXOs, largest first, until they cover `amount_sats`
    /// plus the fee of a create transaction with change.
    ///
    /// The fee is sized for the largest spell this builder's codec accepts.
    pub fn select_funding_utxos(
        &self,
        utxos: &[Utxo],
        amount_sats: u64,
        fee_rate: u64,
    ) -> VaultResult<Vec<Utxo>> {
        check_fee_rate(fee_rate)?;
        let worst_case_spell = self.codec.max_len().min(MAX_FRAMED_SPELL_LEN) + 3;

        let mut candidates: Vec<&Utxo> = utxos.iter().filter(|u| u.confirmed).collect();
        candidates.sort_by(|a, b| b.value_sats.cmp(&a.value_sats));

        let mut selected = Vec::new();
        let mut total: u64 = 0;
        for utxo in candidates {
            selected.push(utxo.clone());
            total = total.saturating_add(utxo.value_sats);

            let fee = estimate_fee(
                ActionKind::CreateVault,
                selected.len(),
                2,
                worst_case_spell,
                fee_rate,
            );
            if total >= amount_sats.saturating_add(fee) {
                return Ok(selected);
            }
        }

        let fee = estimate_fee(
            ActionKind::CreateVault,
            selected.len().max(1),
            2,
            worst_case_spell,
            fee_rate,
        );
        Err(VaultError::InsufficientFunds {
            needed: amount_sats.saturating_add(fee),
            available: total,
        })
    }

    fn finish(
        &self,
        vault_id: VaultId,
        spell: SpellPayload,
        spell_bytes: Vec<u8>,
        inputs: Vec<CandidateInput>,
        outputs: Vec<CandidateOutput>,
        fee: u64,
    ) -> VaultResult<BuiltTransaction> {
        let unsigned_tx = UnsignedTx {
            inputs,
            outputs,
            fee_sats: fee,
        };
        if !unsigned_tx.is_balanced() {
            return Err(VaultError::Validation(format!(
                "unbalanced candidate: in {} != out {} + fee {}",
                unsigned_tx.total_input_sats(),
                unsigned_tx.total_output_sats(),
                fee
            )));
        }

        log::debug!(
            "Built {} candidate for vault {}: {} in, {} out, fee {} sat",
            spell.kind(),
            vault_id,
            unsigned_tx.inputs.len(),
            unsigned_tx.outputs.len(),
            fee
        );

        Ok(BuiltTransaction {
            unsigned_tx,
            estimated_fee: fee,
            vault_id,
            spell,
            spell_bytes,
        })
    }
}

fn spell_output(spell_bytes: &[u8]) -> CandidateOutput {
    CandidateOutput {
        role: OutputRole::Spell,
        value_sats: 0,
        script_pubkey: spell_script(spell_bytes),
    }
}

/// Value left for a single output after `fee`, which must not be dust.
fn spend_to_single_output(available: u64, fee: u64) -> VaultResult<u64> {
    let needed = fee.saturating_add(DUST_THRESHOLD_SATS);
    if available < needed {
        return Err(VaultError::InsufficientFunds { needed, available });
    }
    Ok(available - fee)
}
