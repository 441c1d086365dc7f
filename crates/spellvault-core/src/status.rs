//! Vault lifecycle: status derivation and action transition rules.
//!
//! Pure logic. No I/O, no clock reads; callers pass `now` in unix seconds.
//!
//! ```text
//! |------- Active -------|--- Warning (last 7 days) ---|--- Triggered
//! last_check_in                                period elapsed
//! ```
//!
//! `Claimed` and `Cancelled` are terminal and never change again.

use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};
use crate::model::{ActionKind, ClaimRecord, Vault, VaultId, VaultStatus, SECS_PER_DAY};

/// Remaining time at or below which a vault is in `Warning`.
pub const WARNING_THRESHOLD_SECS: i64 = 7 * SECS_PER_DAY as i64;

/// Seconds until the vault triggers. Zero or negative once triggered.
pub fn seconds_remaining(vault: &Vault, now: i64) -> i64 {
    let period = i64::try_from(vault.inactivity_period_secs).unwrap_or(i64::MAX);
    let elapsed = now.saturating_sub(vault.last_check_in);
    period.saturating_sub(elapsed)
}

/// Current status of a vault at `now`.
///
/// Terminal statuses are returned as stored; live statuses are recomputed
/// from the check-in clock on every call.
pub fn compute_status(vault: &Vault, now: i64) -> VaultStatus {
    if vault.status.is_terminal() {
        return vault.status;
    }

    let remaining = seconds_remaining(vault, now);
    if remaining <= 0 {
        VaultStatus::Triggered
    } else if remaining <= WARNING_THRESHOLD_SECS {
        VaultStatus::Warning
    } else {
        VaultStatus::Active
    }
}

fn ensure_owner_action(vault: &Vault, now: i64, action: ActionKind) -> VaultResult<()> {
    match compute_status(vault, now) {
        VaultStatus::Active | VaultStatus::Warning => Ok(()),
        status => Err(VaultError::InvalidStateTransition { status, action }),
    }
}

/// Check-ins are allowed while `Active` or `Warning`.
pub fn ensure_can_check_in(vault: &Vault, now: i64) -> VaultResult<()> {
    ensure_owner_action(vault, now, ActionKind::CheckIn)
}

/// Cancellation is allowed while `Active` or `Warning`.
pub fn ensure_can_cancel(vault: &Vault, now: i64) -> VaultResult<()> {
    ensure_owner_action(vault, now, ActionKind::Cancel)
}

/// A claim needs a `Triggered` vault and a beneficiary with a share who has
/// not claimed yet. Returns the address's combined share: an address listed
/// more than once claims all of its entries together.
pub fn ensure_can_claim(vault: &Vault, address: &str, now: i64) -> VaultResult<u8> {
    let status = compute_status(vault, now);
    if status != VaultStatus::Triggered {
        return Err(VaultError::InvalidStateTransition {
            status,
            action: ActionKind::Claim,
        });
    }

    if !vault.is_beneficiary(address) {
        return Err(VaultError::NotABeneficiary(address.to_string()));
    }
    if vault.has_claimed(address) {
        return Err(VaultError::AlreadyClaimed(address.to_string()));
    }
    let share = vault.share_of(address);
    if share == 0 {
        return Err(VaultError::Validation(format!(
            "beneficiary {} has a 0% share",
            address
        )));
    }
    Ok(share)
}

/// Record a confirmed check-in: the clock restarts and the vault is `Active`.
pub fn apply_check_in(vault: &mut Vault, checked_in_at: i64) {
    vault.last_check_in = checked_in_at;
    vault.status = VaultStatus::Active;
}

/// Record a confirmed cancellation.
pub fn apply_cancel(vault: &mut Vault) {
    vault.status = VaultStatus::Cancelled;
}

/// Record a confirmed claim.
///
/// `remaining_sats` is the value left at the vault's new anchor (zero when
/// the claim swept it). The vault becomes `Claimed` once nothing is left or
/// every beneficiary with a share has claimed.
pub fn apply_claim(vault: &mut Vault, record: ClaimRecord, remaining_sats: u64) {
    if vault.claim_basis_sats.is_none() {
        vault.claim_basis_sats = Some(vault.amount_sats);
    }
    vault.claims.push(record);
    vault.amount_sats = remaining_sats;

    vault.status = if remaining_sats == 0 || vault.outstanding_beneficiaries().next().is_none() {
        VaultStatus::Claimed
    } else {
        VaultStatus::Triggered
    };
}

/// Status of one vault at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub vault_id: VaultId,
    pub name: String,
    pub status: VaultStatus,
    pub seconds_remaining: i64,
}

impl StatusReport {
    pub fn evaluate(vault: &Vault, now: i64) -> Self {
        Self {
            vault_id: vault.id.clone(),
            name: vault.name.clone(),
            status: compute_status(vault, now),
            seconds_remaining: seconds_remaining(vault, now),
        }
    }
}

/// Evaluate many vaults, most urgent first.
///
/// Order: `Triggered`, `Warning`, `Active`, then terminal vaults. Within a
/// status, less time remaining sorts first.
pub fn evaluate_batch<'a>(
    vaults: impl IntoIterator<Item = &'a Vault>,
    now: i64,
) -> Vec<StatusReport> {
    let mut reports: Vec<StatusReport> = vaults
        .into_iter()
        .map(|vault| StatusReport::evaluate(vault, now))
        .collect();

    let priority = |status: VaultStatus| -> u8 {
        match status {
            VaultStatus::Triggered => 0,
            VaultStatus::Warning => 1,
            VaultStatus::Active => 2,
            VaultStatus::Claimed | VaultStatus::Cancelled => 3,
        }
    };
    reports.sort_by(|a, b| {
        priority(a.status)
            .cmp(&priority(b.status))
            .then(a.seconds_remaining.cmp(&b.seconds_remaining))
    });

    reports
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{make_test_vault, test_address, test_txid};

    const DAY: i64 = SECS_PER_DAY as i64;
    const NOW: i64 = 1_750_000_000;

    fn claim_record(address: &str, amount_sats: u64) -> ClaimRecord {
        ClaimRecord {
            beneficiary_address: address.to_string(),
            amount_sats,
            txid: test_txid(0xC1),
            claimed_at: NOW,
        }
    }

    #[test]
    fn test_triggered_after_period() {
        // 90-day period, last check-in 91 days ago
        let vault = make_test_vault(90, NOW - 91 * DAY);
        assert_eq!(compute_status(&vault, NOW), VaultStatus::Triggered);
        assert_eq!(seconds_remaining(&vault, NOW), -DAY);
    }

    #[test]
    fn test_warning_in_last_week() {
        // 90-day period, last check-in 85 days ago
        let vault = make_test_vault(90, NOW - 85 * DAY);
        assert_eq!(compute_status(&vault, NOW), VaultStatus::Warning);
    }

    #[test]
    fn test_active_when_fresh() {
        let vault = make_test_vault(90, NOW - 10 * DAY);
        assert_eq!(compute_status(&vault, NOW), VaultStatus::Active);
    }

    #[test]
    fn test_boundaries() {
        let vault = make_test_vault(90, NOW - 90 * DAY);
        // Exactly zero remaining
        assert_eq!(compute_status(&vault, NOW), VaultStatus::Triggered);

        let vault = make_test_vault(90, NOW - 83 * DAY);
        // Exactly 7 days remaining
        assert_eq!(compute_status(&vault, NOW), VaultStatus::Warning);
        assert_eq!(compute_status(&vault, NOW - 1), VaultStatus::Active);
    }

    #[test]
    fn test_status_monotonic_without_check_in() {
        let vault = make_test_vault(30, NOW);
        let mut last = VaultStatus::Active;
        let rank = |s: VaultStatus| match s {
            VaultStatus::Active => 0,
            VaultStatus::Warning => 1,
            _ => 2,
        };

        for hour in 0..(40 * 24) {
            let status = compute_status(&vault, NOW + hour * 3_600);
            assert!(rank(status) >= rank(last), "went backwards at hour {}", hour);
            last = status;
        }
        assert_eq!(last, VaultStatus::Triggered);
    }

    #[test]
    fn test_terminal_statuses_are_sticky() {
        for terminal in [VaultStatus::Claimed, VaultStatus::Cancelled] {
            let mut vault = make_test_vault(90, NOW);
            vault.status = terminal;
            for t in [NOW, NOW + 80 * DAY, NOW + 365 * DAY, NOW - 365 * DAY] {
                assert_eq!(compute_status(&vault, t), terminal);
            }
        }
    }

    #[test]
    fn test_compute_status_ignores_stale_live_status() {
        let mut vault = make_test_vault(90, NOW - 91 * DAY);
        vault.status = VaultStatus::Active;
        assert_eq!(compute_status(&vault, NOW), VaultStatus::Triggered);
    }

    #[test]
    fn test_check_in_on_triggered_rejected() {
        let vault = make_test_vault(90, NOW - 91 * DAY);
        assert_eq!(
            ensure_can_check_in(&vault, NOW),
            Err(VaultError::InvalidStateTransition {
                status: VaultStatus::Triggered,
                action: ActionKind::CheckIn,
            })
        );
    }

    #[test]
    fn test_check_in_allowed_in_warning() {
        let mut vault = make_test_vault(90, NOW - 85 * DAY);
        assert!(ensure_can_check_in(&vault, NOW).is_ok());

        apply_check_in(&mut vault, NOW);
        assert_eq!(vault.last_check_in, NOW);
        assert_eq!(compute_status(&vault, NOW), VaultStatus::Active);
    }

    #[test]
    fn test_cancel_rules() {
        let mut vault = make_test_vault(90, NOW);
        assert!(ensure_can_cancel(&vault, NOW).is_ok());

        apply_cancel(&mut vault);
        assert_eq!(
            ensure_can_cancel(&vault, NOW),
            Err(VaultError::InvalidStateTransition {
                status: VaultStatus::Cancelled,
                action: ActionKind::Cancel,
            })
        );
        assert!(ensure_can_check_in(&vault, NOW).is_err());
    }

    #[test]
    fn test_cancel_after_trigger_rejected() {
        let vault = make_test_vault(90, NOW - 91 * DAY);
        assert!(matches!(
            ensure_can_cancel(&vault, NOW),
            Err(VaultError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_claim_rules() {
        let vault = make_test_vault(90, NOW - 91 * DAY);
        let heir = vault.beneficiaries[0].address.clone();

        assert_eq!(ensure_can_claim(&vault, &heir, NOW).unwrap(), 50);

        let stranger = test_address(99);
        assert_eq!(
            ensure_can_claim(&vault, &stranger, NOW),
            Err(VaultError::NotABeneficiary(stranger.clone()))
        );

        let active = make_test_vault(90, NOW);
        assert!(matches!(
            ensure_can_claim(&active, &heir, NOW),
            Err(VaultError::InvalidStateTransition {
                status: VaultStatus::Active,
                action: ActionKind::Claim,
            })
        ));
    }

    #[test]
    fn test_partial_claims_then_claimed() {
        let mut vault = make_test_vault(90, NOW - 91 * DAY);
        let heirs: Vec<String> = vault.beneficiaries.iter().map(|b| b.address.clone()).collect();

        apply_claim(&mut vault, claim_record(&heirs[0], 50_000_000), 49_999_000);
        assert_eq!(vault.status, VaultStatus::Triggered);
        assert_eq!(vault.claim_basis_sats, Some(100_000_000));
        assert_eq!(
            ensure_can_claim(&vault, &heirs[0], NOW),
            Err(VaultError::AlreadyClaimed(heirs[0].clone()))
        );

        apply_claim(&mut vault, claim_record(&heirs[1], 30_000_000), 19_998_000);
        assert_eq!(vault.status, VaultStatus::Triggered);
        // Basis stays fixed at the first claim
        assert_eq!(vault.claim_basis_sats, Some(100_000_000));

        apply_claim(&mut vault, claim_record(&heirs[2], 19_997_000), 0);
        assert_eq!(vault.status, VaultStatus::Claimed);
        assert_eq!(compute_status(&vault, NOW + 365 * DAY), VaultStatus::Claimed);
    }

    #[test]
    fn test_claim_with_nothing_left_is_final() {
        let mut vault = make_test_vault(90, NOW - 91 * DAY);
        let first = vault.beneficiaries[0].address.clone();
        apply_claim(&mut vault, claim_record(&first, 99_999_000), 0);
        assert_eq!(vault.status, VaultStatus::Claimed);
    }

    #[test]
    fn test_batch_sorted_by_urgency() {
        let mut triggered = make_test_vault(90, NOW - 100 * DAY);
        triggered.name = "triggered".into();
        let mut warning = make_test_vault(90, NOW - 86 * DAY);
        warning.name = "warning".into();
        let mut warning_sooner = make_test_vault(90, NOW - 88 * DAY);
        warning_sooner.name = "warning-sooner".into();
        let mut active = make_test_vault(90, NOW);
        active.name = "active".into();
        let mut cancelled = make_test_vault(90, NOW - 100 * DAY);
        cancelled.status = VaultStatus::Cancelled;
        cancelled.name = "cancelled".into();

        let vaults = vec![active, cancelled, warning, triggered, warning_sooner];
        let reports = evaluate_batch(&vaults, NOW);

        let names: Vec<&str> = reports.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["triggered", "warning-sooner", "warning", "active", "cancelled"]
        );
        assert_eq!(reports[0].status, VaultStatus::Triggered);
        assert_eq!(reports[4].status, VaultStatus::Cancelled);
    }
}
