//! The daemon loop: refreshes vault statuses and reconciles broadcasts.

use crate::config::ServerConfig;
use crate::store::VaultStore;
use anyhow::{Context, Result};
use bitcoin::{Script, Txid};
use spellvault_core::builder::{OutputRole, TransactionBuilder};
use spellvault_core::fees::FeeEstimator;
use spellvault_core::ledger::StatusChange;
use spellvault_core::spell::SpellCodec;
use spellvault_core::status::{evaluate_batch, StatusReport};
use spellvault_core::{VaultLedger, VaultStatus};
use spellvault_electrum::{AnchorState, ElectrumClient};
use std::time::Duration;

/// Run the daemon loop. Blocks forever (until shutdown signal).
pub async fn run(config: ServerConfig) -> Result<()> {
    log::info!("SpellVault server starting…");
    log::info!("  Network:    {}", config.network());
    log::info!("  Electrum:   {}", config.bitcoin.electrum_url);
    log::info!(
        "  Interval:   {} seconds ({:.1} hours)",
        config.server.check_interval_secs,
        config.server.check_interval_secs as f64 / 3600.0
    );
    log::info!("  Data dir:   {}", config.server.data_dir.display());
    log::info!("  Fees:       {} priority", config.fees.priority);
    log::info!("  Reconcile:  {}", config.watch.reconcile_anchors);

    std::fs::create_dir_all(&config.server.data_dir).with_context(|| {
        format!(
            "Failed to create data dir: {}",
            config.server.data_dir.display()
        )
    })?;

    let interval = Duration::from_secs(config.server.check_interval_secs);

    // Run first check immediately, then loop
    let mut first = true;
    loop {
        if !first {
            log::info!(
                "Sleeping {} seconds until next check…",
                config.server.check_interval_secs
            );
            tokio::time::sleep(interval).await;
        }
        first = false;

        match run_check_cycle(&config).await {
            Ok(()) => log::info!("Check cycle completed successfully."),
            Err(e) => log::error!("Check cycle failed: {:#}", e),
        }
    }
}

/// Transaction builder honouring the configured spell ceiling.
pub fn builder_for(config: &ServerConfig) -> TransactionBuilder {
    let builder = TransactionBuilder::new(config.network());
    match config.fees.max_spell_len {
        Some(len) => builder.with_codec(SpellCodec::with_max_len(len)),
        None => builder,
    }
}

/// One cycle: refresh statuses, then talk to Electrum for height, pending
/// broadcasts and fees.
pub async fn run_check_cycle(config: &ServerConfig) -> Result<()> {
    log::info!("Starting check cycle…");

    let store = VaultStore::new(config.store_path());
    let now = chrono::Utc::now().timestamp();

    // Saved before connecting so an unreachable server still records statuses
    let changes = refresh_store(&store, config, now)?;
    log::info!("{} status change(s)", changes.len());

    let network = config.network();
    let client = ElectrumClient::new(&config.bitcoin.electrum_url, network).with_context(|| {
        format!(
            "Failed to connect to Electrum at {}",
            config.bitcoin.electrum_url
        )
    })?;

    let height = client.get_height().context("Failed to fetch block height")?;
    log::info!("Block height: {}", height);

    if config.watch.reconcile_anchors {
        let mut ledger = store
            .load_ledger(builder_for(config))
            .context("Failed to load vault store")?;
        let settled = reconcile_pending(&mut ledger, now, |script, txid| {
            client
                .tx_state_for_script(script, txid)
                .map_err(anyhow::Error::from)
        });
        if settled > 0 {
            store
                .save(&ledger.snapshot())
                .context("Failed to save vault store")?;
        }
    }

    let fees = FeeEstimator::new(&client, network);
    let rate = fees.rate_for_priority(config.fees.priority);
    log::info!(
        "Fee rate for {} priority: {} sat/vB",
        config.fees.priority,
        rate
    );

    Ok(())
}

/// Load the store, persist freshly computed statuses, log each change.
pub fn refresh_store(
    store: &VaultStore,
    config: &ServerConfig,
    now: i64,
) -> Result<Vec<StatusChange>> {
    let mut ledger = store
        .load_ledger(builder_for(config))
        .context("Failed to load vault store")?;
    log::info!(
        "Loaded {} vault(s) from {}",
        ledger.len(),
        store.path().display()
    );

    let changes = ledger.refresh_statuses(now);
    for change in &changes {
        log_status_change(change);
    }

    store
        .save(&ledger.snapshot())
        .context("Failed to save vault store")?;
    Ok(changes)
}

fn log_status_change(change: &StatusChange) {
    match change.to {
        VaultStatus::Warning => log::warn!(
            "[{}] {} entered the warning window, owner should check in",
            change.vault_id,
            change.name
        ),
        VaultStatus::Triggered => log::warn!(
            "[{}] {} triggered, beneficiaries may claim",
            change.vault_id,
            change.name
        ),
        _ => log::info!(
            "[{}] {}: {} -> {}",
            change.vault_id,
            change.name,
            change.from,
            change.to
        ),
    }
}

/// Settle every pending action whose transaction `lookup` has seen.
///
/// The lookup searches the history of the candidate's first non-spell output.
/// Returns the number of actions settled.
pub fn reconcile_pending<F>(ledger: &mut VaultLedger, now: i64, lookup: F) -> usize
where
    F: Fn(&Script, &Txid) -> Result<AnchorState>,
{
    let candidates: Vec<_> = ledger
        .pending_actions()
        .filter_map(|p| {
            let output = p
                .built
                .unsigned_tx
                .outputs
                .iter()
                .find(|o| o.role != OutputRole::Spell)?;
            Some((
                p.built.vault_id.clone(),
                p.txid,
                output.script_pubkey.clone(),
            ))
        })
        .collect();

    let mut settled = 0;
    for (vault_id, txid, script) in candidates {
        match lookup(&script, &txid) {
            Ok(AnchorState::Unknown) => {
                log::debug!("[{}] pending {} not seen yet", vault_id, txid);
            }
            Ok(state) => match ledger.settle_observed(&vault_id, txid, now) {
                Ok(true) => {
                    log::info!("[{}] pending {} observed ({:?})", vault_id, txid, state);
                    settled += 1;
                }
                Ok(false) => {}
                Err(e) => log::error!("[{}] could not settle {}: {}", vault_id, txid, e),
            },
            Err(e) => log::warn!("[{}] lookup of {} failed: {:#}", vault_id, txid, e),
        }
    }
    settled
}

/// Reports for `--status`, most urgent first.
pub fn status_reports(config: &ServerConfig, now: i64) -> Result<Vec<StatusReport>> {
    let ledger = VaultStore::new(config.store_path())
        .load_ledger(builder_for(config))
        .context("Failed to load vault store")?;
    Ok(evaluate_batch(ledger.vaults(), now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::STORE_FILE;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bitcoin::{Address, Network};
    use spellvault_core::builder::CreateVaultRequest;
    use spellvault_core::ledger::BroadcastOutcome;
    use spellvault_core::{Beneficiary, Utxo, VaultId};
    use std::str::FromStr;
    use tempfile::TempDir;

    const T0: i64 = 1_700_000_000;
    const DAY: i64 = 86_400;

    fn address(seed: u8) -> String {
        let secp = Secp256k1::new();
        let mut bytes = [0u8; 32];
        bytes[0] = 0x01;
        bytes[31] = seed;
        let pk = SecretKey::from_slice(&bytes).unwrap().public_key(&secp);
        Address::p2tr(&secp, pk.x_only_public_key().0, None, Network::Testnet).to_string()
    }

    fn config_in(dir: &TempDir) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.server.data_dir = dir.path().to_path_buf();
        config
    }

    /// A ledger holding one vault with its create still pending.
    fn pending_ledger(byte: u8) -> (VaultLedger, VaultId, Txid) {
        let mut ledger = VaultLedger::for_network(Network::Testnet);
        let request = CreateVaultRequest {
            name: format!("Vault {}", byte),
            owner_address: address(1),
            amount_sats: 1_000_000,
            beneficiaries: vec![
                Beneficiary::new("a", "A", address(2), 70),
                Beneficiary::new("b", "B", address(3), 30),
            ],
            inactivity_period_days: 30,
        };
        let funding = vec![Utxo {
            txid: Txid::from_byte_array([byte; 32]),
            output_index: 0,
            value_sats: 2_000_000,
            confirmed: true,
        }];
        let built = ledger.create_vault(&request, &funding, 1, T0).unwrap();
        let txid = built.unsigned_tx.txid();
        (ledger, built.vault_id, txid)
    }

    #[test]
    fn test_refresh_store_persists_changes() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let store = VaultStore::new(dir.path().join(STORE_FILE));

        let (mut ledger, id, txid) = pending_ledger(0x01);
        ledger
            .record_broadcast(&id, BroadcastOutcome::Accepted { txid }, T0)
            .unwrap();
        store.save(&ledger.snapshot()).unwrap();

        // 30-day period, 7-day warning window
        let changes = refresh_store(&store, &config, T0 + 25 * DAY).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].to, VaultStatus::Warning);

        let snapshot = store.load().unwrap();
        assert_eq!(snapshot.vaults[0].status, VaultStatus::Warning);
        assert_eq!(snapshot.last_refresh, Some(T0 + 25 * DAY));

        // Nothing new on a second pass
        assert!(refresh_store(&store, &config, T0 + 25 * DAY).unwrap().is_empty());
    }

    #[test]
    fn test_reconcile_settles_seen_transactions_only() {
        let (mut ledger, id, txid) = pending_ledger(0x02);

        let settled = reconcile_pending(&mut ledger, T0, |_, _| Ok(AnchorState::Unknown));
        assert_eq!(settled, 0);
        assert!(ledger.pending(&id).is_some());

        let settled = reconcile_pending(&mut ledger, T0, |_, seen| {
            assert_eq!(*seen, txid);
            Ok(AnchorState::Mempool)
        });
        assert_eq!(settled, 1);
        assert!(ledger.pending(&id).is_none());
        assert!(ledger.get(&id).unwrap().anchor.is_on_chain);
    }

    #[test]
    fn test_reconcile_survives_lookup_errors() {
        let (mut ledger, id, _) = pending_ledger(0x03);
        let settled =
            reconcile_pending(&mut ledger, T0, |_, _| Err(anyhow::anyhow!("server went away")));
        assert_eq!(settled, 0);
        assert!(ledger.pending(&id).is_some());
    }

    #[test]
    fn test_reconcile_looks_up_owner_script() {
        let (mut ledger, _, _) = pending_ledger(0x04);
        let owner = Address::from_str(&address(1))
            .unwrap()
            .assume_checked()
            .script_pubkey();

        reconcile_pending(&mut ledger, T0, |script, _| {
            assert_eq!(script, owner.as_script());
            Ok(AnchorState::Confirmed(100))
        });
    }

    #[test]
    fn test_status_reports_most_urgent_first() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);

        let (mut ledger, id, txid) = pending_ledger(0x05);
        ledger
            .record_broadcast(&id, BroadcastOutcome::Accepted { txid }, T0)
            .unwrap();
        VaultStore::new(config.store_path())
            .save(&ledger.snapshot())
            .unwrap();

        let reports = status_reports(&config, T0 + 31 * DAY).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, VaultStatus::Triggered);
        assert!(reports[0].seconds_remaining <= 0);
    }

    #[test]
    fn test_builder_honours_spell_ceiling() {
        let mut config = ServerConfig::default();
        assert_eq!(builder_for(&config).codec().max_len(), 1_024);
        config.fees.max_spell_len = Some(4_096);
        assert_eq!(builder_for(&config).codec().max_len(), 4_096);
    }
}
