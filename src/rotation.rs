// src/rotation.rs
//! Stake-weighted rotation across the pool of aggregation engines.
//!
//! The ledger records, at every round transition, which aggregator published
//! and which participants submitted, plus the index of the engine that is
//! authoritative for the next round. The rotation reads that record, pays out
//! the stakes, and switches the active engine. All participant traffic goes
//! through the rotation so nobody holds a stale engine reference across a
//! switch.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::config::Config;
use crate::engine::{AggregationEngine, Reveal};
use crate::error::{Result, ZkFedError};
use crate::ledger::{Address, LedgerClient};

struct RotationState {
    active: usize,
    // the very first selection happens before any round closed; there is no
    // winner record yet and nothing to pay
    bootstrapped: bool,
}

pub struct AggregatorRotation {
    engines: Vec<Arc<AggregationEngine>>,
    ledger: Arc<LedgerClient>,
    treasury: Address,
    payouts_enabled: bool,
    stake_amount: u64,
    stake_gas: u64,
    state: Mutex<RotationState>,
}

impl AggregatorRotation {
    pub fn new(
        engines: Vec<Arc<AggregationEngine>>,
        ledger: Arc<LedgerClient>,
        treasury: Address,
        config: &Config,
    ) -> Self {
        assert!(!engines.is_empty(), "rotation needs at least one engine");
        AggregatorRotation {
            engines,
            ledger,
            treasury,
            payouts_enabled: config.payouts_enabled,
            stake_amount: config.stake_amount,
            stake_gas: config.stake_gas,
            state: Mutex::new(RotationState { active: 0, bootstrapped: false }),
        }
    }

    pub fn active(&self) -> Arc<AggregationEngine> {
        let state = self.lock();
        self.engines[state.active].clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RotationState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read the stake-winner record, pay the winners, and hand authority to
    /// the engine the ledger designates. A record that does not match the
    /// local engine pool means this process disagrees with the ledger about
    /// the deployment and cannot continue.
    pub fn select(&self) -> Result<()> {
        let winners = self.ledger.stake_winners()?;
        let mut state = self.lock();
        if winners.next_aggregator_index >= self.engines.len() {
            return Err(ZkFedError::Desync(format!(
                "ledger designates aggregator index {} but only {} engines exist",
                winners.next_aggregator_index,
                self.engines.len()
            )));
        }
        if state.bootstrapped && self.payouts_enabled {
            if winners.aggregator.is_empty() {
                return Err(ZkFedError::Desync(
                    "round closed without a recorded winning aggregator".to_string(),
                ));
            }
            self.ledger.clear_stake_winners(&self.treasury)?;
            self.ledger
                .transfer(&self.treasury, &winners.aggregator, self.stake_amount, self.stake_gas)?;
            for client in &winners.clients {
                self.ledger
                    .transfer(&self.treasury, client, self.stake_amount, self.stake_gas)?;
            }
            debug!(
                aggregator = %winners.aggregator,
                clients = winners.clients.len(),
                stake = self.stake_amount,
                "stakes paid out"
            );
        }
        state.active = winners.next_aggregator_index;
        state.bootstrapped = true;
        info!(
            engine = %self.engines[state.active].name(),
            index = state.active,
            "aggregator selected"
        );
        Ok(())
    }

    pub fn start_round(&self) -> Result<()> {
        self.active().start_round()
    }

    pub fn admit(&self, reveal: Reveal) -> Result<bool> {
        self.active().admit(reveal)
    }

    /// Close the round on the active engine, then immediately re-select so
    /// the handle for the following round is resolved before new commitments
    /// arrive. A published round is first advanced on the ledger so the
    /// winner record the selection reads covers the round that just ended.
    /// An abandoned round is the one case where the otherwise-unconditional
    /// re-select is skipped: nothing was published, so there is no fresh
    /// winner record, and a selection here would read the previous round's
    /// (already cleared) record and flag a desync. The current engine stays
    /// active instead.
    pub fn finish_round(&self) -> Result<()> {
        if self.active().finish_round()? {
            self.ledger.advance_round_if_outstanding(&self.treasury)?;
            self.select()
        } else {
            debug!("round abandoned; keeping the active aggregator");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::hash::digest_model;
    use crate::ledger::{InMemoryLedger, ProofBundle, COMMIT_INPUTS};
    use crate::prover::NullProver;
    use crate::store::MemoryStore;

    fn build(
        engine_count: usize,
        aggregator_count: usize,
    ) -> (AggregatorRotation, Arc<LedgerClient>, Vec<Address>) {
        let participants = vec!["0xp0".to_string()];
        let mut extra = vec!["0xtreasury".to_string()];
        let agg_accounts: Vec<Address> =
            (0..engine_count).map(|i| format!("0xagg{}", i)).collect();
        extra.extend(agg_accounts.clone());
        let ledger = Arc::new(InMemoryLedger::new(
            participants.clone(),
            extra,
            aggregator_count,
            1_000_000,
        ));
        let client = Arc::new(LedgerClient::new(ledger, 2, Duration::from_millis(1)));
        let store = Arc::new(MemoryStore::new());
        let config = Config { participant_count: 1, ..Config::default() };
        let engines = agg_accounts
            .iter()
            .enumerate()
            .map(|(i, account)| {
                Arc::new(AggregationEngine::new(
                    format!("Agg{}", i),
                    account.clone(),
                    &config,
                    vec![vec![0, 0]],
                    vec![0],
                    client.clone(),
                    store.clone(),
                    Arc::new(NullProver),
                ))
            })
            .collect();
        let rotation = AggregatorRotation::new(
            engines,
            client.clone(),
            "0xtreasury".to_string(),
            &config,
        );
        let mut accounts = participants;
        accounts.extend(agg_accounts);
        (rotation, client, accounts)
    }

    fn run_one_round(rotation: &AggregatorRotation, client: &LedgerClient) {
        rotation.start_round().unwrap();
        let weights = vec![vec![4, 4]];
        let bias = vec![2];
        let digest = digest_model(&weights, &bias);
        client
            .submit_commitment(
                &"0xp0".to_string(),
                digest,
                &ProofBundle::placeholder(COMMIT_INPUTS),
            )
            .unwrap();
        assert!(rotation
            .admit(Reveal {
                participant: "0xp0".to_string(),
                weights,
                bias,
                score: 0.1,
            })
            .unwrap());
        assert!(rotation.active().finish_round().unwrap());
        // all updates are in, so the check-and-clear closes the round
        client.advance_round_if_outstanding(&"0xp0".to_string()).unwrap();
    }

    #[test]
    fn bootstrap_selection_pays_nothing() {
        let (rotation, client, accounts) = build(2, 2);
        rotation.select().unwrap();
        assert_eq!(rotation.active().name(), "Agg0");
        assert_eq!(client.balance(&accounts[1]).unwrap(), 1_000_000);
        assert_eq!(client.balance(&"0xtreasury".to_string()).unwrap(), 1_000_000);
    }

    #[test]
    fn rotation_alternates_engines_and_pays_the_winners() {
        let (rotation, client, accounts) = build(2, 2);
        rotation.select().unwrap();
        assert_eq!(rotation.active().name(), "Agg0");

        run_one_round(&rotation, &client);
        rotation.select().unwrap();
        // round 1 closed: 1 % 2 == 1 designates the second engine
        assert_eq!(rotation.active().name(), "Agg1");

        // Agg0 published round 1, the participant submitted: both get paid
        assert_eq!(client.balance(&accounts[1]).unwrap(), 1_001_000);
        assert_eq!(client.balance(&accounts[0]).unwrap(), 1_001_000);
        assert_eq!(client.balance(&"0xtreasury".to_string()).unwrap(), 998_000);

        run_one_round(&rotation, &client);
        rotation.select().unwrap();
        assert_eq!(rotation.active().name(), "Agg0");
    }

    #[test]
    fn finish_round_reselects_immediately() {
        let (rotation, client, _) = build(2, 2);
        rotation.select().unwrap();
        rotation.start_round().unwrap();
        let weights = vec![vec![4, 4]];
        let bias = vec![2];
        client
            .submit_commitment(
                &"0xp0".to_string(),
                digest_model(&weights, &bias),
                &ProofBundle::placeholder(COMMIT_INPUTS),
            )
            .unwrap();
        assert!(rotation
            .admit(Reveal {
                participant: "0xp0".to_string(),
                weights,
                bias,
                score: 0.1,
            })
            .unwrap());
        rotation.finish_round().unwrap();
        assert_eq!(rotation.active().name(), "Agg1");
    }

    #[test]
    fn abandoned_round_keeps_the_active_engine_and_pays_nothing() {
        let (rotation, client, accounts) = build(2, 2);
        rotation.select().unwrap();
        rotation.start_round().unwrap();
        // nobody reveals: the round is abandoned at finish
        rotation.finish_round().unwrap();
        assert_eq!(rotation.active().name(), "Agg0");
        assert_eq!(client.balance(&accounts[1]).unwrap(), 1_000_000);
    }

    #[test]
    fn index_beyond_the_engine_pool_is_a_desync() {
        // the ledger rotates over 3 aggregators but only 1 engine exists
        let (rotation, client, _) = build(1, 3);
        rotation.select().unwrap();
        run_one_round(&rotation, &client);
        // round 1 closed: 1 % 3 == 1, out of range for a single engine
        let err = rotation.select().unwrap_err();
        assert!(matches!(err, ZkFedError::Desync(_)));
    }
}
