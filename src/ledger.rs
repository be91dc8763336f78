// src/ledger.rs
//! The ledger surface and the client every component shares.
//!
//! [`Ledger`] is the narrow RPC surface of the smart contract plus plain
//! account operations. [`LedgerClient`] is the only thing the rest of the
//! core talks to: it owns the process-local mutex around the round-advance
//! check-and-clear and applies the bounded retry/backoff policy to mutating
//! calls. [`InMemoryLedger`] mirrors the deployed contract's observable
//! behavior for the simulation binary and the tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ark_ff::Field;
use tracing::{debug, warn};

use crate::error::{Result, ZkFedError};
use crate::field::Felt;

pub type Address = String;
pub type Digest = Felt;

/// Groth16-shaped proof fields, decoded to field elements. When proofs are
/// disabled a fixed all-ones bundle is substituted so every call site keeps
/// the same shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ProofBundle {
    pub a: Vec<Felt>,
    pub b: Vec<Vec<Felt>>,
    pub c: Vec<Felt>,
    pub inputs: Vec<Felt>,
}

/// Public-input widths of the two verifier entry points.
pub const COMMIT_INPUTS: usize = 5;
pub const PUBLISH_INPUTS: usize = 10;

impl ProofBundle {
    /// The placeholder bundle: `a`/`c` two ones, `b` a 2x2 of ones, and
    /// `inputs` sized for the call site.
    pub fn placeholder(inputs: usize) -> Self {
        let one = Felt::ONE;
        ProofBundle {
            a: vec![one; 2],
            b: vec![vec![one; 2]; 2],
            c: vec![one; 2],
            inputs: vec![one; inputs],
        }
    }
}

/// Stake assignment fetched each round: who gets paid and which aggregator
/// handle is authoritative next.
#[derive(Debug, Clone, PartialEq)]
pub struct StakeWinners {
    pub aggregator: Address,
    pub clients: Vec<Address>,
    pub next_aggregator_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxReceipt {
    pub tx: u64,
    pub gas_used: u64,
}

/// The smart-contract account, as seen from off-chain. Every write blocks
/// until the transaction is confirmed and fails with
/// [`ZkFedError::LedgerRejected`] when it reverts.
pub trait Ledger: Send + Sync {
    fn round_number(&self) -> Result<u64>;
    /// Whether `from` still owes an update for the current round.
    fn round_update_outstanding(&self, from: &Address) -> Result<bool>;
    /// Close the current round. Reverts while updates are still outstanding
    /// and when another transition already landed.
    fn end_update_round(&self, from: &Address) -> Result<TxReceipt>;
    fn commitment_digests(&self, round: u64) -> Result<HashSet<Digest>>;
    fn submit_commitment(
        &self,
        from: &Address,
        digest: Digest,
        proof: &ProofBundle,
    ) -> Result<TxReceipt>;
    fn publish_aggregate(
        &self,
        from: &Address,
        digest: Digest,
        weights_link: &str,
        bias_link: &str,
        proof: &ProofBundle,
    ) -> Result<TxReceipt>;
    /// Record the bootstrap model links without crediting a publisher.
    fn init_model(&self, from: &Address, weights_link: &str, bias_link: &str)
        -> Result<TxReceipt>;
    /// Links recorded by the most recent publish (or bootstrap).
    fn global_model_links(&self) -> Result<(String, String)>;
    fn stake_winners(&self) -> Result<StakeWinners>;
    fn clear_stake_winners(&self, from: &Address) -> Result<TxReceipt>;
    fn transfer(&self, from: &Address, to: &Address, amount: u64, gas: u64)
        -> Result<TxReceipt>;
    fn balance(&self, account: &Address) -> Result<u64>;
}

/// Shared façade over a [`Ledger`]. Cheap to clone behind an `Arc`; one
/// instance is shared by every participant thread.
pub struct LedgerClient {
    ledger: Arc<dyn Ledger>,
    retry_limit: u32,
    retry_backoff: Duration,
    // Only one local thread may run the check-and-clear at a time. The
    // ledger also rejects duplicate transitions, so this narrows the race
    // rather than eliminating it.
    advance_lock: Mutex<()>,
}

impl LedgerClient {
    pub fn new(ledger: Arc<dyn Ledger>, retry_limit: u32, retry_backoff: Duration) -> Self {
        LedgerClient { ledger, retry_limit, retry_backoff, advance_lock: Mutex::new(()) }
    }

    pub fn round_number(&self) -> Result<u64> {
        self.ledger.round_number()
    }

    pub fn commitment_digests(&self, round: u64) -> Result<HashSet<Digest>> {
        self.ledger.commitment_digests(round)
    }

    pub fn global_model_links(&self) -> Result<(String, String)> {
        self.ledger.global_model_links()
    }

    pub fn stake_winners(&self) -> Result<StakeWinners> {
        self.ledger.stake_winners()
    }

    pub fn balance(&self, account: &Address) -> Result<u64> {
        self.ledger.balance(account)
    }

    /// Check whether `from` owes an update, closing the previous round first
    /// when it is complete. A rejected duplicate transition is swallowed and
    /// treated as "no transition occurred".
    pub fn advance_round_if_outstanding(&self, from: &Address) -> Result<bool> {
        let _guard = self
            .advance_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let outstanding = self.ledger.round_update_outstanding(from)?;
        if !outstanding {
            match self.ledger.end_update_round(from) {
                Ok(receipt) => {
                    debug!(from = %from, tx = receipt.tx, "round transition confirmed");
                }
                Err(ZkFedError::LedgerRejected(reason)) => {
                    debug!(from = %from, %reason, "round transition reverted");
                }
                Err(e) => return Err(e),
            }
        }
        self.ledger.round_update_outstanding(from)
    }

    pub fn submit_commitment(
        &self,
        from: &Address,
        digest: Digest,
        proof: &ProofBundle,
    ) -> Result<TxReceipt> {
        self.with_retry("submit_commitment", || {
            self.ledger.submit_commitment(from, digest, proof)
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn publish_aggregate(
        &self,
        from: &Address,
        digest: Digest,
        weights_link: &str,
        bias_link: &str,
        proof: &ProofBundle,
    ) -> Result<TxReceipt> {
        self.with_retry("publish_aggregate", || {
            self.ledger
                .publish_aggregate(from, digest, weights_link, bias_link, proof)
        })
    }

    pub fn init_model(
        &self,
        from: &Address,
        weights_link: &str,
        bias_link: &str,
    ) -> Result<TxReceipt> {
        self.with_retry("init_model", || {
            self.ledger.init_model(from, weights_link, bias_link)
        })
    }

    pub fn clear_stake_winners(&self, from: &Address) -> Result<TxReceipt> {
        self.with_retry("clear_stake_winners", || self.ledger.clear_stake_winners(from))
    }

    pub fn transfer(
        &self,
        from: &Address,
        to: &Address,
        amount: u64,
        gas: u64,
    ) -> Result<TxReceipt> {
        self.with_retry("transfer", || self.ledger.transfer(from, to, amount, gas))
    }

    fn with_retry<T>(&self, what: &str, mut call: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            match call() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt + 1 < self.retry_limit => {
                    attempt += 1;
                    warn!(what, attempt, error = %e, "ledger call reverted, retrying");
                    thread::sleep(self.retry_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// in-memory contract double

#[derive(Debug, Clone, Default)]
struct StakeRecord {
    aggregator: Address,
    clients: Vec<Address>,
    next_aggregator_index: usize,
}

struct LedgerState {
    round: u64,
    participants: Vec<Address>,
    aggregator_count: usize,
    submitted: HashSet<Address>,
    digests: HashMap<u64, HashSet<Digest>>,
    balances: HashMap<Address, u64>,
    weights_link: String,
    bias_link: String,
    publisher: Option<Address>,
    stake: StakeRecord,
    tx_counter: u64,
}

/// Contract double with the deployed contract's observable semantics: one
/// successful transition per round, round-scoped commitment digests, and a
/// stake-winner record rewritten at every transition.
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    pub fn new(
        participants: Vec<Address>,
        extra_accounts: Vec<Address>,
        aggregator_count: usize,
        initial_balance: u64,
    ) -> Self {
        let mut balances = HashMap::new();
        for account in participants.iter().chain(extra_accounts.iter()) {
            balances.insert(account.clone(), initial_balance);
        }
        InMemoryLedger {
            state: Mutex::new(LedgerState {
                round: 1,
                participants,
                aggregator_count,
                submitted: HashSet::new(),
                digests: HashMap::new(),
                balances,
                weights_link: String::new(),
                bias_link: String::new(),
                publisher: None,
                stake: StakeRecord::default(),
                tx_counter: 0,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl LedgerState {
    fn receipt(&mut self, gas_used: u64) -> TxReceipt {
        self.tx_counter += 1;
        TxReceipt { tx: self.tx_counter, gas_used }
    }
}

impl Ledger for InMemoryLedger {
    fn round_number(&self) -> Result<u64> {
        Ok(self.lock().round)
    }

    fn round_update_outstanding(&self, from: &Address) -> Result<bool> {
        let state = self.lock();
        Ok(state.participants.contains(from) && !state.submitted.contains(from))
    }

    fn end_update_round(&self, _from: &Address) -> Result<TxReceipt> {
        let mut state = self.lock();
        if state.submitted.len() < state.participants.len() {
            return Err(ZkFedError::LedgerRejected(format!(
                "round {} still accepting updates ({}/{})",
                state.round,
                state.submitted.len(),
                state.participants.len()
            )));
        }
        let mut clients: Vec<Address> = state.submitted.drain().collect();
        clients.sort();
        state.round += 1;
        let closed = state.round - 1;
        state.stake = StakeRecord {
            aggregator: state.publisher.take().unwrap_or_default(),
            clients,
            next_aggregator_index: (closed % state.aggregator_count as u64) as usize,
        };
        // digests are round-scoped; drop everything before the closed round
        let current = state.round;
        state.digests.retain(|&r, _| r + 1 >= current);
        Ok(state.receipt(30_000))
    }

    fn commitment_digests(&self, round: u64) -> Result<HashSet<Digest>> {
        Ok(self.lock().digests.get(&round).cloned().unwrap_or_default())
    }

    fn submit_commitment(
        &self,
        from: &Address,
        digest: Digest,
        _proof: &ProofBundle,
    ) -> Result<TxReceipt> {
        let mut state = self.lock();
        if !state.participants.contains(from) {
            return Err(ZkFedError::LedgerRejected(format!(
                "account {} is not a registered participant",
                from
            )));
        }
        if state.submitted.contains(from) {
            return Err(ZkFedError::LedgerRejected(format!(
                "account {} already committed for round {}",
                from, state.round
            )));
        }
        let round = state.round;
        state.digests.entry(round).or_default().insert(digest);
        state.submitted.insert(from.clone());
        Ok(state.receipt(60_000))
    }

    fn publish_aggregate(
        &self,
        from: &Address,
        _digest: Digest,
        weights_link: &str,
        bias_link: &str,
        _proof: &ProofBundle,
    ) -> Result<TxReceipt> {
        let mut state = self.lock();
        state.weights_link = weights_link.to_string();
        state.bias_link = bias_link.to_string();
        state.publisher = Some(from.clone());
        Ok(state.receipt(90_000))
    }

    fn init_model(
        &self,
        _from: &Address,
        weights_link: &str,
        bias_link: &str,
    ) -> Result<TxReceipt> {
        let mut state = self.lock();
        state.weights_link = weights_link.to_string();
        state.bias_link = bias_link.to_string();
        Ok(state.receipt(45_000))
    }

    fn global_model_links(&self) -> Result<(String, String)> {
        let state = self.lock();
        Ok((state.weights_link.clone(), state.bias_link.clone()))
    }

    fn stake_winners(&self) -> Result<StakeWinners> {
        let state = self.lock();
        Ok(StakeWinners {
            aggregator: state.stake.aggregator.clone(),
            clients: state.stake.clients.clone(),
            next_aggregator_index: state.stake.next_aggregator_index,
        })
    }

    fn clear_stake_winners(&self, _from: &Address) -> Result<TxReceipt> {
        let mut state = self.lock();
        state.stake.aggregator.clear();
        state.stake.clients.clear();
        Ok(state.receipt(25_000))
    }

    fn transfer(
        &self,
        from: &Address,
        to: &Address,
        amount: u64,
        gas: u64,
    ) -> Result<TxReceipt> {
        let mut state = self.lock();
        let from_balance = *state.balances.get(from).unwrap_or(&0);
        if from_balance < amount {
            return Err(ZkFedError::LedgerRejected(format!(
                "insufficient funds: {} has {}, needs {}",
                from, from_balance, amount
            )));
        }
        *state.balances.entry(from.clone()).or_insert(0) -= amount;
        *state.balances.entry(to.clone()).or_insert(0) += amount;
        Ok(state.receipt(gas))
    }

    fn balance(&self, account: &Address) -> Result<u64> {
        Ok(*self.lock().balances.get(account).unwrap_or(&0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::u64_to_felt;

    fn participants(n: usize) -> Vec<Address> {
        (0..n).map(|i| format!("0xparticipant{}", i)).collect()
    }

    fn client(ledger: Arc<InMemoryLedger>) -> LedgerClient {
        LedgerClient::new(ledger, 3, Duration::from_millis(1))
    }

    #[test]
    fn transition_requires_every_participant() {
        let accounts = participants(2);
        let ledger = Arc::new(InMemoryLedger::new(accounts.clone(), vec![], 2, 1_000_000));
        let client = client(ledger.clone());

        // round 1 open, both owe an update
        assert!(client.advance_round_if_outstanding(&accounts[0]).unwrap());

        let bundle = ProofBundle::placeholder(COMMIT_INPUTS);
        client.submit_commitment(&accounts[0], u64_to_felt(11), &bundle).unwrap();
        // one commitment in: still no transition, and the submitter owes nothing
        assert!(!client.advance_round_if_outstanding(&accounts[0]).unwrap());
        assert_eq!(ledger.round_number().unwrap(), 1);

        client.submit_commitment(&accounts[1], u64_to_felt(22), &bundle).unwrap();
        // now the check-and-clear closes round 1
        assert!(client.advance_round_if_outstanding(&accounts[0]).unwrap());
        assert_eq!(ledger.round_number().unwrap(), 2);
    }

    #[test]
    fn duplicate_transition_is_swallowed() {
        let accounts = participants(1);
        let ledger = Arc::new(InMemoryLedger::new(accounts.clone(), vec![], 1, 1_000_000));
        let client = client(ledger.clone());
        let bundle = ProofBundle::placeholder(COMMIT_INPUTS);
        client.submit_commitment(&accounts[0], u64_to_felt(1), &bundle).unwrap();
        assert!(client.advance_round_if_outstanding(&accounts[0]).unwrap());
        // the round already advanced; a second check performs no transition
        // and reports the (new) outstanding update without erroring
        assert!(client.advance_round_if_outstanding(&accounts[0]).unwrap());
        assert_eq!(ledger.round_number().unwrap(), 2);
    }

    #[test]
    fn digests_are_round_scoped() {
        let accounts = participants(1);
        let ledger = Arc::new(InMemoryLedger::new(accounts.clone(), vec![], 1, 1_000_000));
        let bundle = ProofBundle::placeholder(COMMIT_INPUTS);
        let digest = u64_to_felt(99);
        ledger.submit_commitment(&accounts[0], digest, &bundle).unwrap();
        assert!(ledger.commitment_digests(1).unwrap().contains(&digest));
        assert!(ledger.commitment_digests(2).unwrap().is_empty());
    }

    #[test]
    fn transition_records_stake_winners() {
        let accounts = participants(2);
        let agg = "0xagg0".to_string();
        let ledger = Arc::new(InMemoryLedger::new(
            accounts.clone(),
            vec![agg.clone()],
            2,
            1_000_000,
        ));
        let bundle = ProofBundle::placeholder(COMMIT_INPUTS);
        for (i, account) in accounts.iter().enumerate() {
            ledger.submit_commitment(account, u64_to_felt(i as u64), &bundle).unwrap();
        }
        ledger
            .publish_aggregate(&agg, u64_to_felt(7), "w1", "b1", &bundle)
            .unwrap();
        ledger.end_update_round(&accounts[0]).unwrap();

        let winners = ledger.stake_winners().unwrap();
        assert_eq!(winners.aggregator, agg);
        assert_eq!(winners.clients.len(), 2);
        assert_eq!(winners.next_aggregator_index, 1);

        ledger.clear_stake_winners(&accounts[0]).unwrap();
        let cleared = ledger.stake_winners().unwrap();
        assert!(cleared.aggregator.is_empty());
        assert!(cleared.clients.is_empty());
        // rotation index survives the clear
        assert_eq!(cleared.next_aggregator_index, 1);
    }

    #[test]
    fn transfer_moves_value_and_rejects_overdraw() {
        let accounts = participants(2);
        let ledger = Arc::new(InMemoryLedger::new(accounts.clone(), vec![], 1, 500));
        ledger.transfer(&accounts[0], &accounts[1], 200, 21_000).unwrap();
        assert_eq!(ledger.balance(&accounts[0]).unwrap(), 300);
        assert_eq!(ledger.balance(&accounts[1]).unwrap(), 700);
        let err = ledger.transfer(&accounts[0], &accounts[1], 400, 21_000).unwrap_err();
        assert!(matches!(err, ZkFedError::LedgerRejected(_)));
    }

    #[test]
    fn placeholder_bundle_has_the_fixed_shape() {
        let bundle = ProofBundle::placeholder(PUBLISH_INPUTS);
        assert_eq!(bundle.a.len(), 2);
        assert_eq!(bundle.b.len(), 2);
        assert_eq!(bundle.b[0].len(), 2);
        assert_eq!(bundle.c.len(), 2);
        assert_eq!(bundle.inputs.len(), 10);
        assert!(bundle.inputs.iter().all(|x| *x == Felt::ONE));
    }
}
