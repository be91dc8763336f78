// src/engine.rs
//! The off-chain aggregation engine.
//!
//! One engine owns the authoritative global model for the rounds in which it
//! is selected. Participants reveal their raw local models directly to the
//! engine; a reveal is admitted only when its recomputed commitment digest is
//! already on the ledger for the current round (commit-before-reveal). When
//! the round closes, the engine selects the admitted reveals, folds them into
//! the global model with the incremental moving-average identity, proves the
//! step, persists the tensors to the content-addressed store and publishes
//! digest plus links to the ledger.
//!
//! The moving average is kept in its telescoping form -- accumulate
//! `(local - global) / k` per selected reveal, then add the sum onto the
//! prior global -- because the external circuit computes it the same way and
//! the digest must match the same computation path under fixed-point
//! truncation, not just the same mathematical result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, error, info, warn};

use crate::config::{Config, SelectionPolicy};
use crate::error::{Result, ZkFedError};
use crate::field::{encode_matrix, encode_vector, Bias, Weights};
use crate::hash::digest_model;
use crate::ledger::{Address, Digest, LedgerClient, ProofBundle, PUBLISH_INPUTS};
use crate::prover::{AggregationWitness, Prover};
use crate::store::Store;

/// Raw model update disclosed off-ledger after its digest was committed.
#[derive(Debug, Clone)]
pub struct Reveal {
    pub participant: Address,
    pub weights: Weights,
    pub bias: Bias,
    /// Reported validation score (MSE); consumed by the weighted selection
    /// policy, ignored by select-all.
    pub score: f64,
}

#[derive(Debug, Clone)]
struct AdmittedUpdate {
    digest: Digest,
    weights: Weights,
    bias: Bias,
    score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    RoundOpen,
    Aggregating,
    Published,
}

struct EngineInner {
    state: EngineState,
    round: u64,
    round_ongoing: bool,
    global_w: Weights,
    global_b: Bias,
    admitted: HashMap<Address, AdmittedUpdate>,
    selection_history: HashMap<Address, u64>,
    // result of the last successful round, promoted at the next start
    new_global_w: Weights,
    new_global_b: Bias,
}

pub struct AggregationEngine {
    name: String,
    account: Address,
    participant_count: usize,
    perform_proof: bool,
    selection: SelectionPolicy,
    ledger: Arc<LedgerClient>,
    store: Arc<dyn Store>,
    prover: Arc<dyn Prover>,
    inner: Mutex<EngineInner>,
}

impl AggregationEngine {
    pub fn new(
        name: impl Into<String>,
        account: Address,
        config: &Config,
        initial_w: Weights,
        initial_b: Bias,
        ledger: Arc<LedgerClient>,
        store: Arc<dyn Store>,
        prover: Arc<dyn Prover>,
    ) -> Self {
        AggregationEngine {
            name: name.into(),
            account,
            participant_count: config.participant_count,
            perform_proof: config.perform_proof,
            selection: config.selection.clone(),
            ledger,
            store,
            prover,
            inner: Mutex::new(EngineInner {
                state: EngineState::Idle,
                round: 0,
                round_ongoing: false,
                global_w: initial_w.clone(),
                global_b: initial_b.clone(),
                admitted: HashMap::new(),
                selection_history: HashMap::new(),
                new_global_w: initial_w,
                new_global_b: initial_b,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn account(&self) -> &Address {
        &self.account
    }

    pub fn state(&self) -> EngineState {
        self.lock().state
    }

    pub fn round(&self) -> u64 {
        self.lock().round
    }

    pub fn admitted_count(&self) -> usize {
        self.lock().admitted.len()
    }

    /// The model this engine considers authoritative for the open round.
    pub fn global_model(&self) -> (Weights, Bias) {
        let inner = self.lock();
        (inner.global_w.clone(), inner.global_b.clone())
    }

    fn lock(&self) -> MutexGuard<'_, EngineInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a new round: promote the previous round's published result,
    /// clear the admitted set and re-read the round number. Idempotent --
    /// a second call while the round is ongoing changes nothing, which lets
    /// every participant "join" the start without coordination beyond the
    /// barrier.
    pub fn start_round(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.round_ongoing {
            debug!(engine = %self.name, round = inner.round, "round already ongoing");
            return Ok(());
        }
        // adopt the previous round's published result; the ledger links are
        // authoritative because another engine may have published it. All
        // fallible work happens before any state changes: a failure must
        // leave the engine idle so a later start runs the full open path.
        let (weights_link, bias_link) = self.ledger.global_model_links()?;
        let (global_w, global_b) = if !weights_link.is_empty() && !bias_link.is_empty() {
            (self.store.get_weights(&weights_link)?, self.store.get_bias(&bias_link)?)
        } else {
            (inner.new_global_w.clone(), inner.new_global_b.clone())
        };
        let round = self.ledger.round_number()?;
        inner.global_w = global_w;
        inner.global_b = global_b;
        inner.admitted.clear();
        inner.round = round;
        inner.round_ongoing = true;
        inner.state = EngineState::RoundOpen;
        info!(engine = %self.name, round = inner.round, "aggregator round open");
        Ok(())
    }

    /// Admit a reveal iff its recomputed digest is already committed on the
    /// ledger for the current round. A miss is permanent: the reveal is
    /// dropped, not retried. The last admitted reveal per participant wins.
    pub fn admit(&self, reveal: Reveal) -> Result<bool> {
        let mut inner = self.lock();
        let digest = digest_model(&reveal.weights, &reveal.bias);
        let on_ledger = self.ledger.commitment_digests(inner.round)?;
        if !on_ledger.contains(&digest) {
            // permanent for this reveal; logged, never surfaced or retried
            let rejection = ZkFedError::AdmissionRejected {
                digest: digest.to_string(),
                round: inner.round,
            };
            info!(
                engine = %self.name,
                participant = %reveal.participant,
                error = %rejection,
                "reveal rejected"
            );
            return Ok(false);
        }
        debug!(
            engine = %self.name,
            participant = %reveal.participant,
            round = inner.round,
            "reveal admitted"
        );
        inner.admitted.insert(
            reveal.participant,
            AdmittedUpdate {
                digest,
                weights: reveal.weights,
                bias: reveal.bias,
                score: reveal.score,
            },
        );
        Ok(true)
    }

    /// Close the round: select, aggregate, prove, persist, publish. Returns
    /// whether an aggregate was published. Every failure mode short of an
    /// infrastructure error abandons the round without touching the
    /// authoritative global model; the previous round's weights stay in
    /// force until a future round succeeds.
    pub fn finish_round(&self) -> Result<bool> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        inner.state = EngineState::Aggregating;
        let round = inner.round;

        let selected_ids = select_participants(
            &self.selection,
            &inner.admitted,
            &mut inner.selection_history,
        );
        if selected_ids.len() != self.participant_count {
            // abandoned with a log line only; the next round proceeds
            let shortfall = ZkFedError::InsufficientParticipants {
                selected: selected_ids.len(),
                required: self.participant_count,
            };
            warn!(engine = %self.name, round, error = %shortfall, "abandoning round");
            self.abandon(inner);
            return Ok(false);
        }

        let selected: Vec<AdmittedUpdate> = selected_ids
            .iter()
            .map(|id| inner.admitted[id].clone())
            .collect();
        let local_w: Vec<&Weights> = selected.iter().map(|u| &u.weights).collect();
        let local_b: Vec<&Bias> = selected.iter().map(|u| &u.bias).collect();
        let new_w = moving_average_weights(&local_w, &inner.global_w);
        let new_b = moving_average_bias(&local_b, &inner.global_b);
        let digest = digest_model(&new_w, &new_b);

        let proof = if self.perform_proof {
            let witness = build_witness(inner, &selected, &new_w, &new_b, digest);
            match self.prover.prove(&witness) {
                Ok(bundle) => bundle,
                Err(e) => {
                    error!(engine = %self.name, round, error = %e, "abandoning round: prover failed");
                    self.abandon(inner);
                    return Ok(false);
                }
            }
        } else {
            ProofBundle::placeholder(PUBLISH_INPUTS)
        };

        let weights_link = self.store.save_weights(&new_w)?;
        let bias_link = self.store.save_bias(&new_b)?;
        match self.ledger.publish_aggregate(
            &self.account,
            digest,
            &weights_link,
            &bias_link,
            &proof,
        ) {
            Ok(receipt) => {
                info!(
                    engine = %self.name,
                    round,
                    tx = receipt.tx,
                    %weights_link,
                    %bias_link,
                    "aggregate published"
                );
            }
            Err(e) if e.is_retryable() => {
                // retries are exhausted inside the client; terminal for this
                // round only
                error!(engine = %self.name, round, error = %e, "abandoning round: publish rejected");
                self.abandon(inner);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        inner.new_global_w = new_w;
        inner.new_global_b = new_b;
        inner.state = EngineState::Published;
        inner.round_ongoing = false;
        Ok(true)
    }

    fn abandon(&self, inner: &mut EngineInner) {
        inner.state = EngineState::Idle;
        inner.round_ongoing = false;
    }
}

fn build_witness(
    inner: &EngineInner,
    selected: &[AdmittedUpdate],
    new_w: &Weights,
    new_b: &Bias,
    digest: Digest,
) -> AggregationWitness {
    let mut local_w = Vec::with_capacity(selected.len());
    let mut local_w_sign = Vec::with_capacity(selected.len());
    let mut local_b = Vec::with_capacity(selected.len());
    let mut local_b_sign = Vec::with_capacity(selected.len());
    let mut ledger_digests = Vec::with_capacity(selected.len());
    for update in selected {
        let (w, w_sign) = encode_matrix(&update.weights);
        let (b, b_sign) = encode_vector(&update.bias);
        local_w.push(w);
        local_w_sign.push(w_sign);
        local_b.push(b);
        local_b_sign.push(b_sign);
        ledger_digests.push(update.digest);
    }
    let (global_w, global_w_sign) = encode_matrix(&inner.global_w);
    let (global_b, global_b_sign) = encode_vector(&inner.global_b);
    let (new_global_w, new_global_w_sign) = encode_matrix(new_w);
    let (new_global_b, new_global_b_sign) = encode_vector(new_b);
    AggregationWitness {
        local_w,
        local_w_sign,
        local_b,
        local_b_sign,
        global_w,
        global_w_sign,
        global_b,
        global_b_sign,
        ledger_digests,
        new_global_w,
        new_global_w_sign,
        new_global_b,
        new_global_b_sign,
        digest,
    }
}

/// Apply the selection policy over the admitted set, returning participant
/// ids in a deterministic order.
fn select_participants(
    policy: &SelectionPolicy,
    admitted: &HashMap<Address, AdmittedUpdate>,
    history: &mut HashMap<Address, u64>,
) -> Vec<Address> {
    match policy {
        SelectionPolicy::SelectAll => {
            let mut ids: Vec<Address> = admitted.keys().cloned().collect();
            ids.sort();
            ids
        }
        SelectionPolicy::InverseMseTopK { epsilon, select_count } => {
            let mut scored: Vec<(Address, f64)> = admitted
                .iter()
                .map(|(id, update)| {
                    let inverse = 1.0 / (update.score + epsilon);
                    let damping = (history.get(id).copied().unwrap_or(0) + 1) as f64;
                    (id.clone(), inverse / damping)
                })
                .collect();
            scored.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.0.cmp(&b.0))
            });
            let ids: Vec<Address> = scored
                .into_iter()
                .take(*select_count)
                .map(|(id, _)| id)
                .collect();
            for id in &ids {
                *history.entry(id.clone()).or_insert(0) += 1;
            }
            ids
        }
    }
}

/// Incremental moving average over weight matrices: for every coordinate,
/// accumulate `(local - global) / k` per selected reveal, then add the
/// accumulated delta onto the prior global value. Integer division truncates
/// at every incremental step, matching the circuit.
pub fn moving_average_weights(locals: &[&Weights], global: &Weights) -> Weights {
    let k = locals.len() as i128;
    let mut delta: Weights = global.iter().map(|row| vec![0; row.len()]).collect();
    for local in locals {
        for (i, row) in global.iter().enumerate() {
            for (j, &g) in row.iter().enumerate() {
                delta[i][j] += (local[i][j] - g) / k;
            }
        }
    }
    delta
        .iter()
        .zip(global)
        .map(|(drow, grow)| drow.iter().zip(grow).map(|(&d, &g)| g + d).collect())
        .collect()
}

/// Same telescoping form over bias vectors.
pub fn moving_average_bias(locals: &[&Bias], global: &Bias) -> Bias {
    let k = locals.len() as i128;
    let mut delta: Bias = vec![0; global.len()];
    for local in locals {
        for (i, &g) in global.iter().enumerate() {
            delta[i] += (local[i] - g) / k;
        }
    }
    delta.iter().zip(global).map(|(&d, &g)| g + d).collect()
}
