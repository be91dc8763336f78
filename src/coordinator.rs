// src/coordinator.rs
//! Per-participant round loop and the shared round actor.
//!
//! Every participant thread runs the same cycle: synchronize with the ledger
//! (closing the previous round if it is complete), train on the fetched
//! global model, commit the digest on-ledger, reveal the raw update to the
//! active aggregator, and barrier-synchronize with the sibling participants
//! around the privileged start/finish calls. The ledger round state and the
//! model-link resolution live behind a single [`RoundActor`] thread; the
//! participants talk to it over a channel instead of sharing the mutable
//! round view directly.
//!
//! Leader election is by barrier index: exactly one thread's barrier wait
//! reports it as leader, and only that thread closes the round. The round
//! start, by contrast, is performed by everyone -- it is idempotent on the
//! engine, and having all threads call it removes the gap between "leader
//! started the round" and "first reveal arrives".

use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::Reveal;
use crate::error::{Result, ZkFedError};
use crate::field::{Bias, Weights};
use crate::hash::digest_model;
use crate::ledger::{Address, LedgerClient, ProofBundle, COMMIT_INPUTS};
use crate::rotation::AggregatorRotation;
use crate::store::Store;
use crate::trainer::Trainer;

/// What a participant learns from one synchronization with the ledger.
#[derive(Debug, Clone)]
pub struct SyncView {
    /// Whether this participant still owes an update for the current round.
    pub outstanding: bool,
    pub round: u64,
    /// The published global model, when links have been recorded.
    pub model: Option<(Weights, Bias)>,
}

enum Request {
    Sync { participant: Address, reply: mpsc::Sender<Result<SyncView>> },
}

/// Cheap clonable handle to the round actor; one per participant thread.
#[derive(Clone)]
pub struct RoundActorHandle {
    tx: mpsc::Sender<Request>,
}

impl RoundActorHandle {
    pub fn sync(&self, participant: &Address) -> Result<SyncView> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(Request::Sync { participant: participant.clone(), reply: reply_tx })
            .map_err(|_| ZkFedError::Desync("round actor is gone".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| ZkFedError::Desync("round actor dropped the reply".to_string()))?
    }
}

/// Owns the round/model view of the ledger. Requests are served one at a
/// time, so the advance check-and-clear and the link resolution never
/// interleave between participants. The actor exits when the last handle is
/// dropped.
pub struct RoundActor;

impl RoundActor {
    pub fn spawn(
        ledger: Arc<LedgerClient>,
        store: Arc<dyn Store>,
    ) -> (RoundActorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel::<Request>();
        let join = thread::spawn(move || {
            while let Ok(request) = rx.recv() {
                match request {
                    Request::Sync { participant, reply } => {
                        let view = Self::sync_view(&ledger, store.as_ref(), &participant);
                        // a dead requester is its own problem
                        let _ = reply.send(view);
                    }
                }
            }
            debug!("round actor shutting down");
        });
        (RoundActorHandle { tx }, join)
    }

    fn sync_view(
        ledger: &LedgerClient,
        store: &dyn Store,
        participant: &Address,
    ) -> Result<SyncView> {
        let outstanding = ledger.advance_round_if_outstanding(participant)?;
        let round = ledger.round_number()?;
        let (weights_link, bias_link) = ledger.global_model_links()?;
        let model = if weights_link.is_empty() || bias_link.is_empty() {
            None
        } else {
            Some((store.get_weights(&weights_link)?, store.get_bias(&bias_link)?))
        };
        Ok(SyncView { outstanding, round, model })
    }
}

/// One participant's state machine. `run` blocks until the configured number
/// of rounds has completed; one thread per participant.
pub struct RoundCoordinator {
    participant: Address,
    rounds: u64,
    poll_interval: Duration,
    actor: RoundActorHandle,
    rotation: Arc<AggregatorRotation>,
    ledger: Arc<LedgerClient>,
    start_barrier: Arc<Barrier>,
    end_barrier: Arc<Barrier>,
    trainer: Box<dyn Trainer>,
    global_w: Weights,
    global_b: Bias,
}

impl RoundCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        participant: Address,
        config: &Config,
        actor: RoundActorHandle,
        rotation: Arc<AggregatorRotation>,
        ledger: Arc<LedgerClient>,
        start_barrier: Arc<Barrier>,
        end_barrier: Arc<Barrier>,
        trainer: Box<dyn Trainer>,
        initial_w: Weights,
        initial_b: Bias,
    ) -> Self {
        RoundCoordinator {
            participant,
            rounds: config.rounds,
            poll_interval: config.poll_interval(),
            actor,
            rotation,
            ledger,
            start_barrier,
            end_barrier,
            trainer,
            global_w: initial_w,
            global_b: initial_b,
        }
    }

    pub fn run(mut self) -> Result<()> {
        loop {
            let view = self.actor.sync(&self.participant)?;
            if view.round > self.rounds {
                info!(participant = %self.participant, "all rounds completed");
                return Ok(());
            }
            if !view.outstanding {
                // already submitted; wait for the stragglers
                thread::sleep(self.poll_interval);
                continue;
            }
            if let Some((w, b)) = view.model {
                self.global_w = w;
                self.global_b = b;
            }
            self.run_round(view.round)?;
        }
    }

    fn run_round(&mut self, round: u64) -> Result<()> {
        let update = self.trainer.train(&self.global_w, &self.global_b, round)?;
        let digest = digest_model(&update.weights, &update.bias);

        self.start_barrier.wait();
        // idempotent; whoever gets here first opens the round
        self.rotation.start_round()?;

        let proof = update
            .proof
            .clone()
            .unwrap_or_else(|| ProofBundle::placeholder(COMMIT_INPUTS));
        match self.ledger.submit_commitment(&self.participant, digest, &proof) {
            Ok(receipt) => {
                debug!(
                    participant = %self.participant,
                    round,
                    tx = receipt.tx,
                    "commitment submitted"
                );
                let admitted = self.rotation.admit(Reveal {
                    participant: self.participant.clone(),
                    weights: update.weights,
                    bias: update.bias,
                    score: update.score,
                })?;
                if !admitted {
                    warn!(participant = %self.participant, round, "reveal not admitted");
                }
            }
            Err(e) if e.is_retryable() => {
                // retries exhausted; this participant sits the round out
                error!(participant = %self.participant, round, error = %e, "commitment failed");
            }
            Err(e) => return Err(e),
        }

        let finish = if self.end_barrier.wait().is_leader() {
            self.rotation.finish_round()
        } else {
            Ok(())
        };
        // hold everyone until the leader is done; a participant racing ahead
        // could otherwise close the round before the aggregate is published
        self.end_barrier.wait();
        finish
    }
}
