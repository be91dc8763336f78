// src/trainer.rs
//! Local model updates.
//!
//! The coordination core does not care how a local update is produced; it
//! only needs the scaled-integer tensors, a validation score, and optionally
//! a pre-built proof of the training step. [`SyntheticTrainer`] stands in for
//! a real training pipeline in the simulation binary and the tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::error::Result;
use crate::field::{Bias, Weights};
use crate::ledger::ProofBundle;

/// One participant's contribution for a round. `proof` accompanies the
/// on-ledger commitment when the participant runs its own prover; `None`
/// substitutes the fixed placeholder bundle.
#[derive(Debug, Clone)]
pub struct LocalUpdate {
    pub weights: Weights,
    pub bias: Bias,
    pub score: f64,
    pub proof: Option<ProofBundle>,
}

pub trait Trainer: Send {
    /// Produce this round's local update from the current global model.
    fn train(&mut self, global_w: &Weights, global_b: &Bias, round: u64) -> Result<LocalUpdate>;
}

/// Draw an initial model from a seeded standard normal, scaled into
/// fixed-point space at a fifth of the precision factor. The seed is fixed
/// so every process bootstraps the identical model.
pub fn initial_model(output_dim: usize, input_dim: usize, precision: u64) -> (Weights, Bias) {
    let mut rng = StdRng::seed_from_u64(4);
    let normal = Normal::new(0.0, 1.0).expect("unit normal parameters are valid");
    let scale = precision as f64 / 5.0;
    let weights = (0..output_dim)
        .map(|_| {
            (0..input_dim)
                .map(|_| (normal.sample(&mut rng) * scale) as i128)
                .collect()
        })
        .collect();
    let bias = (0..output_dim)
        .map(|_| (normal.sample(&mut rng) * scale) as i128)
        .collect();
    (weights, bias)
}

/// Perturbs the global model with gaussian noise instead of running a real
/// training step. Deterministic per seed.
pub struct SyntheticTrainer {
    rng: StdRng,
    noise: Normal<f64>,
}

impl SyntheticTrainer {
    pub fn new(seed: u64, noise_stddev: f64) -> Self {
        SyntheticTrainer {
            rng: StdRng::seed_from_u64(seed),
            noise: Normal::new(0.0, noise_stddev).expect("caller passes a finite stddev"),
        }
    }
}

impl Trainer for SyntheticTrainer {
    fn train(&mut self, global_w: &Weights, global_b: &Bias, _round: u64) -> Result<LocalUpdate> {
        let weights = global_w
            .iter()
            .map(|row| {
                row.iter()
                    .map(|&x| x + self.noise.sample(&mut self.rng) as i128)
                    .collect()
            })
            .collect();
        let bias = global_b
            .iter()
            .map(|&x| x + self.noise.sample(&mut self.rng) as i128)
            .collect();
        Ok(LocalUpdate {
            weights,
            bias,
            score: self.rng.gen_range(0.01..1.0),
            proof: None,
        })
    }
}
