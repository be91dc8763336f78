// src/config.rs
//! Explicit configuration passed to every component at construction.
//! No ambient globals: each component keeps a clone of (the part of) this
//! struct it needs.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Which admitted reveals enter the aggregation.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Deployed policy: every admitted reveal is selected.
    SelectAll,
    /// Alternative policy: inverse-MSE weighted top-k with
    /// historical-frequency damping.
    InverseMseTopK { epsilon: f64, select_count: usize },
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy::SelectAll
    }
}

/// Where the external prover lives and how long we wait for its artifacts.
#[derive(Debug, Clone, Deserialize)]
pub struct ProverConfig {
    /// Prover executable, e.g. `zokrates`.
    pub binary: PathBuf,
    /// Directory holding the compiled circuit (`out`), `abi.json` and
    /// `proving.key`, and receiving witness/proof artifacts.
    pub workdir: PathBuf,
    /// Deadline for each artifact file to appear. The external tool's only
    /// completion signal is the file showing up.
    pub artifact_timeout_ms: u64,
    /// Interval between file-existence polls.
    pub poll_interval_ms: u64,
}

impl Default for ProverConfig {
    fn default() -> Self {
        ProverConfig {
            binary: PathBuf::from("zokrates"),
            workdir: PathBuf::from("verification/aggregator"),
            artifact_timeout_ms: 10 * 60 * 1000,
            poll_interval_ms: 200,
        }
    }
}

impl ProverConfig {
    pub fn artifact_timeout(&self) -> Duration {
        Duration::from_millis(self.artifact_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Features per activation (weight-matrix columns).
    pub input_dim: usize,
    /// Activations (weight-matrix rows and bias length).
    pub output_dim: usize,
    /// Participants per round; aggregation requires exactly this many
    /// admitted reveals.
    pub participant_count: usize,
    /// Number of update rounds to run.
    pub rounds: u64,
    /// Fixed-point scaling factor shared with the circuit.
    pub precision: u64,
    pub learning_rate: f64,
    /// Whether the external prover is invoked; when false the fixed
    /// placeholder proof bundle is substituted so call shapes stay identical.
    pub perform_proof: bool,
    /// Whether stake payouts are issued after each rotation.
    pub payouts_enabled: bool,
    /// Fixed stake amount transferred to the winning aggregator and to each
    /// winning client.
    pub stake_amount: u64,
    /// Fixed gas budget attached to every payout transfer.
    pub stake_gas: u64,
    /// Mutating ledger calls are retried up to this many times.
    pub retry_limit: u32,
    /// Fixed sleep between retries.
    pub retry_backoff_ms: u64,
    /// Sleep between round-status polls.
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub selection: SelectionPolicy,
    #[serde(default)]
    pub prover: ProverConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            input_dim: 9,
            output_dim: 6,
            participant_count: 3,
            rounds: 3,
            precision: 10_000,
            learning_rate: 0.0001,
            perform_proof: false,
            payouts_enabled: true,
            stake_amount: 1_000,
            stake_gas: 21_000,
            retry_limit: 5,
            retry_backoff_ms: 500,
            poll_interval_ms: 100,
            selection: SelectionPolicy::SelectAll,
            prover: ProverConfig::default(),
        }
    }
}

impl Config {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_policy_deserializes_from_tagged_form() {
        let p: SelectionPolicy =
            serde_json::from_str(r#"{"policy":"select_all"}"#).unwrap();
        assert_eq!(p, SelectionPolicy::SelectAll);
        let p: SelectionPolicy = serde_json::from_str(
            r#"{"policy":"inverse_mse_top_k","epsilon":1.0,"select_count":3}"#,
        )
        .unwrap();
        assert_eq!(
            p,
            SelectionPolicy::InverseMseTopK { epsilon: 1.0, select_count: 3 }
        );
    }
}
