// src/error.rs
//! Error taxonomy for the coordination core.
//!
//! The split matters operationally: `AdmissionRejected` is permanent (never
//! retried), `LedgerRejected` is retried with bounded backoff and then dropped
//! for the round, prover failures abandon the round without touching global
//! state, and `Desync` is fatal because it means the ledger and the rotation
//! disagree about who won the round.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ZkFedError>;

#[derive(Debug, Error)]
pub enum ZkFedError {
    /// A reveal's recomputed digest was not found in the on-ledger
    /// commitment set for the current round. Permanent for that reveal.
    #[error("admission rejected: digest {digest} not committed for round {round}")]
    AdmissionRejected { digest: String, round: u64 },

    /// A ledger transaction reverted.
    #[error("ledger rejected transaction: {0}")]
    LedgerRejected(String),

    /// The external prover exited non-zero and its output artifact never
    /// appeared. A clean exit with a missing artifact is a
    /// [`ZkFedError::ProverTimeout`] instead.
    #[error("prover failed: {0}")]
    ProverFailed(String),

    /// The prover's output artifact did not appear within the deadline.
    /// File-existence polling is the only completion signal the external
    /// tool offers; the deadline turns an infinite wait into a round abort.
    #[error("prover timed out after {waited:?} waiting for {artifact}")]
    ProverTimeout { artifact: String, waited: Duration },

    /// Fewer admitted reveals than the configured participant count.
    /// The round is abandoned; partial aggregation is not performed.
    #[error("insufficient participants: selected {selected}, need {required}")]
    InsufficientParticipants { selected: usize, required: usize },

    /// The stake-winner record is missing or malformed while payouts are
    /// enabled. Fatal: the ledger and the aggregator rotation have
    /// desynchronized and continuing would pay the wrong parties.
    #[error("ledger/rotation desync: {0}")]
    Desync(String),

    /// A link handed to the content-addressed store resolved to nothing.
    #[error("store lookup failed for link {0}")]
    StoreMiss(String),

    /// A field-element string (hex or decimal) could not be decoded.
    #[error("malformed field element: {0}")]
    MalformedFieldElement(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("proof document malformed: {0}")]
    ProofDocument(#[from] serde_json::Error),
}

impl ZkFedError {
    /// Transaction reverts are the only failures worth a retry; everything
    /// else in the taxonomy is either permanent or fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ZkFedError::LedgerRejected(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_ledger_rejections_are_retryable() {
        assert!(ZkFedError::LedgerRejected("revert".into()).is_retryable());
        assert!(!ZkFedError::Desync("bad winners".into()).is_retryable());
        assert!(!ZkFedError::InsufficientParticipants { selected: 1, required: 3 }.is_retryable());
    }
}
