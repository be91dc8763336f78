// src/lib.rs
//! Library root for zkfed: the coordination core of a zero-knowledge
//! verified federated-learning deployment. Commit-reveal admission over
//! MiMC digests, barrier-synchronized rounds, moving-average aggregation
//! and stake-weighted aggregator rotation, all anchored to an external
//! ledger.

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod field;
pub mod hash;
pub mod ledger;
pub mod prover;
pub mod rotation;
pub mod store;
pub mod trainer;

// Re-export commonly used items
pub use config::{Config, SelectionPolicy};
pub use coordinator::{RoundActor, RoundActorHandle, RoundCoordinator};
pub use engine::{AggregationEngine, Reveal};
pub use error::{Result, ZkFedError};
pub use field::{Bias, Felt, Weights};
pub use ledger::{InMemoryLedger, Ledger, LedgerClient, ProofBundle};
pub use rotation::AggregatorRotation;
pub use store::{MemoryStore, Store};
pub use trainer::{LocalUpdate, SyntheticTrainer, Trainer};
