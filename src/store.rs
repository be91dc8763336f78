// src/store.rs
//! Content-addressed storage for the raw model tensors.
//!
//! The ledger carries only digests and links; between rounds the store is
//! the sole source of truth for the global model. Links are opaque strings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{Result, ZkFedError};
use crate::field::{Bias, Weights};

pub trait Store: Send + Sync {
    fn save_weights(&self, weights: &Weights) -> Result<String>;
    fn save_bias(&self, bias: &Bias) -> Result<String>;
    fn get_weights(&self, link: &str) -> Result<Weights>;
    fn get_bias(&self, link: &str) -> Result<Bias>;
}

enum Tensor {
    Weights(Weights),
    Bias(Bias),
}

/// In-process store used by the simulation binary and tests; links are
/// sequence-numbered per kind.
pub struct MemoryStore {
    data: Mutex<HashMap<String, Tensor>>,
    counter: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore { data: Mutex::new(HashMap::new()), counter: AtomicU64::new(0) }
    }

    fn next_link(&self, kind: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("store://{}-{}", kind, n)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn save_weights(&self, weights: &Weights) -> Result<String> {
        let link = self.next_link("gw");
        self.data
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(link.clone(), Tensor::Weights(weights.clone()));
        Ok(link)
    }

    fn save_bias(&self, bias: &Bias) -> Result<String> {
        let link = self.next_link("gb");
        self.data
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(link.clone(), Tensor::Bias(bias.clone()));
        Ok(link)
    }

    fn get_weights(&self, link: &str) -> Result<Weights> {
        match self.data.lock().unwrap_or_else(|p| p.into_inner()).get(link) {
            Some(Tensor::Weights(w)) => Ok(w.clone()),
            _ => Err(ZkFedError::StoreMiss(link.to_string())),
        }
    }

    fn get_bias(&self, link: &str) -> Result<Bias> {
        match self.data.lock().unwrap_or_else(|p| p.into_inner()).get(link) {
            Some(Tensor::Bias(b)) => Ok(b.clone()),
            _ => Err(ZkFedError::StoreMiss(link.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_fetch_round_trip() {
        let store = MemoryStore::new();
        let w: Weights = vec![vec![1, -2], vec![3, 4]];
        let b: Bias = vec![-5, 6];
        let wl = store.save_weights(&w).unwrap();
        let bl = store.save_bias(&b).unwrap();
        assert_ne!(wl, bl);
        assert_eq!(store.get_weights(&wl).unwrap(), w);
        assert_eq!(store.get_bias(&bl).unwrap(), b);
    }

    #[test]
    fn unknown_link_misses() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get_weights("store://gw-404"),
            Err(ZkFedError::StoreMiss(_))
        ));
    }

    #[test]
    fn bias_link_does_not_resolve_as_weights() {
        let store = MemoryStore::new();
        let bl = store.save_bias(&vec![1, 2]).unwrap();
        assert!(store.get_weights(&bl).is_err());
    }
}
