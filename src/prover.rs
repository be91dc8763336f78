// src/prover.rs
//! Interface to the external zero-knowledge prover.
//!
//! The prover is a pair of subprocess invocations: "compute-witness" takes
//! every field-encoded argument flattened into whitespace-joined decimal
//! strings in a fixed positional order, "generate-proof" turns the witness
//! artifact into a JSON proof document. The only completion signal the tool
//! gives is the artifact file appearing on disk, so completion is detected
//! by polling for the file -- wrapped here with an explicit deadline. A
//! non-zero exit is logged but is not final by itself; only the artifact
//! never appearing is. When that happens after a non-zero exit the step is a
//! prover failure; after a clean exit it is a timeout.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use std::thread;
use std::time::Instant;

use ark_ff::PrimeField;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ProverConfig;
use crate::error::{Result, ZkFedError};
use crate::field::Felt;
use crate::ledger::{ProofBundle, PUBLISH_INPUTS};

pub trait Prover: Send + Sync {
    fn prove(&self, witness: &AggregationWitness) -> Result<ProofBundle>;
}

/// Everything the aggregation circuit takes, in its positional order:
/// local models and sign masks, the prior global model and sign masks, the
/// on-ledger commitment digests of the selected reveals, the expected new
/// global model and sign masks, and the result digest.
#[derive(Debug, Clone)]
pub struct AggregationWitness {
    pub local_w: Vec<Vec<Vec<Felt>>>,
    pub local_w_sign: Vec<Vec<Vec<Felt>>>,
    pub local_b: Vec<Vec<Felt>>,
    pub local_b_sign: Vec<Vec<Felt>>,
    pub global_w: Vec<Vec<Felt>>,
    pub global_w_sign: Vec<Vec<Felt>>,
    pub global_b: Vec<Felt>,
    pub global_b_sign: Vec<Felt>,
    pub ledger_digests: Vec<Felt>,
    pub new_global_w: Vec<Vec<Felt>>,
    pub new_global_w_sign: Vec<Vec<Felt>>,
    pub new_global_b: Vec<Felt>,
    pub new_global_b_sign: Vec<Felt>,
    pub digest: Felt,
}

fn push_felt(args: &mut Vec<String>, x: &Felt) {
    let mut s = String::new();
    // Display of a field element is its canonical decimal representation;
    // the witness format wants exactly that, one token per element.
    write!(s, "{}", x).expect("formatting a field element cannot fail");
    args.push(s);
}

fn push_vector(args: &mut Vec<String>, v: &[Felt]) {
    for x in v {
        push_felt(args, x);
    }
}

fn push_matrix(args: &mut Vec<String>, m: &[Vec<Felt>]) {
    for row in m {
        push_vector(args, row);
    }
}

fn push_tensor(args: &mut Vec<String>, t: &[Vec<Vec<Felt>>]) {
    for m in t {
        push_matrix(args, m);
    }
}

impl AggregationWitness {
    /// Flatten into the positional decimal-token list the circuit expects.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        push_tensor(&mut args, &self.local_w);
        push_tensor(&mut args, &self.local_w_sign);
        push_matrix(&mut args, &self.local_b);
        push_matrix(&mut args, &self.local_b_sign);
        push_matrix(&mut args, &self.global_w);
        push_matrix(&mut args, &self.global_w_sign);
        push_vector(&mut args, &self.global_b);
        push_vector(&mut args, &self.global_b_sign);
        push_vector(&mut args, &self.ledger_digests);
        push_matrix(&mut args, &self.new_global_w);
        push_matrix(&mut args, &self.new_global_w_sign);
        push_vector(&mut args, &self.new_global_b);
        push_vector(&mut args, &self.new_global_b_sign);
        push_felt(&mut args, &self.digest);
        args
    }
}

// proof document as written by the external tool: hex strings throughout
#[derive(Debug, Deserialize)]
struct ProofFieldsJson {
    a: Vec<String>,
    b: Vec<Vec<String>>,
    c: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProofJson {
    proof: ProofFieldsJson,
    inputs: Vec<String>,
}

/// Decode a hex-encoded field element (with or without `0x`).
pub fn decode_field_hex(s: &str) -> Result<Felt> {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    let padded = if stripped.len() % 2 == 1 {
        format!("0{}", stripped)
    } else {
        stripped.to_string()
    };
    let bytes = hex::decode(&padded)
        .map_err(|_| ZkFedError::MalformedFieldElement(s.to_string()))?;
    Ok(Felt::from_be_bytes_mod_order(&bytes))
}

fn decode_bundle(doc: ProofJson) -> Result<ProofBundle> {
    let decode_vec = |v: &[String]| -> Result<Vec<Felt>> {
        v.iter().map(|s| decode_field_hex(s)).collect()
    };
    Ok(ProofBundle {
        a: decode_vec(&doc.proof.a)?,
        b: doc
            .proof
            .b
            .iter()
            .map(|row| decode_vec(row))
            .collect::<Result<Vec<_>>>()?,
        c: decode_vec(&doc.proof.c)?,
        inputs: decode_vec(&doc.inputs)?,
    })
}

/// Drives the external prover binary over its two-step flow.
pub struct ZkProver {
    cfg: ProverConfig,
}

impl ZkProver {
    pub fn new(cfg: ProverConfig) -> Self {
        ZkProver { cfg }
    }

    fn wait_for_artifact(&self, path: &Path) -> Result<()> {
        let deadline = Instant::now() + self.cfg.artifact_timeout();
        while !path.exists() {
            if Instant::now() >= deadline {
                return Err(ZkFedError::ProverTimeout {
                    artifact: path.display().to_string(),
                    waited: self.cfg.artifact_timeout(),
                });
            }
            thread::sleep(self.cfg.poll_interval());
        }
        Ok(())
    }

    /// A non-zero exit is not final on its own; the artifact check decides.
    /// A missing artifact after a non-zero exit is a prover failure, after a
    /// clean exit a timeout.
    fn settle_step(&self, step: &str, output: &Output, artifact: &Path) -> Result<()> {
        if !output.status.success() {
            warn!(
                step,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "prover step exited non-zero"
            );
        }
        match self.wait_for_artifact(artifact) {
            Ok(()) => Ok(()),
            Err(e) if output.status.success() => Err(e),
            Err(_) => Err(ZkFedError::ProverFailed(format!(
                "{} exited {} and produced no {}",
                step,
                output.status,
                artifact.display()
            ))),
        }
    }
}

impl Prover for ZkProver {
    fn prove(&self, witness: &AggregationWitness) -> Result<ProofBundle> {
        let dir = &self.cfg.workdir;
        let circuit = dir.join("out");
        let abi = dir.join("abi.json");
        let proving_key = dir.join("proving.key");
        let witness_path = dir.join("witness_aggregator");
        let proof_path = dir.join("proof_aggregator");

        // stale artifacts from a previous round would defeat the
        // file-existence completion check
        for stale in [&witness_path, &proof_path] {
            if stale.exists() {
                fs::remove_file(stale)?;
            }
        }

        let args = witness.to_args();
        debug!(tokens = args.len(), "invoking compute-witness");
        let output = Command::new(&self.cfg.binary)
            .arg("compute-witness")
            .arg("-o")
            .arg(&witness_path)
            .arg("-i")
            .arg(&circuit)
            .arg("-s")
            .arg(&abi)
            .arg("-a")
            .args(&args)
            .output()?;
        self.settle_step("compute-witness", &output, &witness_path)?;

        let output = Command::new(&self.cfg.binary)
            .arg("generate-proof")
            .arg("-w")
            .arg(&witness_path)
            .arg("-p")
            .arg(&proving_key)
            .arg("-i")
            .arg(&circuit)
            .arg("-j")
            .arg(&proof_path)
            .output()?;
        self.settle_step("generate-proof", &output, &proof_path)?;

        let doc: ProofJson = serde_json::from_str(&fs::read_to_string(&proof_path)?)?;
        decode_bundle(doc)
    }
}

/// Stand-in prover returning the fixed placeholder bundle; used when proof
/// generation is disabled so the publish call keeps its shape.
pub struct NullProver;

impl Prover for NullProver {
    fn prove(&self, _witness: &AggregationWitness) -> Result<ProofBundle> {
        Ok(ProofBundle::placeholder(PUBLISH_INPUTS))
    }
}
