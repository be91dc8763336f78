// src/main.rs

use std::error::Error;
use std::sync::{Arc, Barrier};
use std::thread;

use structopt::StructOpt;
use tracing::info;

use zkfed::config::{Config, SelectionPolicy};
use zkfed::coordinator::{RoundActor, RoundCoordinator};
use zkfed::engine::AggregationEngine;
use zkfed::ledger::{Address, InMemoryLedger, LedgerClient};
use zkfed::prover::{NullProver, Prover, ZkProver};
use zkfed::rotation::AggregatorRotation;
use zkfed::store::{MemoryStore, Store};
use zkfed::trainer::{initial_model, SyntheticTrainer};

/// CLI args
#[derive(Debug, StructOpt)]
#[structopt(name = "zkfed", about = "Simulated zk-verified federated-learning rounds")]
struct Cli {
    /// number of participant threads
    #[structopt(long, default_value = "3")]
    participants: usize,

    /// number of update rounds to run
    #[structopt(long, default_value = "3")]
    rounds: u64,

    /// size of the aggregator pool the rotation cycles through
    #[structopt(long, default_value = "2")]
    aggregators: usize,

    /// disable stake payouts after each rotation
    #[structopt(long)]
    no_payouts: bool,

    /// invoke the external prover instead of the placeholder bundle
    #[structopt(long)]
    prove: bool,

    /// use inverse-MSE weighted selection instead of select-all
    #[structopt(long)]
    weighted_selection: bool,

    /// stddev of the synthetic local-update noise, in fixed-point units
    #[structopt(long, default_value = "50.0")]
    noise: f64,
}

const INITIAL_BALANCE: u64 = 1_000_000;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt().with_target(false).init();
    let args = Cli::from_args();

    let config = Config {
        participant_count: args.participants,
        rounds: args.rounds,
        payouts_enabled: !args.no_payouts,
        perform_proof: args.prove,
        selection: if args.weighted_selection {
            SelectionPolicy::InverseMseTopK { epsilon: 1.0, select_count: args.participants }
        } else {
            SelectionPolicy::SelectAll
        },
        ..Config::default()
    };

    let participants: Vec<Address> =
        (0..args.participants).map(|i| format!("0xparticipant{}", i)).collect();
    let aggregator_accounts: Vec<Address> =
        (0..args.aggregators).map(|i| format!("0xaggregator{}", i)).collect();
    let treasury: Address = "0xtreasury".to_string();

    let mut extra_accounts = aggregator_accounts.clone();
    extra_accounts.push(treasury.clone());
    let ledger = Arc::new(InMemoryLedger::new(
        participants.clone(),
        extra_accounts,
        args.aggregators,
        INITIAL_BALANCE,
    ));
    let client = Arc::new(LedgerClient::new(
        ledger,
        config.retry_limit,
        config.retry_backoff(),
    ));
    let store = Arc::new(MemoryStore::new());

    // bootstrap: publish the seeded initial model so round 1 has links
    let (initial_w, initial_b) =
        initial_model(config.output_dim, config.input_dim, config.precision);
    let weights_link = store.save_weights(&initial_w)?;
    let bias_link = store.save_bias(&initial_b)?;
    client.init_model(&participants[0], &weights_link, &bias_link)?;
    info!(%weights_link, %bias_link, "initial model published");

    let prover: Arc<dyn Prover> = if config.perform_proof {
        Arc::new(ZkProver::new(config.prover.clone()))
    } else {
        Arc::new(NullProver)
    };
    let engines: Vec<Arc<AggregationEngine>> = aggregator_accounts
        .iter()
        .enumerate()
        .map(|(i, account)| {
            Arc::new(AggregationEngine::new(
                format!("Aggregator-{}", i + 1),
                account.clone(),
                &config,
                initial_w.clone(),
                initial_b.clone(),
                client.clone(),
                store.clone(),
                prover.clone(),
            ))
        })
        .collect();
    let rotation = Arc::new(AggregatorRotation::new(
        engines,
        client.clone(),
        treasury.clone(),
        &config,
    ));
    rotation.select()?;

    let (actor, actor_join) = RoundActor::spawn(client.clone(), store.clone());
    let start_barrier = Arc::new(Barrier::new(args.participants));
    let end_barrier = Arc::new(Barrier::new(args.participants));

    let mut joins = Vec::new();
    for (i, account) in participants.iter().enumerate() {
        let coordinator = RoundCoordinator::new(
            account.clone(),
            &config,
            actor.clone(),
            rotation.clone(),
            client.clone(),
            start_barrier.clone(),
            end_barrier.clone(),
            Box::new(SyntheticTrainer::new(i as u64 + 1, args.noise)),
            initial_w.clone(),
            initial_b.clone(),
        );
        joins.push(thread::spawn(move || coordinator.run()));
    }
    for join in joins {
        join.join().expect("participant thread panicked")?;
    }
    drop(actor);
    actor_join.join().expect("round actor panicked");

    info!(round = client.round_number()?, "simulation finished");
    for account in participants.iter().chain(aggregator_accounts.iter()) {
        info!(account = %account, balance = client.balance(account)?, "final balance");
    }
    info!(
        account = %treasury,
        balance = client.balance(&treasury)?,
        "final balance"
    );
    Ok(())
}
