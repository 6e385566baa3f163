//! catena: the Catena blockchain daemon.
//!
//! Single OS process on a Tokio runtime. Hosts the ledger, the miner,
//! the gossip endpoint, and the query endpoint; peers are dialed from
//! the `--join` flags and the persisted peer table.

mod config;
mod node;
mod query;
mod store;
mod transport;

use std::process::ExitCode;
use std::sync::Arc;

use catena_chain::queue::{PermanentStore, StoreLocation};
use catena_chain::{pow, Block, Ledger, ReplayQueue};
use catena_crypto::{keys, Hash};
use clap::error::ErrorKind;
use clap::Parser;
use tracing::{error, info};

use crate::config::{Cli, EXIT_USAGE};
use crate::node::Node;
use crate::store::NodeStore;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(EXIT_USAGE as u8);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("catena={}", cli.log.directive()).into()),
        )
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(cli: Cli) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "catena starting");

    if cli.initialize {
        initialize(&cli)?;
    }

    let store = NodeStore::open(&cli.node_database)?;
    let keypair = store.identity()?;
    let uuid = match cli.node_uuid {
        Some(uuid) => uuid,
        None => store.uuid()?,
    };

    if cli.show_identity {
        println!("public key: {}", keypair.verifying_key.to_hex());
        println!(
            "invoker hash: {}",
            keys::invoker_hash(&keypair.verifying_key)
        );
        println!("uuid: {uuid}");
        return Ok(());
    }

    // The genesis seed: the CLI flag wins, then whatever this node was
    // initialized with before, then the empty seed.
    let seed = if !cli.seed.is_empty() {
        cli.seed.clone()
    } else {
        store.genesis_seed()?.unwrap_or_default()
    };
    store.set_genesis_seed(&seed)?;

    // The genesis block is derived deterministically from the seed: zero
    // miner, zero timestamp, nonce search from zero. Every node with the
    // same seed computes the same genesis hash.
    let mut genesis = Block::genesis(seed.clone(), Hash::zero(), 0);
    if !pow::mine(&mut genesis, pow::INITIAL_DIFFICULTY, &Default::default()) {
        anyhow::bail!("genesis mining aborted");
    }
    info!(signature = %genesis.signature, "genesis block");

    let location = if cli.in_memory_database {
        StoreLocation::Memory
    } else {
        StoreLocation::File(cli.database.clone())
    };
    let permanent = PermanentStore::open(location, pow::INITIAL_DIFFICULTY, !cli.no_replay)?;
    let mut queue = ReplayQueue::new(permanent);
    let mut ledger = Ledger::new(genesis)?;
    ledger.synchronize(&mut queue)?;

    let node = Node::new(uuid, keypair, cli.gossip_port, cli.mine, ledger, queue);

    // Shutdown fan-out: one broadcast channel everyone subscribes to.
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    let gossip = tokio::spawn(transport::serve_gossip(node.clone(), cli.gossip_port));
    let queries = tokio::spawn(query::serve_query(node.clone(), cli.query_port()));
    tokio::spawn(node::run_ticker(node.clone(), shutdown_tx.subscribe()));
    if cli.mine {
        tokio::spawn(node::run_miner(node.clone(), shutdown_tx.subscribe()));
    }

    // Dial explicit peers first, then whatever the peer table remembers.
    let mut dials = cli.join.clone();
    for remembered in store.peers()? {
        if !dials.contains(&remembered) {
            dials.push(remembered);
        }
    }
    for url in dials {
        store.save_peer(&url, Node::now_timestamp())?;
        tokio::spawn(transport::dial(node.clone(), url));
    }

    wait_for_shutdown().await;
    info!("shutting down");
    let _ = shutdown_tx.send(());
    gossip.abort();
    queries.abort();
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut terminate =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// `--initialize`: truncate the chain database and the peer table.
fn initialize(cli: &Cli) -> anyhow::Result<()> {
    if !cli.in_memory_database {
        for suffix in ["", "-wal", "-shm"] {
            let mut target = cli.database.clone().into_os_string();
            target.push(suffix);
            let target = std::path::PathBuf::from(target);
            if target.exists() {
                std::fs::remove_file(&target)?;
            }
        }
    }
    if cli.node_database.exists() {
        let store = NodeStore::open(&cli.node_database)?;
        store.truncate_peers()?;
    }
    info!("chain database and peer table truncated");
    Ok(())
}
