mod api;
mod constants;
mod error;

use anyhow::Context;
use clap::Parser;
use ledger_core::{chain::ChainStore, constants::DEFAULT_DIFFICULTY, Ledger, LedgerConfig};
use ledger_storage::SledStore;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tracing::{info, warn, Level};

use crate::constants::{DEFAULT_LISTEN, DEFAULT_REQUIRED_FIELDS};

#[derive(Parser, Debug)]
#[command(name = "ledger-node", about = "Single-node proof-of-work ledger")]
struct Args {
    /// Address to listen on, e.g. 127.0.0.1:5000
    #[arg(long, default_value = DEFAULT_LISTEN)]
    listen: String,

    /// Directory for sled snapshots of sealed blocks. In-memory only when omitted.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Leading zero hex characters required of a mined block hash
    #[arg(long, default_value_t = DEFAULT_DIFFICULTY)]
    difficulty: usize,

    /// Field every submitted transaction must carry (repeatable)
    #[arg(long = "required-field", default_values = DEFAULT_REQUIRED_FIELDS)]
    required_fields: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = LedgerConfig {
        difficulty: args.difficulty,
    };

    let (ledger, store) = match &args.data_dir {
        Some(dir) => {
            let store = SledStore::open(dir)?;
            let ledger = open_ledger(&store, config)?;
            (ledger, Some(Arc::new(store)))
        }
        None => {
            warn!("no --data-dir given, chain will be lost on shutdown");
            (Ledger::new(config)?, None)
        }
    };
    let ledger = Arc::new(ledger);

    let state = api::AppState::new(
        Arc::clone(&ledger),
        store.clone().map(|s| s as Arc<dyn ChainStore>),
        args.required_fields,
    );
    let app = api::router(state);

    let addr: SocketAddr = args.listen.parse()?;
    info!(difficulty = config.difficulty, height = ledger.len() - 1, "ledger-node listening on http://{addr}");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(store) = store {
        store.close()?;
    }
    info!("ledger-node stopped");
    Ok(())
}

/// Restores the persisted chain, or seeds an empty store with a fresh genesis.
fn open_ledger(store: &SledStore, config: LedgerConfig) -> anyhow::Result<Ledger> {
    let blocks = store.load_chain()?;
    if blocks.is_empty() {
        let ledger = Ledger::new(config)?;
        store.put_block(&ledger.tip())?;
        return Ok(ledger);
    }
    Ledger::restore(blocks, config).context("stored chain failed verification")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
