use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    chain::{self, can_extend},
    constants::DEFAULT_DIFFICULTY,
    now_timestamp, pow, Block, Result, Transaction,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Leading '0' hex characters a mined block hash must carry.
    pub difficulty: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            difficulty: DEFAULT_DIFFICULTY,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MineOutcome {
    /// A block was sealed at this index.
    Mined(u64),
    NothingToMine,
    /// The candidate no longer extended the tip; mempool left as it was.
    Rejected,
}

struct LedgerState {
    chain: Vec<Block>,
    mempool: Vec<Transaction>,
}

impl LedgerState {
    fn tip(&self) -> &Block {
        // Constructors never build an empty chain.
        &self.chain[self.chain.len() - 1]
    }

    fn accept(&mut self, mut candidate: Block, proof: &str, difficulty: usize) -> Result<bool> {
        if !can_extend(self.tip(), &candidate, proof, difficulty)? {
            return Ok(false);
        }
        candidate.hash = Some(proof.to_owned());
        self.chain.push(candidate);
        Ok(true)
    }
}

/// Owns the sealed chain and the pending mempool.
///
/// Writers take the state lock briefly. `mine` holds a separate mining lock
/// for its whole run so miners never interleave, but releases the state lock
/// while searching so `submit` and reads keep flowing.
pub struct Ledger {
    config: LedgerConfig,
    state: RwLock<LedgerState>,
    mining: Mutex<()>,
}

impl Ledger {
    /// Fresh ledger holding only a genesis block.
    pub fn new(config: LedgerConfig) -> Result<Self> {
        let genesis = chain::genesis_block(now_timestamp())?;
        info!(hash = genesis.hash.as_deref(), "genesis block created");
        Ok(Self::from_chain(config, vec![genesis]))
    }

    /// Rebuilds a ledger from a persisted chain after re-verifying it.
    pub fn restore(blocks: Vec<Block>, config: LedgerConfig) -> Result<Self> {
        chain::validate_chain(&blocks, config.difficulty)?;
        info!(height = blocks.len() - 1, "ledger restored");
        Ok(Self::from_chain(config, blocks))
    }

    fn from_chain(config: LedgerConfig, chain: Vec<Block>) -> Self {
        Self {
            config,
            state: RwLock::new(LedgerState {
                chain,
                mempool: Vec::new(),
            }),
            mining: Mutex::new(()),
        }
    }

    pub fn config(&self) -> LedgerConfig {
        self.config
    }

    pub fn difficulty(&self) -> usize {
        self.config.difficulty
    }

    pub fn submit(&self, tx: Transaction) {
        let mut state = self.state.write();
        state.mempool.push(tx);
        debug!(pending = state.mempool.len(), "transaction queued");
    }

    /// Mines the current mempool into a new block.
    ///
    /// Transactions submitted while the search runs are not part of the
    /// snapshot and stay pending for the next round.
    pub fn mine(&self) -> Result<MineOutcome> {
        let _miner = self.mining.lock();

        let mut candidate = {
            let state = self.state.read();
            if state.mempool.is_empty() {
                return Ok(MineOutcome::NothingToMine);
            }
            let tip = state.tip();
            Block::new(
                tip.index + 1,
                state.mempool.clone(),
                now_timestamp(),
                tip.hash.clone().unwrap_or_default(),
            )
        };
        let snapshot_len = candidate.transactions.len();
        let index = candidate.index;

        let proof = pow::search(&mut candidate, self.config.difficulty)?;
        let nonce = candidate.nonce;

        let mut state = self.state.write();
        if !state.accept(candidate, &proof, self.config.difficulty)? {
            warn!(index, "mined block rejected by chain tip");
            return Ok(MineOutcome::Rejected);
        }
        // Only miners remove from the mempool and they are serialized, so the
        // snapshot is still its prefix.
        state.mempool.drain(..snapshot_len);
        info!(
            index,
            nonce,
            txs = snapshot_len,
            hash = %proof,
            still_pending = state.mempool.len(),
            "block mined"
        );
        Ok(MineOutcome::Mined(index))
    }

    /// Appends `candidate` sealed with `proof` if it extends the tip.
    /// The single gate for chain growth.
    pub fn accept(&self, candidate: Block, proof: &str) -> Result<bool> {
        let index = candidate.index;
        let accepted = self
            .state
            .write()
            .accept(candidate, proof, self.config.difficulty)?;
        if !accepted {
            warn!(index, "block rejected");
        }
        Ok(accepted)
    }

    pub fn tip(&self) -> Block {
        self.state.read().tip().clone()
    }

    pub fn chain(&self) -> Vec<Block> {
        self.state.read().chain.clone()
    }

    pub fn block(&self, index: u64) -> Option<Block> {
        let state = self.state.read();
        usize::try_from(index)
            .ok()
            .and_then(|i| state.chain.get(i))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().chain.len()
    }

    /// Always false: a ledger holds at least its genesis block.
    pub fn is_empty(&self) -> bool {
        self.state.read().chain.is_empty()
    }

    pub fn pending(&self) -> Vec<Transaction> {
        self.state.read().mempool.clone()
    }
}
