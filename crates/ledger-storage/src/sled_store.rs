use anyhow::{Context, Result};
use ledger_core::{chain::ChainStore, Block, Hash};
use parking_lot::Mutex;
use sled::{Db, IVec, Tree};
use std::{path::Path, sync::Arc};
use tracing::{debug, info};

const TREE_BLOCKS: &str = "blocks";
const KEY_TIP_HEIGHT: &[u8] = b"tip_height";
const KEY_TIP_HASH: &[u8] = b"tip_hash";

#[derive(Clone)]
pub struct SledStore {
  db: Db,
  blocks: Tree,
  // Serializes tip updates so the tip only ever moves forward.
  tip_lock: Arc<Mutex<()>>,
}

impl SledStore {
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
    let path = path.as_ref();
    let db = sled::open(path).with_context(|| format!("opening sled store at {}", path.display()))?;
    let blocks = db.open_tree(TREE_BLOCKS)?;
    info!(path = %path.display(), "sled store opened");
    Ok(Self {
      db,
      blocks,
      tip_lock: Arc::new(Mutex::new(())),
    })
  }

  /// Drops every stored block and the tip metadata.
  pub fn clear(&self) -> Result<()> {
    self.blocks.clear()?;
    self.db.remove(KEY_TIP_HEIGHT)?;
    self.db.remove(KEY_TIP_HASH)?;
    self.db.flush()?;
    Ok(())
  }
}

impl ChainStore for SledStore {
  fn put_block(&self, block: &Block) -> Result<()> {
    let hash = block
      .hash
      .as_deref()
      .with_context(|| format!("block {} is not sealed", block.index))?;
    let key = block.index.to_be_bytes();
    let bytes = serde_json::to_vec(block)?;
    self.blocks.insert(key, bytes)?;

    {
      let _tip = self.tip_lock.lock();
      let advances = self.tip_hash()?.is_none() || block.index >= self.tip_height()?;
      if advances {
        self.db.insert(KEY_TIP_HEIGHT, &block.index.to_be_bytes())?;
        self.db.insert(KEY_TIP_HASH, hash.as_bytes())?;
      }
    }

    self.db.flush()?;
    debug!(index = block.index, "block persisted");
    Ok(())
  }

  fn get_block(&self, index: u64) -> Result<Option<Block>> {
    let key = index.to_be_bytes();
    self
      .blocks
      .get(key)?
      .map(|ivec: IVec| {
        serde_json::from_slice(&ivec).with_context(|| format!("decoding stored block {index}"))
      })
      .transpose()
  }

  fn tip_height(&self) -> Result<u64> {
    match self.db.get(KEY_TIP_HEIGHT)? {
      Some(v) => {
        let arr = <[u8; 8]>::try_from(&v[..]).context("corrupt tip height")?;
        Ok(u64::from_be_bytes(arr))
      }
      None => Ok(0),
    }
  }

  fn tip_hash(&self) -> Result<Option<Hash>> {
    self
      .db
      .get(KEY_TIP_HASH)?
      .map(|v| String::from_utf8(v.to_vec()).context("corrupt tip hash"))
      .transpose()
  }

  fn close(&self) -> Result<()> {
    self.db.flush()?;
    Ok(())
  }
}
