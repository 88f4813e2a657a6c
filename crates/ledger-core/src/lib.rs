pub mod constants;
pub mod error;
mod ledger;

pub use error::{LedgerError, Result};
pub use ledger::{Ledger, LedgerConfig, MineOutcome};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::constants::TIMESTAMP_FIELD;

/// Lowercase hex rendering of a SHA-256 digest.
pub type Hash = String;

/// Seconds since the unix epoch, with sub-second precision.
pub fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// A loosely-typed transaction field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Empty strings, zero and `false` carry no value and fail a
    /// required-field check. Whitespace is a value.
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Bool(b) => !b,
            FieldValue::Int(i) => *i == 0,
            FieldValue::Float(x) => *x == 0.0,
            FieldValue::Str(s) => s.is_empty(),
        }
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Int(i) => write!(f, "{i}"),
            FieldValue::Float(x) => write!(f, "{x}"),
            FieldValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Str(s)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Int(i)
    }
}

impl From<f64> for FieldValue {
    fn from(x: f64) -> Self {
        FieldValue::Float(x)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

/// Caller-supplied fields plus the server-side submission timestamp.
/// Serializes flat, e.g. `{"party":"..","timestamp":1.7e9,"voter_id":".."}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: f64,
}

impl Transaction {
    /// Stamps `fields` with the current time. A caller-supplied `timestamp`
    /// key is replaced by the server stamp.
    pub fn new(fields: BTreeMap<String, FieldValue>) -> Result<Self> {
        Self::with_timestamp(fields, now_timestamp())
    }

    pub fn with_timestamp(mut fields: BTreeMap<String, FieldValue>, timestamp: f64) -> Result<Self> {
        fields.remove(TIMESTAMP_FIELD);
        if !timestamp.is_finite() {
            return Err(LedgerError::NonFiniteField(TIMESTAMP_FIELD.to_owned()));
        }
        if let Some((key, _)) = fields
            .iter()
            .find(|(_, v)| matches!(v, FieldValue::Float(x) if !x.is_finite()))
        {
            return Err(LedgerError::NonFiniteField(key.clone()));
        }
        Ok(Self { fields, timestamp })
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }
}

/// One link of the chain. `hash` stays `None` until the block is sealed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    pub transactions: Vec<Transaction>,
    pub timestamp: f64,
    pub previous_hash: Hash,
    pub nonce: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<Hash>,
}

/// Every block field except `hash`.
#[derive(Serialize)]
struct HashInput<'a> {
    index: u64,
    nonce: u64,
    previous_hash: &'a str,
    timestamp: f64,
    transactions: &'a [Transaction],
}

impl Block {
    pub fn new(
        index: u64,
        transactions: Vec<Transaction>,
        timestamp: f64,
        previous_hash: impl Into<Hash>,
    ) -> Self {
        Self {
            index,
            transactions,
            timestamp,
            previous_hash: previous_hash.into(),
            nonce: 0,
            hash: None,
        }
    }

    /// Key-sorted compact JSON of every field except `hash`.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let value = serde_json::to_value(HashInput {
            index: self.index,
            nonce: self.nonce,
            previous_hash: &self.previous_hash,
            timestamp: self.timestamp,
            transactions: &self.transactions,
        })?;
        Ok(serde_json::to_vec(&sort_keys(value))?)
    }

    pub fn compute_hash(&self) -> Result<Hash> {
        let digest = Sha256::digest(self.canonical_bytes()?);
        Ok(hex::encode(digest))
    }

    pub fn is_sealed(&self) -> bool {
        self.hash.is_some()
    }
}

// Rebuilds objects in key order so the encoding does not depend on how
// serde_json's map type is configured.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

pub mod pow {
    use super::{chain::meets_difficulty, Block, Hash, Result};

    /// Searches nonces sequentially from zero until the block hash starts with
    /// `difficulty` '0' hex characters. Leaves the winning nonce on the block
    /// and returns the qualifying hash. Unbounded: expect ~16^difficulty tries.
    pub fn search(block: &mut Block, difficulty: usize) -> Result<Hash> {
        block.nonce = 0;
        let mut hash = block.compute_hash()?;
        while !meets_difficulty(&hash, difficulty) {
            block.nonce = block.nonce.wrapping_add(1);
            hash = block.compute_hash()?;
        }
        Ok(hash)
    }

    pub fn count_leading_zero_chars(hash: &str) -> usize {
        hash.bytes().take_while(|b| *b == b'0').count()
    }
}

pub mod chain {
    use super::*;
    use crate::constants::GENESIS_PREVIOUS_HASH;
    use rayon::prelude::*;
    use thiserror::Error;

    /// Trait the storage backends implement to snapshot sealed blocks.
    /// Lives in `ledger-core` to avoid a circular dependency.
    pub trait ChainStore: Send + Sync {
        fn put_block(&self, block: &Block) -> anyhow::Result<()>;
        fn get_block(&self, index: u64) -> anyhow::Result<Option<Block>>;
        fn tip_height(&self) -> anyhow::Result<u64>;
        fn tip_hash(&self) -> anyhow::Result<Option<Hash>>;
        fn close(&self) -> anyhow::Result<()>;

        /// All stored blocks in index order; empty when nothing was stored yet.
        fn load_chain(&self) -> anyhow::Result<Vec<Block>> {
            if self.tip_hash()?.is_none() {
                return Ok(Vec::new());
            }
            let height = self.tip_height()?;
            (0..=height)
                .map(|index| {
                    self.get_block(index)?
                        .ok_or_else(|| anyhow::anyhow!("block {index} missing from store"))
                })
                .collect()
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Error)]
    pub enum ChainViolation {
        #[error("chain has no blocks")]
        Empty,
        #[error("genesis block is malformed")]
        BadGenesis,
        #[error("block at position {position} carries index {found}")]
        IndexGap { position: u64, found: u64 },
        #[error("block {index} was never sealed")]
        Unsealed { index: u64 },
        #[error("block {index} does not link to its predecessor")]
        BrokenLink { index: u64 },
        #[error("block {index} stored hash does not match its contents")]
        HashMismatch { index: u64 },
        #[error("block {index} hash does not meet difficulty {difficulty}")]
        InsufficientWork { index: u64, difficulty: usize },
    }

    impl ChainViolation {
        /// Chain position the violation was found at.
        pub fn position(&self) -> u64 {
            match self {
                ChainViolation::Empty | ChainViolation::BadGenesis => 0,
                ChainViolation::IndexGap { position, .. } => *position,
                ChainViolation::Unsealed { index }
                | ChainViolation::BrokenLink { index }
                | ChainViolation::HashMismatch { index }
                | ChainViolation::InsufficientWork { index, .. } => *index,
            }
        }
    }

    /// Literal prefix check: the hex string starts with `difficulty` '0' chars.
    pub fn meets_difficulty(hash: &str, difficulty: usize) -> bool {
        hash.as_bytes()
            .get(..difficulty)
            .is_some_and(|prefix| prefix.iter().all(|b| *b == b'0'))
    }

    /// The proof must meet difficulty and be this block's actual hash.
    pub fn is_valid_proof(block: &Block, proof: &str, difficulty: usize) -> Result<bool> {
        Ok(meets_difficulty(proof, difficulty) && proof == block.compute_hash()?)
    }

    /// Whether `candidate` sealed with `proof` may be appended after `tip`.
    pub fn can_extend(tip: &Block, candidate: &Block, proof: &str, difficulty: usize) -> Result<bool> {
        if tip.hash.as_deref() != Some(candidate.previous_hash.as_str()) {
            return Ok(false);
        }
        if candidate.index != tip.index + 1 {
            return Ok(false);
        }
        is_valid_proof(candidate, proof, difficulty)
    }

    /// An empty index-0 block sealed with its own hash. Exempt from difficulty.
    pub fn genesis_block(timestamp: f64) -> Result<Block> {
        let mut genesis = Block::new(0, Vec::new(), timestamp, GENESIS_PREVIOUS_HASH);
        genesis.hash = Some(genesis.compute_hash()?);
        Ok(genesis)
    }

    /// Full re-verification of a chain: genesis shape, index continuity,
    /// linkage, stored-vs-recomputed hashes and difficulty. Reports the
    /// violation at the lowest position.
    pub fn validate_chain(blocks: &[Block], difficulty: usize) -> std::result::Result<(), ChainViolation> {
        let genesis = blocks.first().ok_or(ChainViolation::Empty)?;
        let genesis_ok = genesis.index == 0
            && genesis.transactions.is_empty()
            && genesis.previous_hash == GENESIS_PREVIOUS_HASH
            && genesis.hash.is_some()
            && genesis.compute_hash().ok() == genesis.hash;
        if !genesis_ok {
            return Err(ChainViolation::BadGenesis);
        }

        let first_bad = blocks
            .par_windows(2)
            .enumerate()
            .filter_map(|(offset, pair)| {
                check_link(&pair[0], &pair[1], offset as u64 + 1, difficulty).err()
            })
            .min_by_key(|violation| violation.position());

        match first_bad {
            Some(violation) => Err(violation),
            None => Ok(()),
        }
    }

    fn check_link(
        prev: &Block,
        block: &Block,
        position: u64,
        difficulty: usize,
    ) -> std::result::Result<(), ChainViolation> {
        if block.index != position {
            return Err(ChainViolation::IndexGap {
                position,
                found: block.index,
            });
        }
        let index = block.index;
        let stored = block
            .hash
            .as_deref()
            .ok_or(ChainViolation::Unsealed { index })?;
        if prev.hash.as_deref() != Some(block.previous_hash.as_str()) {
            return Err(ChainViolation::BrokenLink { index });
        }
        if block.compute_hash().ok().as_deref() != Some(stored) {
            return Err(ChainViolation::HashMismatch { index });
        }
        if !meets_difficulty(stored, difficulty) {
            return Err(ChainViolation::InsufficientWork { index, difficulty });
        }
        Ok(())
    }
}
