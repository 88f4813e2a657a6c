//! Durable snapshots of sealed blocks. The ledger itself stays in memory;
//! a store only mirrors what has already been accepted.
pub mod sled_store;

pub use ledger_core::chain::ChainStore;
pub use sled_store::SledStore;
