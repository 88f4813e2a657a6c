#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;

use ledger_core::{FieldValue, Ledger, LedgerConfig, MineOutcome, Transaction};
use ledger_storage::sled_store::SledStore;
use tempfile::{tempdir, TempDir};

pub fn create_temp_store() -> (TempDir, SledStore) {
    // Create a temporary directory for the sled database
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let db_path = temp_dir.path().to_path_buf();
    (
        temp_dir,
        SledStore::open(&db_path).expect("Failed to open SledStore"),
    )
}

pub fn teardown_store(temp_dir: TempDir, store: SledStore) {
    let db_path = temp_dir.path().to_path_buf();
    store.clear().expect("Failed to clear the store");
    drop(store);
    temp_dir.close().expect("Failed to delete temp dir");
    let _ = fs::remove_dir_all(&db_path);
    assert!(!db_path.exists(), "Database directory should be removed");
}

pub fn vote(voter_id: &str, party: &str) -> Transaction {
    Transaction::new(BTreeMap::from([
        ("voter_id".to_string(), FieldValue::from(voter_id)),
        ("party".to_string(), FieldValue::from(party)),
    ]))
    .expect("finite fields")
}

/// A ledger with `blocks` mined blocks of one vote each.
pub fn mined_ledger(blocks: usize) -> Ledger {
    let ledger = Ledger::new(LedgerConfig::default()).expect("genesis");
    for i in 0..blocks {
        ledger.submit(vote(&format!("VOID{:03}", i + 1), "Democratic Party"));
        assert!(matches!(ledger.mine().expect("mine"), MineOutcome::Mined(_)));
    }
    ledger
}
