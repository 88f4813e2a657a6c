use ledger_core::chain::{validate_chain, ChainViolation};
use ledger_core::{FieldValue, Ledger, LedgerConfig, MineOutcome, Transaction};
use rand::Rng;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const PARTIES: [&str; 3] = ["Democratic Party", "Republican Party", "Socialist Party"];

fn random_vote(rng: &mut impl Rng, seq: usize) -> Transaction {
    let party = PARTIES[rng.gen_range(0..PARTIES.len())];
    Transaction::new(BTreeMap::from([
        ("voter_id".to_string(), FieldValue::from(format!("VOID{seq:03}"))),
        ("party".to_string(), FieldValue::from(party)),
        ("seq".to_string(), FieldValue::Int(seq as i64)),
    ]))
    .expect("finite fields")
}

fn mined_ledger(blocks: usize, txs_per_block: usize) -> Ledger {
    let mut rng = rand::thread_rng();
    let ledger = Ledger::new(LedgerConfig::default()).expect("genesis");
    let mut seq = 0;
    for _ in 0..blocks {
        for _ in 0..txs_per_block {
            ledger.submit(random_vote(&mut rng, seq));
            seq += 1;
        }
        assert!(matches!(ledger.mine().expect("mine"), MineOutcome::Mined(_)));
    }
    ledger
}

#[test]
fn test_concrete_voting_scenario() {
    let ledger = Ledger::new(LedgerConfig { difficulty: 2 }).unwrap();
    assert_eq!(ledger.len(), 1);

    let tx = Transaction::new(BTreeMap::from([
        ("voter_id".to_string(), FieldValue::from("VOID001")),
        ("party".to_string(), FieldValue::from("Democratic Party")),
    ]))
    .unwrap();
    ledger.submit(tx);

    assert_eq!(ledger.mine().unwrap(), MineOutcome::Mined(1));
    let chain = ledger.chain();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[1].index, 1);
    assert!(chain[1].hash.as_deref().unwrap().starts_with("00"));
    assert!(ledger.pending().is_empty());
    assert_eq!(chain[1].previous_hash, chain[0].hash.clone().unwrap());
}

#[test]
fn test_mined_chain_verifies() {
    let ledger = mined_ledger(8, 3);
    let chain = ledger.chain();
    assert_eq!(chain.len(), 9);
    for pair in chain.windows(2) {
        assert_eq!(Some(pair[1].previous_hash.as_str()), pair[0].hash.as_deref());
        assert_eq!(pair[1].index, pair[0].index + 1);
    }
    for block in &chain[1..] {
        assert!(block.hash.as_deref().unwrap().starts_with("00"));
    }
    assert_eq!(validate_chain(&chain, ledger.difficulty()), Ok(()));
}

#[test]
fn test_tamper_detection() {
    let ledger = mined_ledger(4, 2);
    let mut chain = ledger.chain();

    chain[2].transactions[0]
        .fields
        .insert("party".into(), "Tampered Party".into());
    assert_ne!(chain[2].compute_hash().unwrap(), chain[2].hash.clone().unwrap());
    assert_eq!(
        validate_chain(&chain, ledger.difficulty()),
        Err(ChainViolation::HashMismatch { index: 2 })
    );
}

#[test]
fn test_resealed_tamper_breaks_link() {
    let ledger = mined_ledger(3, 1);
    let mut chain = ledger.chain();

    // Re-mining the tampered block fixes its own hash but not its successor's link.
    chain[1].transactions[0]
        .fields
        .insert("party".into(), "Tampered Party".into());
    let proof = ledger_core::pow::search(&mut chain[1], ledger.difficulty()).unwrap();
    chain[1].hash = Some(proof);
    assert_eq!(
        validate_chain(&chain, ledger.difficulty()),
        Err(ChainViolation::BrokenLink { index: 2 })
    );
}

#[test]
fn test_validate_reports_lowest_violation() {
    let ledger = mined_ledger(5, 1);
    let mut chain = ledger.chain();
    chain[4].nonce += 1;
    chain[2].index = 7;
    assert_eq!(
        validate_chain(&chain, ledger.difficulty()),
        Err(ChainViolation::IndexGap { position: 2, found: 7 })
    );
}

#[test]
fn test_validate_flags_insufficient_work() {
    let ledger = mined_ledger(2, 1);
    let chain = ledger.chain();
    // Every mined hash carries two zeros; demanding far more must fail at block 1.
    assert_eq!(
        validate_chain(&chain, 40),
        Err(ChainViolation::InsufficientWork { index: 1, difficulty: 40 })
    );
}

#[test]
fn test_genesis_tamper_detected() {
    let ledger = mined_ledger(1, 1);
    let mut chain = ledger.chain();
    chain[0].timestamp += 1.0;
    assert_eq!(
        validate_chain(&chain, ledger.difficulty()),
        Err(ChainViolation::BadGenesis)
    );
}

#[test]
fn test_submissions_during_mining_survive() {
    let ledger = Arc::new(Ledger::new(LedgerConfig { difficulty: 3 }).unwrap());
    let mut rng = rand::thread_rng();
    for seq in 0..5 {
        ledger.submit(random_vote(&mut rng, seq));
    }

    let start = Arc::new(Barrier::new(2));
    let mining_done = Arc::new(AtomicBool::new(false));
    let miner = {
        let (ledger, start, done) = (Arc::clone(&ledger), Arc::clone(&start), Arc::clone(&mining_done));
        thread::spawn(move || {
            start.wait();
            let outcome = ledger.mine().unwrap();
            done.store(true, Ordering::SeqCst);
            outcome
        })
    };
    // Submits back to back for as long as the search runs.
    let submitter = {
        let (ledger, start, done) = (Arc::clone(&ledger), Arc::clone(&start), Arc::clone(&mining_done));
        thread::spawn(move || {
            let mut rng = rand::thread_rng();
            start.wait();
            let mut seq = 5;
            while !done.load(Ordering::SeqCst) {
                ledger.submit(random_vote(&mut rng, seq));
                seq += 1;
                thread::yield_now();
            }
            seq
        })
    };
    assert_eq!(miner.join().unwrap(), MineOutcome::Mined(1));
    let submitted = submitter.join().unwrap();

    let seqs = |txs: Vec<Transaction>| -> Vec<i64> {
        txs.iter()
            .map(|tx| match tx.get("seq") {
                Some(FieldValue::Int(seq)) => *seq,
                other => panic!("unexpected seq field {other:?}"),
            })
            .collect()
    };
    let mined = seqs(ledger.block(1).unwrap().transactions);
    let pending = seqs(ledger.pending());
    assert!(!pending.is_empty(), "no submission landed while the block was being searched");

    // The block took a prefix of submission order and the rest stayed queued:
    // nothing lost, nothing duplicated.
    let all: Vec<i64> = mined.iter().chain(&pending).copied().collect();
    assert_eq!(all, (0..submitted as i64).collect::<Vec<_>>());
    assert!(mined.len() >= 5);
    assert_eq!(all.iter().collect::<HashSet<_>>().len(), submitted);

    assert_eq!(ledger.mine().unwrap(), MineOutcome::Mined(2));
    assert_eq!(seqs(ledger.block(2).unwrap().transactions), pending);
    assert!(ledger.pending().is_empty());
    assert_eq!(validate_chain(&ledger.chain(), 3), Ok(()));
}

#[test]
fn test_concurrent_miners_never_fork() {
    let ledger = Arc::new(Ledger::new(LedgerConfig::default()).unwrap());
    let mut rng = rand::thread_rng();
    for seq in 0..12 {
        ledger.submit(random_vote(&mut rng, seq));
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || ledger.mine().unwrap())
        })
        .collect();
    let outcomes: Vec<MineOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let mined = outcomes
        .iter()
        .filter(|o| matches!(o, MineOutcome::Mined(_)))
        .count();
    assert_eq!(mined, 1, "only the first miner finds pending transactions");
    assert!(outcomes.contains(&MineOutcome::NothingToMine));
    assert!(!outcomes.contains(&MineOutcome::Rejected));
    assert_eq!(ledger.len(), 2);
    assert_eq!(validate_chain(&ledger.chain(), ledger.difficulty()), Ok(()));
}

#[test]
fn test_restore_round_trip_through_json() {
    let ledger = mined_ledger(3, 2);
    let json = serde_json::to_string(&ledger.chain()).unwrap();
    let blocks = serde_json::from_str(&json).unwrap();
    let restored = Ledger::restore(blocks, ledger.config()).unwrap();
    assert_eq!(restored.len(), 4);
    assert_eq!(restored.tip().hash, ledger.tip().hash);

    let mut rng = rand::thread_rng();
    restored.submit(random_vote(&mut rng, 99));
    assert_eq!(restored.mine().unwrap(), MineOutcome::Mined(4));
}
