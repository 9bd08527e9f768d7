use audit_ledger::audit::event::decode_hash;
use audit_ledger::audit::verify::BreakReason;
use audit_ledger::audit::{BatchRange, EventRecorder, MerkleRoot, VerificationOutcome};
use audit_ledger::database::{BatchStore, EventStore, ProofStore, SqliteStore, StoredEntry};
use audit_ledger::ots::ProofStatus;
use audit_ledger::LedgerError;
use chrono::Utc;
use std::sync::Arc;
use tempfile::TempDir;

mod common;
use common::*;

fn database_url(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("ledger.db").display())
}

#[tokio::test]
async fn test_sqlite_ledger_end_to_end() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::connect(&database_url(&dir)).await.unwrap());
    let t = setup_ledger(store.clone()).await;
    let ledger = &t.ledger;

    let mut events = Vec::new();
    for i in 0..4 {
        events.push(ledger.recorder().record(payment_event(100 + i)).await.unwrap());
    }

    let stored = store.get(&events[2].id).await.unwrap().unwrap();
    assert_eq!(stored.as_event(), Some(&events[2]));

    let root = ledger.aggregator().aggregate("main", 0..=3).await.unwrap().unwrap();
    assert_eq!(store.get_root(&root.batch_id).await.unwrap(), Some(root.clone()));

    let proof = ledger.anchor().anchor(&root).await.unwrap();
    t.notary.confirm(&decode_hash(&root.root).unwrap(), 12).await;
    let report = ledger.upgrader().upgrade_all().await.unwrap();
    assert_eq!(report.verified, 1, "{}", report.summary());

    let outcome = ledger.verifier().verify_event(&events[1].id, &proof.proof_id).await.unwrap();
    assert_eq!(outcome, VerificationOutcome::Verified);
}

#[tokio::test]
async fn test_sqlite_append_rejects_stale_head() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let first = EventRecorder::open("main", store.clone()).await.unwrap();
    let second = EventRecorder::open("main", store.clone()).await.unwrap();

    let committed = first.record(login_event("alice")).await.unwrap();

    // second recorder still believes the chain is empty
    let err = second.record(login_event("mallory")).await.unwrap_err();
    assert!(matches!(err, LedgerError::PersistenceFailure(_)));

    // and resyncs, so the retry lands after the committed event
    let retried = second.record(login_event("mallory")).await.unwrap();
    assert_eq!(retried.sequence, 1);
    assert_eq!(retried.previous_hash, committed.hash);
}

#[tokio::test]
async fn test_sqlite_reopen_restores_head() {
    let dir = TempDir::new().unwrap();
    let url = database_url(&dir);

    let last = {
        let store = Arc::new(SqliteStore::connect(&url).await.unwrap());
        let recorder = EventRecorder::open("main", store).await.unwrap();
        let mut last = None;
        for i in 0..3 {
            last = Some(recorder.record(system_event(i)).await.unwrap());
        }
        last.unwrap()
    };

    let store = Arc::new(SqliteStore::connect(&url).await.unwrap());
    let recorder = EventRecorder::open("main", store.clone()).await.unwrap();
    assert_eq!(recorder.head_hash().await, last.hash);
    assert_eq!(recorder.len().await, 3);

    let next = recorder.record(system_event(3)).await.unwrap();
    assert_eq!(next.sequence, 3);
    assert_eq!(next.previous_hash, last.hash);
}

#[tokio::test]
async fn test_sqlite_purge_keeps_tombstone() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let recorder = EventRecorder::open("main", store.clone()).await.unwrap();
    let event = recorder.record(payment_event(42)).await.unwrap();

    let tombstone = store.purge(&event.id, Utc::now()).await.unwrap();
    assert_eq!(tombstone.hash, event.hash);
    assert_eq!(tombstone.previous_hash, event.previous_hash);

    match store.get(&event.id).await.unwrap() {
        Some(StoredEntry::Tombstone(t)) => {
            assert_eq!(t.sequence, 0);
            assert_eq!(t.hash, event.hash);
        }
        other => panic!("expected tombstone, got {:?}", other),
    }

    let err = store.purge(&event.id, Utc::now()).await.unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));
}

#[tokio::test]
async fn test_sqlite_rejects_overlapping_batches() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let recorder = EventRecorder::open("main", store.clone()).await.unwrap();
    let mut hashes = Vec::new();
    let mut events = Vec::new();
    for i in 0..4 {
        let event = recorder.record(system_event(i)).await.unwrap();
        hashes.push(event.hash.clone());
        events.push(event);
    }

    let range = |first: usize, last: usize| BatchRange {
        first_event_id: events[first].id.clone(),
        last_event_id: events[last].id.clone(),
        first_sequence: first as u64,
        last_sequence: last as u64,
    };

    let first = MerkleRoot::new("main", hashes[0..3].to_vec(), range(0, 2)).unwrap();
    store.save_root(&first).await.unwrap();

    let overlapping = MerkleRoot::new("main", hashes[2..4].to_vec(), range(2, 3)).unwrap();
    let err = store.save_root(&overlapping).await.unwrap_err();
    assert!(matches!(err, LedgerError::InvalidRange(_)));

    let next = MerkleRoot::new("main", hashes[3..4].to_vec(), range(3, 3)).unwrap();
    store.save_root(&next).await.unwrap();

    let roots = store.list_roots("main").await.unwrap();
    assert_eq!(roots, vec![first.clone(), next]);
    assert_eq!(store.root_containing("main", 1).await.unwrap(), Some(first));
}

#[tokio::test]
async fn test_sqlite_proof_status_never_regresses() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let t = setup_ledger(store.clone()).await;
    for i in 0..2 {
        t.ledger.recorder().record(system_event(i)).await.unwrap();
    }
    let root = t.ledger.aggregator().aggregate("main", 0..=1).await.unwrap().unwrap();
    let mut proof = t.ledger.anchor().anchor(&root).await.unwrap();

    proof.transition(ProofStatus::Upgraded).unwrap();
    store.save_proof(&proof).await.unwrap();
    proof.transition(ProofStatus::Verified).unwrap();
    proof.block_height = Some(7);
    store.save_proof(&proof).await.unwrap();

    let mut stale = proof.clone();
    stale.status = ProofStatus::Pending;
    let err = store.save_proof(&stale).await.unwrap_err();
    assert!(matches!(err, LedgerError::IntegrityViolation(_)));

    let stored = store.get_proof(&proof.proof_id).await.unwrap().unwrap();
    assert_eq!(stored.status, ProofStatus::Verified);
    assert_eq!(stored.block_height, Some(7));
    assert_eq!(
        store.proofs_with_status(&[ProofStatus::Verified]).await.unwrap().len(),
        1
    );
    assert!(store
        .proofs_with_status(&[ProofStatus::Pending, ProofStatus::Upgraded])
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_sqlite_body_edit_is_detected() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let t = setup_ledger(store.clone()).await;
    let mut events = Vec::new();
    for i in 0..3 {
        events.push(t.ledger.recorder().record(payment_event(500 + i)).await.unwrap());
    }

    sqlx::query("UPDATE audit_events SET body = replace(body, 'capture', 'refund') WHERE id = ?")
        .bind(&events[1].id)
        .execute(store.pool())
        .await
        .unwrap();

    let report = t.ledger.verifier().verify_chain("main").await.unwrap();
    let broken = report.broken_at.expect("edited body must break the chain");
    assert_eq!(broken.event_id, events[1].id);
}

#[tokio::test]
async fn test_sqlite_undecodable_row_breaks_chain() {
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let t = setup_ledger(store.clone()).await;
    let mut events = Vec::new();
    for i in 0..3 {
        events.push(t.ledger.recorder().record(payment_event(700 + i)).await.unwrap());
    }
    let root = t.ledger.aggregator().aggregate("main", 0..=2).await.unwrap().unwrap();
    let proof = t.ledger.anchor().anchor(&root).await.unwrap();

    // a stray quote leaves the stored body unparseable
    sqlx::query("UPDATE audit_events SET body = replace(body, 'captured', 'captur\"d') WHERE id = ?")
        .bind(&events[1].id)
        .execute(store.pool())
        .await
        .unwrap();

    match store.get(&events[1].id).await.unwrap() {
        Some(StoredEntry::Corrupt(c)) => assert_eq!(c.hash, events[1].hash),
        other => panic!("expected a corrupt entry, got {:?}", other),
    }

    let report = t.ledger.verifier().verify_chain("main").await.unwrap();
    let broken = report.broken_at.expect("undecodable row must break the chain");
    assert_eq!(broken.event_id, events[1].id);
    assert_eq!(broken.reason, BreakReason::Undecodable);

    let outcome = t.ledger.verifier().verify_event(&events[0].id, &proof.proof_id).await.unwrap();
    assert_eq!(outcome, VerificationOutcome::ChainBroken(events[1].id.clone()));
}
