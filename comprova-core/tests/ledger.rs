//! Ledger behaviour against a real SQLite file: dual-insert atomicity,
//! duplicate detection on either key, retention purge, and durability across
//! reopen.

use chrono::{NaiveDate, NaiveDateTime};
use comprova_core::ledger::{CommitRequest, Ledger, PurgeScope};
use comprova_core::{DuplicateKind, ReconcileError, ReceiptFields, ReceiptKind, SemanticKey};

fn stamp(h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 7, 14)
        .unwrap()
        .and_hms_opt(h, m, s)
        .unwrap()
}

fn request(hash: &str, minute: u32, second: u32) -> CommitRequest {
    CommitRequest {
        hash: hash.to_string(),
        filename: format!("{hash}.jpg"),
        fields: ReceiptFields {
            kind: ReceiptKind::Toll,
            amount_minor: 1250,
            stamp: stamp(9, minute, second),
        },
    }
}

#[tokio::test]
async fn commit_then_lookup_both_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(&dir.path().join("ledger.sqlite3")).await.unwrap();

    let req = request("aaa111", 15, 42);
    assert!(!ledger.is_known_physical(&req.hash).await.unwrap());
    ledger.commit(&req).await.unwrap();

    assert!(ledger.is_known_physical("aaa111").await.unwrap());
    // Seconds-level jitter resolves to the same semantic record.
    let jittered = SemanticKey::new(ReceiptKind::Toll, stamp(9, 15, 3), 1250);
    assert!(ledger.is_known_semantic(&jittered).await.unwrap());
    // A different minute is a different transaction.
    let other = SemanticKey::new(ReceiptKind::Toll, stamp(9, 16, 0), 1250);
    assert!(!ledger.is_known_semantic(&other).await.unwrap());
}

#[tokio::test]
async fn duplicate_hash_is_rejected_at_commit() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(&dir.path().join("ledger.sqlite3")).await.unwrap();

    ledger.commit(&request("samehash", 15, 0)).await.unwrap();
    let err = ledger.commit(&request("samehash", 45, 0)).await.unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::Duplicate {
            kind: DuplicateKind::Physical
        }
    ));
}

#[tokio::test]
async fn semantic_collision_rolls_back_physical_row() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(&dir.path().join("ledger.sqlite3")).await.unwrap();

    ledger.commit(&request("firstscan", 15, 10)).await.unwrap();

    // Different bytes, same (kind, minute, amount): the semantic insert fails
    // and the already-inserted physical row must not survive the transaction.
    let err = ledger.commit(&request("rescanned", 15, 55)).await.unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::Duplicate {
            kind: DuplicateKind::Semantic
        }
    ));

    assert!(!ledger.is_known_physical("rescanned").await.unwrap());
    let stats = ledger.stats().await.unwrap();
    assert_eq!(stats.physical_rows, 1);
    assert_eq!(stats.semantic_rows, 1);
}

#[tokio::test]
async fn records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.sqlite3");

    {
        let ledger = Ledger::open(&path).await.unwrap();
        ledger.commit(&request("durable", 15, 0)).await.unwrap();
        ledger.close().await;
    }

    let reopened = Ledger::open(&path).await.unwrap();
    assert!(reopened.is_known_physical("durable").await.unwrap());
    let key = SemanticKey::new(ReceiptKind::Toll, stamp(9, 15, 0), 1250);
    assert!(reopened.is_known_semantic(&key).await.unwrap());
}

#[tokio::test]
async fn purge_is_scoped_and_leaves_recent_rows() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(&dir.path().join("ledger.sqlite3")).await.unwrap();

    ledger.commit(&request("fresh", 15, 0)).await.unwrap();

    // Rows were just created, so any positive age threshold keeps them.
    assert_eq!(ledger.purge(30, PurgeScope::Both).await.unwrap(), 0);

    // SQLite timestamps have second resolution; let the rows age past "now"
    // so a zero-day threshold sees them as old.
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    // Zero-day threshold removes everything in the selected scope only.
    let deleted = ledger.purge(0, PurgeScope::Physical).await.unwrap();
    assert_eq!(deleted, 1);
    let stats = ledger.stats().await.unwrap();
    assert_eq!(stats.physical_rows, 0);
    assert_eq!(stats.semantic_rows, 1);
}

#[tokio::test]
async fn admin_listing_and_search() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(&dir.path().join("ledger.sqlite3")).await.unwrap();

    ledger.commit(&request("abc123", 15, 0)).await.unwrap();
    ledger.commit(&request("def456", 16, 0)).await.unwrap();

    assert_eq!(ledger.list_physical(None).await.unwrap().len(), 2);
    assert_eq!(ledger.list_physical(Some(1)).await.unwrap().len(), 1);
    assert_eq!(ledger.list_semantic(None).await.unwrap().len(), 2);

    let found = ledger.find_physical("abc").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].hash, "abc123");

    assert_eq!(ledger.delete_physical("def").await.unwrap(), 1);
    assert_eq!(ledger.list_physical(None).await.unwrap().len(), 1);
}
