//! End-to-end reconciliation behaviour over real folders and a real ledger
//! file, with scripted collaborator stubs standing in for the OCR engine,
//! the itinerary export, and the portal robot.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use comprova_core::folders::ReceiptFolders;
use comprova_core::ledger::CommitRequest;
use comprova_core::retry::{RetryController, RetrySettings};
use comprova_core::traits::{FieldExtractor, ItinerarySource, PortalSubmitter};
use comprova_core::watch::{InboxWatcher, WatchConfig};
use comprova_core::{
    DuplicateKind, Itinerary, Ledger, Outcome, QuarantineReason, Receipt, ReceiptFields,
    ReceiptKind, ReconcileError, Reconciler, Result, TripSegment,
};

fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 7, 14)
        .unwrap()
        .and_hms_opt(h, m, s)
        .unwrap()
}

fn toll_fields(minute: u32, second: u32) -> ReceiptFields {
    ReceiptFields {
        kind: ReceiptKind::Toll,
        amount_minor: 1250,
        stamp: at(9, minute, second),
    }
}

fn two_leg_itinerary() -> Itinerary {
    Itinerary::new(vec![
        TripSegment {
            start: at(9, 0, 0),
            end: at(9, 30, 0),
        },
        TripSegment {
            start: at(10, 0, 0),
            end: at(10, 30, 0),
        },
    ])
}

/// Extractor that answers by file name, so different drops of the same test
/// can carry different OCR results.
struct StubExtractor {
    by_name: Vec<(String, ReceiptFields)>,
    calls: AtomicUsize,
}

impl StubExtractor {
    fn new(by_name: Vec<(&str, ReceiptFields)>) -> Self {
        Self {
            by_name: by_name
                .into_iter()
                .map(|(name, fields)| (name.to_string(), fields))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl FieldExtractor for StubExtractor {
    async fn extract(&self, path: &Path) -> Result<ReceiptFields> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let name = path.file_name().unwrap().to_string_lossy();
        self.by_name
            .iter()
            .find(|(candidate, _)| *candidate == name)
            .map(|(_, fields)| *fields)
            .ok_or_else(|| ReconcileError::Extraction(format!("no fields scripted for {name}")))
    }
}

struct StubItinerary(Itinerary);

#[async_trait]
impl ItinerarySource for StubItinerary {
    async fn itinerary_for(&self, _day: chrono::NaiveDate) -> Result<Itinerary> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
struct RecordingSubmitter {
    submissions: AtomicUsize,
    fail_first: AtomicUsize,
}

impl RecordingSubmitter {
    fn failing_times(n: usize) -> Self {
        Self {
            submissions: AtomicUsize::new(0),
            fail_first: AtomicUsize::new(n),
        }
    }

    fn count(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PortalSubmitter for RecordingSubmitter {
    async fn submit(&self, _receipt: &Receipt, _segment: &TripSegment) -> Result<()> {
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(ReconcileError::Submission("portal refused".into()));
        }
        self.submissions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Submitter that commits the same record itself before returning, standing
/// in for a concurrent instance winning the race between our dedup check and
/// our ledger commit.
struct RacingSubmitter {
    ledger: Arc<Ledger>,
}

#[async_trait]
impl PortalSubmitter for RacingSubmitter {
    async fn submit(&self, receipt: &Receipt, _segment: &TripSegment) -> Result<()> {
        let rival = CommitRequest {
            hash: receipt.hash.clone(),
            filename: "rival.jpg".to_string(),
            fields: receipt.fields,
        };
        self.ledger.commit(&rival).await?;
        Ok(())
    }
}

struct Harness {
    dir: tempfile::TempDir,
    folders: ReceiptFolders,
    ledger: Arc<Ledger>,
    submitter: Arc<RecordingSubmitter>,
    reconciler: Arc<Reconciler>,
}

impl Harness {
    async fn new(
        extractor: StubExtractor,
        itinerary: Itinerary,
        submitter: RecordingSubmitter,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let folders = ReceiptFolders::new(
            dir.path().join("inbox"),
            dir.path().join("archive"),
            dir.path().join("quarantine"),
        );
        folders.ensure().unwrap();
        let ledger = Arc::new(
            Ledger::open(&dir.path().join("ledger.sqlite3"))
                .await
                .unwrap(),
        );
        let submitter = Arc::new(submitter);
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&ledger),
            Arc::new(extractor),
            Arc::new(StubItinerary(itinerary)),
            Arc::clone(&submitter) as Arc<dyn PortalSubmitter>,
            folders.clone(),
        ));
        Self {
            dir,
            folders,
            ledger,
            submitter,
            reconciler,
        }
    }

    fn drop_receipt(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.folders.inbox.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    fn retry_controller(&self, max_attempts: Option<u32>) -> RetryController {
        RetryController::new(
            Arc::clone(&self.reconciler),
            RetrySettings {
                state_path: self.dir.path().join("retry_state.json"),
                max_attempts,
            },
        )
    }
}

#[tokio::test]
async fn identical_bytes_yield_exactly_one_commit() {
    let harness = Harness::new(
        StubExtractor::new(vec![
            ("a.jpg", toll_fields(15, 0)),
            ("b.jpg", toll_fields(15, 0)),
        ]),
        two_leg_itinerary(),
        RecordingSubmitter::default(),
    )
    .await;

    let a = harness.drop_receipt("a.jpg", b"identical scan bytes");
    let b = harness.drop_receipt("b.jpg", b"identical scan bytes");

    assert_eq!(
        harness.reconciler.process_file(&a).await.unwrap(),
        Outcome::Committed
    );
    assert_eq!(
        harness.reconciler.process_file(&b).await.unwrap(),
        Outcome::DuplicateSkip(DuplicateKind::Physical)
    );

    assert_eq!(harness.submitter.count(), 1);
    let stats = harness.ledger.stats().await.unwrap();
    assert_eq!(stats.physical_rows, 1);
    // Both copies left the inbox.
    assert!(harness.folders.archive.join("a.jpg").exists());
    assert!(harness.folders.archive.join("b.jpg").exists());
}

#[tokio::test]
async fn rescan_with_same_transaction_is_semantic_duplicate() {
    // Same kind and amount, timestamps 40 seconds apart in the same minute,
    // visually different files.
    let harness = Harness::new(
        StubExtractor::new(vec![
            ("scan1.jpg", toll_fields(15, 10)),
            ("scan2.jpg", toll_fields(15, 50)),
        ]),
        two_leg_itinerary(),
        RecordingSubmitter::default(),
    )
    .await;

    let first = harness.drop_receipt("scan1.jpg", b"first scanner pass");
    let second = harness.drop_receipt("scan2.jpg", b"second scanner pass");

    assert_eq!(
        harness.reconciler.process_file(&first).await.unwrap(),
        Outcome::Committed
    );
    assert_eq!(
        harness.reconciler.process_file(&second).await.unwrap(),
        Outcome::DuplicateSkip(DuplicateKind::Semantic)
    );

    assert_eq!(harness.submitter.count(), 1);
    let stats = harness.ledger.stats().await.unwrap();
    assert_eq!(stats.physical_rows, 1);
    assert_eq!(stats.semantic_rows, 1);
}

#[tokio::test]
async fn unmatched_timestamp_quarantines() {
    let harness = Harness::new(
        StubExtractor::new(vec![("late.jpg", {
            let mut fields = toll_fields(0, 0);
            fields.stamp = at(11, 0, 0);
            fields
        })]),
        two_leg_itinerary(),
        RecordingSubmitter::default(),
    )
    .await;

    let path = harness.drop_receipt("late.jpg", b"toll at 11:00");
    assert_eq!(
        harness.reconciler.process_file(&path).await.unwrap(),
        Outcome::Quarantined(QuarantineReason::NoMatch)
    );
    assert_eq!(harness.submitter.count(), 0);
    assert!(harness.folders.quarantine.join("late.jpg").exists());
}

#[tokio::test]
async fn retry_reenters_standard_path_and_succeeds() {
    // Portal fails once, then accepts. The retry sweep must drive the same
    // pipeline and end with exactly one commit.
    let harness = Harness::new(
        StubExtractor::new(vec![("flaky.jpg", toll_fields(15, 0))]),
        two_leg_itinerary(),
        RecordingSubmitter::failing_times(1),
    )
    .await;

    let path = harness.drop_receipt("flaky.jpg", b"flaky submission");
    assert_eq!(
        harness.reconciler.process_file(&path).await.unwrap(),
        Outcome::Quarantined(QuarantineReason::Submission)
    );

    let controller = harness.retry_controller(None);
    let report = controller.run_once().await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.committed, 1);
    assert_eq!(harness.submitter.count(), 1);
    assert!(harness.folders.archive.join("flaky.jpg").exists());
}

#[tokio::test]
async fn retry_of_already_committed_receipt_resolves_as_duplicate() {
    // Crash-restart replay: the receipt was committed, then a copy shows up
    // in quarantine. The sweep must skip it, not submit again.
    let harness = Harness::new(
        StubExtractor::new(vec![
            ("orig.jpg", toll_fields(15, 0)),
            ("replay.jpg", toll_fields(15, 0)),
        ]),
        two_leg_itinerary(),
        RecordingSubmitter::default(),
    )
    .await;

    let orig = harness.drop_receipt("orig.jpg", b"committed earlier");
    assert_eq!(
        harness.reconciler.process_file(&orig).await.unwrap(),
        Outcome::Committed
    );

    fs::write(
        harness.folders.quarantine.join("replay.jpg"),
        b"committed earlier",
    )
    .unwrap();

    let controller = harness.retry_controller(None);
    let report = controller.run_once().await.unwrap();
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.committed, 0);
    assert_eq!(harness.submitter.count(), 1);
}

#[tokio::test]
async fn deferred_file_waits_for_backoff_window() {
    let harness = Harness::new(
        StubExtractor::new(vec![("stuck.jpg", toll_fields(15, 0))]),
        two_leg_itinerary(),
        RecordingSubmitter::failing_times(usize::MAX),
    )
    .await;

    let path = harness.drop_receipt("stuck.jpg", b"always fails");
    harness.reconciler.process_file(&path).await.unwrap();

    let controller = harness.retry_controller(None);

    // First sweep attempts the file, fails, and schedules its next window.
    let first = controller.run_once().await.unwrap();
    assert_eq!(first.quarantined, 1);

    // An immediate second sweep finds the file still inside its window.
    let second = controller.run_once().await.unwrap();
    assert_eq!(second.processed, 0);
    assert_eq!(second.deferred, 1);
}

#[tokio::test]
async fn exhausted_receipt_moves_to_rejected() {
    let harness = Harness::new(
        StubExtractor::new(vec![("doomed.jpg", toll_fields(15, 0))]),
        two_leg_itinerary(),
        RecordingSubmitter::failing_times(usize::MAX),
    )
    .await;

    let path = harness.drop_receipt("doomed.jpg", b"never submits");
    harness.reconciler.process_file(&path).await.unwrap();

    let controller = harness.retry_controller(Some(0));
    let report = controller.run_once().await.unwrap();

    assert_eq!(report.exhausted, 1);
    assert_eq!(report.processed, 0);
    assert!(
        harness
            .folders
            .rejected()
            .join("doomed.jpg")
            .exists()
    );
}

#[tokio::test]
async fn startup_backlog_is_drained() {
    let harness = Harness::new(
        StubExtractor::new(vec![
            ("one.jpg", toll_fields(15, 0)),
            ("two.jpg", toll_fields(16, 0)),
        ]),
        two_leg_itinerary(),
        RecordingSubmitter::default(),
    )
    .await;

    harness.drop_receipt("one.jpg", b"first");
    harness.drop_receipt("two.jpg", b"second");
    harness.drop_receipt("notes.txt", b"not a receipt");

    let watcher = InboxWatcher::new(Arc::clone(&harness.reconciler), WatchConfig::default());
    let report = watcher.process_existing().await.unwrap();

    assert_eq!(report.processed, 2);
    assert_eq!(report.committed, 2);
    assert_eq!(harness.submitter.count(), 2);
    assert!(harness.folders.inbox.join("notes.txt").exists());
}

#[tokio::test]
async fn commit_race_with_concurrent_submitter_resolves_as_duplicate() {
    // Another instance commits the same receipt between our dedup check and
    // our own commit. The orchestrator must treat its losing commit as a
    // duplicate skip and archive the file, never as a failure.
    let dir = tempfile::tempdir().unwrap();
    let folders = ReceiptFolders::new(
        dir.path().join("inbox"),
        dir.path().join("archive"),
        dir.path().join("quarantine"),
    );
    folders.ensure().unwrap();
    let ledger = Arc::new(
        Ledger::open(&dir.path().join("ledger.sqlite3"))
            .await
            .unwrap(),
    );
    let reconciler = Reconciler::new(
        Arc::clone(&ledger),
        Arc::new(StubExtractor::new(vec![("raced.jpg", toll_fields(15, 0))])),
        Arc::new(StubItinerary(two_leg_itinerary())),
        Arc::new(RacingSubmitter {
            ledger: Arc::clone(&ledger),
        }),
        folders.clone(),
    );

    let path = folders.inbox.join("raced.jpg");
    fs::write(&path, b"raced scan bytes").unwrap();

    let outcome = reconciler.process_file(&path).await.unwrap();
    assert!(matches!(outcome, Outcome::DuplicateSkip(_)));
    assert!(folders.archive.join("raced.jpg").exists());
    assert!(!folders.quarantine.join("raced.jpg").exists());

    // Exactly one committed record survives: the rival's.
    let stats = ledger.stats().await.unwrap();
    assert_eq!(stats.physical_rows, 1);
    assert_eq!(stats.semantic_rows, 1);
}

#[tokio::test]
async fn backoff_entry_follows_inbox_rename() {
    // Retrying while a fresh file with the same name sits in the inbox
    // renames the retried copy. Its attempt count must move with it instead
    // of starting over under the new name.
    let harness = Harness::new(
        StubExtractor::new(vec![
            ("dup.jpg", toll_fields(15, 0)),
            ("dup__1.jpg", toll_fields(15, 0)),
        ]),
        two_leg_itinerary(),
        RecordingSubmitter::failing_times(usize::MAX),
    )
    .await;

    let path = harness.drop_receipt("dup.jpg", b"keeps failing");
    harness.reconciler.process_file(&path).await.unwrap();

    // A new, unrelated scan with the same name arrives before the sweep.
    harness.drop_receipt("dup.jpg", b"different fresh scan");

    let controller = harness.retry_controller(None);
    let first = controller.run_once().await.unwrap();
    assert_eq!(first.quarantined, 1);
    assert!(harness.folders.quarantine.join("dup__1.jpg").exists());

    let state: serde_json::Value = serde_json::from_slice(
        &fs::read(harness.dir.path().join("retry_state.json")).unwrap(),
    )
    .unwrap();
    assert!(state.get("dup.jpg").is_none());
    assert_eq!(state["dup__1.jpg"]["attempts"], 1);

    // The renamed copy is still inside its backoff window, so an immediate
    // second sweep defers it rather than counting from scratch.
    let second = controller.run_once().await.unwrap();
    assert_eq!(second.processed, 0);
    assert_eq!(second.deferred, 1);
}

#[tokio::test]
async fn parking_receipt_matches_gap_between_legs() {
    let fields = ReceiptFields {
        kind: ReceiptKind::Parking,
        amount_minor: 800,
        stamp: at(9, 45, 0),
    };
    let harness = Harness::new(
        StubExtractor::new(vec![("parking.jpg", fields)]),
        two_leg_itinerary(),
        RecordingSubmitter::default(),
    )
    .await;

    let path = harness.drop_receipt("parking.jpg", b"parking stub");
    assert_eq!(
        harness.reconciler.process_file(&path).await.unwrap(),
        Outcome::Committed
    );
    assert_eq!(harness.submitter.count(), 1);
}
