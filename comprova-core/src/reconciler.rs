//! Reconciliation orchestrator.
//!
//! One re-entrant entry point, [`Reconciler::process_file`], drives a receipt
//! through a strictly forward state machine: hash -> physical dedup ->
//! extract -> semantic dedup -> match -> submit -> commit. The ledger is
//! written only after the portal reports success, so it never records an
//! un-submitted receipt. Fresh inbox discovery and the quarantine retry sweep
//! both call this same path, which is what keeps retries subject to both
//! dedup checks.

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::digest;
use crate::error::{DuplicateKind, ReconcileError, Result};
use crate::folders::ReceiptFolders;
use crate::ledger::{CommitRequest, Ledger};
use crate::matcher::{MatchResult, match_receipt};
use crate::traits::{FieldExtractor, ItinerarySource, PortalSubmitter};
use crate::types::{Outcome, QuarantineReason, Receipt, SemanticKey};

pub struct Reconciler {
    ledger: Arc<Ledger>,
    extractor: Arc<dyn FieldExtractor>,
    itineraries: Arc<dyn ItinerarySource>,
    submitter: Arc<dyn PortalSubmitter>,
    folders: ReceiptFolders,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("folders", &self.folders)
            .finish()
    }
}

impl Reconciler {
    pub fn new(
        ledger: Arc<Ledger>,
        extractor: Arc<dyn FieldExtractor>,
        itineraries: Arc<dyn ItinerarySource>,
        submitter: Arc<dyn PortalSubmitter>,
        folders: ReceiptFolders,
    ) -> Self {
        Self {
            ledger,
            extractor,
            itineraries,
            submitter,
            folders,
        }
    }

    pub fn folders(&self) -> &ReceiptFolders {
        &self.folders
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Process one receipt file to a terminal state.
    ///
    /// `Ok(outcome)` always leaves the file moved out of the inbox (archive
    /// for committed/duplicate, quarantine for failures). `Err` is reserved
    /// for ledger/IO trouble that must abort the surrounding pass; the file
    /// stays where it is for a later attempt.
    pub async fn process_file(&self, path: &Path) -> Result<Outcome> {
        let id = Uuid::now_v7();
        info!(receipt = %id, path = %path.display(), "processing receipt");

        // Cheap check first: hash before invoking OCR.
        let hash = match digest::file_digest_async(path.to_path_buf()).await {
            Ok(hash) => hash,
            Err(err) => {
                warn!(receipt = %id, path = %path.display(), error = %err, "unreadable receipt");
                return self.quarantine(path, QuarantineReason::Unreadable);
            }
        };

        if self.ledger.is_known_physical(&hash).await? {
            info!(receipt = %id, hash = %hash, "known file content; skipping");
            return self.archive_duplicate(path, DuplicateKind::Physical);
        }

        let fields = match self.extractor.extract(path).await.and_then(|fields| {
            fields.validate()?;
            Ok(fields)
        }) {
            Ok(fields) => fields,
            Err(ReconcileError::Ledger(err)) => return Err(ReconcileError::Ledger(err)),
            Err(err) => {
                warn!(receipt = %id, path = %path.display(), error = %err, "extraction failed");
                return self.quarantine(path, QuarantineReason::Extraction);
            }
        };
        info!(
            receipt = %id,
            kind = %fields.kind,
            stamp = %fields.stamp,
            amount_minor = fields.amount_minor,
            "fields extracted"
        );

        let key = SemanticKey::from(&fields);
        if self.ledger.is_known_semantic(&key).await? {
            info!(
                receipt = %id,
                minute = %key.stamp_minute,
                "known transaction (kind/minute/amount); skipping rescan"
            );
            return self.archive_duplicate(path, DuplicateKind::Semantic);
        }

        let itinerary = match self.itineraries.itinerary_for(fields.stamp.date()).await {
            Ok(itinerary) => itinerary,
            Err(err) => {
                warn!(receipt = %id, error = %err, "itinerary retrieval failed");
                return self.quarantine(path, QuarantineReason::Itinerary);
            }
        };

        let segment = match match_receipt(fields.kind, fields.stamp, &itinerary) {
            MatchResult::Segment(segment) => segment,
            MatchResult::NoMatch => {
                warn!(
                    receipt = %id,
                    stamp = %fields.stamp,
                    "no trip segment fits the receipt timestamp"
                );
                return self.quarantine(path, QuarantineReason::NoMatch);
            }
        };

        let receipt = Receipt {
            id,
            path: path.to_path_buf(),
            hash: hash.clone(),
            fields,
        };

        if let Err(err) = self.submitter.submit(&receipt, &segment).await {
            warn!(receipt = %id, error = %err, "portal submission failed");
            return self.quarantine(path, QuarantineReason::Submission);
        }

        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let commit = CommitRequest {
            hash,
            filename,
            fields,
        };
        match self.ledger.commit(&commit).await {
            Ok(()) => {}
            Err(ReconcileError::Duplicate { kind }) => {
                // Lost a race with another committer after our own submission
                // already went through. Nothing to roll back on the portal;
                // surface it loudly and archive.
                warn!(
                    receipt = %id,
                    duplicate = %kind,
                    "ledger commit raced a concurrent submission"
                );
                return self.archive_duplicate(path, kind);
            }
            Err(err) => {
                // Submitted but not recorded. This must stop the pass; on the
                // next attempt the semantic check against a repaired ledger
                // is the only line of defense, so do not quietly continue.
                error!(receipt = %id, error = %err, "ledger commit failed after submission");
                return Err(err);
            }
        }

        let archived = ReceiptFolders::move_into(path, &self.folders.archive)?;
        info!(receipt = %id, archived = %archived.display(), "receipt committed");
        Ok(Outcome::Committed)
    }

    fn archive_duplicate(&self, path: &Path, kind: DuplicateKind) -> Result<Outcome> {
        ReceiptFolders::move_into(path, &self.folders.archive)?;
        Ok(Outcome::DuplicateSkip(kind))
    }

    fn quarantine(&self, path: &Path, reason: QuarantineReason) -> Result<Outcome> {
        let moved = ReceiptFolders::move_into(path, &self.folders.quarantine)?;
        info!(
            path = %moved.display(),
            reason = %reason,
            "receipt quarantined"
        );
        Ok(Outcome::Quarantined(reason))
    }
}
