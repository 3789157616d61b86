use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DuplicateKind, ReconcileError, Result};

/// Receipt category recognized by the OCR collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptKind {
    Toll,
    Parking,
}

impl ReceiptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Toll => "toll",
            Self::Parking => "parking",
        }
    }
}

impl fmt::Display for ReceiptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReceiptKind {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "toll" => Ok(Self::Toll),
            "parking" => Ok(Self::Parking),
            other => Err(ReconcileError::Extraction(format!(
                "unrecognized receipt kind '{other}'"
            ))),
        }
    }
}

/// Fields produced by OCR extraction for one receipt.
///
/// Amounts are minor currency units (cents); timestamps are local wall-clock
/// with whatever sub-minute precision the scan happened to yield. Minute
/// truncation is applied by [`SemanticKey`], not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptFields {
    pub kind: ReceiptKind,
    pub amount_minor: i64,
    pub stamp: NaiveDateTime,
}

impl ReceiptFields {
    /// Strict-OCR gate: a receipt is only submitted when every field is
    /// trustworthy. Anything else counts as a failed extraction.
    pub fn validate(&self) -> Result<()> {
        if self.amount_minor <= 0 {
            return Err(ReconcileError::Extraction(format!(
                "non-positive amount {}",
                self.amount_minor
            )));
        }
        Ok(())
    }
}

/// Semantic transaction identity: two scans with the same kind, the same
/// amount, and timestamps in the same minute are one real-world transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SemanticKey {
    pub kind: ReceiptKind,
    pub stamp_minute: String,
    pub amount_minor: i64,
}

impl SemanticKey {
    pub fn new(kind: ReceiptKind, stamp: NaiveDateTime, amount_minor: i64) -> Self {
        Self {
            kind,
            stamp_minute: truncate_to_minute(stamp),
            amount_minor,
        }
    }
}

impl From<&ReceiptFields> for SemanticKey {
    fn from(fields: &ReceiptFields) -> Self {
        Self::new(fields.kind, fields.stamp, fields.amount_minor)
    }
}

/// Minute-resolution form used for the semantic key. Absorbs seconds-level
/// OCR jitter without conflating distinct transactions.
pub fn truncate_to_minute(stamp: NaiveDateTime) -> String {
    stamp
        .with_second(0)
        .and_then(|s| s.with_nanosecond(0))
        .unwrap_or(stamp)
        .format("%Y-%m-%dT%H:%M")
        .to_string()
}

/// One candidate unit of work flowing through the reconciler.
#[derive(Debug, Clone)]
pub struct Receipt {
    /// Correlation id for logs; one per processing attempt.
    pub id: Uuid,
    pub path: PathBuf,
    pub hash: String,
    pub fields: ReceiptFields,
}

/// A time-bounded leg of the external itinerary. Read-only to this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripSegment {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TripSegment {
    /// Inclusive on both bounds: a toll stamped at the exact end of a segment
    /// belongs to that segment, not to the following gap.
    pub fn contains(&self, stamp: NaiveDateTime) -> bool {
        self.start <= stamp && stamp <= self.end
    }
}

/// Ordered, non-overlapping (by upstream construction) trip segments.
///
/// Ordering is enforced here so the matcher can rely on it; overlap is an
/// upstream data defect the matcher reports but tolerates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Itinerary {
    segments: Vec<TripSegment>,
}

impl Itinerary {
    pub fn new(mut segments: Vec<TripSegment>) -> Self {
        segments.sort_by_key(|segment| segment.start);
        Self { segments }
    }

    pub fn segments(&self) -> &[TripSegment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Why a receipt landed in quarantine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineReason {
    /// The receipt file could not be read or hashed.
    Unreadable,
    /// The OCR collaborator could not produce trustworthy fields.
    Extraction,
    /// The itinerary collaborator failed.
    Itinerary,
    /// No trip segment fits the receipt timestamp.
    NoMatch,
    /// The portal collaborator reported failure.
    Submission,
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreadable => f.write_str("unreadable"),
            Self::Extraction => f.write_str("extraction"),
            Self::Itinerary => f.write_str("itinerary"),
            Self::NoMatch => f.write_str("no-match"),
            Self::Submission => f.write_str("submission"),
        }
    }
}

/// Terminal outcome of processing one receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Submitted and durably recorded in both ledger tables.
    Committed,
    /// Legitimate skip; the file was archived, nothing was submitted.
    DuplicateSkip(DuplicateKind),
    /// Failed this attempt; eligible for retry from quarantine.
    Quarantined(QuarantineReason),
}

/// Counters for one processing pass (inbox drain or quarantine sweep).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingReport {
    pub processed: usize,
    pub committed: usize,
    pub duplicates: usize,
    pub quarantined: usize,
    /// Skipped because the file is still inside its backoff window.
    pub deferred: usize,
    /// Moved to the permanent-failure area after exhausting max attempts.
    pub exhausted: usize,
}

impl ProcessingReport {
    pub fn record(&mut self, outcome: &Outcome) {
        self.processed += 1;
        match outcome {
            Outcome::Committed => self.committed += 1,
            Outcome::DuplicateSkip(_) => self.duplicates += 1,
            Outcome::Quarantined(_) => self.quarantined += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn stamp(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 7, 14)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn test_semantic_key_truncates_to_minute() {
        let a = SemanticKey::new(ReceiptKind::Toll, stamp(9, 15, 3), 1250);
        let b = SemanticKey::new(ReceiptKind::Toll, stamp(9, 15, 58), 1250);
        assert_eq!(a, b);
        assert_eq!(a.stamp_minute, "2025-07-14T09:15");

        let c = SemanticKey::new(ReceiptKind::Toll, stamp(9, 16, 0), 1250);
        assert_ne!(a, c);
    }

    #[test]
    fn test_kind_round_trip() {
        assert_eq!("toll".parse::<ReceiptKind>().unwrap(), ReceiptKind::Toll);
        assert_eq!(
            " Parking ".parse::<ReceiptKind>().unwrap(),
            ReceiptKind::Parking
        );
        assert!("fuel".parse::<ReceiptKind>().is_err());
    }

    #[test]
    fn test_validate_rejects_non_positive_amount() {
        let fields = ReceiptFields {
            kind: ReceiptKind::Parking,
            amount_minor: 0,
            stamp: stamp(10, 0, 0),
        };
        assert!(fields.validate().is_err());
    }

    #[test]
    fn test_itinerary_orders_segments() {
        let late = TripSegment {
            start: stamp(10, 0, 0),
            end: stamp(10, 30, 0),
        };
        let early = TripSegment {
            start: stamp(9, 0, 0),
            end: stamp(9, 30, 0),
        };
        let itinerary = Itinerary::new(vec![late, early]);
        assert_eq!(itinerary.segments()[0], early);
        assert_eq!(itinerary.segments()[1], late);
    }
}
