//! Temporal matching of receipts to trip segments.
//!
//! Pure and stateless: the same (kind, timestamp, itinerary) always yields
//! the same answer, which keeps retries deterministic. Tolls match the
//! segment whose inclusive `[start, end]` window contains the timestamp;
//! parking matches the inclusive gap `[end_i, start_i+1]` between two legs
//! and is attributed to the leg the driver parked after.

use chrono::NaiveDateTime;
use tracing::warn;

use crate::types::{Itinerary, ReceiptKind, TripSegment};

/// Result of matching one receipt timestamp against the itinerary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// The segment the submission should be filed against.
    Segment(TripSegment),
    NoMatch,
}

/// Assign a receipt to a trip segment, or report that none fits.
///
/// An empty itinerary never matches. Parking timestamps before the first
/// segment's start or after the last segment's end never match either: a
/// parking event is modeled strictly as occurring between two legs.
pub fn match_receipt(
    kind: ReceiptKind,
    stamp: NaiveDateTime,
    itinerary: &Itinerary,
) -> MatchResult {
    let segments = itinerary.segments();
    if segments.is_empty() {
        return MatchResult::NoMatch;
    }

    match kind {
        ReceiptKind::Toll => match_toll(stamp, segments),
        ReceiptKind::Parking => match_parking(stamp, segments),
    }
}

fn match_toll(stamp: NaiveDateTime, segments: &[TripSegment]) -> MatchResult {
    let mut containing = segments.iter().filter(|segment| segment.contains(stamp));

    match containing.next() {
        None => MatchResult::NoMatch,
        Some(first) => {
            // Segments are non-overlapping by upstream construction, so more
            // than one hit is a data defect. First in start order wins.
            let extra = containing.count();
            if extra > 0 {
                warn!(
                    stamp = %stamp,
                    ambiguous = extra + 1,
                    "overlapping itinerary segments; selecting the earliest"
                );
            }
            MatchResult::Segment(*first)
        }
    }
}

fn match_parking(stamp: NaiveDateTime, segments: &[TripSegment]) -> MatchResult {
    for pair in segments.windows(2) {
        let (before, after) = (pair[0], pair[1]);
        if before.end <= stamp && stamp <= after.start {
            return MatchResult::Segment(before);
        }
    }
    MatchResult::NoMatch
}
