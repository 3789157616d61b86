//! Collaborator seams.
//!
//! OCR extraction, itinerary retrieval, and portal submission are external
//! programs; the core only sees these traits. The daemon wires command-line
//! adapters, tests wire stubs or mocks.

use std::path::Path;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::Result;
use crate::types::{Itinerary, Receipt, ReceiptFields, TripSegment};

/// Extracts structured fields from a receipt image.
///
/// The core does not retry extraction internally; failed files go to
/// quarantine and come back through the retry sweep.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FieldExtractor: Send + Sync {
    async fn extract(&self, path: &Path) -> Result<ReceiptFields>;
}

/// Supplies the ordered trip segments relevant to a receipt's date.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ItinerarySource: Send + Sync {
    async fn itinerary_for(&self, day: NaiveDate) -> Result<Itinerary>;
}

/// Performs the portal submission for a matched receipt.
///
/// Diagnostic artifacts a failed submission may produce (screenshots, portal
/// logs) are the collaborator's concern; the core only sees the error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PortalSubmitter: Send + Sync {
    async fn submit(&self, receipt: &Receipt, segment: &TripSegment) -> Result<()>;
}
