//! # Comprova Core
//!
//! Core library for the comprova receipt reconciler. Scanned toll and parking
//! receipts dropped into a watched inbox are hashed, OCR-extracted, matched to
//! a trip segment on an external itinerary, and submitted to the expense
//! portal - with a two-tier ledger guaranteeing no receipt is ever submitted
//! twice.
//!
//! ## Overview
//!
//! The crate is organized into several key modules:
//!
//! - [`ledger`]: Durable dedup ledger (physical file identity + semantic
//!   transaction identity), backed by a single SQLite file
//! - [`matcher`]: Pure temporal matcher assigning a receipt to a trip-segment
//!   window or to the parking gap between two legs
//! - [`reconciler`]: The single re-entrant processing path driving one receipt
//!   from discovery to a terminal state
//! - [`retry`]: Quarantine sweep with per-file backoff, re-entering the same
//!   reconciler path
//! - [`watch`]: Inbox watcher bridging `notify` events onto the runtime
//! - [`traits`]: Collaborator seams for OCR extraction, itinerary retrieval,
//!   and portal submission
//!
//! OCR itself, the portal robot, and itinerary export are external programs;
//! this crate only coordinates them.

/// Collaborator seams (OCR extraction, itinerary retrieval, portal submission)
pub mod traits;

/// Runtime configuration model and loader
pub mod config;

/// Content hashing for physical receipt identity
pub mod digest;

/// Error types shared across the pipeline
pub mod error;

/// Inbox / archive / quarantine folder layout and atomic moves
pub mod folders;

/// Durable two-tier dedup ledger
pub mod ledger;

/// Temporal matching of receipts to trip segments
pub mod matcher;

/// Reconciliation orchestrator (one receipt, forward-only state machine)
pub mod reconciler;

/// Quarantine retry controller with per-file backoff
pub mod retry;

/// Domain types: receipts, semantic keys, itineraries, outcomes
pub mod types;

/// Inbox watcher built on `notify`
pub mod watch;

pub use config::AppConfig;
pub use error::{DuplicateKind, ReconcileError, Result};
pub use ledger::Ledger;
pub use reconciler::Reconciler;
pub use retry::RetryController;
pub use types::{
    Itinerary, Outcome, ProcessingReport, QuarantineReason, Receipt, ReceiptFields,
    ReceiptKind, SemanticKey, TripSegment,
};
