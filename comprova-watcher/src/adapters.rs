//! Command-line collaborator adapters.
//!
//! The OCR engine and the portal robot are separate programs; the daemon
//! drives them through child processes. The itinerary comes from a JSON
//! export refreshed out of band. All three stay behind the core's traits so
//! the pipeline never learns how they work.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use comprova_core::traits::{FieldExtractor, ItinerarySource, PortalSubmitter};
use comprova_core::{
    Itinerary, Receipt, ReceiptFields, ReceiptKind, ReconcileError, Result, TripSegment,
};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

const STAMP_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"];

fn parse_stamp(raw: &str) -> Result<NaiveDateTime> {
    for format in STAMP_FORMATS {
        if let Ok(stamp) = NaiveDateTime::parse_from_str(raw.trim(), format) {
            return Ok(stamp);
        }
    }
    Err(ReconcileError::Extraction(format!(
        "unparseable timestamp '{raw}'"
    )))
}

/// Wire shape printed by the OCR command on stdout.
#[derive(Debug, Deserialize)]
struct ExtractedPayload {
    kind: String,
    amount_minor: i64,
    stamp: String,
}

/// Runs the configured OCR program with the receipt path as its only
/// argument and parses the JSON object it prints.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    program: PathBuf,
}

impl CommandExtractor {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }
}

#[async_trait]
impl FieldExtractor for CommandExtractor {
    async fn extract(&self, path: &Path) -> Result<ReceiptFields> {
        let output = Command::new(&self.program)
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| {
                ReconcileError::Extraction(format!(
                    "failed to spawn {}: {err}",
                    self.program.display()
                ))
            })?;

        if !output.status.success() {
            return Err(ReconcileError::Extraction(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let payload: ExtractedPayload = serde_json::from_slice(&output.stdout)
            .map_err(|err| ReconcileError::Extraction(format!("bad extractor output: {err}")))?;

        let kind: ReceiptKind = payload.kind.parse()?;
        Ok(ReceiptFields {
            kind,
            amount_minor: payload.amount_minor,
            stamp: parse_stamp(&payload.stamp)?,
        })
    }
}

/// Submission payload handed to the portal robot as JSON on argv.
#[derive(Debug, Serialize)]
struct SubmissionPayload<'a> {
    kind: &'a str,
    amount_minor: i64,
    stamp: String,
    segment_start: String,
    segment_end: String,
}

/// Runs the configured portal program with the receipt path and the
/// submission JSON. Exit status zero means the portal confirmed the entry.
#[derive(Debug, Clone)]
pub struct CommandSubmitter {
    program: PathBuf,
}

impl CommandSubmitter {
    pub fn new(program: PathBuf) -> Self {
        Self { program }
    }
}

#[async_trait]
impl PortalSubmitter for CommandSubmitter {
    async fn submit(&self, receipt: &Receipt, segment: &TripSegment) -> Result<()> {
        let payload = SubmissionPayload {
            kind: receipt.fields.kind.as_str(),
            amount_minor: receipt.fields.amount_minor,
            stamp: receipt.fields.stamp.format("%Y-%m-%dT%H:%M:%S").to_string(),
            segment_start: segment.start.format("%Y-%m-%dT%H:%M:%S").to_string(),
            segment_end: segment.end.format("%Y-%m-%dT%H:%M:%S").to_string(),
        };
        let json = serde_json::to_string(&payload)
            .map_err(|err| ReconcileError::Submission(err.to_string()))?;

        debug!(program = %self.program.display(), payload = %json, "invoking portal robot");

        let output = Command::new(&self.program)
            .arg(&receipt.path)
            .arg(&json)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| {
                ReconcileError::Submission(format!(
                    "failed to spawn {}: {err}",
                    self.program.display()
                ))
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ReconcileError::Submission(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

/// Reads the itinerary export (a JSON array of `{start, end}` segments) and
/// narrows it to the month of the receipt, mirroring the portal's own
/// month-scoped trip grid.
#[derive(Debug, Clone)]
pub struct JsonItinerarySource {
    path: PathBuf,
}

impl JsonItinerarySource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl ItinerarySource for JsonItinerarySource {
    async fn itinerary_for(&self, day: NaiveDate) -> Result<Itinerary> {
        let bytes = tokio::fs::read(&self.path).await?;
        let segments: Vec<TripSegment> = serde_json::from_slice(&bytes).map_err(|err| {
            ReconcileError::Extraction(format!(
                "bad itinerary export {}: {err}",
                self.path.display()
            ))
        })?;

        let month_scoped: Vec<TripSegment> = segments
            .into_iter()
            .filter(|segment| {
                segment.start.date().year() == day.year()
                    && segment.start.date().month() == day.month()
            })
            .collect();

        Ok(Itinerary::new(month_scoped))
    }
}
