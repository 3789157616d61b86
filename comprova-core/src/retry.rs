//! Quarantine retry controller.
//!
//! Each pass lists the quarantine folder and, for every file whose backoff
//! window has elapsed, moves it back to the inbox and re-enters the standard
//! [`Reconciler::process_file`] path. Retries are not special-cased logic:
//! a receipt that became a duplicate in the meantime is skipped by the same
//! dedup checks as fresh work, never double-submitted.
//!
//! Backoff state is a small JSON file keyed by basename, written atomically
//! (tmp + rename). The first two attempts come back quickly, later ones more
//! slowly, each with a little jitter so passes do not synchronize with the
//! portal's own rhythms.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::folders::ReceiptFolders;
use crate::reconciler::Reconciler;
use crate::types::ProcessingReport;

const MAX_JITTER_SECS: u64 = 20;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BackoffEntry {
    attempts: u32,
    next_due: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct BackoffState {
    entries: HashMap<String, BackoffEntry>,
}

impl BackoffState {
    fn load(path: &Path) -> Self {
        match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => Self { entries },
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "unreadable retry state; starting clean");
                    Self::default()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "cannot read retry state; starting clean");
                Self::default()
            }
        }
    }

    fn save(&self, path: &Path) -> io::Result<()> {
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&self.entries)
            .map_err(|err| io::Error::other(err.to_string()))?;
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)
    }

    /// Drop state for files no longer present in quarantine.
    fn retain_known(&mut self, known: &[String]) {
        self.entries.retain(|name, _| known.iter().any(|k| k == name));
    }
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    /// Where the per-file backoff state lives.
    pub state_path: PathBuf,
    /// `None` retries indefinitely; `Some(n)` moves a file to the rejected
    /// area after its n-th failed attempt.
    pub max_attempts: Option<u32>,
}

pub struct RetryController {
    reconciler: Arc<Reconciler>,
    settings: RetrySettings,
}

impl std::fmt::Debug for RetryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryController")
            .field("settings", &self.settings)
            .finish()
    }
}

impl RetryController {
    pub fn new(reconciler: Arc<Reconciler>, settings: RetrySettings) -> Self {
        Self {
            reconciler,
            settings,
        }
    }

    /// One sweep over the quarantine folder.
    ///
    /// Ledger trouble aborts the sweep with `Err`; per-file collaborator
    /// failures just leave the file quarantined for the next pass.
    pub async fn run_once(&self) -> Result<ProcessingReport> {
        let folders = self.reconciler.folders().clone();
        folders.ensure()?;

        let files = ReceiptFolders::list_images(&folders.quarantine)?;
        let mut state = BackoffState::load(&self.settings.state_path);
        let mut report = ProcessingReport::default();

        let known: Vec<String> = files
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        state.retain_known(&known);

        if files.is_empty() {
            state.save(&self.settings.state_path)?;
            return Ok(report);
        }

        info!(count = files.len(), "sweeping quarantined receipts");

        for src in files {
            let name = match src.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };

            let now = Utc::now();
            let entry = state.entries.entry(name.clone()).or_default();
            if entry.next_due.is_some_and(|due| now < due) {
                report.deferred += 1;
                continue;
            }

            entry.attempts += 1;
            let attempts = entry.attempts;

            if self
                .settings
                .max_attempts
                .is_some_and(|max| attempts > max)
            {
                let rejected = ReceiptFolders::move_into(&src, &folders.rejected())?;
                state.entries.remove(&name);
                state.save(&self.settings.state_path)?;
                report.exhausted += 1;
                warn!(
                    path = %rejected.display(),
                    attempts = attempts - 1,
                    "retries exhausted; receipt rejected permanently"
                );
                continue;
            }

            let delay = delay_for_attempt(attempts) + jitter();
            entry.next_due = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());

            // Back into the inbox so the retry uses the exact same path as
            // fresh discovery.
            let staged = ReceiptFolders::move_into(&src, &folders.inbox)?;
            let staged_name = match staged.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => name.clone(),
            };
            // A collision in the inbox renames the file. The backoff entry
            // must follow, or a re-quarantine under the new name would start
            // the attempt count over.
            if staged_name != name {
                if let Some(entry) = state.entries.remove(&name) {
                    state.entries.insert(staged_name.clone(), entry);
                }
            }
            state.save(&self.settings.state_path)?;

            info!(
                path = %staged.display(),
                attempt = attempts,
                next_delay_secs = delay.as_secs(),
                "retrying quarantined receipt"
            );

            match self.reconciler.process_file(&staged).await {
                Ok(outcome) => {
                    report.record(&outcome);
                    if !matches!(outcome, crate::types::Outcome::Quarantined(_)) {
                        state.entries.remove(&staged_name);
                        state.save(&self.settings.state_path)?;
                    }
                }
                Err(err) => {
                    // Put the file back where the next sweep will find it,
                    // then abort: processing without a working ledger risks
                    // double submissions.
                    error!(error = %err, "retry pass aborted");
                    if staged.exists() {
                        ReceiptFolders::move_into(&staged, &folders.quarantine)?;
                    }
                    state.save(&self.settings.state_path)?;
                    return Err(err);
                }
            }
        }

        info!(
            processed = report.processed,
            committed = report.committed,
            duplicates = report.duplicates,
            quarantined = report.quarantined,
            deferred = report.deferred,
            exhausted = report.exhausted,
            "retry sweep finished"
        );
        Ok(report)
    }

    /// Periodic sweeps until cancelled. A failed sweep is logged and the
    /// schedule continues; the ledger may well be back for the next tick.
    pub async fn run_forever(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would race daemon startup; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once().await {
                        error!(error = %err, "retry sweep failed");
                    }
                }
            }
        }
    }
}

fn delay_for_attempt(attempt: u32) -> Duration {
    let minutes = match attempt {
        0 | 1 => 2,
        2 => 5,
        _ => 10,
    };
    Duration::from_secs(minutes * 60)
}

fn jitter() -> Duration {
    Duration::from_secs(rand::rng().random_range(0..=MAX_JITTER_SECS))
}
