//! Inbox watcher.
//!
//! A thin bridge from `notify` filesystem notifications onto the tokio
//! runtime: raw events land on an mpsc channel, each candidate path is given
//! a short settle delay (scanners write files in bursts), and is then handed
//! to the reconciler. Files already present at startup are drained first, so
//! a restart never strands receipts that arrived while the daemon was down.
//!
//! Receipts are processed one at a time. The portal collaborator is a single
//! logical session, and sequential processing means the dedup ledger, not
//! scheduling luck, is what prevents double submissions.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::event::EventKind;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ReconcileError, Result};
use crate::folders::ReceiptFolders;
use crate::reconciler::Reconciler;
use crate::types::ProcessingReport;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Settle delay between seeing an event for a path and processing it.
    pub debounce: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
        }
    }
}

pub struct InboxWatcher {
    reconciler: Arc<Reconciler>,
    config: WatchConfig,
}

impl std::fmt::Debug for InboxWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboxWatcher")
            .field("config", &self.config)
            .finish()
    }
}

impl InboxWatcher {
    pub fn new(reconciler: Arc<Reconciler>, config: WatchConfig) -> Self {
        Self { reconciler, config }
    }

    /// Drain receipts already sitting in the inbox. Used at startup, before
    /// live events are consumed.
    pub async fn process_existing(&self) -> Result<ProcessingReport> {
        let folders = self.reconciler.folders();
        folders.ensure()?;

        let backlog = ReceiptFolders::list_images(&folders.inbox)?;
        let mut report = ProcessingReport::default();
        for path in backlog {
            let outcome = self.reconciler.process_file(&path).await?;
            report.record(&outcome);
        }
        Ok(report)
    }

    /// Watch the inbox until the shutdown token fires.
    ///
    /// The in-flight receipt always reaches a terminal or quarantined state
    /// before this returns; cancellation is only observed between receipts.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let folders = self.reconciler.folders().clone();
        folders.ensure()?;

        let (tx, mut rx) = mpsc::channel::<PathBuf>(EVENT_CHANNEL_CAPACITY);
        let mut watcher = build_watcher(tx)?;
        watcher
            .watch(&folders.inbox, RecursiveMode::NonRecursive)
            .map_err(|err| ReconcileError::Io(std::io::Error::other(err)))?;

        info!(inbox = %folders.inbox.display(), "watching for receipts");

        let startup = self.process_existing().await?;
        if startup.processed > 0 {
            info!(
                processed = startup.processed,
                committed = startup.committed,
                "startup backlog drained"
            );
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested; inbox watcher stopping");
                    break;
                }
                received = rx.recv() => {
                    let Some(path) = received else { break };
                    self.handle_event(path).await?;
                }
            }
        }

        // Dropping the watcher stops the notify stream.
        Ok(())
    }

    async fn handle_event(&self, path: PathBuf) -> Result<()> {
        if !ReceiptFolders::is_receipt_image(&path) {
            debug!(path = %path.display(), "ignoring non-receipt file");
            return Ok(());
        }

        // Let the writer finish; rescans arrive as create-then-modify bursts.
        tokio::time::sleep(self.config.debounce).await;

        if !path.exists() {
            // Already moved by an earlier event for the same file.
            return Ok(());
        }

        self.reconciler.process_file(&path).await.map(|_| ())
    }
}

fn build_watcher(tx: mpsc::Sender<PathBuf>) -> Result<RecommendedWatcher> {
    notify::recommended_watcher(move |result: notify::Result<Event>| match result {
        Ok(event) => {
            if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                for path in event.paths {
                    // Runs on notify's own thread; blocking send is correct
                    // here and applies backpressure on event floods.
                    if tx.blocking_send(path).is_err() {
                        return;
                    }
                }
            }
        }
        Err(err) => warn!(error = %err, "filesystem watch error"),
    })
    .map_err(|err| ReconcileError::Io(std::io::Error::other(err)))
}
