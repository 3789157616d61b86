//! Runtime configuration.
//!
//! Layered the usual way: built-in defaults, then an optional TOML file,
//! then `COMPROVA_`-prefixed environment variables (double underscore for
//! nesting, e.g. `COMPROVA_RETRY__MAX_ATTEMPTS=5`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ReconcileError, Result};
use crate::folders::ReceiptFolders;
use crate::retry::RetrySettings;
use crate::watch::WatchConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct FoldersConfig {
    pub inbox: PathBuf,
    pub archive: PathBuf,
    pub quarantine: PathBuf,
}

impl Default for FoldersConfig {
    fn default() -> Self {
        Self {
            inbox: PathBuf::from("inbox"),
            archive: PathBuf::from("archive"),
            quarantine: PathBuf::from("quarantine"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct LedgerConfig {
    pub path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ledger.sqlite3"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RetryConfig {
    /// Seconds between quarantine sweeps; 0 disables the sweep.
    pub interval_secs: u64,
    /// Failed attempts allowed before a receipt is rejected permanently.
    /// Unset retries indefinitely.
    pub max_attempts: Option<u32>,
    pub state_path: PathBuf,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_attempts: None,
            state_path: PathBuf::from("retry_state.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct WatchSettings {
    /// Settle delay in milliseconds before processing a freshly seen file.
    pub debounce_ms: u64,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

/// External programs the daemon drives.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CollaboratorsConfig {
    /// OCR extractor: invoked with the receipt path, prints field JSON.
    pub ocr_command: Option<PathBuf>,
    /// Portal robot: invoked with the receipt path and the submission JSON.
    pub submit_command: Option<PathBuf>,
    /// Itinerary export consumed by the file-based itinerary source.
    pub itinerary_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AppConfig {
    pub folders: FoldersConfig,
    pub ledger: LedgerConfig,
    pub retry: RetryConfig,
    pub watch: WatchSettings,
    pub collaborators: CollaboratorsConfig,
}

impl AppConfig {
    /// Load defaults, the optional TOML file, then environment overrides.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(
                config::File::from(file.to_path_buf()).format(config::FileFormat::Toml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("COMPROVA").separator("__"),
        );

        let settings = builder
            .build()
            .map_err(|err| ReconcileError::Config(err.to_string()))?;
        settings
            .try_deserialize()
            .map_err(|err| ReconcileError::Config(err.to_string()))
    }

    pub fn receipt_folders(&self) -> ReceiptFolders {
        ReceiptFolders::new(
            self.folders.inbox.clone(),
            self.folders.archive.clone(),
            self.folders.quarantine.clone(),
        )
    }

    pub fn retry_settings(&self) -> RetrySettings {
        RetrySettings {
            state_path: self.retry.state_path.clone(),
            max_attempts: self.retry.max_attempts,
        }
    }

    pub fn retry_interval(&self) -> Option<Duration> {
        (self.retry.interval_secs > 0).then(|| Duration::from_secs(self.retry.interval_secs))
    }

    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            debounce: Duration::from_millis(self.watch.debounce_ms),
        }
    }
}
