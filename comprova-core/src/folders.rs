//! Folder-as-queue layout: `inbox/` for new receipts, `archive/` for
//! committed or duplicate ones, `quarantine/` for failures awaiting retry,
//! and `quarantine/rejected/` for permanent failures.
//!
//! Moves are renames, so a receipt is never visible in two states at once and
//! concurrent scans never observe a partial file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Extensions accepted as receipt scans.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

#[derive(Debug, Clone)]
pub struct ReceiptFolders {
    pub inbox: PathBuf,
    pub archive: PathBuf,
    pub quarantine: PathBuf,
}

impl ReceiptFolders {
    pub fn new(
        inbox: impl Into<PathBuf>,
        archive: impl Into<PathBuf>,
        quarantine: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inbox: inbox.into(),
            archive: archive.into(),
            quarantine: quarantine.into(),
        }
    }

    /// Permanent-failure area for receipts that exhausted their retries.
    pub fn rejected(&self) -> PathBuf {
        self.quarantine.join("rejected")
    }

    pub fn ensure(&self) -> io::Result<()> {
        for dir in [&self.inbox, &self.archive, &self.quarantine] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn is_receipt_image(path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                let lower = ext.to_ascii_lowercase();
                IMAGE_EXTENSIONS.contains(&lower.as_str())
            })
    }

    /// Receipt images directly inside `dir`, name-sorted for stable passes.
    pub fn list_images(dir: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(dir)?;
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && Self::is_receipt_image(path))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Rename `src` into `dest_dir`, suffixing `name__1.ext`, `name__2.ext`,
    /// ... instead of overwriting on collision. Returns the final path.
    pub fn move_into(src: &Path, dest_dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(dest_dir)?;
        let file_name = src
            .file_name()
            .ok_or_else(|| io::Error::other(format!("no file name in {}", src.display())))?;

        let mut dest = dest_dir.join(file_name);
        if dest.exists() {
            let stem = src
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("receipt");
            let ext = src.extension().and_then(|e| e.to_str());
            for i in 1.. {
                let candidate = match ext {
                    Some(ext) => dest_dir.join(format!("{stem}__{i}.{ext}")),
                    None => dest_dir.join(format!("{stem}__{i}")),
                };
                if !candidate.exists() {
                    dest = candidate;
                    break;
                }
            }
        }

        fs::rename(src, &dest)?;
        Ok(dest)
    }
}
