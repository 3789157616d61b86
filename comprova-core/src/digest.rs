//! Content hashing for physical receipt identity.
//!
//! The physical dedup tier keys on a SHA-256 digest of the full file bytes,
//! computed before any OCR work so identical re-drops are rejected cheaply.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::task::spawn_blocking;

const CHUNK_SIZE: usize = 64 * 1024;

/// Streaming SHA-256 over the file contents, hex-encoded.
pub fn file_digest(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// [`file_digest`] off the runtime threads.
pub async fn file_digest_async(path: PathBuf) -> io::Result<String> {
    spawn_blocking(move || file_digest(&path))
        .await
        .map_err(|join_err| io::Error::other(format!("digest task panicked: {join_err}")))?
}
