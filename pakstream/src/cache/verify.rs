//! SHA-256 digest calculation for package verification.
//!
//! Digest checking is lazy: it runs once, when a package's whole body has
//! become resident as a single merged chunk file. These helpers stream that
//! file through the hasher without loading it into memory.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use super::CacheError;

/// Buffer size for reading files during digest calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Calculates the SHA-256 digest of an in-memory buffer.
pub fn bytes_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Calculates the SHA-256 digest of a file.
///
/// # Returns
///
/// The lowercase hexadecimal SHA-256 hash of the file contents.
///
/// # Errors
///
/// Returns [`CacheError::Io`] if the file cannot be read.
pub async fn file_digest(path: &Path) -> Result<String, CacheError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Verifies a file against an expected digest.
///
/// # Errors
///
/// [`CacheError::DigestMismatch`] when the content hashes to something else,
/// [`CacheError::Io`] when the file cannot be read.
pub async fn verify_file_digest(path: &Path, expected: &str) -> Result<(), CacheError> {
    let actual = file_digest(path).await?;
    if actual != expected {
        return Err(CacheError::DigestMismatch {
            file: path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}
