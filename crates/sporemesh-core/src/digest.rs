//! SHA-256 digest helpers shared by the bundle codec and the repository.

use std::fs::File;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Number of bytes in a SHA-256 digest.
pub const DIGEST_SIZE: usize = 32;

/// Computes the SHA-256 digest of a byte slice.
#[must_use]
pub fn sha256(bytes: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Streams a file through SHA-256 without loading it into memory.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn sha256_file(path: &Path) -> io::Result<[u8; DIGEST_SIZE]> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher.finalize().into())
}

/// Encodes a digest as lowercase hex.
#[must_use]
pub fn hex_encode(digest: &[u8]) -> String {
    use std::fmt::Write;
    digest
        .iter()
        .fold(String::with_capacity(digest.len() * 2), |mut acc, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        })
}
