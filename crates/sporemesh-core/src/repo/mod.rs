//! Content-addressed spore repository.
//!
//! A repository is a single flat directory of immutable files named
//! `<digest>.spore`, where `<digest>` is the lowercase-hex SHA-256 of the
//! whole archive file. Content addressing makes `put` idempotent and
//! concurrent puts of equal content harmless.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

use crate::bundle::SPORE_EXTENSION;
use crate::digest::{hex_encode, sha256_file};

/// Errors raised by repository operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RepoError {
    /// Underlying I/O failure.
    #[error("repository I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Handle to a directory-rooted spore store.
#[derive(Debug, Clone)]
pub struct Repository {
    dir: PathBuf,
}

impl Repository {
    /// Opens (creating if necessary) a repository at `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, RepoError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;
        Ok(Self { dir })
    }

    /// Stores a byte-identical copy of the file at `source`, keyed by its
    /// SHA-256, and returns `(digest, stored_path)`.
    ///
    /// Idempotent: equal content yields an equal digest and path, and an
    /// already-present entry is left untouched. A concurrent `put` of the
    /// same content is safe because the copy lands via a temporary file and
    /// an atomic rename.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be read or the copy cannot be
    /// written.
    pub fn put(&self, source: impl AsRef<Path>) -> Result<(String, PathBuf), RepoError> {
        let source = source.as_ref();
        let digest = hex_encode(&sha256_file(source)?);
        let stored = self.path(&digest);

        if stored.exists() {
            debug!(%digest, "spore already stored");
            return Ok((digest, stored));
        }

        let mut reader = File::open(source)?;
        let mut staged = NamedTempFile::new_in(&self.dir)?;
        io::copy(&mut reader, staged.as_file_mut())?;
        staged.persist(&stored).map_err(|e| RepoError::Io(e.error))?;
        fs::set_permissions(&stored, fs::Permissions::from_mode(0o644))?;

        debug!(%digest, stored = %stored.display(), "stored spore");
        Ok((digest, stored))
    }

    /// Path an entry with the given digest would live at. Pure; does not
    /// check existence.
    #[must_use]
    pub fn path(&self, digest: &str) -> PathBuf {
        self.dir.join(format!("{digest}.{SPORE_EXTENSION}"))
    }

    /// The repository's root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
