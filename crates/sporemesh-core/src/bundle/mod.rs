//! Signed spore bundles.
//!
//! A spore is a ZIP archive with exactly two meaningful entries:
//!
//! - `manifest.json` — the bundle's manifest, indented JSON
//! - `binary` — the raw executable bytes
//!
//! The manifest is cryptographically bound to the binary: it carries the
//! binary's SHA-256 and an Ed25519 signature over a canonical (RFC 8785)
//! serialization of the manifest concatenated with the binary hash. Any
//! mutation of the binary or of a manifest field invalidates the bundle.

mod codec;
mod manifest;
mod signing;

use thiserror::Error;

pub use codec::{extract, pack, verify};
pub use manifest::{MANIFEST_KIND, Manifest, Nutrients, SecurityProfile, Slo};
pub use signing::{
    SIGNING_KEY_SIZE, generate_signing_key, load_signing_key, save_signing_key, signing_digest,
};

/// Archive entry name of the serialized manifest.
pub const MANIFEST_ENTRY: &str = "manifest.json";

/// Archive entry name of the executable payload.
pub const BINARY_ENTRY: &str = "binary";

/// File extension of spore archives (without the leading dot).
pub const SPORE_EXTENSION: &str = "spore";

/// Errors that can occur while packing, verifying, or extracting bundles.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BundleError {
    /// The archive is unreadable or is missing a required entry.
    #[error("malformed bundle: {0}")]
    MalformedBundle(String),

    /// The manifest entry does not parse, or lacks required fields.
    #[error("malformed manifest: {0}")]
    MalformedManifest(String),

    /// The archive's binary entry does not match the manifest's hash.
    #[error("binary hash mismatch: manifest claims {claimed}, archive holds {actual}")]
    BinaryHashMismatch {
        /// Hash recorded in the manifest (lowercase hex).
        claimed: String,
        /// Hash of the binary entry actually present (lowercase hex).
        actual: String,
    },

    /// The public key or signature is not valid base64/Ed25519 material.
    #[error("malformed signature material: {0}")]
    MalformedSignature(String),

    /// The signature does not validate under the manifest's public key.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// An archive entry name is absolute or escapes the extraction root.
    #[error("unsafe archive entry name: {0}")]
    UnsafeEntryName(String),

    /// A key file is readable by group or other.
    #[error("insecure permissions on key file: {path}")]
    InsecureKeyPermissions {
        /// The offending path.
        path: String,
    },

    /// Failure while writing the archive.
    #[error("archive write failed: {0}")]
    Archive(#[source] zip::result::ZipError),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
