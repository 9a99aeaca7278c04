//! Ed25519 signing of bundle manifests and signing-key persistence.
//!
//! The signing preimage is `SHA256( JCS(manifest with empty signature) ||
//! SHA256(binary) )`, where JCS is the RFC 8785 canonical JSON form. Sign
//! and verify reconstruct the preimage independently, so verification does
//! not depend on field order or whitespace of the stored manifest.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use super::{BundleError, Manifest};
use crate::digest::DIGEST_SIZE;

/// Size of an Ed25519 signing-key seed in bytes.
pub const SIGNING_KEY_SIZE: usize = 32;

/// Computes the digest that is signed for a manifest and its binary.
///
/// The manifest's `signature` field is cleared before canonicalization, so
/// the same function serves both packing and verification.
///
/// # Errors
///
/// Returns [`BundleError::MalformedManifest`] if the manifest cannot be
/// canonicalized.
pub fn signing_digest(
    manifest: &Manifest,
    binary_hash: &[u8; DIGEST_SIZE],
) -> Result<[u8; DIGEST_SIZE], BundleError> {
    let mut unsigned = manifest.clone();
    unsigned.signature = String::new();

    let canonical = serde_jcs::to_vec(&unsigned)
        .map_err(|e| BundleError::MalformedManifest(format!("canonicalization failed: {e}")))?;

    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hasher.update(binary_hash);
    Ok(hasher.finalize().into())
}

/// Populates `public_key` and `signature` on a manifest.
pub(super) fn sign_manifest(
    manifest: &mut Manifest,
    key: &SigningKey,
    binary_hash: &[u8; DIGEST_SIZE],
) -> Result<(), BundleError> {
    manifest.public_key = BASE64.encode(key.verifying_key().to_bytes());
    manifest.signature = String::new();

    let digest = signing_digest(manifest, binary_hash)?;
    let signature: Signature = key.sign(&digest);
    manifest.signature = BASE64.encode(signature.to_bytes());
    Ok(())
}

/// Verifies a manifest's signature against the given binary hash.
pub(super) fn verify_manifest(
    manifest: &Manifest,
    binary_hash: &[u8; DIGEST_SIZE],
) -> Result<(), BundleError> {
    let public_key = BASE64
        .decode(&manifest.public_key)
        .map_err(|e| BundleError::MalformedSignature(format!("public key: {e}")))?;
    let signature = BASE64
        .decode(&manifest.signature)
        .map_err(|e| BundleError::MalformedSignature(format!("signature: {e}")))?;

    let public_key: [u8; SIGNING_KEY_SIZE] = public_key.try_into().map_err(|bytes: Vec<u8>| {
        BundleError::MalformedSignature(format!(
            "public key must be {SIGNING_KEY_SIZE} bytes, got {}",
            bytes.len()
        ))
    })?;
    let verifying_key = VerifyingKey::from_bytes(&public_key)
        .map_err(|e| BundleError::MalformedSignature(format!("public key: {e}")))?;
    let signature = Signature::from_slice(&signature)
        .map_err(|e| BundleError::MalformedSignature(format!("signature: {e}")))?;

    let digest = signing_digest(manifest, binary_hash)?;
    verifying_key
        .verify(&digest, &signature)
        .map_err(|_| BundleError::SignatureInvalid)
}

/// Generates a fresh Ed25519 signing key from the OS RNG.
#[must_use]
pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Writes a signing key's seed to `path` with `0600` permissions.
///
/// # Errors
///
/// Returns an error if the file already exists or cannot be written.
pub fn save_signing_key(path: &Path, key: &SigningKey) -> Result<(), BundleError> {
    let seed = Zeroizing::new(key.to_bytes());

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(&*seed)?;
    file.sync_all()?;
    Ok(())
}

/// Loads a signing key from a `0600` seed file written by
/// [`save_signing_key`].
///
/// # Errors
///
/// Returns [`BundleError::InsecureKeyPermissions`] if the file is readable
/// by group or other, or an I/O error if it cannot be read.
pub fn load_signing_key(path: &Path) -> Result<SigningKey, BundleError> {
    let metadata = fs::metadata(path)?;
    let mode = metadata.permissions().mode();
    if mode & 0o077 != 0 {
        return Err(BundleError::InsecureKeyPermissions {
            path: path.display().to_string(),
        });
    }

    let mut file = File::open(path)?;
    let mut seed = Zeroizing::new([0u8; SIGNING_KEY_SIZE]);
    file.read_exact(&mut *seed)?;

    Ok(SigningKey::from_bytes(&seed))
}
