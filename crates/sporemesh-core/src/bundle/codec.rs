//! Pack, verify, and extract spore archives.

use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use ed25519_dalek::SigningKey;
use tracing::debug;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{BINARY_ENTRY, BundleError, MANIFEST_ENTRY, MANIFEST_KIND, Manifest, signing};
use crate::digest::{hex_encode, sha256};

/// Packs a binary and a manifest into a signed spore archive.
///
/// Fills in `kind`, `created_at`, `binary_sha256`, `public_key`, and
/// `signature`, then writes `<out_dir>/<name>-<version>.spore` containing
/// the indented manifest and the raw binary.
///
/// Returns the archive path and the fully populated manifest.
///
/// # Errors
///
/// Fails if the binary cannot be read, the manifest cannot be serialized,
/// or the archive cannot be written.
pub fn pack(
    binary_path: &Path,
    manifest: Manifest,
    key: &SigningKey,
    out_dir: &Path,
) -> Result<(PathBuf, Manifest), BundleError> {
    let binary = fs::read(binary_path)?;
    let binary_hash = sha256(&binary);

    let mut manifest = manifest;
    manifest.kind = MANIFEST_KIND.to_string();
    manifest.binary_sha256 = hex_encode(&binary_hash);
    manifest.created_at = Utc::now();
    signing::sign_manifest(&mut manifest, key, &binary_hash)?;

    let manifest_json = serde_json::to_string_pretty(&manifest)
        .map_err(|e| BundleError::MalformedManifest(e.to_string()))?;

    fs::create_dir_all(out_dir)?;
    let archive_path = out_dir.join(manifest.archive_file_name());
    let file = File::create(&archive_path)?;
    let mut archive = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    archive
        .start_file(MANIFEST_ENTRY, options)
        .map_err(BundleError::Archive)?;
    archive.write_all(manifest_json.as_bytes())?;

    archive
        .start_file(BINARY_ENTRY, options.unix_permissions(0o755))
        .map_err(BundleError::Archive)?;
    archive.write_all(&binary)?;

    archive.finish().map_err(BundleError::Archive)?;
    debug!(archive = %archive_path.display(), name = %manifest.name, "packed spore");
    Ok((archive_path, manifest))
}

/// Verifies a spore archive and returns its manifest.
///
/// Checks, in order: presence of both entries, manifest parse, presence of
/// the signed fields, binary hash, and the Ed25519 signature over the
/// canonical signing digest.
///
/// # Errors
///
/// See [`BundleError`]; each check failure maps to its own variant.
pub fn verify(archive_path: &Path) -> Result<Manifest, BundleError> {
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| BundleError::MalformedBundle(format!("not a spore archive: {e}")))?;

    let manifest_bytes = read_entry(&mut archive, MANIFEST_ENTRY)?;
    let binary = read_entry(&mut archive, BINARY_ENTRY)?;

    let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
        .map_err(|e| BundleError::MalformedManifest(e.to_string()))?;
    manifest.require_signed()?;

    let binary_hash = sha256(&binary);
    let actual = hex_encode(&binary_hash);
    if manifest.binary_sha256 != actual {
        return Err(BundleError::BinaryHashMismatch {
            claimed: manifest.binary_sha256.clone(),
            actual,
        });
    }

    signing::verify_manifest(&manifest, &binary_hash)?;
    Ok(manifest)
}

/// Verifies a spore archive, then extracts it into `dest_dir`.
///
/// Every safely named entry is written below `dest_dir`; the `binary` entry
/// is made executable (0755) and renamed to the manifest's `command`.
/// Returns the manifest and the path of the renamed binary.
///
/// # Errors
///
/// Propagates any [`verify`] failure, and fails with
/// [`BundleError::UnsafeEntryName`] on entries that are absolute or traverse
/// out of `dest_dir`.
pub fn extract(archive_path: &Path, dest_dir: &Path) -> Result<(Manifest, PathBuf), BundleError> {
    let manifest = verify(archive_path)?;

    let command = Path::new(&manifest.command);
    let single_basename = matches!(
        command.components().collect::<Vec<_>>().as_slice(),
        [Component::Normal(_)]
    );
    if !single_basename {
        return Err(BundleError::MalformedManifest(format!(
            "command must be a plain file name, got {:?}",
            manifest.command
        )));
    }

    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)
        .map_err(|e| BundleError::MalformedBundle(format!("not a spore archive: {e}")))?;
    fs::create_dir_all(dest_dir)?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| BundleError::MalformedBundle(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }

        let Some(relative) = entry.enclosed_name() else {
            return Err(BundleError::UnsafeEntryName(entry.name().to_string()));
        };

        let dest = dest_dir.join(relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&dest)?;
        io::copy(&mut entry, &mut out)?;

        if entry.name() == BINARY_ENTRY {
            fs::set_permissions(&dest, fs::Permissions::from_mode(0o755))?;
        }
    }

    let binary_path = dest_dir.join(&manifest.command);
    fs::rename(dest_dir.join(BINARY_ENTRY), &binary_path)?;
    debug!(dest = %dest_dir.display(), binary = %binary_path.display(), "extracted spore");
    Ok((manifest, binary_path))
}

fn read_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Vec<u8>, BundleError> {
    let mut entry = archive.by_name(name).map_err(|e| match e {
        ZipError::FileNotFound => BundleError::MalformedBundle(format!("missing {name} entry")),
        other => BundleError::MalformedBundle(other.to_string()),
    })?;
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::DateTime;
    use tempfile::TempDir;

    use super::*;
    use crate::bundle::generate_signing_key;

    fn sample_manifest() -> Manifest {
        Manifest {
            name: "a".into(),
            version: "v1".into(),
            command: "a".into(),
            ..Manifest::default()
        }
    }

    fn packed_sample(dir: &TempDir, binary: &[u8]) -> PathBuf {
        let binary_path = dir.path().join("payload");
        fs::write(&binary_path, binary).unwrap();
        let key = generate_signing_key();
        let (archive, _) = pack(&binary_path, sample_manifest(), &key, dir.path()).unwrap();
        archive
    }

    /// Rebuilds an archive in place with the given entry contents, reusing
    /// everything else from `packed_sample`'s layout.
    fn rewrite_archive(path: &Path, manifest_json: &[u8], binary: &[u8]) {
        let file = File::create(path).unwrap();
        let mut archive = ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        archive.start_file(MANIFEST_ENTRY, options).unwrap();
        archive.write_all(manifest_json).unwrap();
        archive.start_file(BINARY_ENTRY, options).unwrap();
        archive.write_all(binary).unwrap();
        archive.finish().unwrap();
    }

    fn archive_entry(path: &Path, name: &str) -> Vec<u8> {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut bytes = Vec::new();
        archive
            .by_name(name)
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        bytes
    }

    #[test]
    fn test_pack_verify_round_trip() {
        let dir = TempDir::new().unwrap();
        let archive = packed_sample(&dir, b"hello");

        let manifest = verify(&archive).unwrap();
        assert_eq!(manifest.kind, MANIFEST_KIND);
        assert_eq!(manifest.name, "a");
        assert_eq!(
            manifest.binary_sha256,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(!manifest.signature.is_empty());
        assert!(!manifest.public_key.is_empty());
        assert!(manifest.created_at > DateTime::UNIX_EPOCH);
    }

    #[test]
    fn test_corrupted_binary_fails_hash_check() {
        let dir = TempDir::new().unwrap();
        let archive = packed_sample(&dir, b"hello");
        let manifest_json = archive_entry(&archive, MANIFEST_ENTRY);

        rewrite_archive(&archive, &manifest_json, b"hellx");
        assert!(matches!(
            verify(&archive),
            Err(BundleError::BinaryHashMismatch { .. })
        ));
    }

    #[test]
    fn test_tampered_manifest_field_fails_signature() {
        let dir = TempDir::new().unwrap();
        let archive = packed_sample(&dir, b"hello");

        let mut manifest: Manifest =
            serde_json::from_slice(&archive_entry(&archive, MANIFEST_ENTRY)).unwrap();
        manifest.version = "v2".into();
        rewrite_archive(
            &archive,
            serde_json::to_string_pretty(&manifest).unwrap().as_bytes(),
            b"hello",
        );

        assert!(matches!(verify(&archive), Err(BundleError::SignatureInvalid)));
    }

    #[test]
    fn test_foreign_public_key_fails_signature() {
        let dir = TempDir::new().unwrap();
        let archive = packed_sample(&dir, b"hello");

        let mut manifest: Manifest =
            serde_json::from_slice(&archive_entry(&archive, MANIFEST_ENTRY)).unwrap();
        let other = generate_signing_key();
        manifest.public_key = {
            use base64::Engine as _;
            base64::engine::general_purpose::STANDARD.encode(other.verifying_key().to_bytes())
        };
        rewrite_archive(
            &archive,
            serde_json::to_string_pretty(&manifest).unwrap().as_bytes(),
            b"hello",
        );

        assert!(matches!(verify(&archive), Err(BundleError::SignatureInvalid)));
    }

    #[test]
    fn test_missing_entry_is_malformed_bundle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.spore");
        let file = File::create(&path).unwrap();
        let mut archive = ZipWriter::new(file);
        archive
            .start_file(MANIFEST_ENTRY, SimpleFileOptions::default())
            .unwrap();
        archive.write_all(b"{}").unwrap();
        archive.finish().unwrap();

        assert!(matches!(
            verify(&path),
            Err(BundleError::MalformedBundle(_))
        ));
    }

    #[test]
    fn test_unparseable_manifest_is_malformed_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.spore");
        rewrite_archive(&path, b"not json", b"hello");

        assert!(matches!(
            verify(&path),
            Err(BundleError::MalformedManifest(_))
        ));
    }

    #[test]
    fn test_unsigned_manifest_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("unsigned.spore");
        let manifest_json = serde_json::to_vec(&sample_manifest()).unwrap();
        rewrite_archive(&path, &manifest_json, b"hello");

        assert!(matches!(
            verify(&path),
            Err(BundleError::MalformedManifest(_))
        ));
    }

    #[test]
    fn test_extra_entries_are_ignored_by_verify() {
        let dir = TempDir::new().unwrap();
        let archive = packed_sample(&dir, b"hello");
        let manifest_json = archive_entry(&archive, MANIFEST_ENTRY);

        let file = File::create(&archive).unwrap();
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        writer.start_file(MANIFEST_ENTRY, options).unwrap();
        writer.write_all(&manifest_json).unwrap();
        writer.start_file(BINARY_ENTRY, options).unwrap();
        writer.write_all(b"hello").unwrap();
        writer.start_file("README", options).unwrap();
        writer.write_all(b"extra").unwrap();
        writer.finish().unwrap();

        verify(&archive).unwrap();
    }

    #[test]
    fn test_extract_renames_and_marks_executable() {
        let dir = TempDir::new().unwrap();
        let archive = packed_sample(&dir, b"hello");
        let dest = dir.path().join("extracted");

        let (manifest, binary_path) = extract(&archive, &dest).unwrap();
        assert_eq!(binary_path, dest.join("a"));
        assert_eq!(fs::read(&binary_path).unwrap(), b"hello");
        assert_eq!(manifest.command, "a");

        let mode = fs::metadata(&binary_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111, "binary should be executable");
        assert!(dest.join(MANIFEST_ENTRY).exists());
    }

    #[test]
    fn test_extract_refuses_traversal_entries() {
        let dir = TempDir::new().unwrap();
        let archive = packed_sample(&dir, b"hello");
        let manifest_json = archive_entry(&archive, MANIFEST_ENTRY);

        let file = File::create(&archive).unwrap();
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        writer.start_file(MANIFEST_ENTRY, options).unwrap();
        writer.write_all(&manifest_json).unwrap();
        writer.start_file(BINARY_ENTRY, options).unwrap();
        writer.write_all(b"hello").unwrap();
        writer.start_file("../escape", options).unwrap();
        writer.write_all(b"boom").unwrap();
        writer.finish().unwrap();

        let dest = dir.path().join("extracted");
        assert!(matches!(
            extract(&archive, &dest),
            Err(BundleError::UnsafeEntryName(_))
        ));
        assert!(!dir.path().join("escape").exists());
    }

    #[test]
    fn test_extract_refuses_pathy_command() {
        let dir = TempDir::new().unwrap();
        let binary_path = dir.path().join("payload");
        fs::write(&binary_path, b"hello").unwrap();
        let manifest = Manifest {
            command: "../sneaky".into(),
            ..sample_manifest()
        };
        let key = generate_signing_key();
        let (archive, _) = pack(&binary_path, manifest, &key, dir.path()).unwrap();

        assert!(matches!(
            extract(&archive, &dir.path().join("extracted")),
            Err(BundleError::MalformedManifest(_))
        ));
    }

    #[test]
    fn test_manifest_env_survives_round_trip() {
        let dir = TempDir::new().unwrap();
        let binary_path = dir.path().join("payload");
        fs::write(&binary_path, b"hello").unwrap();
        let mut env = BTreeMap::new();
        env.insert("GREETING".to_string(), "hi".to_string());
        let manifest = Manifest {
            env,
            ..sample_manifest()
        };
        let key = generate_signing_key();
        let (archive, _) = pack(&binary_path, manifest, &key, dir.path()).unwrap();

        let verified = verify(&archive).unwrap();
        assert_eq!(verified.env.get("GREETING").map(String::as_str), Some("hi"));
    }
}
