//! The manifest: a bundle's signed metadata document.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BundleError, SPORE_EXTENSION};

/// The constant `kind` value of every spore manifest.
pub const MANIFEST_KIND: &str = "Spore";

/// Metadata describing a packed workload, bound to its binary by hash and
/// signature.
///
/// Unknown fields encountered while parsing are preserved in [`Self::extra`]
/// and participate in the signing preimage, so they cannot be tampered with
/// either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Document kind; always [`MANIFEST_KIND`] once packed.
    #[serde(default)]
    pub kind: String,

    /// Workload name.
    #[serde(default)]
    pub name: String,

    /// Workload version, free-form.
    #[serde(default)]
    pub version: String,

    /// Basename the extracted binary is renamed to.
    #[serde(default)]
    pub command: String,

    /// Arguments passed to the spawned process.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables for the spawned process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Capability tags, informational.
    #[serde(default)]
    pub provides: Vec<String>,

    /// Advisory resource requirements.
    #[serde(default)]
    pub nutrients: Nutrients,

    /// Advisory service-level objective.
    #[serde(default)]
    pub slo: Slo,

    /// Advisory security settings.
    #[serde(default)]
    pub security: SecurityProfile,

    /// Wall-clock timestamp set at packing.
    #[serde(default = "unix_epoch")]
    pub created_at: DateTime<Utc>,

    /// Lowercase-hex SHA-256 of the packed binary.
    #[serde(default)]
    pub binary_sha256: String,

    /// Base64 of the Ed25519 verification key.
    #[serde(default)]
    pub public_key: String,

    /// Base64 of the Ed25519 signature over the signing digest; empty while
    /// the manifest is being signed.
    #[serde(default)]
    pub signature: String,

    /// Fields this version does not know about, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn unix_epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            kind: String::new(),
            name: String::new(),
            version: String::new(),
            command: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            provides: Vec::new(),
            nutrients: Nutrients::default(),
            slo: Slo::default(),
            security: SecurityProfile::default(),
            created_at: DateTime::UNIX_EPOCH,
            binary_sha256: String::new(),
            public_key: String::new(),
            signature: String::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl Manifest {
    /// File name of the archive produced for this manifest.
    #[must_use]
    pub fn archive_file_name(&self) -> String {
        format!("{}-{}.{SPORE_EXTENSION}", self.name, self.version)
    }

    /// Checks that the manifest carries the fields a packed bundle must
    /// have.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::MalformedManifest`] if `binary_sha256`,
    /// `public_key`, or `signature` is missing.
    pub fn require_signed(&self) -> Result<(), BundleError> {
        for (field, value) in [
            ("binary_sha256", &self.binary_sha256),
            ("public_key", &self.public_key),
            ("signature", &self.signature),
        ] {
            if value.is_empty() {
                return Err(BundleError::MalformedManifest(format!(
                    "missing required field {field}"
                )));
            }
        }
        Ok(())
    }
}

/// Advisory resource requirements of a workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nutrients {
    /// CPU requirement in milli-cores.
    #[serde(default)]
    pub cpu_milli: u32,

    /// Memory requirement in mebibytes.
    #[serde(default)]
    pub memory_mb: u32,
}

/// Advisory service-level objective of a workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slo {
    /// p99 latency budget in milliseconds.
    #[serde(default)]
    pub p99_budget_ms: u32,
}

/// Advisory security settings of a workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityProfile {
    /// Name of the LSM profile the workload expects.
    #[serde(default)]
    pub lsm_profile: String,

    /// Whether the workload tolerates a read-only filesystem.
    #[serde(default)]
    pub read_only_fs: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_manifest_parses_with_defaults() {
        let manifest: Manifest =
            serde_json::from_str(r#"{"name":"web","version":"v1","command":"web"}"#).unwrap();

        assert_eq!(manifest.name, "web");
        assert_eq!(manifest.nutrients, Nutrients::default());
        assert!(manifest.signature.is_empty());
        assert_eq!(manifest.created_at, DateTime::UNIX_EPOCH);
    }

    #[test]
    fn test_unknown_fields_round_trip() {
        let manifest: Manifest =
            serde_json::from_str(r#"{"name":"web","flavor":"umami"}"#).unwrap();
        assert_eq!(
            manifest.extra.get("flavor"),
            Some(&serde_json::Value::String("umami".into()))
        );

        let reserialized = serde_json::to_string(&manifest).unwrap();
        let reparsed: Manifest = serde_json::from_str(&reserialized).unwrap();
        assert_eq!(manifest, reparsed);
    }

    #[test]
    fn test_require_signed_rejects_missing_fields() {
        let manifest = Manifest {
            binary_sha256: "aa".into(),
            public_key: "bb".into(),
            ..Manifest::default()
        };

        let err = manifest.require_signed().unwrap_err();
        assert!(matches!(err, BundleError::MalformedManifest(_)));
    }

    #[test]
    fn test_archive_file_name() {
        let manifest = Manifest {
            name: "web".into(),
            version: "v2".into(),
            ..Manifest::default()
        };
        assert_eq!(manifest.archive_file_name(), "web-v2.spore");
    }
}
