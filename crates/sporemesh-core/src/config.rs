//! Mesh configuration.
//!
//! `MeshConfig` carries the knobs the `run` entry point needs: where the
//! repository and run directories live, where the edge listens, how many
//! agents to start, and the blue/green warmup. Values come from a TOML
//! file, with compiled-in defaults for anything omitted; command-line
//! flags override both.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for a `MeshConfig`.
    #[error("failed to parse config {path}: {source}")]
    Parse {
        /// Path of the offending file.
        path: String,
        /// The underlying TOML error.
        source: toml::de::Error,
    },
}

/// Top-level configuration of a mesh process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Directory of the content-addressed spore repository.
    #[serde(default = "default_repo_dir")]
    pub repo_dir: PathBuf,

    /// Root directory under which each agent gets its own run directory.
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,

    /// Address the edge gateway listens on.
    #[serde(default = "default_edge_addr")]
    pub edge_addr: SocketAddr,

    /// Number of agent nodes to start.
    #[serde(default = "default_nodes")]
    pub nodes: u32,

    /// Instance-count hint per plan.
    #[serde(default = "default_instances")]
    pub instances: u32,

    /// Blue/green warmup interval.
    #[serde(default = "default_warmup")]
    #[serde(with = "humantime_serde")]
    pub warmup: Duration,
}

fn default_repo_dir() -> PathBuf {
    PathBuf::from("./repo")
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("./run")
}

fn default_edge_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

const fn default_nodes() -> u32 {
    3
}

const fn default_instances() -> u32 {
    2
}

const fn default_warmup() -> Duration {
    Duration::from_secs(2)
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            repo_dir: default_repo_dir(),
            run_dir: default_run_dir(),
            edge_addr: default_edge_addr(),
            nodes: default_nodes(),
            instances: default_instances(),
            warmup: default_warmup(),
        }
    }
}

impl MeshConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.nodes, 3);
        assert_eq!(config.instances, 2);
        assert_eq!(config.warmup, Duration::from_secs(2));
        assert_eq!(config.edge_addr.port(), 8080);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mesh.toml");
        fs::write(
            &path,
            r#"
            nodes = 5
            warmup = "500ms"
            edge_addr = "127.0.0.1:9999"
            "#,
        )
        .unwrap();

        let config = MeshConfig::from_file(&path).unwrap();
        assert_eq!(config.nodes, 5);
        assert_eq!(config.warmup, Duration::from_millis(500));
        assert_eq!(config.edge_addr.port(), 9999);
        assert_eq!(config.repo_dir, PathBuf::from("./repo"));
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mesh.toml");
        fs::write(&path, "nodes = \"many\"").unwrap();

        assert!(matches!(
            MeshConfig::from_file(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            MeshConfig::from_file("/nonexistent/mesh.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
