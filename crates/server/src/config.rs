use std::path::{Path, PathBuf};

use bancroft_engine::EngineConfig;
use bancroft_import::ImportProfile;
use serde::{Deserialize, Serialize};

/// Whole-server configuration, loaded from a TOML file. Every section has
/// working defaults so an empty (or absent) file runs a local instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BancroftConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub matching: EngineConfig,
    pub import: ImportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Upload size ceiling in bytes.
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8473".to_string(),
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("bancroft.db"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Column mapping applied to uploads that do not name a profile.
    pub default_profile: ImportProfile,
}

impl BancroftConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// `BANCROFT_CONFIG` names the file; otherwise `bancroft.toml` is used
    /// when present, and built-in defaults when it is not.
    pub fn load() -> anyhow::Result<Self> {
        if let Ok(path) = std::env::var("BANCROFT_CONFIG") {
            return Self::from_file(Path::new(&path));
        }
        let fallback = Path::new("bancroft.toml");
        if fallback.exists() {
            return Self::from_file(fallback);
        }
        Ok(Self::default())
    }
}
