//! Engine configuration and persistence.
//!
//! Every knob has a default, so a missing or partial TOML file is fine.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::errors::{VaultError, VaultResult};
use crate::walker::SkipRules;

/// Digest used to verify copied files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DigestKind {
    #[default]
    Sha256,
    /// Non-cryptographic, much faster on large payloads.
    Xxh3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FtpSettings {
    pub default_port: u16,
    pub connect_timeout_secs: u64,
    /// Time box for a single remote directory listing.
    pub list_timeout_secs: u64,
    /// How deep discovery looks below a games directory for content roots.
    pub scan_depth: usize,
    pub size_max_depth: usize,
    /// Mount points tried when only a bare host (or a mount root) is given.
    pub mount_points: Vec<String>,
    /// Game directories tried below each mount point.
    pub game_subdirs: Vec<String>,
}

impl Default for FtpSettings {
    fn default() -> Self {
        Self {
            default_port: crate::ftp::address::DEFAULT_PORT,
            connect_timeout_secs: 10,
            list_timeout_secs: 15,
            scan_depth: 3,
            size_max_depth: 12,
            mount_points: ["/data", "/mnt/ext0", "/mnt/ext1", "/mnt/usb0", "/mnt/usb1"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            game_subdirs: ["etaHEN/games", "games", "homebrew"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_scan_depth: usize,
    pub scan_concurrency: usize,
    pub skip_dir_names: Vec<String>,
    pub skip_globs: Vec<String>,
    pub size_file_cap: usize,
    pub copy_buffer_size: usize,
    pub digest: DigestKind,
    pub verify_attempts: u32,
    pub retry_delay_ms: u64,
    pub preserve_mtime: bool,
    pub unique_name_attempts: u32,
    pub progress_every: usize,
    pub staging_dir: Option<PathBuf>,
    pub cover_cache_dir: Option<PathBuf>,
    pub ftp: FtpSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_scan_depth: 6,
            scan_concurrency: 16,
            skip_dir_names: crate::walker::DEFAULT_SKIP_DIRS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            skip_globs: Vec::new(),
            size_file_cap: 10_000,
            copy_buffer_size: 1024 * 1024,
            digest: DigestKind::Sha256,
            verify_attempts: 3,
            retry_delay_ms: 200,
            preserve_mtime: false,
            unique_name_attempts: 100,
            progress_every: 8,
            staging_dir: None,
            cover_cache_dir: None,
            ftp: FtpSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Default config file location.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ps5vault")
            .join("config.toml")
    }

    /// Loads the default config file, falling back to defaults on any problem.
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => {
                debug!("Loaded config from {:?}", path);
                config
            }
            Err(e) => {
                warn!("Failed to load config {:?}: {}, using defaults", path, e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> VaultResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| VaultError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> VaultResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| VaultError::Config(e.to_string()))?;
        fs::write(path, content)?;
        debug!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> VaultResult<()> {
        if self.scan_concurrency == 0 {
            return Err(VaultError::Config("scan_concurrency must be at least 1".into()));
        }
        if self.copy_buffer_size == 0 {
            return Err(VaultError::Config("copy_buffer_size must be at least 1".into()));
        }
        if self.verify_attempts == 0 {
            return Err(VaultError::Config("verify_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn skip_rules(&self) -> VaultResult<SkipRules> {
        SkipRules::new(&self.skip_dir_names, &self.skip_globs)
    }

    /// Directory cover art fetched over FTP is cached in.
    pub fn cover_cache_root(&self) -> PathBuf {
        self.cover_cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("ps5vault")
                .join("covers")
        })
    }

    /// Root for FTP staging directories when no target-adjacent location applies.
    pub fn staging_root(&self) -> PathBuf {
        self.staging_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.max_scan_depth, 6);
        assert_eq!(config.scan_concurrency, 16);
        assert_eq!(config.ftp.default_port, 2121);
        assert_eq!(config.digest, DigestKind::Sha256);
        assert!(config.skip_dir_names.iter().any(|n| n == "$recycle.bin"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            max_scan_depth = 12
            digest = "xxh3"

            [ftp]
            default_port = 1337
            "#,
        )
        .unwrap();
        assert_eq!(config.max_scan_depth, 12);
        assert_eq!(config.digest, DigestKind::Xxh3);
        assert_eq!(config.ftp.default_port, 1337);
        assert_eq!(config.ftp.list_timeout_secs, 15);
        assert_eq!(config.size_file_cap, 10_000);
    }

    #[test]
    fn test_save_and_load_from() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = EngineConfig {
            verify_attempts: 5,
            skip_globs: vec!["backup*".into()],
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "scan_concurrency = 0\n").unwrap();
        assert!(matches!(
            EngineConfig::load_from(&path),
            Err(VaultError::Config(_))
        ));
    }
}
