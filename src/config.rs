//! Configuration management for deltablob

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default block size (0 = derive from the file size)
pub const DEFAULT_BLOCK_SIZE: usize = 0;

/// Smallest block size picked when deriving from the file size
pub const DEFAULT_MIN_BLOCK_SIZE: usize = 50_000;

/// Largest block size (block blobs cap staged blocks, keep well under it)
pub const MAX_BLOCK_SIZE: usize = 4_000_000;

/// Number of blocks aimed for when deriving the block size
pub const DEFAULT_INITIAL_BLOCK_COUNT: u64 = 10_000;

/// Default number of concurrent block uploads
pub const DEFAULT_PARALLELISM: usize = 2;

/// Default suffix of the signature object stored next to each blob
pub const DEFAULT_SIGNATURE_SUFFIX: &str = ".sig";

/// Which object store implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Directory-backed store
    Local,
    /// Azure Blob Storage (requires the `azure` feature)
    Azure,
}

/// Object store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend kind
    pub backend: BackendKind,

    /// Root directory for the local backend
    pub root: Option<PathBuf>,

    /// Storage account name for the Azure backend
    pub account: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            root: None,
            account: None,
        }
    }
}

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // ==================== Signatures ====================

    /// Block size for signatures and uploads (0 = derive from file size)
    pub block_size: usize,

    /// Lower bound when deriving the block size
    pub min_block_size: usize,

    /// Upper bound when deriving the block size
    pub max_block_size: usize,

    /// Target block count when deriving the block size
    pub initial_block_count: u64,

    /// Suffix appended to a blob name to locate its signature
    pub signature_suffix: String,

    // ==================== Transfer ====================

    /// Number of concurrent block uploads (0 = auto-detect CPU count)
    pub parallelism: usize,

    /// Verify downloaded files against the content hash recorded on upload
    pub verify_downloads: bool,

    // ==================== Retry ====================

    /// Maximum retries for failed store operations
    pub max_retries: u32,

    /// Retry delay base in milliseconds
    pub retry_delay_ms: u64,

    // ==================== Storage ====================

    /// Object store settings
    pub store: StoreConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            min_block_size: DEFAULT_MIN_BLOCK_SIZE,
            max_block_size: MAX_BLOCK_SIZE,
            initial_block_count: DEFAULT_INITIAL_BLOCK_COUNT,
            signature_suffix: DEFAULT_SIGNATURE_SUFFIX.to_string(),

            parallelism: DEFAULT_PARALLELISM,
            verify_downloads: true,

            max_retries: 10,
            retry_delay_ms: 2000,

            store: StoreConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default config file
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::io("reading config", e))?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default config file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::default_config_path()?;
        self.save_to(&config_path)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io("creating config dir", e))?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("serializing config: {}", e)))?;
        std::fs::write(path, contents).map_err(|e| Error::io("writing config", e))?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("deltablob").join("config.toml"))
            .ok_or_else(|| Error::config("could not determine config directory"))
    }

    /// Reject settings the sync core cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.block_size > self.max_block_size {
            return Err(Error::config(format!(
                "block_size {} exceeds max_block_size {}",
                self.block_size, self.max_block_size
            )));
        }
        if self.min_block_size == 0 || self.min_block_size > self.max_block_size {
            return Err(Error::config(format!(
                "min_block_size must be in 1..={}",
                self.max_block_size
            )));
        }
        if self.initial_block_count == 0 {
            return Err(Error::config("initial_block_count must be positive"));
        }
        if self.signature_suffix.is_empty() {
            return Err(Error::config("signature_suffix must not be empty"));
        }
        Ok(())
    }

    /// Get the effective upload parallelism (resolves 0 to CPU count)
    pub fn effective_parallelism(&self) -> usize {
        if self.parallelism == 0 {
            num_cpus::get()
        } else {
            self.parallelism
        }
    }

    /// Block size to use for a file of the given length.
    ///
    /// Fails with a configuration error when the settings do not validate.
    pub fn block_size_for(&self, file_size: u64) -> Result<usize> {
        self.validate()?;
        if self.block_size > 0 {
            return Ok(self.block_size);
        }
        let derived = file_size / self.initial_block_count;
        Ok((derived as usize).clamp(self.min_block_size, self.max_block_size))
    }

    /// Name of the signature object for a blob
    pub fn signature_name(&self, blob: &str) -> String {
        format!("{}{}", blob, self.signature_suffix)
    }

    /// Parse a size string like "100", "100K", "4M", "1G" into bytes
    pub fn parse_size(s: &str) -> Result<u64> {
        let s = s.trim().to_uppercase();
        if s.is_empty() {
            return Ok(0);
        }

        let (num_part, suffix) = if let Some(n) = s.strip_suffix("KB") {
            (n, 1024u64)
        } else if let Some(n) = s.strip_suffix("MB") {
            (n, 1024u64 * 1024)
        } else if let Some(n) = s.strip_suffix("GB") {
            (n, 1024u64 * 1024 * 1024)
        } else if let Some(n) = s.strip_suffix('K') {
            (n, 1024u64)
        } else if let Some(n) = s.strip_suffix('M') {
            (n, 1024u64 * 1024)
        } else if let Some(n) = s.strip_suffix('G') {
            (n, 1024u64 * 1024 * 1024)
        } else {
            (s.as_str(), 1u64)
        };

        let num: u64 = num_part
            .trim()
            .parse()
            .map_err(|_| Error::config(format!("invalid size value: {}", s)))?;

        num.checked_mul(suffix)
            .ok_or_else(|| Error::config(format!("size value overflows: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.block_size, 0);
        assert_eq!(config.parallelism, 2);
        assert_eq!(config.signature_suffix, ".sig");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_block_size_for() {
        let mut config = Config::default();
        // Small files hit the floor
        assert_eq!(config.block_size_for(1024).unwrap(), DEFAULT_MIN_BLOCK_SIZE);
        // 10k blocks of 100_000 bytes
        assert_eq!(config.block_size_for(1_000_000_000).unwrap(), 100_000);
        // Huge files hit the ceiling
        assert_eq!(config.block_size_for(1 << 40).unwrap(), MAX_BLOCK_SIZE);

        config.block_size = 1024 * 1024;
        assert_eq!(config.block_size_for(12).unwrap(), 1024 * 1024);
    }

    #[test]
    fn test_block_size_for_rejects_inverted_bounds() {
        let config = Config {
            min_block_size: MAX_BLOCK_SIZE + 1,
            ..Default::default()
        };
        assert!(matches!(config.block_size_for(1 << 30), Err(Error::Config { .. })));

        let config = Config {
            initial_block_count: 0,
            ..Default::default()
        };
        assert!(matches!(config.block_size_for(1 << 30), Err(Error::Config { .. })));
    }

    #[test]
    fn test_effective_parallelism() {
        let mut config = Config::default();
        config.parallelism = 0;
        assert!(config.effective_parallelism() > 0);

        config.parallelism = 8;
        assert_eq!(config.effective_parallelism(), 8);
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(Config::parse_size("512").unwrap(), 512);
        assert_eq!(Config::parse_size("4k").unwrap(), 4096);
        assert_eq!(Config::parse_size("1M").unwrap(), 1024 * 1024);
        assert_eq!(Config::parse_size("2MB").unwrap(), 2 * 1024 * 1024);
        assert_eq!(Config::parse_size("").unwrap(), 0);
        assert!(Config::parse_size("lots").is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_block() {
        let config = Config {
            block_size: MAX_BLOCK_SIZE + 1,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.toml");

        let config = Config {
            block_size: 65536,
            parallelism: 4,
            store: StoreConfig {
                backend: BackendKind::Local,
                root: Some(PathBuf::from("/srv/blobs")),
                account: None,
            },
            ..Default::default()
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.block_size, 65536);
        assert_eq!(loaded.parallelism, 4);
        assert_eq!(loaded.store.backend, BackendKind::Local);
        assert_eq!(loaded.store.root, Some(PathBuf::from("/srv/blobs")));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "parallelism = 6\n[store]\nbackend = \"azure\"\n").unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.parallelism, 6);
        assert_eq!(loaded.store.backend, BackendKind::Azure);
        assert_eq!(loaded.max_retries, 10);
    }
}
