//! Engine configuration loaded from a TOML file.

use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{IndexError, Result};

/// Default cooldown between two runs of the same refresh operation.
pub const DEFAULT_MIN_INTERVAL_SECS: u64 = 10;

/// Default period of the full refresh ticker (30 minutes).
pub const DEFAULT_REBUILD_INTERVAL_SECS: u64 = 30 * 60;

/// Default polling period for config file changes.
pub const DEFAULT_CONFIG_POLL_SECS: u64 = 10;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Roots indexed as-is (directories or single files).
    pub paths: Vec<PathBuf>,
    /// Directories whose immediate children each become a root.
    pub root_paths: Vec<PathBuf>,
    pub refresh: RefreshConfig,
    pub cache: CacheConfig,
    pub classify: ClassifyConfig,
    pub helper: Option<HelperConfig>,
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RefreshConfig {
    pub min_interval_secs: u64,
    pub rebuild_interval_secs: u64,
    /// Zero disables config polling.
    pub config_poll_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: DEFAULT_MIN_INTERVAL_SECS,
            rebuild_interval_secs: DEFAULT_REBUILD_INTERVAL_SECS,
            config_poll_secs: DEFAULT_CONFIG_POLL_SECS,
        }
    }
}

impl RefreshConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    /// The ticker period; never zero.
    pub fn rebuild_interval(&self) -> Duration {
        Duration::from_secs(self.rebuild_interval_secs.max(1))
    }

    pub fn config_poll_interval(&self) -> Option<Duration> {
        (self.config_poll_secs > 0).then(|| Duration::from_secs(self.config_poll_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Snapshot directory. `None` disables persistence.
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: Some(PathBuf::from(".pathindex-cache")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifyConfig {
    pub enabled: bool,
    /// MIME prefixes whose files are dropped from the index.
    pub exclude: Vec<String>,
    /// Keep files whose type cannot be determined.
    pub keep_unclassified: bool,
    /// Size of the probe worker pool.
    pub workers: usize,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            exclude: Vec::new(),
            keep_unclassified: true,
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HelperConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    pub enabled: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl EngineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).map_err(|error| IndexError::Config(error.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|error| {
            IndexError::Config(format!("failed to read {}: {error}", path.display()))
        })?;
        Self::from_toml_str(&raw)
            .map_err(|error| IndexError::Config(format!("{}: {error}", path.display())))
    }

    /// Hash of the settings that shape what the tree builder produces.
    ///
    /// Stored next to persisted snapshots; a snapshot built under other
    /// settings is not restored.
    pub fn builder_key(&self) -> u64 {
        let mut hasher = fnv::FnvHasher::default();
        match &self.helper {
            Some(helper) => {
                "helper".hash(&mut hasher);
                helper.program.hash(&mut hasher);
                helper.args.hash(&mut hasher);
            }
            None if self.classify.enabled => {
                "classify".hash(&mut hasher);
                self.classify.exclude.hash(&mut hasher);
                self.classify.keep_unclassified.hash(&mut hasher);
            }
            None => "in-process".hash(&mut hasher),
        }
        hasher.finish()
    }
}

/// Where the scheduler gets its configuration from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    Static(EngineConfig),
    /// Re-read when the file's bytes change.
    File(PathBuf),
}

impl ConfigSource {
    /// Loads the current config together with a hash of the file contents.
    ///
    /// Static configs always report the same hash.
    pub fn load(&self) -> Result<(EngineConfig, u64)> {
        match self {
            Self::Static(config) => Ok((config.clone(), 0)),
            Self::File(path) => {
                let bytes = fs::read(path).map_err(|error| {
                    IndexError::Config(format!("failed to read {}: {error}", path.display()))
                })?;
                let raw = String::from_utf8(bytes).map_err(|_| {
                    IndexError::Config(format!("{} is not valid UTF-8", path.display()))
                })?;
                let config = EngineConfig::from_toml_str(&raw)
                    .map_err(|error| IndexError::Config(format!("{}: {error}", path.display())))?;
                Ok((config, content_hash(raw.as_bytes())))
            }
        }
    }

    /// Hashes the file without parsing it. `None` when unreadable.
    pub fn current_hash(&self) -> Option<u64> {
        match self {
            Self::Static(_) => Some(0),
            Self::File(path) => fs::read(path).ok().map(|bytes| content_hash(&bytes)),
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Self::File(_))
    }
}

fn content_hash(bytes: &[u8]) -> u64 {
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(bytes);
    hasher.finish()
}
