//! Per-device firmware configuration snapshots.
//!
//! The build tree has a single Kconfig dotfile, so every registered device
//! keeps its own copy under the cache root and the flash pipeline swaps it
//! in and out. Copies in either direction are atomic.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::registry::GlobalConfig;
use crate::util;

/// Kconfig dotfile name at the build-tree root.
pub const BUILD_CONFIG_FILE: &str = ".config";

/// Config-cache errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("device '{0}' has no cached config (run menuconfig first)")]
    Missing(String),

    #[error("build tree has no config file at {0}")]
    NoBuildConfig(PathBuf),

    #[error("no CONFIG_MCU line in {0}")]
    McuLineMissing(PathBuf),

    #[error("failed to copy config {from} -> {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    #[error("failed to access {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("cache for '{0}' already exists")]
    TargetExists(String),

    #[error("failed to move cache {from} -> {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
}

/// Where device config snapshots live: the configured override when set,
/// else `configs/` under the application config directory.
pub fn resolve_cache_root(global: &GlobalConfig) -> PathBuf {
    match global.cache_root.as_deref() {
        Some(raw) if !raw.trim().is_empty() => util::expand_path(raw),
        _ => util::config_home().join("configs"),
    }
}

/// Move a device's cache directory to a new key. Fails when the target key
/// already has a cache; missing source is fine (nothing cached yet).
pub fn rename_cache(cache_root: &Path, old_key: &str, new_key: &str) -> Result<(), ConfigError> {
    let from = cache_root.join(old_key);
    let to = cache_root.join(new_key);
    if !from.exists() {
        return Ok(());
    }
    if to.exists() {
        return Err(ConfigError::TargetExists(new_key.to_string()));
    }
    util::move_dir(&from, &to).map_err(|source| ConfigError::Rename { from, to, source })
}

/// One device's view of the cache: its snapshot file plus the shared
/// build-tree dotfile it swaps against.
#[derive(Debug, Clone)]
pub struct DeviceConfigCache {
    key: String,
    cache_file: PathBuf,
    build_config: PathBuf,
}

impl DeviceConfigCache {
    pub fn new(cache_root: &Path, key: &str, build_tree: &Path) -> Self {
        Self {
            key: key.to_string(),
            cache_file: cache_root.join(key).join(BUILD_CONFIG_FILE),
            build_config: build_tree.join(BUILD_CONFIG_FILE),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn cache_file(&self) -> &Path {
        &self.cache_file
    }

    pub fn build_config(&self) -> &Path {
        &self.build_config
    }

    pub fn has_cache(&self) -> bool {
        self.cache_file.is_file()
    }

    /// Copy the cached snapshot into the build tree.
    pub fn load_into_build_tree(&self) -> Result<(), ConfigError> {
        if !self.has_cache() {
            return Err(ConfigError::Missing(self.key.clone()));
        }
        debug!(device = %self.key, "loading cached config into build tree");
        copy_atomic(&self.cache_file, &self.build_config)
    }

    /// Snapshot the build-tree dotfile into the cache.
    pub fn save_from_build_tree(&self) -> Result<(), ConfigError> {
        if !self.build_config.is_file() {
            return Err(ConfigError::NoBuildConfig(self.build_config.clone()));
        }
        debug!(device = %self.key, "saving build-tree config to cache");
        copy_atomic(&self.build_config, &self.cache_file)
    }

    /// Remove the build-tree dotfile, if present.
    pub fn clear_build_tree_config(&self) -> Result<(), ConfigError> {
        match fs::remove_file(&self.build_config) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ConfigError::Io {
                path: self.build_config.clone(),
                source,
            }),
        }
    }

    /// Put the build tree back to this device's last cached state: the
    /// cached config when one exists, otherwise no config at all.
    pub fn reset_build_tree(&self) -> Result<(), ConfigError> {
        if self.has_cache() {
            self.load_into_build_tree()
        } else {
            self.clear_build_tree_config()
        }
    }

    /// Check the build-tree config's MCU selector against the registry's
    /// expectation. Returns the match flag and the actual value; the value
    /// is `None` when the file carries no `CONFIG_MCU` line at all.
    pub fn validate_mcu(&self, expected: &str) -> Result<(bool, Option<String>), ConfigError> {
        let text = match fs::read_to_string(&self.build_config) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigError::NoBuildConfig(self.build_config.clone()))
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.build_config.clone(),
                    source,
                })
            }
        };
        match extract_mcu(&text) {
            Some(actual) => {
                let matched = mcu_matches(expected, &actual);
                Ok((matched, Some(actual)))
            }
            None => Ok((false, None)),
        }
    }
}

fn copy_atomic(from: &Path, to: &Path) -> Result<(), ConfigError> {
    let bytes = fs::read(from).map_err(|source| ConfigError::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    })?;
    util::write_atomic(to, &bytes).map_err(|source| ConfigError::Copy {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    })
}

/// Pull the `CONFIG_MCU` value out of a Kconfig dotfile. Assignments are
/// escape-free `KEY=value` lines; the value may be quoted. Commented lines
/// (including Kconfig's `# CONFIG_MCU is not set`) are skipped.
pub fn extract_mcu(text: &str) -> Option<String> {
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        if key.trim() != "CONFIG_MCU" {
            continue;
        }
        let value = value.trim().trim_matches('"').trim();
        if !value.is_empty() {
            return Some(value.to_string());
        }
    }
    None
}

/// Bidirectional prefix match: `stm32h723` accepts `stm32h723xx` and the
/// other way round. Case-sensitive.
pub fn mcu_matches(expected: &str, actual: &str) -> bool {
    expected.starts_with(actual) || actual.starts_with(expected)
}
