//! Device registry persistence.
//!
//! One TOML document holds the global settings and every registered board.
//! All mutations go through load-modify-save of the whole document; device
//! keys live in a `BTreeMap` so a save is always byte-stable and diffs stay
//! meaningful. Writes are atomic (temp file, fsync, rename-over).

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::flash::FlashMethod;
use crate::util;

/// Registry file name under the application config directory.
pub const REGISTRY_FILE: &str = "registry.toml";

/// Registry errors.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to read registry at {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    /// The file exists but is not a valid registry document. Never silently
    /// replaced: the operator has to fix or remove it.
    #[error("registry at {path} is malformed: {source}")]
    Parse {
        path: PathBuf,
        source: Box<toml::de::Error>,
    },

    #[error("failed to write registry at {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("could not serialize registry: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("device '{0}' is not registered")]
    UnknownDevice(String),

    #[error("device key '{0}' already exists")]
    DuplicateKey(String),
}

/// Global settings shared by every flash operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Klipper source tree (the shared build tree).
    pub klipper_src: String,
    /// Katapult checkout holding `scripts/flashtool.py`.
    pub katapult_src: String,
    pub default_flash_method: FlashMethod,
    /// Permit one retry with the other flash method when the selected one
    /// fails.
    pub allow_flash_fallback: bool,
    /// Config-cache root override; empty/absent means the default under the
    /// user config directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_root: Option<String>,
    /// Skip the menuconfig step when a device already has a cached config.
    pub skip_menuconfig: bool,
    /// Pause between devices in the flash-all flow, seconds.
    pub stagger_delay_secs: u64,
    /// Pause before returning to the caller after an action, seconds
    /// (consumed by interactive front ends).
    pub post_action_delay_secs: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            klipper_src: "~/klipper".to_string(),
            katapult_src: "~/katapult".to_string(),
            default_flash_method: FlashMethod::Katapult,
            allow_flash_fallback: true,
            cache_root: None,
            skip_menuconfig: false,
            stagger_delay_secs: 2,
            post_action_delay_secs: 2,
        }
    }
}

impl GlobalConfig {
    pub fn klipper_src_path(&self) -> PathBuf {
        util::expand_path(&self.klipper_src)
    }

    pub fn katapult_src_path(&self) -> PathBuf {
        util::expand_path(&self.katapult_src)
    }
}

fn default_flashable() -> bool {
    true
}

/// One registered board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Human-facing display name. The registry key is a slug of this.
    pub name: String,
    /// MCU family selector expected in the device's firmware config
    /// (e.g. `stm32h723xx`, `rp2040`).
    pub mcu: String,
    /// Glob matched against `/dev/serial/by-id` filenames. Stored in the
    /// cross-mode form so one entry matches the board before and after a
    /// flash.
    pub serial_pattern: String,
    /// Per-device flash method; absent means the global default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flash_method: Option<FlashMethod>,
    /// Excluded from all flash operations when false.
    #[serde(default = "default_flashable")]
    pub flashable: bool,
}

/// Value-typed view of the whole registry document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceEntry>,
}

/// Derive the stable internal key from a display name: lowercase ASCII
/// alphanumerics, everything else collapsed to single dashes.
pub fn device_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !key.is_empty() {
                key.push('-');
            }
            pending_dash = false;
            key.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    key
}

/// Handle on the registry file. Holds only the path; every operation is a
/// pure load or save against it.
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `registry.toml` under the application config directory.
    pub fn default_path() -> PathBuf {
        util::config_home().join(REGISTRY_FILE)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document. A missing file is first-run and yields the empty
    /// snapshot; malformed content is a hard error. Unknown fields are
    /// ignored, missing fields take defaults.
    pub fn load(&self) -> Result<RegistrySnapshot, RegistryError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no registry yet, starting empty");
                return Ok(RegistrySnapshot::default());
            }
            Err(source) => {
                return Err(RegistryError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        toml::from_str(&text).map_err(|source| RegistryError::Parse {
            path: self.path.clone(),
            source: Box::new(source),
        })
    }

    /// Persist a snapshot atomically. The output is identical for equal
    /// snapshots (sorted device keys, fixed field order).
    pub fn save(&self, snapshot: &RegistrySnapshot) -> Result<(), RegistryError> {
        let text = toml::to_string_pretty(snapshot)?;
        util::write_atomic(&self.path, text.as_bytes()).map_err(|source| RegistryError::Write {
            path: self.path.clone(),
            source,
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<DeviceEntry>, RegistryError> {
        Ok(self.load()?.devices.get(key).cloned())
    }

    /// Register a new device. The key is derived from the display name;
    /// a duplicate key is rejected. Returns the key.
    pub fn add(&self, entry: DeviceEntry) -> Result<String, RegistryError> {
        let key = device_key(&entry.name);
        let mut snapshot = self.load()?;
        if snapshot.devices.contains_key(&key) {
            return Err(RegistryError::DuplicateKey(key));
        }
        snapshot.devices.insert(key.clone(), entry);
        self.save(&snapshot)?;
        Ok(key)
    }

    /// Apply `patch` to an existing entry.
    pub fn update(
        &self,
        key: &str,
        patch: impl FnOnce(&mut DeviceEntry),
    ) -> Result<(), RegistryError> {
        let mut snapshot = self.load()?;
        let entry = snapshot
            .devices
            .get_mut(key)
            .ok_or_else(|| RegistryError::UnknownDevice(key.to_string()))?;
        patch(entry);
        self.save(&snapshot)
    }

    pub fn remove(&self, key: &str) -> Result<DeviceEntry, RegistryError> {
        let mut snapshot = self.load()?;
        let entry = snapshot
            .devices
            .remove(key)
            .ok_or_else(|| RegistryError::UnknownDevice(key.to_string()))?;
        self.save(&snapshot)?;
        Ok(entry)
    }

    pub fn set_flashable(&self, key: &str, flashable: bool) -> Result<(), RegistryError> {
        self.update(key, |entry| entry.flashable = flashable)
    }

    pub fn load_global(&self) -> Result<GlobalConfig, RegistryError> {
        Ok(self.load()?.global)
    }

    pub fn save_global(&self, global: GlobalConfig) -> Result<(), RegistryError> {
        let mut snapshot = self.load()?;
        snapshot.global = global;
        self.save(&snapshot)
    }
}

/// Apply one `key=value` settings change to the global section. Used by the
/// settings command; returns a description of the accepted change.
pub fn apply_setting(
    global: &mut GlobalConfig,
    key: &str,
    value: &str,
) -> Result<(), String> {
    match key {
        "klipper_src" => global.klipper_src = value.to_string(),
        "katapult_src" => global.katapult_src = value.to_string(),
        "default_flash_method" => {
            global.default_flash_method = value
                .parse()
                .map_err(|_| format!("unknown flash method '{value}'"))?;
        }
        "allow_flash_fallback" => {
            global.allow_flash_fallback = parse_bool(value)?;
        }
        "cache_root" => {
            global.cache_root = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            };
        }
        "skip_menuconfig" => global.skip_menuconfig = parse_bool(value)?,
        "stagger_delay_secs" => {
            global.stagger_delay_secs = value
                .parse()
                .map_err(|_| format!("'{value}' is not a number of seconds"))?;
        }
        "post_action_delay_secs" => {
            global.post_action_delay_secs = value
                .parse()
                .map_err(|_| format!("'{value}' is not a number of seconds"))?;
        }
        other => return Err(format!("unknown setting '{other}'")),
    }
    Ok(())
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(format!("'{other}' is not a boolean")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(name: &str) -> DeviceEntry {
        DeviceEntry {
            name: name.to_string(),
            mcu: "stm32h723xx".to_string(),
            serial_pattern: "usb-*_ABC123*".to_string(),
            flash_method: None,
            flashable: true,
        }
    }

    fn temp_registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path().join(REGISTRY_FILE));
        (dir, registry)
    }

    #[test]
    fn missing_file_loads_empty_snapshot() {
        let (_dir, registry) = temp_registry();
        let snapshot = registry.load().unwrap();
        assert!(snapshot.devices.is_empty());
        assert_eq!(snapshot.global, GlobalConfig::default());
    }

    #[test]
    fn save_then_load_roundtrips() {
        let (_dir, registry) = temp_registry();
        let mut snapshot = RegistrySnapshot::default();
        snapshot.global.stagger_delay_secs = 7;
        snapshot
            .devices
            .insert("octopus-pro".to_string(), sample_entry("Octopus Pro"));
        registry.save(&snapshot).unwrap();
        assert_eq!(registry.load().unwrap(), snapshot);
    }

    #[test]
    fn save_output_is_stable() {
        let (_dir, registry) = temp_registry();
        let mut snapshot = RegistrySnapshot::default();
        snapshot
            .devices
            .insert("b-board".to_string(), sample_entry("B Board"));
        snapshot
            .devices
            .insert("a-board".to_string(), sample_entry("A Board"));
        registry.save(&snapshot).unwrap();
        let first = std::fs::read_to_string(registry.path()).unwrap();
        registry.save(&snapshot).unwrap();
        let second = std::fs::read_to_string(registry.path()).unwrap();
        assert_eq!(first, second);
        // Device keys appear in sorted order.
        assert!(first.find("a-board").unwrap() < first.find("b-board").unwrap());
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let (_dir, registry) = temp_registry();
        std::fs::create_dir_all(registry.path().parent().unwrap()).unwrap();
        std::fs::write(registry.path(), "this is { not toml").unwrap();
        match registry.load() {
            Err(RegistryError::Parse { .. }) => {}
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let (_dir, registry) = temp_registry();
        std::fs::create_dir_all(registry.path().parent().unwrap()).unwrap();
        std::fs::write(
            registry.path(),
            r#"
[global]
klipper_src = "/opt/klipper"
some_future_knob = 42

[devices.nitehawk]
name = "Nitehawk"
mcu = "rp2040"
serial_pattern = "usb-*_E66138*"
extra_field = "ignored"
"#,
        )
        .unwrap();
        let snapshot = registry.load().unwrap();
        assert_eq!(snapshot.global.klipper_src, "/opt/klipper");
        assert_eq!(snapshot.devices["nitehawk"].mcu, "rp2040");
    }

    #[test]
    fn missing_fields_take_defaults() {
        let (_dir, registry) = temp_registry();
        std::fs::create_dir_all(registry.path().parent().unwrap()).unwrap();
        std::fs::write(
            registry.path(),
            r#"
[devices.ebb36]
name = "EBB36"
mcu = "stm32g0b1xx"
serial_pattern = "usb-*_4E0032*"
"#,
        )
        .unwrap();
        let snapshot = registry.load().unwrap();
        let entry = &snapshot.devices["ebb36"];
        assert!(entry.flashable);
        assert!(entry.flash_method.is_none());
        assert_eq!(snapshot.global.default_flash_method, FlashMethod::Katapult);
    }

    #[test]
    fn add_rejects_duplicate_key() {
        let (_dir, registry) = temp_registry();
        let key = registry.add(sample_entry("Octopus Pro")).unwrap();
        assert_eq!(key, "octopus-pro");
        match registry.add(sample_entry("octopus  PRO")) {
            Err(RegistryError::DuplicateKey(k)) => assert_eq!(k, "octopus-pro"),
            other => panic!("expected duplicate key error, got {other:?}"),
        }
    }

    #[test]
    fn update_and_remove() {
        let (_dir, registry) = temp_registry();
        let key = registry.add(sample_entry("Octopus Pro")).unwrap();
        registry
            .update(&key, |e| e.flash_method = Some(FlashMethod::MakeFlash))
            .unwrap();
        assert_eq!(
            registry.get(&key).unwrap().unwrap().flash_method,
            Some(FlashMethod::MakeFlash)
        );
        registry.set_flashable(&key, false).unwrap();
        assert!(!registry.get(&key).unwrap().unwrap().flashable);
        registry.remove(&key).unwrap();
        assert!(registry.get(&key).unwrap().is_none());
        assert!(matches!(
            registry.remove(&key),
            Err(RegistryError::UnknownDevice(_))
        ));
    }

    #[test]
    fn device_key_slugs() {
        assert_eq!(device_key("Octopus Pro"), "octopus-pro");
        assert_eq!(device_key("  EBB36 (toolhead) "), "ebb36-toolhead");
        assert_eq!(device_key("nitehawk_36"), "nitehawk-36");
        assert_eq!(device_key("SB2040v2"), "sb2040v2");
    }

    #[test]
    fn apply_setting_updates_fields() {
        let mut global = GlobalConfig::default();
        apply_setting(&mut global, "klipper_src", "/srv/klipper").unwrap();
        apply_setting(&mut global, "default_flash_method", "make-flash").unwrap();
        apply_setting(&mut global, "allow_flash_fallback", "no").unwrap();
        apply_setting(&mut global, "stagger_delay_secs", "5").unwrap();
        assert_eq!(global.klipper_src, "/srv/klipper");
        assert_eq!(global.default_flash_method, FlashMethod::MakeFlash);
        assert!(!global.allow_flash_fallback);
        assert_eq!(global.stagger_delay_secs, 5);
        assert!(apply_setting(&mut global, "bogus", "1").is_err());
        assert!(apply_setting(&mut global, "stagger_delay_secs", "soon").is_err());
    }
}
