//! Discovery of serial endpoints under `/dev/serial/by-id`.
//!
//! The kernel keeps one stable symlink per USB serial function; the
//! filename's leading token says whether the board is running Klipper or
//! sitting in the katapult bootloader, and the embedded hardware serial
//! survives the transition between the two.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::util;

/// Directory the kernel populates with stable by-name serial symlinks.
pub const SERIAL_BY_ID_DIR: &str = "/dev/serial/by-id";

const KLIPPER_PREFIX: &str = "usb-Klipper_";
const KATAPULT_PREFIX: &str = "usb-katapult_";

/// Discovery errors.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("invalid serial pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },

    #[error("no connected device matches '{0}'")]
    NoMatch(String),

    #[error("pattern '{pattern}' matches {count} devices; registration is ambiguous")]
    AmbiguousMatch { pattern: String, count: usize },
}

/// What the endpoint's name prefix says about the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    /// Running flashed firmware (`usb-Klipper_...`).
    Klipper,
    /// Awaiting firmware in the katapult bootloader (`usb-katapult_...`).
    Bootloader,
    /// Some other serial device.
    Other,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Klipper => write!(f, "klipper"),
            Self::Bootloader => write!(f, "bootloader"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// One endpoint from a single scan. Valid only until the next USB
/// re-enumeration; rescan after anything that could replug a board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Stable by-name symlink path.
    pub path: PathBuf,
    /// Last path segment (encodes the mode prefix and hardware serial).
    pub name: String,
    pub mode: DeviceMode,
}

/// Classify an endpoint filename by its leading token. Every name lands in
/// exactly one class.
pub fn classify(name: &str) -> DeviceMode {
    if name.starts_with(KLIPPER_PREFIX) {
        DeviceMode::Klipper
    } else if name.starts_with(KATAPULT_PREFIX) {
        DeviceMode::Bootloader
    } else {
        DeviceMode::Other
    }
}

/// Scanner over a by-name symlink directory. The directory is injectable so
/// tests (and the verifier) can point it anywhere.
#[derive(Debug, Clone)]
pub struct Scanner {
    dir: PathBuf,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new(SERIAL_BY_ID_DIR)
    }
}

impl Scanner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// One scan, sorted by filename. A missing directory means the kernel
    /// has no serial devices registered, which is an empty result rather
    /// than an error.
    pub fn scan(&self) -> Vec<DiscoveredDevice> {
        let mut devices = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.dir.display(), error = %e, "no serial endpoints");
                return devices;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let mode = classify(&name);
            devices.push(DiscoveredDevice {
                path: entry.path(),
                name,
                mode,
            });
        }
        devices.sort_by(|a, b| a.name.cmp(&b.name));
        devices
    }
}

/// All devices whose filename matches the glob, in scan order.
pub fn find_matches<'a>(
    pattern: &str,
    devices: &'a [DiscoveredDevice],
) -> Result<Vec<&'a DiscoveredDevice>, DiscoveryError> {
    let compiled = glob::Pattern::new(pattern).map_err(|source| DiscoveryError::Pattern {
        pattern: pattern.to_string(),
        source,
    })?;
    Ok(devices.iter().filter(|d| compiled.matches(&d.name)).collect())
}

/// First device matching the glob. With multiple matches the first is
/// returned and the caller is expected to surface the ambiguity.
pub fn match_device<'a>(
    pattern: &str,
    devices: &'a [DiscoveredDevice],
) -> Result<Option<&'a DiscoveredDevice>, DiscoveryError> {
    Ok(find_matches(pattern, devices)?.into_iter().next())
}

/// Exactly one match, for operations that must never pick among
/// candidates.
pub fn match_one<'a>(
    pattern: &str,
    devices: &'a [DiscoveredDevice],
) -> Result<&'a DiscoveredDevice, DiscoveryError> {
    let matches = find_matches(pattern, devices)?;
    match matches.as_slice() {
        [] => Err(DiscoveryError::NoMatch(pattern.to_string())),
        [single] => Ok(*single),
        many => Err(DiscoveryError::AmbiguousMatch {
            pattern: pattern.to_string(),
            count: many.len(),
        }),
    }
}

/// The hardware-serial token of a Klipper/katapult endpoint name, e.g.
/// `29001A000851` out of `usb-Klipper_stm32h723xx_29001A000851-if00`.
pub fn hardware_serial(name: &str) -> Option<&str> {
    let rest = name
        .strip_prefix(KLIPPER_PREFIX)
        .or_else(|| name.strip_prefix(KATAPULT_PREFIX))?;
    let rest = rest.rsplit_once("-if").map(|(head, _)| head).unwrap_or(rest);
    let (_, serial) = rest.rsplit_once('_')?;
    (!serial.is_empty()).then_some(serial)
}

/// The MCU token of a Klipper/katapult endpoint name (everything between
/// the mode prefix and the serial).
pub fn mcu_hint(name: &str) -> Option<&str> {
    let rest = name
        .strip_prefix(KLIPPER_PREFIX)
        .or_else(|| name.strip_prefix(KATAPULT_PREFIX))?;
    let rest = rest.rsplit_once("-if").map(|(head, _)| head).unwrap_or(rest);
    let (mcu, _) = rest.rsplit_once('_')?;
    (!mcu.is_empty()).then_some(mcu)
}

/// Derive a pattern that matches this physical board in both Klipper and
/// bootloader mode: the hardware serial pinned, wildcards on both sides.
pub fn cross_mode_pattern(device: &DiscoveredDevice) -> Option<String> {
    hardware_serial(&device.name).map(|serial| format!("usb-*_{serial}*"))
}

/// USB reset errors.
#[derive(Error, Debug)]
pub enum UsbResetError {
    #[error("USB reset requires root privileges")]
    NotRoot,

    #[error("could not resolve {path}: {source}")]
    Resolve { path: PathBuf, source: io::Error },

    #[error("no USB `authorized` control under {0}")]
    NoAuthorized(PathBuf),

    #[error("writing {path} failed: {source}")]
    Sysfs { path: PathBuf, source: io::Error },
}

/// Power-cycle a serial device's USB port by deauthorizing and
/// reauthorizing its parent USB device through sysfs. Last-resort recovery
/// for boards the flash tool cannot talk out of a wedged state.
pub fn usb_reset(by_id_path: &Path) -> Result<(), UsbResetError> {
    if !util::is_root() {
        return Err(UsbResetError::NotRoot);
    }

    let tty = fs::canonicalize(by_id_path).map_err(|source| UsbResetError::Resolve {
        path: by_id_path.to_path_buf(),
        source,
    })?;
    let tty_name = tty
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    // /sys/class/tty/<tty>/device points at the USB interface; its parent
    // is the USB device that owns the `authorized` control.
    let device_link = PathBuf::from(format!("/sys/class/tty/{tty_name}/device"));
    let interface = fs::canonicalize(&device_link).map_err(|source| UsbResetError::Resolve {
        path: device_link,
        source,
    })?;
    let usb_device = interface
        .parent()
        .ok_or_else(|| UsbResetError::NoAuthorized(interface.clone()))?;
    let authorized = usb_device.join("authorized");
    if !authorized.is_file() {
        return Err(UsbResetError::NoAuthorized(usb_device.to_path_buf()));
    }

    warn!(device = %by_id_path.display(), "power-cycling USB port");
    write_sysfs(&authorized, "0")?;
    thread::sleep(Duration::from_millis(500));
    write_sysfs(&authorized, "1")?;
    Ok(())
}

fn write_sysfs(path: &Path, value: &str) -> Result<(), UsbResetError> {
    fs::write(path, value).map_err(|source| UsbResetError::Sysfs {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KLIPPER_NAME: &str = "usb-Klipper_stm32h723xx_29001A000851313339373836-if00";
    const KATAPULT_NAME: &str = "usb-katapult_stm32h723xx_29001A000851313339373836-if00";

    fn scan_dir(names: &[&str]) -> (tempfile::TempDir, Scanner) {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            fs::write(dir.path().join(name), "").unwrap();
        }
        let scanner = Scanner::new(dir.path());
        (dir, scanner)
    }

    #[test]
    fn classification_is_exclusive() {
        for name in [KLIPPER_NAME, KATAPULT_NAME, "usb-CP2102_USB_to_UART-if00", "pci-x"] {
            let mode = classify(name);
            let classes = [DeviceMode::Klipper, DeviceMode::Bootloader, DeviceMode::Other];
            assert_eq!(classes.iter().filter(|c| **c == mode).count(), 1);
        }
        assert_eq!(classify(KLIPPER_NAME), DeviceMode::Klipper);
        assert_eq!(classify(KATAPULT_NAME), DeviceMode::Bootloader);
        // Case matters: the kernel name uses exactly these prefixes.
        assert_eq!(classify("usb-klipper_stm32_x-if00"), DeviceMode::Other);
    }

    #[test]
    fn scan_sorts_by_filename() {
        let (_dir, scanner) = scan_dir(&[KATAPULT_NAME, "usb-Arduino_Uno-if00", KLIPPER_NAME]);
        let devices = scanner.scan();
        let names: Vec<_> = devices.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["usb-Arduino_Uno-if00", KLIPPER_NAME, KATAPULT_NAME]
        );
        assert_eq!(devices[0].mode, DeviceMode::Other);
    }

    #[test]
    fn scan_of_missing_directory_is_empty() {
        let scanner = Scanner::new("/nonexistent/by-id");
        assert!(scanner.scan().is_empty());
    }

    #[test]
    fn match_device_applies_glob() {
        let (_dir, scanner) = scan_dir(&[KLIPPER_NAME, "usb-Arduino_Uno-if00"]);
        let devices = scanner.scan();
        let found = match_device("usb-*_29001A000851*", &devices).unwrap().unwrap();
        assert_eq!(found.name, KLIPPER_NAME);
        assert!(match_device("usb-*_DEADBEEF*", &devices).unwrap().is_none());
        assert!(matches!(
            match_device("[broken", &devices),
            Err(DiscoveryError::Pattern { .. })
        ));
    }

    #[test]
    fn cross_mode_pattern_matches_both_names() {
        let (_dir, scanner) = scan_dir(&[KLIPPER_NAME]);
        let devices = scanner.scan();
        let pattern = cross_mode_pattern(&devices[0]).unwrap();
        let compiled = glob::Pattern::new(&pattern).unwrap();
        assert!(compiled.matches(KLIPPER_NAME));
        assert!(compiled.matches(KATAPULT_NAME));
        assert!(!compiled.matches("usb-Klipper_stm32h723xx_FFFF-if00"));
    }

    #[test]
    fn find_matches_returns_every_match() {
        let (_dir, scanner) = scan_dir(&[KLIPPER_NAME, KATAPULT_NAME]);
        let devices = scanner.scan();
        let matches = find_matches("usb-*_29001A000851*", &devices).unwrap();
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn match_one_requires_exactly_one() {
        let (_dir, scanner) = scan_dir(&[KLIPPER_NAME, KATAPULT_NAME]);
        let devices = scanner.scan();
        assert!(matches!(
            match_one("usb-*_29001A000851*", &devices),
            Err(DiscoveryError::AmbiguousMatch { count: 2, .. })
        ));
        assert!(matches!(
            match_one("usb-*_FFFF*", &devices),
            Err(DiscoveryError::NoMatch(_))
        ));
        assert_eq!(
            match_one(KLIPPER_NAME, &devices).unwrap().name,
            KLIPPER_NAME
        );
    }

    #[test]
    fn serial_and_mcu_extraction() {
        assert_eq!(
            hardware_serial(KLIPPER_NAME),
            Some("29001A000851313339373836")
        );
        assert_eq!(
            hardware_serial(KATAPULT_NAME),
            Some("29001A000851313339373836")
        );
        assert_eq!(mcu_hint(KLIPPER_NAME), Some("stm32h723xx"));
        assert_eq!(hardware_serial("usb-Arduino_Uno-if00"), None);
        assert_eq!(hardware_serial("usb-Klipper_noserial-if00"), None);
    }
}
