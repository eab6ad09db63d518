//! Firmware flashing.
//!
//! Two write paths: the katapult bootloader's flash tool, and the build
//! system's own `flash` target. Method selection is per device with a
//! global default, plus an optional symmetric one-retry fallback between
//! the two.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::time::Instant;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::make;
use crate::registry::GlobalConfig;
use crate::util;

/// Flash-tool script inside the katapult checkout.
pub const FLASHTOOL_SCRIPT: &str = "scripts/flashtool.py";

/// How a firmware image gets onto a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FlashMethod {
    /// Write through the katapult bootloader's flash tool.
    Katapult,
    /// Let the build system's `flash` target drive the write.
    MakeFlash,
}

impl FlashMethod {
    /// The other method, for the fallback retry.
    pub fn other(self) -> Self {
        match self {
            Self::Katapult => Self::MakeFlash,
            Self::MakeFlash => Self::Katapult,
        }
    }
}

impl fmt::Display for FlashMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Katapult => write!(f, "katapult"),
            Self::MakeFlash => write!(f, "make-flash"),
        }
    }
}

impl FromStr for FlashMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "katapult" => Ok(Self::Katapult),
            "make-flash" => Ok(Self::MakeFlash),
            _ => Err(()),
        }
    }
}

/// Preconditions that must hold before any flash operation.
#[derive(Error, Debug)]
pub enum PreflightError {
    #[error("klipper source tree missing at {0}")]
    KlipperTreeMissing(PathBuf),

    #[error("{0} does not look like a build tree (no Makefile)")]
    NotABuildTree(PathBuf),

    #[error("katapult flash tool missing at {0}")]
    FlashToolMissing(PathBuf),

    #[error("required binary '{0}' not found on PATH")]
    BinaryMissing(&'static str),

    #[error("passwordless sudo is unavailable (needed to stop and start the klipper service)")]
    ElevationUnavailable,
}

/// Validate toolchain and tree preconditions. `katapult_needed` is true
/// when the katapult method is selected for any device or reachable
/// through fallback.
pub fn preflight(global: &GlobalConfig, katapult_needed: bool) -> Result<(), PreflightError> {
    let klipper = global.klipper_src_path();
    if !klipper.is_dir() {
        return Err(PreflightError::KlipperTreeMissing(klipper));
    }
    if !klipper.join(make::MAKEFILE).is_file() {
        return Err(PreflightError::NotABuildTree(klipper));
    }
    which::which("make").map_err(|_| PreflightError::BinaryMissing("make"))?;

    if katapult_needed {
        let tool = global.katapult_src_path().join(FLASHTOOL_SCRIPT);
        if !tool.is_file() {
            return Err(PreflightError::FlashToolMissing(tool));
        }
        which::which("python3").map_err(|_| PreflightError::BinaryMissing("python3"))?;
    }

    if !util::is_root() {
        which::which("sudo").map_err(|_| PreflightError::BinaryMissing("sudo"))?;
        if !passwordless_sudo() {
            return Err(PreflightError::ElevationUnavailable);
        }
    }
    Ok(())
}

fn passwordless_sudo() -> bool {
    Command::new("sudo")
        .args(["-n", "true"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Flash errors.
#[derive(Error, Debug)]
pub enum FlashError {
    #[error("failed to spawn {tool}: {source}")]
    Spawn { tool: String, source: io::Error },

    #[error("{method} flash failed with exit code {code}")]
    Tool { method: FlashMethod, code: i32 },

    /// The flash tool never got a recognizable bootloader response. Boards
    /// like the RP2040 family enter their bootloader by a different
    /// mechanism than the serial request the tool sends.
    #[error("no recognizable bootloader response; the board may use a different bootloader entry mechanism")]
    UnknownBootloader,

    #[error("{primary} failed ({primary_error}); {fallback} fallback failed too ({fallback_error})")]
    BothMethodsFailed {
        primary: FlashMethod,
        primary_error: String,
        fallback: FlashMethod,
        fallback_error: String,
    },
}

/// One timed flash attempt (or attempt-plus-fallback) as recorded in
/// reports.
#[derive(Debug, Clone)]
pub struct FlashResult {
    pub success: bool,
    pub elapsed_secs: f64,
    /// The method that last ran (the fallback one when it was taken).
    pub method: FlashMethod,
    pub error: Option<String>,
}

/// Flash executor bound to the global configuration. `quiet` selects the
/// batch behavior: child output captured (and inspected) rather than
/// inherited.
pub struct Flasher<'a> {
    global: &'a GlobalConfig,
    quiet: bool,
}

impl<'a> Flasher<'a> {
    pub fn new(global: &'a GlobalConfig, quiet: bool) -> Self {
        Self { global, quiet }
    }

    /// Single attempt with one method.
    pub fn flash(
        &self,
        method: FlashMethod,
        device: &Path,
        firmware: &Path,
    ) -> Result<(), FlashError> {
        match method {
            FlashMethod::Katapult => self.flash_katapult(device, firmware),
            FlashMethod::MakeFlash => self.flash_make(device),
        }
    }

    fn flash_katapult(&self, device: &Path, firmware: &Path) -> Result<(), FlashError> {
        let tool = self.global.katapult_src_path().join(FLASHTOOL_SCRIPT);
        let mut cmd = Command::new("python3");
        cmd.arg(&tool).arg("-d").arg(device).arg("-f").arg(firmware);
        debug!(device = %device.display(), "katapult flash");
        self.run_tool(cmd, FlashMethod::Katapult)
    }

    fn flash_make(&self, device: &Path) -> Result<(), FlashError> {
        let mut cmd = Command::new("make");
        cmd.arg("flash")
            .current_dir(self.global.klipper_src_path())
            .env("FLASH_DEVICE", device);
        debug!(device = %device.display(), "make flash");
        self.run_tool(cmd, FlashMethod::MakeFlash)
    }

    fn run_tool(&self, mut cmd: Command, method: FlashMethod) -> Result<(), FlashError> {
        let spawn_err = |source| FlashError::Spawn {
            tool: method.to_string(),
            source,
        };
        if self.quiet {
            let output = cmd.output().map_err(spawn_err)?;
            if output.status.success() {
                return Ok(());
            }
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            if unknown_bootloader_response(&text) {
                return Err(FlashError::UnknownBootloader);
            }
            Err(FlashError::Tool {
                method,
                code: output.status.code().unwrap_or(-1),
            })
        } else {
            let status = cmd.status().map_err(spawn_err)?;
            if status.success() {
                return Ok(());
            }
            Err(FlashError::Tool {
                method,
                code: status.code().unwrap_or(-1),
            })
        }
    }

    /// One attempt with the selected method, then at most one retry with
    /// the other method when fallback is permitted. Always returns a
    /// result record; the caller decides what a failure means.
    pub fn flash_with_fallback(
        &self,
        method: FlashMethod,
        allow_fallback: bool,
        device: &Path,
        firmware: &Path,
    ) -> FlashResult {
        let started = Instant::now();
        match self.flash(method, device, firmware) {
            Ok(()) => FlashResult {
                success: true,
                elapsed_secs: started.elapsed().as_secs_f64(),
                method,
                error: None,
            },
            Err(primary_error) if allow_fallback => {
                let fallback = method.other();
                warn!(%method, %fallback, error = %primary_error, "flash failed, retrying with fallback method");
                match self.flash(fallback, device, firmware) {
                    Ok(()) => FlashResult {
                        success: true,
                        elapsed_secs: started.elapsed().as_secs_f64(),
                        method: fallback,
                        error: None,
                    },
                    Err(fallback_error) => FlashResult {
                        success: false,
                        elapsed_secs: started.elapsed().as_secs_f64(),
                        method: fallback,
                        error: Some(
                            FlashError::BothMethodsFailed {
                                primary: method,
                                primary_error: primary_error.to_string(),
                                fallback,
                                fallback_error: fallback_error.to_string(),
                            }
                            .to_string(),
                        ),
                    },
                }
            }
            Err(e) => FlashResult {
                success: false,
                elapsed_secs: started.elapsed().as_secs_f64(),
                method,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Katapult's flash tool prints a recognizable complaint when the target
/// never answers the bootloader handshake.
fn unknown_bootloader_response(output: &str) -> bool {
    const MARKERS: [&str; 3] = [
        "Unable to enter bootloader",
        "Unable to verify bootloader",
        "no response from bootloader",
    ];
    MARKERS.iter().any(|marker| output.contains(marker))
}

/// Effective method for one device: the per-device override when present,
/// else the global default.
pub fn effective_method(override_method: Option<FlashMethod>, global: &GlobalConfig) -> FlashMethod {
    override_method.unwrap_or(global.default_flash_method)
}
