//! Post-flash verification.
//!
//! After a write the board drops off the bus and re-enumerates. Success
//! means it comes back under its Klipper-mode name; a board that reappears
//! only under the bootloader name never started its new firmware.

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::discovery::{self, DeviceMode, DiscoveryError, Scanner};
use crate::interrupt;

/// Default re-enumeration deadline. Generous enough for slow USB hubs and
/// boards with leisurely bootloader exits.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// Verification errors (the "board didn't come back" cases are data, not
/// errors — see [`VerifyOutcome`]).
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error(transparent)]
    Pattern(#[from] DiscoveryError),

    #[error("interrupted while waiting for the device")]
    Interrupted,
}

/// How the wait ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Board reappeared running its freshly flashed firmware.
    Success(PathBuf),
    /// Board reappeared but stayed in bootloader mode: the write did not
    /// complete or the application never started.
    StuckInBootloader(PathBuf),
    /// No matching device appeared before the deadline.
    TimedOut,
}

impl VerifyOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Stable failure phrase, `None` on success.
    pub fn failure_reason(&self) -> Option<&'static str> {
        match self {
            Self::Success(_) => None,
            Self::StuckInBootloader(_) => Some("stuck-in-bootloader"),
            Self::TimedOut => Some("timeout"),
        }
    }
}

/// Poll the by-name directory until a device matching `pattern` shows up in
/// Klipper mode or the timeout expires. `progress` is called roughly every
/// two seconds with the elapsed time.
///
/// A bootloader-mode match is remembered rather than reported immediately:
/// boards pass through the bootloader name on their way up, and a Klipper
/// name seen later wins. Only a deadline with nothing but bootloader
/// sightings counts as stuck.
pub fn wait_for_device(
    scanner: &Scanner,
    pattern: &str,
    timeout: Duration,
    mut progress: impl FnMut(Duration),
) -> Result<VerifyOutcome, VerifyError> {
    let started = Instant::now();
    let deadline = started + timeout;
    let mut last_progress = started;
    let mut bootloader_seen: Option<PathBuf> = None;

    loop {
        let devices = scanner.scan();
        for device in discovery::find_matches(pattern, &devices)? {
            match device.mode {
                DeviceMode::Klipper => {
                    debug!(name = %device.name, "device reappeared in klipper mode");
                    return Ok(VerifyOutcome::Success(device.path.clone()));
                }
                DeviceMode::Bootloader => {
                    bootloader_seen = Some(device.path.clone());
                }
                DeviceMode::Other => {}
            }
        }

        if Instant::now() >= deadline {
            return Ok(match bootloader_seen {
                Some(path) => VerifyOutcome::StuckInBootloader(path),
                None => VerifyOutcome::TimedOut,
            });
        }
        if interrupt::interrupted() {
            return Err(VerifyError::Interrupted);
        }
        if last_progress.elapsed() >= PROGRESS_INTERVAL {
            progress(started.elapsed());
            last_progress = Instant::now();
        }
        thread::sleep(POLL_INTERVAL);
    }
}
