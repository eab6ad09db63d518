//! Scoped control of the Klipper host service.
//!
//! The daemon owns every MCU serial port while it runs, so flashing needs a
//! window with the service stopped. `with_stopped` provides that window and
//! guarantees a restart attempt on every exit path, including panics.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::{debug, warn};

use crate::util;

/// systemd unit of the host control daemon.
pub const KLIPPER_UNIT: &str = "klipper";

/// Service-control errors.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("'systemctl stop {unit}' exited with code {code}")]
    StopFailed { unit: String, code: i32 },

    #[error("'systemctl start {unit}' exited with code {code}")]
    StartFailed { unit: String, code: i32 },
}

/// Handle on one systemd unit. Stateless beyond its configuration; the
/// stopped window exists only inside `with_stopped`.
#[derive(Debug, Clone)]
pub struct ServiceController {
    unit: String,
    systemctl: PathBuf,
    use_sudo: bool,
}

impl Default for ServiceController {
    fn default() -> Self {
        Self::new(KLIPPER_UNIT)
    }
}

impl ServiceController {
    pub fn new(unit: &str) -> Self {
        Self::custom(unit, PathBuf::from("systemctl"), !util::is_root())
    }

    /// Full control over the invoked binary and elevation, for deployments
    /// with systemd elsewhere on the path and for tests.
    pub fn custom(unit: &str, systemctl: PathBuf, use_sudo: bool) -> Self {
        Self {
            unit: unit.to_string(),
            systemctl,
            use_sudo,
        }
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    fn run(&self, action: &str) -> Result<(), ServiceError> {
        let mut cmd = if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(&self.systemctl);
            cmd
        } else {
            Command::new(&self.systemctl)
        };
        cmd.arg(action).arg(&self.unit);
        cmd.stdout(Stdio::null()).stderr(Stdio::null());

        debug!(unit = %self.unit, action, "service control");
        let status = cmd.status().map_err(|source| ServiceError::Spawn {
            command: format!("systemctl {action} {}", self.unit),
            source,
        })?;
        if status.success() {
            return Ok(());
        }
        let code = status.code().unwrap_or(-1);
        match action {
            "stop" => Err(ServiceError::StopFailed {
                unit: self.unit.clone(),
                code,
            }),
            _ => Err(ServiceError::StartFailed {
                unit: self.unit.clone(),
                code,
            }),
        }
    }

    pub fn stop(&self) -> Result<(), ServiceError> {
        self.run("stop")
    }

    pub fn start(&self) -> Result<(), ServiceError> {
        self.run("start")
    }

    /// Stop the service, run `block`, restart the service. The restart runs
    /// on every exit path (normal return, error inside `block`, panic); a
    /// restart failure is reported as a warning and never replaces
    /// `block`'s result, since the firmware work already happened.
    ///
    /// Not reentrant: never nest. Batch flows take one window and flash
    /// every device inside it.
    pub fn with_stopped<T>(&self, block: impl FnOnce() -> T) -> Result<T, ServiceError> {
        self.stop()?;
        let _guard = RestartGuard { controller: self };
        Ok(block())
    }
}

struct RestartGuard<'a> {
    controller: &'a ServiceController,
}

impl Drop for RestartGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.controller.start() {
            warn!(error = %e, "service restart failed");
            eprintln!(
                "warning: {e}; start it manually with 'systemctl start {}'",
                self.controller.unit
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Stub systemctl that appends its arguments to a log file and exits
    /// with a per-action code taken from `<dir>/fail-<action>`.
    fn stub_systemctl(dir: &Path) -> PathBuf {
        let script = dir.join("systemctl");
        let log = dir.join("calls.log");
        fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$@\" >> {}\n[ -f {}/fail-$1 ] && exit 1\nexit 0\n",
                log.display(),
                dir.display()
            ),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    fn calls(dir: &Path) -> Vec<String> {
        fs::read_to_string(dir.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn controller(dir: &Path) -> ServiceController {
        ServiceController::custom("klipper", stub_systemctl(dir), false)
    }

    #[test]
    fn with_stopped_brackets_the_block() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());
        let out = ctl.with_stopped(|| {
            assert_eq!(calls(dir.path()), vec!["stop klipper"]);
            42
        });
        assert_eq!(out.unwrap(), 42);
        assert_eq!(calls(dir.path()), vec!["stop klipper", "start klipper"]);
    }

    #[test]
    fn restart_runs_when_block_panics() {
        let dir = tempfile::tempdir().unwrap();
        let ctl = controller(dir.path());
        let result = std::panic::catch_unwind(|| {
            let _ = ctl.with_stopped(|| panic!("boom"));
        });
        assert!(result.is_err());
        assert_eq!(calls(dir.path()), vec!["stop klipper", "start klipper"]);
    }

    #[test]
    fn stop_failure_aborts_without_start() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("fail-stop"), "").unwrap();
        let ctl = controller(dir.path());
        let result = ctl.with_stopped(|| unreachable!("block must not run"));
        assert!(matches!(result, Err(ServiceError::StopFailed { .. })));
        assert_eq!(calls(dir.path()), vec!["stop klipper"]);
    }

    #[test]
    fn start_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("fail-start"), "").unwrap();
        let ctl = controller(dir.path());
        let out = ctl.with_stopped(|| "flashed");
        assert_eq!(out.unwrap(), "flashed");
        assert_eq!(calls(dir.path()), vec!["stop klipper", "start klipper"]);
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let ctl = ServiceController::custom(
            "klipper",
            PathBuf::from("/nonexistent/systemctl"),
            false,
        );
        assert!(matches!(ctl.stop(), Err(ServiceError::Spawn { .. })));
    }
}
