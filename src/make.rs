//! Wrapper around the firmware build system's make targets.
//!
//! Three targets matter: `menuconfig` (interactive, must own the terminal),
//! `clean`, and the parallel default build. The firmware artifact lands at
//! a fixed relative path inside the tree.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Instant, SystemTime};

use thiserror::Error;
use tracing::{debug, info};

/// Top-level file that marks a usable build tree.
pub const MAKEFILE: &str = "Makefile";

/// Where the build drops the firmware image, relative to the tree root.
pub const FIRMWARE_ARTIFACT: &str = "out/klipper.bin";

/// Which build step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStep {
    Clean,
    Compile,
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clean => write!(f, "clean"),
            Self::Compile => write!(f, "build"),
        }
    }
}

/// Build-driver errors.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("failed to spawn make in {dir}: {source}")]
    Spawn {
        dir: PathBuf,
        source: std::io::Error,
    },

    #[error("make {step} failed with exit code {code}")]
    StepFailed { step: BuildStep, code: i32 },

    #[error("build succeeded but no firmware image at {0}")]
    ArtifactMissing(PathBuf),
}

/// Outcome of the interactive configuration step.
#[derive(Debug)]
pub struct MenuconfigOutcome {
    pub status: ExitStatus,
    /// Whether the config file was (re)written, judged by its mtime.
    pub saved: bool,
}

/// Outcome of a successful build.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub elapsed_secs: f64,
    pub artifact: PathBuf,
    pub artifact_size: u64,
}

/// Run `make menuconfig` against `config_path`. The child inherits the
/// controlling terminal — the Kconfig UI is a full-screen program that
/// cannot run behind a pipe — so nothing is captured or redirected.
pub fn run_menuconfig(build_tree: &Path, config_path: &Path) -> Result<MenuconfigOutcome, BuildError> {
    let before = mtime(config_path);
    let config_abs = std::path::absolute(config_path).unwrap_or_else(|_| config_path.to_path_buf());

    debug!(tree = %build_tree.display(), config = %config_abs.display(), "make menuconfig");
    let status = Command::new("make")
        .arg("menuconfig")
        .current_dir(build_tree)
        .env("KCONFIG_CONFIG", &config_abs)
        .status()
        .map_err(|source| BuildError::Spawn {
            dir: build_tree.to_path_buf(),
            source,
        })?;

    let saved = match (before, mtime(config_path)) {
        (None, Some(_)) => true,
        (Some(before), Some(after)) => after > before,
        _ => false,
    };
    Ok(MenuconfigOutcome { status, saved })
}

/// Run `make clean` then a parallel build. With `quiet` the compiler output
/// is discarded (batch mode); otherwise the child inherits stdio so the
/// operator watches the build live. Never streamed through an intermediary.
pub fn run_build(build_tree: &Path, quiet: bool) -> Result<BuildResult, BuildError> {
    let started = Instant::now();

    run_step(build_tree, BuildStep::Clean, &["clean".to_string()], quiet)?;

    let jobs = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    run_step(build_tree, BuildStep::Compile, &[format!("-j{jobs}")], quiet)?;

    let artifact = build_tree.join(FIRMWARE_ARTIFACT);
    let size = fs::metadata(&artifact)
        .map_err(|_| BuildError::ArtifactMissing(artifact.clone()))?
        .len();
    let elapsed_secs = started.elapsed().as_secs_f64();
    info!(size, elapsed_secs, "firmware built");

    Ok(BuildResult {
        elapsed_secs,
        artifact,
        artifact_size: size,
    })
}

fn run_step(
    build_tree: &Path,
    step: BuildStep,
    args: &[String],
    quiet: bool,
) -> Result<(), BuildError> {
    debug!(%step, ?args, "running make");
    let mut cmd = Command::new("make");
    cmd.args(args).current_dir(build_tree);
    if quiet {
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
    }
    let status = cmd.status().map_err(|source| BuildError::Spawn {
        dir: build_tree.to_path_buf(),
        source,
    })?;
    if !status.success() {
        return Err(BuildError::StepFailed {
            step,
            code: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

fn mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
