//! Single-device flash pipeline.
//!
//! A strict sequence: lookup → preflight → safety check → config step →
//! MCU validation → build → device match → (daemon stopped: flash →
//! verify) → report. Operator decisions go through the [`Interact`] trait
//! so the CLI and tests drive the same engine.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use moonraker_client::{MoonrakerClient, PrintState};

use crate::config_cache::{self, ConfigError, DeviceConfigCache};
use crate::discovery::{self, DiscoveryError, Scanner};
use crate::flash::{self, FlashMethod, FlashResult, Flasher, PreflightError};
use crate::interrupt;
use crate::make::{self, BuildError};
use crate::registry::{DeviceEntry, GlobalConfig, Registry, RegistryError};
use crate::service::{ServiceController, ServiceError};
use crate::verify::{self, VerifyError, VerifyOutcome};

/// Pipeline errors, spanning both the single-device and flash-all paths.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("device '{0}' is not registered")]
    DeviceNotRegistered(String),

    #[error("device '{0}' is excluded from flashing")]
    NotFlashable(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Preflight(#[from] PreflightError),

    #[error("a print job is {0}; flashing is blocked")]
    PrintJobActive(PrintState),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("device '{key}' is not connected (no match for '{pattern}')")]
    NotConnected { key: String, pattern: String },

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("no flashable devices registered")]
    NoFlashableDevices,

    #[error("devices without a cached config: {}", .0.join(", "))]
    MissingConfigs(Vec<String>),

    #[error("could not create scratch directory: {0}")]
    Scratch(std::io::Error),

    #[error("interrupted")]
    Interrupted,
}

impl From<VerifyError> for PipelineError {
    fn from(e: VerifyError) -> Self {
        match e {
            VerifyError::Pattern(p) => Self::Discovery(p),
            VerifyError::Interrupted => Self::Interrupted,
        }
    }
}

impl PipelineError {
    /// Internal errors (registry corruption, filesystem trouble) versus
    /// handled operational failures. The CLI maps this onto exit codes.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Self::Registry(_)
                | Self::Scratch(_)
                | Self::Config(
                    ConfigError::Copy { .. } | ConfigError::Io { .. } | ConfigError::Rename { .. }
                )
        )
    }
}

/// How to resolve an MCU mismatch after the config step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchChoice {
    /// Open menuconfig again.
    Rerun,
    /// Restore the previous cached config and abort.
    Discard,
    /// Accept the selected MCU as-is.
    Keep,
}

/// Operator decisions the pipeline can ask for.
pub trait Interact {
    /// Progress/info line for the operator.
    fn note(&mut self, message: &str);

    /// Yes/no question with a default.
    fn confirm(&mut self, prompt: &str, default: bool) -> bool;

    /// Resolve an MCU mismatch.
    fn mcu_mismatch(&mut self, expected: &str, actual: &str) -> MismatchChoice;
}

/// Terminal-backed implementation.
pub struct CliInteract;

impl Interact for CliInteract {
    fn note(&mut self, message: &str) {
        println!("{message}");
    }

    fn confirm(&mut self, prompt: &str, default: bool) -> bool {
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(default)
            .interact()
            .unwrap_or(default)
    }

    fn mcu_mismatch(&mut self, expected: &str, actual: &str) -> MismatchChoice {
        let items = [
            "Re-run menuconfig",
            "Discard the change and abort",
            "Keep this config anyway",
        ];
        let picked = dialoguer::Select::new()
            .with_prompt(format!(
                "Config selects MCU '{actual}' but '{expected}' is expected"
            ))
            .items(&items)
            .default(0)
            .interact();
        match picked {
            Ok(1) => MismatchChoice::Discard,
            Ok(2) => MismatchChoice::Keep,
            Ok(_) => MismatchChoice::Rerun,
            // No usable terminal: abort rather than loop.
            Err(_) => MismatchChoice::Discard,
        }
    }
}

/// Per-run knobs layered over the registry's global configuration.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Flash-method override for this run only.
    pub method_override: Option<FlashMethod>,
    /// Refuse the fallback retry even when the registry permits it.
    pub disable_fallback: bool,
    pub verify_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            method_override: None,
            disable_fallback: false,
            verify_timeout: verify::DEFAULT_TIMEOUT,
        }
    }
}

/// Result of a completed pipeline run.
#[derive(Debug)]
pub enum FlashRun {
    Completed(FlashReport),
    /// Operator declined at a consent point; a clean cancel, not an error.
    Cancelled,
}

/// What happened to one device.
#[derive(Debug)]
pub struct FlashReport {
    pub key: String,
    pub name: String,
    pub build_elapsed_secs: f64,
    pub flash: FlashResult,
    /// Absent when the flash attempt itself failed.
    pub verify: Option<VerifyOutcome>,
}

impl FlashReport {
    pub fn succeeded(&self) -> bool {
        self.flash.success && self.verify.as_ref().is_some_and(VerifyOutcome::is_success)
    }
}

/// Outcome of the configuration step.
#[derive(Debug, PartialEq, Eq)]
pub enum ConfigOutcome {
    Ready,
    Cancelled,
}

/// Everything a flash run needs. The flash-all flow drives the same
/// struct.
pub struct Pipeline<'a> {
    pub registry: &'a Registry,
    pub scanner: Scanner,
    pub service: ServiceController,
    pub oracle: Option<MoonrakerClient>,
    pub options: PipelineOptions,
}

impl Pipeline<'_> {
    /// Flash one registered device end to end.
    pub fn flash_device(
        &self,
        interact: &mut dyn Interact,
        key: &str,
    ) -> Result<FlashRun, PipelineError> {
        let snapshot = self.registry.load()?;
        let entry = snapshot
            .devices
            .get(key)
            .cloned()
            .ok_or_else(|| PipelineError::DeviceNotRegistered(key.to_string()))?;
        if !entry.flashable {
            return Err(PipelineError::NotFlashable(key.to_string()));
        }
        let global = snapshot.global;

        let method =
            flash::effective_method(self.options.method_override.or(entry.flash_method), &global);
        let allow_fallback = global.allow_flash_fallback && !self.options.disable_fallback;
        flash::preflight(&global, method == FlashMethod::Katapult || allow_fallback)?;

        if !self.safety_check(interact)? {
            return Ok(FlashRun::Cancelled);
        }

        let cache = DeviceConfigCache::new(
            &config_cache::resolve_cache_root(&global),
            key,
            &global.klipper_src_path(),
        );
        match self.config_step(interact, &entry, &global, &cache, false)? {
            ConfigOutcome::Ready => {}
            ConfigOutcome::Cancelled => return Ok(FlashRun::Cancelled),
        }

        interact.note(&format!("Building firmware for {}...", entry.name));
        let build = make::run_build(&global.klipper_src_path(), false)?;
        interact.note(&format!(
            "Built {} ({} bytes) in {:.0}s",
            make::FIRMWARE_ARTIFACT,
            build.artifact_size,
            build.elapsed_secs
        ));

        // Fresh scan: enumeration may have changed since the run started.
        let devices = self.scanner.scan();
        let matches = discovery::find_matches(&entry.serial_pattern, &devices)?;
        let target = match matches.as_slice() {
            [] => {
                return Err(PipelineError::NotConnected {
                    key: key.to_string(),
                    pattern: entry.serial_pattern.clone(),
                })
            }
            [single] => (*single).clone(),
            multiple => {
                // Ambiguous registration; never pick silently.
                let listing: Vec<String> =
                    multiple.iter().map(|d| format!("  {}", d.name)).collect();
                interact.note(&format!(
                    "Pattern '{}' matches {} devices:\n{}",
                    entry.serial_pattern,
                    multiple.len(),
                    listing.join("\n")
                ));
                if !interact.confirm("Flash the first match?", false) {
                    return Ok(FlashRun::Cancelled);
                }
                multiple[0].clone()
            }
        };

        if interrupt::interrupted() {
            return Err(PipelineError::Interrupted);
        }

        interact.note(&format!(
            "Stopping {} and flashing {} via {}...",
            self.service.unit(),
            target.name,
            method
        ));
        let flasher = Flasher::new(&global, false);
        let window: Result<(FlashResult, Option<VerifyOutcome>), PipelineError> =
            self.service.with_stopped(|| {
                let result =
                    flasher.flash_with_fallback(method, allow_fallback, &target.path, &build.artifact);
                if !result.success {
                    return Ok((result, None));
                }
                let outcome = verify::wait_for_device(
                    &self.scanner,
                    &entry.serial_pattern,
                    self.options.verify_timeout,
                    |elapsed| {
                        interact.note(&format!("  waiting for device... {}s", elapsed.as_secs()));
                    },
                )?;
                Ok((result, Some(outcome)))
            })?;
        let (flash_result, verify_outcome) = window?;

        Ok(FlashRun::Completed(FlashReport {
            key: key.to_string(),
            name: entry.name,
            build_elapsed_secs: build.elapsed_secs,
            flash: flash_result,
            verify: verify_outcome,
        }))
    }

    /// Check the daemon's print state. `Ok(false)` means the operator
    /// declined to continue without the check.
    pub(crate) fn safety_check(&self, interact: &mut dyn Interact) -> Result<bool, PipelineError> {
        let Some(oracle) = &self.oracle else {
            return Ok(true);
        };
        match oracle.print_state() {
            Ok(state) if state.blocks_flashing() => Err(PipelineError::PrintJobActive(state)),
            Ok(state) => {
                debug!(%state, "printer idle");
                Ok(true)
            }
            Err(e) => {
                warn!(error = %e, "moonraker unreachable, print state unknown");
                interact.note(
                    "Warning: Moonraker is unreachable; the print state cannot be checked.",
                );
                Ok(interact.confirm("Continue without safety checks?", false))
            }
        }
    }

    /// Bring the build tree to a validated config for `entry` and snapshot
    /// it into the cache. The cache is written only after the MCU check
    /// passed or the operator explicitly chose Keep, so a discarded
    /// mismatch never corrupts the previous snapshot.
    pub fn config_step(
        &self,
        interact: &mut dyn Interact,
        entry: &DeviceEntry,
        global: &GlobalConfig,
        cache: &DeviceConfigCache,
        force_tui: bool,
    ) -> Result<ConfigOutcome, PipelineError> {
        let build_tree = global.klipper_src_path();

        if global.skip_menuconfig && cache.has_cache() && !force_tui {
            cache.load_into_build_tree()?;
        } else {
            // Seed the build tree with the device's last known state so
            // menuconfig starts from it.
            cache.reset_build_tree()?;
            let outcome = make::run_menuconfig(&build_tree, cache.build_config())?;
            if !outcome.saved {
                if !cache.has_cache() {
                    return Err(ConfigError::Missing(cache.key().to_string()).into());
                }
                if !interact.confirm(
                    "Menuconfig exited without saving. Use the previously cached config?",
                    true,
                ) {
                    return Ok(ConfigOutcome::Cancelled);
                }
                cache.load_into_build_tree()?;
            }
        }

        loop {
            let (matched, actual) = cache.validate_mcu(&entry.mcu)?;
            let Some(actual) = actual else {
                return Err(
                    ConfigError::McuLineMissing(cache.build_config().to_path_buf()).into(),
                );
            };
            if matched {
                break;
            }
            match interact.mcu_mismatch(&entry.mcu, &actual) {
                MismatchChoice::Rerun => {
                    make::run_menuconfig(&build_tree, cache.build_config())?;
                }
                MismatchChoice::Discard => {
                    cache.reset_build_tree()?;
                    interact.note("Change discarded; the cached config is untouched.");
                    return Ok(ConfigOutcome::Cancelled);
                }
                MismatchChoice::Keep => break,
            }
        }

        cache.save_from_build_tree()?;
        Ok(ConfigOutcome::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::fs;

    /// Scripted [`Interact`]: queued answers, recorded notes.
    pub(crate) struct Scripted {
        pub confirms: VecDeque<bool>,
        pub choices: VecDeque<MismatchChoice>,
        pub notes: Vec<String>,
    }

    impl Scripted {
        pub fn new() -> Self {
            Self {
                confirms: VecDeque::new(),
                choices: VecDeque::new(),
                notes: Vec::new(),
            }
        }
    }

    impl Interact for Scripted {
        fn note(&mut self, message: &str) {
            self.notes.push(message.to_string());
        }

        fn confirm(&mut self, _prompt: &str, default: bool) -> bool {
            self.confirms.pop_front().unwrap_or(default)
        }

        fn mcu_mismatch(&mut self, _expected: &str, _actual: &str) -> MismatchChoice {
            self.choices.pop_front().unwrap_or(MismatchChoice::Discard)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: Registry,
        global: GlobalConfig,
        cache: DeviceConfigCache,
        entry: DeviceEntry,
    }

    fn fixture(cached_mcu: Option<&str>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let build_tree = dir.path().join("klipper");
        fs::create_dir_all(&build_tree).unwrap();
        let cache_root = dir.path().join("configs");

        let mut global = GlobalConfig::default();
        global.klipper_src = build_tree.to_string_lossy().into_owned();
        global.cache_root = Some(cache_root.to_string_lossy().into_owned());
        global.skip_menuconfig = true;

        let cache = DeviceConfigCache::new(&cache_root, "octopus-pro", &build_tree);
        if let Some(mcu) = cached_mcu {
            fs::create_dir_all(cache_root.join("octopus-pro")).unwrap();
            fs::write(
                cache.cache_file(),
                format!("CONFIG_MCU=\"{mcu}\"\nCONFIG_CLOCK_FREQ=25000000\n"),
            )
            .unwrap();
        }

        let entry = DeviceEntry {
            name: "Octopus Pro".to_string(),
            mcu: "stm32h723".to_string(),
            serial_pattern: "usb-*_AA11*".to_string(),
            flash_method: None,
            flashable: true,
        };

        let registry = Registry::new(dir.path().join("registry.toml"));
        Fixture {
            _dir: dir,
            registry,
            global,
            cache,
            entry,
        }
    }

    fn pipeline(f: &Fixture) -> Pipeline<'_> {
        Pipeline {
            registry: &f.registry,
            scanner: Scanner::new("/nonexistent/by-id"),
            service: ServiceController::custom(
                "klipper",
                std::path::PathBuf::from("/bin/true"),
                false,
            ),
            oracle: None,
            options: PipelineOptions::default(),
        }
    }

    #[test]
    fn config_step_fast_path_loads_cache_and_validates() {
        let f = fixture(Some("stm32h723xx"));
        let p = pipeline(&f);
        let mut ui = Scripted::new();
        let outcome = p
            .config_step(&mut ui, &f.entry, &f.global, &f.cache, false)
            .unwrap();
        assert_eq!(outcome, ConfigOutcome::Ready);
        let on_disk = fs::read_to_string(f.cache.build_config()).unwrap();
        assert!(on_disk.contains("stm32h723xx"));
    }

    #[test]
    fn config_step_discard_restores_previous_cache() {
        let f = fixture(Some("stm32f446xx"));
        let p = pipeline(&f);
        let cached_before = fs::read(f.cache.cache_file()).unwrap();

        let mut ui = Scripted::new();
        ui.choices.push_back(MismatchChoice::Discard);
        let outcome = p
            .config_step(&mut ui, &f.entry, &f.global, &f.cache, false)
            .unwrap();

        assert_eq!(outcome, ConfigOutcome::Cancelled);
        // The previous cache bytes are back in the build tree and the
        // cache file itself is bitwise untouched.
        assert_eq!(
            fs::read(f.cache.build_config()).unwrap(),
            cached_before
        );
        assert_eq!(fs::read(f.cache.cache_file()).unwrap(), cached_before);
    }

    #[test]
    fn config_step_keep_saves_mismatching_config() {
        let f = fixture(Some("stm32f446xx"));
        let p = pipeline(&f);
        let mut ui = Scripted::new();
        ui.choices.push_back(MismatchChoice::Keep);
        let outcome = p
            .config_step(&mut ui, &f.entry, &f.global, &f.cache, false)
            .unwrap();
        assert_eq!(outcome, ConfigOutcome::Ready);
        assert!(fs::read_to_string(f.cache.cache_file())
            .unwrap()
            .contains("stm32f446xx"));
    }

    #[test]
    fn config_step_missing_mcu_line_is_an_error() {
        let f = fixture(None);
        fs::create_dir_all(f.cache.cache_file().parent().unwrap()).unwrap();
        fs::write(f.cache.cache_file(), "CONFIG_CLOCK_FREQ=8000000\n").unwrap();
        let p = pipeline(&f);
        let mut ui = Scripted::new();
        let result = p.config_step(&mut ui, &f.entry, &f.global, &f.cache, false);
        assert!(matches!(
            result,
            Err(PipelineError::Config(ConfigError::McuLineMissing(_)))
        ));
    }

    #[test]
    fn flash_device_rejects_unknown_and_unflashable() {
        let f = fixture(Some("stm32h723xx"));
        let p = pipeline(&f);
        let mut ui = Scripted::new();
        assert!(matches!(
            p.flash_device(&mut ui, "octopus-pro"),
            Err(PipelineError::DeviceNotRegistered(_))
        ));

        let mut entry = f.entry.clone();
        entry.flashable = false;
        f.registry.add(entry).unwrap();
        assert!(matches!(
            p.flash_device(&mut ui, "octopus-pro"),
            Err(PipelineError::NotFlashable(_))
        ));
    }

    #[test]
    fn safety_check_with_unreachable_oracle_asks_for_consent() {
        let f = fixture(Some("stm32h723xx"));
        let mut p = pipeline(&f);
        // Nothing listens here; the query fails immediately.
        p.oracle = Some(MoonrakerClient::new("http://127.0.0.1:1").unwrap());

        let mut ui = Scripted::new();
        ui.confirms.push_back(false);
        assert!(!p.safety_check(&mut ui).unwrap());
        assert!(ui.notes.iter().any(|n| n.contains("unreachable")));

        let mut ui = Scripted::new();
        ui.confirms.push_back(true);
        assert!(p.safety_check(&mut ui).unwrap());
    }

    #[test]
    fn pipeline_error_classifies_internal_kinds() {
        let internal = PipelineError::Registry(RegistryError::UnknownDevice("x".into()));
        assert!(internal.is_internal());
        let handled = PipelineError::NotFlashable("x".into());
        assert!(!handled.is_internal());
    }
}
