//! All-device flash flow.
//!
//! Builds every flashable device's firmware up front, staging each image
//! aside (the build tree has a single output path), then opens one
//! daemon-stopped window and flashes the boards in sequence. A failure in
//! any per-device step never stops the run; every device gets a ledger
//! row.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config_cache::{self, DeviceConfigCache};
use crate::discovery;
use crate::flash::{self, FlashMethod, Flasher};
use crate::interrupt;
use crate::make;
use crate::orchestrator::{Interact, Pipeline, PipelineError};
use crate::registry::{self, DeviceEntry};
use crate::verify::{self, VerifyError};

/// Per-device ledger row.
#[derive(Debug, Clone)]
pub struct BatchRow {
    pub key: String,
    pub name: String,
    pub config_ok: bool,
    pub build_ok: bool,
    pub flash_ok: bool,
    pub verify_ok: bool,
    /// Passed over by policy (duplicate USB path, already-current
    /// firmware) rather than failed.
    pub skipped: bool,
    pub error: Option<String>,
    pub version_before: Option<String>,
}

impl BatchRow {
    fn new(key: &str, name: &str) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            config_ok: false,
            build_ok: false,
            flash_ok: false,
            verify_ok: false,
            skipped: false,
            error: None,
            version_before: None,
        }
    }

    /// Skipped rows count as passed; everything else needs all four
    /// stages.
    pub fn passed(&self) -> bool {
        self.skipped || (self.config_ok && self.build_ok && self.flash_ok && self.verify_ok)
    }
}

/// Result of a flash-all run.
#[derive(Debug)]
pub enum BatchRun {
    Completed(BatchReport),
    Cancelled,
}

/// The full ledger.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub rows: Vec<BatchRow>,
}

impl BatchReport {
    pub fn all_ok(&self) -> bool {
        self.rows.iter().all(BatchRow::passed)
    }

    /// Render the per-device summary table.
    pub fn summary_table(&self) -> String {
        let name_width = self
            .rows
            .iter()
            .map(|r| r.name.len())
            .chain(std::iter::once("Device".len()))
            .max()
            .unwrap_or(6);

        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<name_width$}  {:<6} {:<6} {:<6} {:<6}  Notes",
            "Device", "Config", "Build", "Flash", "Verify"
        );
        for row in &self.rows {
            let cells = if row.skipped {
                ["skip"; 4]
            } else {
                [
                    mark(row.config_ok, true),
                    mark(row.build_ok, row.config_ok),
                    mark(row.flash_ok, row.build_ok),
                    mark(row.verify_ok, row.flash_ok),
                ]
            };
            let _ = writeln!(
                out,
                "{:<name_width$}  {:<6} {:<6} {:<6} {:<6}  {}",
                row.name,
                cells[0],
                cells[1],
                cells[2],
                cells[3],
                row.error.as_deref().unwrap_or("")
            );
        }
        out
    }
}

fn mark(ok: bool, reached: bool) -> &'static str {
    if !reached {
        "-"
    } else if ok {
        "ok"
    } else {
        "FAIL"
    }
}

/// Resolve a by-name symlink and claim its real device path. Returns false
/// when a prior device in this batch already claimed the same path.
pub fn claim_real_path(used: &mut HashSet<PathBuf>, by_id: &Path) -> bool {
    let real = fs::canonicalize(by_id).unwrap_or_else(|_| by_id.to_path_buf());
    used.insert(real)
}

/// Map Moonraker's mcu objects onto a registry key: the object suffix
/// (`"mcu nhk36"` → `nhk36`) is slugged and compared; the bare `"mcu"`
/// object only matches a device literally keyed `mcu`.
fn version_for_key(mcus: &BTreeMap<String, String>, key: &str) -> Option<String> {
    mcus.iter()
        .find(|(object, _)| {
            let suffix = object
                .strip_prefix("mcu")
                .map(str::trim)
                .unwrap_or(object.as_str());
            if suffix.is_empty() {
                key == "mcu"
            } else {
                registry::device_key(suffix) == key
            }
        })
        .map(|(_, version)| version.clone())
}

/// Load a device's cached config into the build tree and check its MCU
/// selector. Errors come back as row text, never as run-stopping failures.
fn stage_config(cache: &DeviceConfigCache, entry: &DeviceEntry) -> Result<(), String> {
    cache.load_into_build_tree().map_err(|e| e.to_string())?;
    match cache.validate_mcu(&entry.mcu) {
        Ok((true, _)) => Ok(()),
        Ok((false, Some(actual))) => Err(format!(
            "cached config selects MCU '{actual}', expected '{}'",
            entry.mcu
        )),
        Ok((false, None)) => Err("cached config has no CONFIG_MCU line".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

fn stage_artifact(artifact: &Path, dir: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let staged = dir.join("klipper.bin");
    fs::copy(artifact, &staged)?;
    Ok(staged)
}

/// Flash every flashable device.
pub fn flash_all(
    pipeline: &Pipeline<'_>,
    interact: &mut dyn Interact,
) -> Result<BatchRun, PipelineError> {
    let snapshot = pipeline.registry.load()?;
    let global = snapshot.global;

    // Deterministic order straight out of the snapshot's sorted map.
    let targets: Vec<(String, DeviceEntry)> = snapshot
        .devices
        .iter()
        .filter(|(_, entry)| entry.flashable)
        .map(|(key, entry)| (key.clone(), entry.clone()))
        .collect();
    if targets.is_empty() {
        return Err(PipelineError::NoFlashableDevices);
    }

    let katapult_needed = global.allow_flash_fallback
        || targets.iter().any(|(_, entry)| {
            flash::effective_method(entry.flash_method, &global) == FlashMethod::Katapult
        });
    flash::preflight(&global, katapult_needed)?;

    if !pipeline.safety_check(interact)? {
        return Ok(BatchRun::Cancelled);
    }

    // Every target needs a cached config before anything is touched;
    // missing ones are listed by display name.
    let cache_root = config_cache::resolve_cache_root(&global);
    let build_tree = global.klipper_src_path();
    let caches: Vec<DeviceConfigCache> = targets
        .iter()
        .map(|(key, _)| DeviceConfigCache::new(&cache_root, key, &build_tree))
        .collect();
    let missing: Vec<String> = targets
        .iter()
        .zip(&caches)
        .filter(|(_, cache)| !cache.has_cache())
        .map(|((_, entry), _)| entry.name.clone())
        .collect();
    if !missing.is_empty() {
        return Err(PipelineError::MissingConfigs(missing));
    }

    let mut rows: Vec<BatchRow> = targets
        .iter()
        .map(|(key, entry)| BatchRow::new(key, &entry.name))
        .collect();

    // Version survey, best-effort.
    let mut skip_current: HashSet<usize> = HashSet::new();
    if let Some(oracle) = &pipeline.oracle {
        match oracle.versions() {
            Ok(report) => {
                for ((key, _), row) in targets.iter().zip(rows.iter_mut()) {
                    row.version_before = version_for_key(&report.mcus, key);
                }
                if let Some(host) = &report.host {
                    let matching: Vec<usize> = rows
                        .iter()
                        .enumerate()
                        .filter(|(_, row)| row.version_before.as_deref() == Some(host.as_str()))
                        .map(|(i, _)| i)
                        .collect();
                    if !matching.is_empty() && matching.len() == rows.len() {
                        interact.note(&format!("Every MCU already reports {host}."));
                        if !interact.confirm("Flash all devices anyway?", false) {
                            return Ok(BatchRun::Cancelled);
                        }
                    } else if !matching.is_empty() {
                        let names: Vec<&str> =
                            matching.iter().map(|&i| rows[i].name.as_str()).collect();
                        interact.note(&format!(
                            "{} of {} MCUs already match host version {host}: {}",
                            matching.len(),
                            rows.len(),
                            names.join(", ")
                        ));
                        if interact.confirm("Skip the devices that are already current?", true) {
                            skip_current.extend(matching);
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "version survey unavailable"),
        }
    }

    // Build loop: one quiet build per device, image staged aside before
    // the next build overwrites the tree's output.
    let scratch = tempfile::tempdir().map_err(PipelineError::Scratch)?;
    let mut staged: BTreeMap<String, PathBuf> = BTreeMap::new();
    for (i, ((key, entry), cache)) in targets.iter().zip(&caches).enumerate() {
        if interrupt::interrupted() {
            return Err(PipelineError::Interrupted);
        }
        let row = &mut rows[i];
        if skip_current.contains(&i) {
            row.skipped = true;
            row.error = Some("firmware already current".to_string());
            continue;
        }

        if let Err(message) = stage_config(cache, entry) {
            row.error = Some(message);
            continue;
        }
        row.config_ok = true;

        interact.note(&format!("Building {}...", entry.name));
        match make::run_build(&build_tree, true) {
            Ok(build) => match stage_artifact(&build.artifact, &scratch.path().join(key)) {
                Ok(path) => {
                    row.build_ok = true;
                    staged.insert(key.clone(), path);
                }
                Err(e) => row.error = Some(format!("failed to stage firmware image: {e}")),
            },
            Err(e) => row.error = Some(e.to_string()),
        }
    }

    // Flash loop: one daemon-stopped window for the whole batch.
    let flasher = Flasher::new(&global, true);
    let window: Result<(), PipelineError> = pipeline.service.with_stopped(|| {
        // Enumeration can change once the daemon lets go of the ports.
        let devices = pipeline.scanner.scan();
        let mut used_paths: HashSet<PathBuf> = HashSet::new();
        let mut first = true;

        for (i, (key, entry)) in targets.iter().enumerate() {
            let row = &mut rows[i];
            if row.skipped || !row.build_ok {
                continue;
            }
            if interrupt::interrupted() {
                return Err(PipelineError::Interrupted);
            }
            if !first {
                // Give the kernel and the previous board time to settle.
                thread::sleep(Duration::from_secs(global.stagger_delay_secs));
            }
            first = false;

            let target = match discovery::match_device(&entry.serial_pattern, &devices) {
                Ok(Some(device)) => device,
                Ok(None) => {
                    row.error =
                        Some(format!("not connected (no match for '{}')", entry.serial_pattern));
                    continue;
                }
                Err(e) => {
                    row.error = Some(e.to_string());
                    continue;
                }
            };

            if !claim_real_path(&mut used_paths, &target.path) {
                debug!(device = %key, "symlink resolves to an already-flashed port");
                row.skipped = true;
                row.error = Some("USB path already targeted by prior device".to_string());
                continue;
            }

            let Some(firmware) = staged.get(key) else {
                continue;
            };
            let method = flash::effective_method(entry.flash_method, &global);
            interact.note(&format!("Flashing {} via {}...", entry.name, method));
            let result =
                flasher.flash_with_fallback(method, global.allow_flash_fallback, &target.path, firmware);
            row.flash_ok = result.success;
            if !result.success {
                row.error = result.error;
                continue;
            }

            match verify::wait_for_device(
                &pipeline.scanner,
                &entry.serial_pattern,
                pipeline.options.verify_timeout,
                |_| {},
            ) {
                Ok(outcome) => {
                    row.verify_ok = outcome.is_success();
                    if let Some(reason) = outcome.failure_reason() {
                        row.error = Some(reason.to_string());
                    }
                }
                Err(VerifyError::Interrupted) => return Err(PipelineError::Interrupted),
                Err(VerifyError::Pattern(e)) => row.error = Some(e.to_string()),
            }
        }
        Ok(())
    })?;
    window?;

    Ok(BatchRun::Completed(BatchReport { rows }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn claim_real_path_detects_shared_targets() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("ttyACM0");
        fs::write(&real, "").unwrap();
        let link_a = dir.path().join("usb-Klipper_stm32_AAAA-if00");
        let link_b = dir.path().join("usb-Klipper_stm32_BBBB-if00");
        symlink(&real, &link_a).unwrap();
        symlink(&real, &link_b).unwrap();

        let mut used = HashSet::new();
        assert!(claim_real_path(&mut used, &link_a));
        assert!(!claim_real_path(&mut used, &link_b));

        let other = dir.path().join("ttyACM1");
        fs::write(&other, "").unwrap();
        let link_c = dir.path().join("usb-Klipper_stm32_CCCC-if00");
        symlink(&other, &link_c).unwrap();
        assert!(claim_real_path(&mut used, &link_c));
    }

    #[test]
    fn version_for_key_slugs_object_suffixes() {
        let mut mcus = BTreeMap::new();
        mcus.insert("mcu".to_string(), "v0.12.0-89".to_string());
        mcus.insert("mcu nhk36".to_string(), "v0.12.0-85".to_string());
        mcus.insert("mcu EBB_36".to_string(), "v0.12.0-80".to_string());

        assert_eq!(version_for_key(&mcus, "nhk36").as_deref(), Some("v0.12.0-85"));
        assert_eq!(version_for_key(&mcus, "ebb-36").as_deref(), Some("v0.12.0-80"));
        assert_eq!(version_for_key(&mcus, "mcu").as_deref(), Some("v0.12.0-89"));
        assert_eq!(version_for_key(&mcus, "octopus"), None);
    }

    #[test]
    fn row_pass_logic() {
        let mut row = BatchRow::new("k", "K");
        assert!(!row.passed());
        row.config_ok = true;
        row.build_ok = true;
        row.flash_ok = true;
        row.verify_ok = true;
        assert!(row.passed());

        let mut skipped = BatchRow::new("s", "S");
        skipped.skipped = true;
        assert!(skipped.passed());
    }

    #[test]
    fn summary_table_layout() {
        let mut report = BatchReport::default();
        let mut ok = BatchRow::new("octopus-pro", "Octopus Pro");
        ok.config_ok = true;
        ok.build_ok = true;
        ok.flash_ok = true;
        ok.verify_ok = true;
        report.rows.push(ok);

        let mut stuck = BatchRow::new("nhk36", "Nitehawk 36");
        stuck.config_ok = true;
        stuck.build_ok = true;
        stuck.flash_ok = true;
        stuck.error = Some("stuck-in-bootloader".to_string());
        report.rows.push(stuck);

        let mut dup = BatchRow::new("ebb36", "EBB36");
        dup.skipped = true;
        dup.error = Some("USB path already targeted by prior device".to_string());
        report.rows.push(dup);

        let table = report.summary_table();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("Device"));
        assert!(lines[1].contains("ok"));
        assert!(lines[2].contains("FAIL"));
        assert!(lines[2].contains("stuck-in-bootloader"));
        assert!(lines[3].contains("skip"));
        assert!(!report.all_ok());
    }

    #[test]
    fn unreached_stages_render_as_dashes() {
        let mut report = BatchReport::default();
        let mut failed = BatchRow::new("k", "Board");
        failed.config_ok = true;
        // Build failed; flash and verify never ran.
        report.rows.push(failed);
        let table = report.summary_table();
        let row_line = table.lines().nth(1).unwrap();
        assert!(row_line.contains("FAIL"));
        assert!(row_line.contains('-'));
    }
}
