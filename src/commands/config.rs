//! Standalone menuconfig command.

use std::process::ExitCode;

use kflash::orchestrator::ConfigOutcome;
use kflash::{config_cache, CliInteract, DeviceConfigCache, Pipeline};

use super::{report_pipeline_error, resolve_device_key, CommandResult, FAILURE};

/// Open the firmware configuration UI for one device and snapshot the
/// result into its cache. Uses the same deferred-save and MCU-validation
/// discipline as the flash path.
pub fn menuconfig(pipeline: &Pipeline<'_>, device: &str) -> CommandResult {
    let Some(key) = resolve_device_key(pipeline.registry, device)? else {
        eprintln!("error: device '{device}' is not registered");
        return Ok(ExitCode::from(FAILURE));
    };
    let snapshot = pipeline.registry.load()?;
    let Some(entry) = snapshot.devices.get(&key) else {
        eprintln!("error: device '{device}' is not registered");
        return Ok(ExitCode::from(FAILURE));
    };
    let global = &snapshot.global;

    let build_tree = global.klipper_src_path();
    if !build_tree.join(kflash::make::MAKEFILE).is_file() {
        eprintln!(
            "error: {} is not a build tree (set klipper_src with 'kflash settings')",
            build_tree.display()
        );
        return Ok(ExitCode::from(FAILURE));
    }

    let cache = DeviceConfigCache::new(&config_cache::resolve_cache_root(global), &key, &build_tree);
    let mut interact = CliInteract;
    match pipeline.config_step(&mut interact, entry, global, &cache, true) {
        Ok(ConfigOutcome::Ready) => {
            println!("Config for '{}' saved to {}.", entry.name, cache.cache_file().display());
            Ok(ExitCode::SUCCESS)
        }
        Ok(ConfigOutcome::Cancelled) => {
            println!("No changes saved.");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => report_pipeline_error(e),
    }
}
