//! Operator utilities: USB reset and global settings.

use std::process::ExitCode;

use kflash::{discovery, registry, DiscoveryError, Registry, Scanner};

use super::{resolve_device_key, CommandResult, FAILURE};

/// Power-cycle the USB port behind a registered device.
pub fn usb_reset(registry: &Registry, scanner: &Scanner, device: &str) -> CommandResult {
    let Some(key) = resolve_device_key(registry, device)? else {
        eprintln!("error: device '{device}' is not registered");
        return Ok(ExitCode::from(FAILURE));
    };
    let Some(entry) = registry.get(&key)? else {
        eprintln!("error: device '{device}' is not registered");
        return Ok(ExitCode::from(FAILURE));
    };

    let devices = scanner.scan();
    let target = match discovery::match_one(&entry.serial_pattern, &devices) {
        Ok(target) => target,
        Err(e) => {
            eprintln!("error: {e}");
            if matches!(e, DiscoveryError::AmbiguousMatch { .. }) {
                for d in discovery::find_matches(&entry.serial_pattern, &devices)? {
                    eprintln!("  {}", d.name);
                }
            }
            return Ok(ExitCode::from(FAILURE));
        }
    };

    match discovery::usb_reset(&target.path) {
        Ok(()) => {
            println!("Reset {}.", target.name);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("error: {e}");
            Ok(ExitCode::from(FAILURE))
        }
    }
}

/// Show the global settings, or apply `key=value` changes.
pub fn settings(registry: &Registry, changes: &[String]) -> CommandResult {
    if changes.is_empty() {
        let global = registry.load_global()?;
        println!("klipper_src            = {}", global.klipper_src);
        println!("katapult_src           = {}", global.katapult_src);
        println!("default_flash_method   = {}", global.default_flash_method);
        println!("allow_flash_fallback   = {}", global.allow_flash_fallback);
        println!(
            "cache_root             = {}",
            global.cache_root.as_deref().unwrap_or("(default)")
        );
        println!("skip_menuconfig        = {}", global.skip_menuconfig);
        println!("stagger_delay_secs     = {}", global.stagger_delay_secs);
        println!("post_action_delay_secs = {}", global.post_action_delay_secs);
        return Ok(ExitCode::SUCCESS);
    }

    let mut global = registry.load_global()?;
    for change in changes {
        let Some((key, value)) = change.split_once('=') else {
            eprintln!("error: '{change}' is not of the form key=value");
            return Ok(ExitCode::from(FAILURE));
        };
        if let Err(message) = registry::apply_setting(&mut global, key.trim(), value.trim()) {
            eprintln!("error: {message}");
            return Ok(ExitCode::from(FAILURE));
        }
    }
    registry.save_global(global)?;
    println!("Settings updated.");
    Ok(ExitCode::SUCCESS)
}
