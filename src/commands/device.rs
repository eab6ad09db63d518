//! Registry maintenance commands: list, add, remove, rename,
//! enable/disable.

use std::process::ExitCode;

use dialoguer::{Confirm, Input, Select};

use kflash::{config_cache, discovery, registry, DeviceEntry, Registry, Scanner};

use super::{resolve_device_key, CommandResult, FAILURE};

/// Show every registered device with its live connection state.
pub fn list(registry: &Registry, scanner: &Scanner) -> CommandResult {
    let snapshot = registry.load()?;
    if snapshot.devices.is_empty() {
        println!("No devices registered. Run 'kflash add' with a board connected.");
        return Ok(ExitCode::SUCCESS);
    }

    let devices = scanner.scan();
    let name_width = snapshot
        .devices
        .values()
        .map(|e| e.name.len())
        .chain(std::iter::once("Device".len()))
        .max()
        .unwrap_or(6);

    println!(
        "{:<name_width$}  {:<12} {:<10} {:<10}  State",
        "Device", "MCU", "Method", "Flashable"
    );
    for (key, entry) in &snapshot.devices {
        let method = entry
            .flash_method
            .map(|m| m.to_string())
            .unwrap_or_else(|| format!("{} (default)", snapshot.global.default_flash_method));
        let state = match discovery::find_matches(&entry.serial_pattern, &devices) {
            Ok(matches) => match matches.as_slice() {
                [] => "not connected".to_string(),
                [single] => single.mode.to_string(),
                many => format!("AMBIGUOUS ({} matches)", many.len()),
            },
            Err(e) => format!("bad pattern: {e}"),
        };
        println!(
            "{:<name_width$}  {:<12} {:<10} {:<10}  {}",
            entry.name,
            entry.mcu,
            method,
            if entry.flashable { "yes" } else { "no" },
            state
        );
        tracing::debug!(%key, pattern = %entry.serial_pattern, "listed device");
    }
    Ok(ExitCode::SUCCESS)
}

/// Interactive registration of a connected board.
pub fn add(registry: &Registry, scanner: &Scanner) -> CommandResult {
    let devices = scanner.scan();
    if devices.is_empty() {
        eprintln!("No serial devices found under {}.", discovery::SERIAL_BY_ID_DIR);
        return Ok(ExitCode::from(FAILURE));
    }

    let labels: Vec<String> = devices
        .iter()
        .map(|d| format!("{} [{}]", d.name, d.mode))
        .collect();
    let picked = Select::new()
        .with_prompt("Which endpoint is the board to register?")
        .items(&labels)
        .default(0)
        .interact()?;
    let device = &devices[picked];

    let pattern = match discovery::cross_mode_pattern(device) {
        Some(pattern) => pattern,
        None => {
            // No recognizable serial token; fall back to the exact name.
            println!("Endpoint has no hardware serial; matching on the exact name.");
            device.name.clone()
        }
    };

    let name: String = Input::new()
        .with_prompt("Display name")
        .interact_text()?;
    let key = registry::device_key(&name);
    if key.is_empty() {
        eprintln!("A display name needs at least one alphanumeric character.");
        return Ok(ExitCode::from(FAILURE));
    }

    let mcu: String = Input::new()
        .with_prompt("MCU family")
        .with_initial_text(discovery::mcu_hint(&device.name).unwrap_or_default())
        .interact_text()?;

    let flashable = Confirm::new()
        .with_prompt("Include this device in flash operations?")
        .default(true)
        .interact()?;

    let entry = DeviceEntry {
        name: name.clone(),
        mcu,
        serial_pattern: pattern.clone(),
        flash_method: None,
        flashable,
    };
    let key = match registry.add(entry) {
        Ok(key) => key,
        Err(kflash::RegistryError::DuplicateKey(k)) => {
            eprintln!("error: a device keyed '{k}' already exists; pick another name");
            return Ok(ExitCode::from(FAILURE));
        }
        Err(e) => return Err(e.into()),
    };

    println!("Registered '{name}' (pattern {pattern}).");
    println!("Next: 'kflash menuconfig {key}' to capture its firmware config.");
    Ok(ExitCode::SUCCESS)
}

pub fn remove(registry: &Registry, device: &str) -> CommandResult {
    let Some(key) = resolve_device_key(registry, device)? else {
        eprintln!("error: device '{device}' is not registered");
        return Ok(ExitCode::from(FAILURE));
    };
    let entry = registry.remove(&key)?;
    println!("Removed '{}'.", entry.name);

    let global = registry.load_global()?;
    let cache_root = config_cache::resolve_cache_root(&global);
    let cache_dir = cache_root.join(&key);
    if cache_dir.exists()
        && Confirm::new()
            .with_prompt("Also delete its cached firmware config?")
            .default(false)
            .interact()?
    {
        std::fs::remove_dir_all(&cache_dir)?;
        println!("Deleted {}.", cache_dir.display());
    }
    Ok(ExitCode::SUCCESS)
}

/// Rename a device; the registry key and the cache directory follow the
/// new display name.
pub fn rename(registry: &Registry, device: &str, new_name: &str) -> CommandResult {
    let Some(old_key) = resolve_device_key(registry, device)? else {
        eprintln!("error: device '{device}' is not registered");
        return Ok(ExitCode::from(FAILURE));
    };
    let new_key = registry::device_key(new_name);
    if new_key.is_empty() {
        eprintln!("A display name needs at least one alphanumeric character.");
        return Ok(ExitCode::from(FAILURE));
    }

    let mut snapshot = registry.load()?;
    if new_key != old_key && snapshot.devices.contains_key(&new_key) {
        eprintln!("error: a device keyed '{new_key}' already exists");
        return Ok(ExitCode::from(FAILURE));
    }

    let cache_root = config_cache::resolve_cache_root(&snapshot.global);
    if new_key != old_key {
        if let Err(e) = config_cache::rename_cache(&cache_root, &old_key, &new_key) {
            if matches!(e, kflash::ConfigError::TargetExists(_)) {
                eprintln!("error: {e}");
                return Ok(ExitCode::from(FAILURE));
            }
            return Err(e.into());
        }
    }

    let Some(mut entry) = snapshot.devices.remove(&old_key) else {
        eprintln!("error: device '{device}' is not registered");
        return Ok(ExitCode::from(FAILURE));
    };
    entry.name = new_name.to_string();
    snapshot.devices.insert(new_key.clone(), entry);
    registry.save(&snapshot)?;

    println!("Renamed to '{new_name}' (key {new_key}).");
    Ok(ExitCode::SUCCESS)
}

pub fn set_flashable(registry: &Registry, device: &str, flashable: bool) -> CommandResult {
    let Some(key) = resolve_device_key(registry, device)? else {
        eprintln!("error: device '{device}' is not registered");
        return Ok(ExitCode::from(FAILURE));
    };
    registry.set_flashable(&key, flashable)?;
    println!(
        "'{key}' is now {} flash operations.",
        if flashable { "included in" } else { "excluded from" }
    );
    Ok(ExitCode::SUCCESS)
}
