//! Printer status command.

use std::process::ExitCode;

use moonraker_client::MoonrakerClient;

use super::{CommandResult, FAILURE};

/// Query Moonraker for the print state and component versions.
pub fn status(oracle: Option<&MoonrakerClient>) -> CommandResult {
    let Some(oracle) = oracle else {
        eprintln!("Moonraker client could not be constructed.");
        return Ok(ExitCode::from(FAILURE));
    };

    match oracle.print_state() {
        Ok(state) => println!("Print state: {state}"),
        Err(e) => {
            eprintln!("Moonraker unreachable: {e}");
            return Ok(ExitCode::from(FAILURE));
        }
    }

    match oracle.versions() {
        Ok(report) => {
            if let Some(host) = &report.host {
                println!("Host:        {host}");
            }
            for (object, version) in &report.mcus {
                println!("{object:<12} {version}");
            }
        }
        Err(e) => eprintln!("Version query failed: {e}"),
    }
    Ok(ExitCode::SUCCESS)
}
