//! Flash command handlers (single device and flash-all).

use std::process::ExitCode;

use kflash::batch::{self, BatchRun};
use kflash::{CliInteract, FlashRun, Pipeline, VerifyOutcome};

use super::{report_pipeline_error, resolve_device_key, CommandResult, FAILURE};

/// Build and flash one device.
pub fn flash(pipeline: &Pipeline<'_>, device: &str) -> CommandResult {
    let Some(key) = resolve_device_key(pipeline.registry, device)? else {
        eprintln!("error: device '{device}' is not registered");
        return Ok(ExitCode::from(FAILURE));
    };

    let mut interact = CliInteract;
    match pipeline.flash_device(&mut interact, &key) {
        Ok(FlashRun::Completed(report)) => {
            if !report.flash.success {
                eprintln!(
                    "Flash of '{}' failed: {}",
                    report.name,
                    report.flash.error.as_deref().unwrap_or("unknown error")
                );
                return Ok(ExitCode::from(FAILURE));
            }
            println!(
                "Flashed '{}' via {} in {:.1}s.",
                report.name, report.flash.method, report.flash.elapsed_secs
            );
            match report.verify {
                Some(VerifyOutcome::Success(path)) => {
                    println!("Device is back at {}.", path.display());
                    Ok(ExitCode::SUCCESS)
                }
                Some(outcome) => {
                    eprintln!(
                        "Verification failed: {}",
                        outcome.failure_reason().unwrap_or("unknown")
                    );
                    if matches!(outcome, VerifyOutcome::StuckInBootloader(_)) {
                        eprintln!("The board is still in bootloader mode; try flashing again.");
                    }
                    Ok(ExitCode::from(FAILURE))
                }
                None => Ok(ExitCode::from(FAILURE)),
            }
        }
        Ok(FlashRun::Cancelled) => {
            println!("Cancelled.");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => report_pipeline_error(e),
    }
}

/// Build and flash every flashable device, then print the ledger.
pub fn flash_all(pipeline: &Pipeline<'_>) -> CommandResult {
    let mut interact = CliInteract;
    match batch::flash_all(pipeline, &mut interact) {
        Ok(BatchRun::Completed(report)) => {
            println!();
            print!("{}", report.summary_table());
            if report.all_ok() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(FAILURE))
            }
        }
        Ok(BatchRun::Cancelled) => {
            println!("Cancelled.");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => report_pipeline_error(e),
    }
}
