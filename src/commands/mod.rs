//! Command handlers for the CLI application.
//!
//! Handlers print for the operator and map pipeline results onto exit
//! codes: 0 for success and clean cancels, 1 for handled failures, 2 for
//! internal errors (the latter propagate as `Err` to `main`).

pub mod config;
pub mod device;
pub mod flash;
pub mod status;
pub mod utility;

use std::process::ExitCode;

use kflash::{Pipeline, PipelineError, PipelineOptions, Registry, Scanner, ServiceController};
use moonraker_client::MoonrakerClient;

use crate::cli::Cli;

/// Result type for command handlers.
pub type CommandResult = anyhow::Result<ExitCode>;

/// Exit code for handled operational failures.
pub const FAILURE: u8 = 1;

/// Registry handle from the CLI override or the default location.
pub fn open_registry(cli: &Cli) -> Registry {
    match &cli.registry {
        Some(path) => Registry::new(path.clone()),
        None => Registry::new(Registry::default_path()),
    }
}

/// Assemble the standard pipeline for flash-type commands.
pub fn build_pipeline<'a>(cli: &Cli, registry: &'a Registry, options: PipelineOptions) -> Pipeline<'a> {
    let oracle = match MoonrakerClient::new(&cli.moonraker_url) {
        Ok(client) => Some(client),
        Err(e) => {
            tracing::warn!(error = %e, "moonraker client unavailable");
            None
        }
    };
    Pipeline {
        registry,
        scanner: Scanner::default(),
        service: ServiceController::default(),
        oracle,
        options,
    }
}

/// Print a pipeline error and turn it into the right exit code.
pub fn report_pipeline_error(error: PipelineError) -> CommandResult {
    if error.is_internal() {
        return Err(error.into());
    }
    eprintln!("error: {error}");
    Ok(ExitCode::from(FAILURE))
}

/// Resolve a user-supplied device argument (key or display name) to a key.
pub fn resolve_device_key(registry: &Registry, device: &str) -> anyhow::Result<Option<String>> {
    let snapshot = registry.load()?;
    if snapshot.devices.contains_key(device) {
        return Ok(Some(device.to_string()));
    }
    let slug = kflash::registry::device_key(device);
    Ok(snapshot.devices.contains_key(&slug).then_some(slug))
}
