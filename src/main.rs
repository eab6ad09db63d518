//! kflash CLI
//!
//! Thin dispatch layer: parse arguments, wire up the pipeline, hand off to
//! the command handlers. Exit codes: 0 success or clean cancel, 1 handled
//! failure, 2 internal error.

use std::process::ExitCode;

use clap::Parser;

// CLI definitions
mod cli;
use cli::{Cli, Commands};

// Command handlers (split from main.rs)
mod commands;

use kflash::{PipelineOptions, Scanner};

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kflash=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    kflash::interrupt::install();

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: &Cli) -> commands::CommandResult {
    let registry = commands::open_registry(cli);
    let scanner = Scanner::default();

    match &cli.command {
        Commands::List => commands::device::list(&registry, &scanner),
        Commands::Add => commands::device::add(&registry, &scanner),
        Commands::Remove { device } => commands::device::remove(&registry, device),
        Commands::Rename { device, new_name } => {
            commands::device::rename(&registry, device, new_name)
        }
        Commands::Enable { device } => commands::device::set_flashable(&registry, device, true),
        Commands::Disable { device } => commands::device::set_flashable(&registry, device, false),

        Commands::Menuconfig { device } => {
            let pipeline = commands::build_pipeline(cli, &registry, PipelineOptions::default());
            commands::config::menuconfig(&pipeline, device)
        }
        Commands::Flash {
            device,
            method,
            no_fallback,
        } => {
            let options = PipelineOptions {
                method_override: *method,
                disable_fallback: *no_fallback,
                ..PipelineOptions::default()
            };
            let pipeline = commands::build_pipeline(cli, &registry, options);
            commands::flash::flash(&pipeline, device)
        }
        Commands::FlashAll => {
            let pipeline = commands::build_pipeline(cli, &registry, PipelineOptions::default());
            commands::flash::flash_all(&pipeline)
        }

        Commands::Status => {
            let pipeline = commands::build_pipeline(cli, &registry, PipelineOptions::default());
            commands::status::status(pipeline.oracle.as_ref())
        }
        Commands::UsbReset { device } => commands::utility::usb_reset(&registry, &scanner, device),
        Commands::Settings { set } => commands::utility::settings(&registry, set),
    }
}
