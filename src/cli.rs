// CLI definitions using clap

use clap::{Parser, Subcommand};
use kflash::FlashMethod;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kflash")]
#[command(author, version, about = "Firmware build & flash manager for Klipper hosts")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Registry file override (default: the user config directory).
    #[arg(long, global = true, value_name = "PATH")]
    pub registry: Option<PathBuf>,

    /// Moonraker base URL for print-state and version queries.
    #[arg(long, global = true, value_name = "URL", default_value = moonraker_client::DEFAULT_URL)]
    pub moonraker_url: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    // === Registry ===
    /// List registered devices and their connection state
    #[command(visible_aliases = ["ls", "l"])]
    List,

    /// Register a connected board interactively
    Add,

    /// Remove a device from the registry
    #[command(visible_alias = "rm")]
    Remove {
        /// Device key or display name
        device: String,
    },

    /// Rename a device (moves its config cache)
    Rename {
        device: String,
        new_name: String,
    },

    /// Include a device in flash operations
    Enable { device: String },

    /// Exclude a device from flash operations
    Disable { device: String },

    // === Firmware ===
    /// Run the firmware configuration UI for a device
    #[command(visible_alias = "config")]
    Menuconfig { device: String },

    /// Build and flash one device
    #[command(visible_alias = "f")]
    Flash {
        device: String,
        /// Flash method override for this run
        #[arg(long, value_enum)]
        method: Option<FlashMethod>,
        /// Do not fall back to the other flash method on failure
        #[arg(long)]
        no_fallback: bool,
    },

    /// Build and flash every flashable device
    #[command(visible_alias = "fa")]
    FlashAll,

    // === Utilities ===
    /// Show printer state and component versions
    Status,

    /// Power-cycle a device's USB port (requires root)
    UsbReset { device: String },

    /// Show or change global settings
    Settings {
        /// Apply `key=value` changes (repeatable)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
}
