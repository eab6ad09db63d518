// kflash - multi-device firmware build & flash manager for Klipper hosts
// Registry, discovery, build/flash pipeline, and service control

pub mod batch;
pub mod config_cache;
pub mod discovery;
pub mod flash;
pub mod interrupt;
pub mod make;
pub mod orchestrator;
pub mod registry;
pub mod service;
pub mod util;
pub mod verify;

pub use batch::{BatchReport, BatchRow, BatchRun};
pub use config_cache::{ConfigError, DeviceConfigCache};
pub use discovery::{DeviceMode, DiscoveredDevice, DiscoveryError, Scanner};
pub use flash::{FlashMethod, FlashResult, Flasher, PreflightError};
pub use orchestrator::{
    CliInteract, FlashReport, FlashRun, Interact, MismatchChoice, Pipeline, PipelineError,
    PipelineOptions,
};
pub use registry::{DeviceEntry, GlobalConfig, Registry, RegistryError, RegistrySnapshot};
pub use service::{ServiceController, ServiceError};
pub use verify::VerifyOutcome;
