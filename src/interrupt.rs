//! Cooperative interrupt handling.
//!
//! Ctrl-C sets a process-wide flag; long-running loops poll it at their
//! suspension points so scoped cleanup (service restart, scratch dirs)
//! still runs on the way out.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Install the Ctrl-C handler. Call once at startup.
pub fn install() {
    ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)).ok();
}

/// Whether the operator has requested cancellation.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}
