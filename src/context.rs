//! Shared process-control state.
//!
//! Replaces process-wide statics with one context object handed to the
//! components that need it: the command channel raises flags, the main loop
//! and scheduler consume them.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct ControlFlags {
    kill: AtomicBool,
    reboot: AtomicBool,
    read_now: AtomicBool,
}

impl ControlFlags {
    pub fn request_kill(&self) {
        self.kill.store(true, Ordering::SeqCst);
    }

    pub fn request_reboot(&self) {
        self.reboot.store(true, Ordering::SeqCst);
    }

    pub fn request_read(&self) {
        self.read_now.store(true, Ordering::SeqCst);
    }

    pub fn kill_requested(&self) -> bool {
        self.kill.load(Ordering::SeqCst)
    }

    pub fn reboot_requested(&self) -> bool {
        self.reboot.load(Ordering::SeqCst)
    }

    /// Returns whether an immediate read was requested and clears the request.
    pub fn take_read_request(&self) -> bool {
        self.read_now.swap(false, Ordering::SeqCst)
    }
}

/// Everything the long-lived components share.
#[derive(Debug, Clone)]
pub struct GatewayContext {
    pub flags: Arc<ControlFlags>,
    pub config_path: PathBuf,
}

impl GatewayContext {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            flags: Arc::new(ControlFlags::default()),
            config_path: config_path.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_request_is_consumed_once() {
        let flags = ControlFlags::default();
        flags.request_read();
        assert!(flags.take_read_request());
        assert!(!flags.take_read_request());
    }
}
