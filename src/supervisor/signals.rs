//! Control flags driving the supervisor state machine.
//!
//! Three signals move the machine: terminate (SIGTERM/SIGINT), graceful
//! restart (SIGUSR1) and immediate restart (SIGHUP). Handlers only latch
//! flags; the main loop reads them at its own pace. External callers (and
//! tests) can latch the same flags without a signal. Once latched, a flag
//! stays latched for the rest of that `run()` lifetime.

#![allow(dead_code)] // Some methods are for signal-free external callers

use crate::error::Result;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Latched shutdown/restart requests.
#[derive(Debug, Clone, Default)]
pub struct ControlFlags {
    shutdown: Arc<AtomicBool>,
    restart: Arc<AtomicBool>,
    graceful: Arc<AtomicBool>,
}

impl ControlFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the signal handlers. Call once, in the supervisor process,
    /// before the first fork.
    pub fn install(&self) -> Result<()> {
        signal_hook::flag::register(SIGTERM, self.shutdown.clone())?;
        signal_hook::flag::register(SIGINT, self.shutdown.clone())?;
        signal_hook::flag::register(SIGHUP, self.restart.clone())?;

        // One handler sets both flags, graceful first, so the main loop
        // can never observe the restart without its graceful marker.
        let graceful = self.graceful.clone();
        let restart = self.restart.clone();
        unsafe {
            signal_hook::low_level::register(SIGUSR1, move || {
                graceful.store(true, Ordering::SeqCst);
                restart.store(true, Ordering::SeqCst);
            })?;
        }
        Ok(())
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn request_restart(&self, graceful: bool) {
        if graceful {
            self.graceful.store(true, Ordering::SeqCst);
        }
        self.restart.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn restart_requested(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }

    pub fn graceful_requested(&self) -> bool {
        self.graceful.load(Ordering::SeqCst)
    }

    /// Either kind of stop has been requested.
    pub fn stop_requested(&self) -> bool {
        self.shutdown_requested() || self.restart_requested()
    }

    /// Clear all latches for the next `run()` lifetime.
    pub fn reset(&self) {
        self.shutdown.store(false, Ordering::SeqCst);
        self.restart.store(false, Ordering::SeqCst);
        self.graceful.store(false, Ordering::SeqCst);
    }
}
