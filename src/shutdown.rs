//! Process shutdown
//!
//! Signal handling is explicit: the handle owns references to everything
//! that must be cleaned up (the pump stop flag, the HID injector) instead of
//! reaching for globals. Teardown is idempotent, so a second signal during
//! cleanup is harmless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use crate::input::InputInjector;

/// Owns the cleanup performed on SIGINT/SIGTERM.
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    injector: Arc<InputInjector>,
    done: AtomicBool,
}

impl ShutdownHandle {
    pub fn new(stop: Arc<AtomicBool>, injector: Arc<InputInjector>) -> Self {
        Self {
            stop,
            injector,
            done: AtomicBool::new(false),
        }
    }

    /// Stop the pump and release all injected input. Safe to call more than
    /// once.
    pub fn shutdown(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down");
        // The host must not be left with a key or button held down.
        self.injector.release_all();
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

/// Resolve when SIGINT or SIGTERM arrives.
pub async fn wait_for_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!(%err, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = term.recv() => info!("received SIGTERM"),
    }
}
