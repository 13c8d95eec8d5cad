//! Capture session lifecycle and the video pump

pub mod state;
pub mod supervisor;

pub use state::{SessionLifecycle, SessionPhase, MAX_CONSECUTIVE_TIMEOUTS};
pub use supervisor::{Supervisor, SupervisorConfig};
