//! Shared plumbing for the postbox crates: logging setup and process signals.

pub mod logging;

pub use tracing;

/// Process-wide notifications broadcast from the controller to long-running loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Stop taking new work; in-flight cycles finish
    Shutdown,
    /// Every loop has observed the shutdown
    Finalised,
    /// Configuration file changed and should be re-read
    Reload,
}
