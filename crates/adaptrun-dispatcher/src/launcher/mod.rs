//! Execution launchers: one bounded unit of compute per request.

mod pod;
mod subprocess;

pub use pod::PodLauncher;
pub use subprocess::SubprocessLauncher;

use async_trait::async_trait;
use thiserror::Error;

use adaptrun_core::AdaptationContext;

/// Launch errors.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to spawn processor '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("execution unit creation failed after {attempts} attempts: {last_error}")]
    Creation { attempts: usize, last_error: String },

    #[error("invalid resource quantity '{0}'")]
    InvalidQuantity(String),
}

/// What a launcher did with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchOutcome {
    /// Whether the execution unit reported success. Only meaningful when the
    /// launcher ran to completion locally.
    pub exit_ok: bool,

    /// True when the strategy handed the upload/reply stage off to the
    /// execution unit itself; the dispatcher must not publish for it.
    pub handed_off: bool,
}

impl LaunchOutcome {
    /// A local run that finished with the given exit result.
    pub fn completed(exit_ok: bool) -> Self {
        Self {
            exit_ok,
            handed_off: false,
        }
    }

    /// A remote unit was created; it owns the rest of the pipeline.
    pub fn handed_off() -> Self {
        Self {
            exit_ok: true,
            handed_off: true,
        }
    }
}

/// One strategy for running the transformation for a single request.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn run(&self, ctx: &AdaptationContext) -> Result<LaunchOutcome, LaunchError>;
}
