//! Local subprocess launcher.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use adaptrun_core::AdaptationContext;

use crate::config::ProcessorSettings;

use super::{LaunchError, LaunchOutcome, Launcher};

/// Runs the transformation as a single blocking child process with the full
/// correlation context bound into its environment.
///
/// A non-zero exit is deliberately soft: the pipeline still attempts upload
/// and reply, and the presence or absence of an output artifact is the
/// signal of success.
#[derive(Debug, Clone)]
pub struct SubprocessLauncher {
    command: String,
    args: Vec<String>,
}

impl SubprocessLauncher {
    pub fn new(processor: &ProcessorSettings) -> Self {
        Self {
            command: processor.command.clone(),
            args: processor.args.clone(),
        }
    }
}

#[async_trait]
impl Launcher for SubprocessLauncher {
    async fn run(&self, ctx: &AdaptationContext) -> Result<LaunchOutcome, LaunchError> {
        let output = Command::new(&self.command)
            .args(&self.args)
            .envs(ctx.env_bindings())
            .output()
            .await
            .map_err(|source| LaunchError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        if !output.status.success() {
            warn!(
                request_id = %ctx.request_id,
                status = %output.status,
                "processor exited with failure; proceeding to report back"
            );
        }

        debug!(
            request_id = %ctx.request_id,
            stdout = %String::from_utf8_lossy(&output.stdout),
            stderr = %String::from_utf8_lossy(&output.stderr),
            "processor output"
        );

        Ok(LaunchOutcome::completed(output.status.success()))
    }
}
