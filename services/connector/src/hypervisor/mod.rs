//! Hypervisor access.
//!
//! All VM work goes through the `multipass` executable. Spawning is behind
//! [`CommandRunner`] so tests can swap in [`MockRunner`].

mod gateway;
mod mock;
mod runner;

use thiserror::Error;

pub use gateway::{render_command, InstanceInfo, LaunchRequest, Multipass, MULTIPASS};
pub use mock::MockRunner;
pub use runner::{CommandRunner, ProcessRunner, ToolOutput};

/// Errors from invoking the hypervisor.
#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{message}")]
    Exit { code: i32, message: String },
}

impl HypervisorError {
    fn exit(program: &str, output: &ToolOutput) -> Self {
        let stderr = output.stderr.trim();
        let message = if !stderr.is_empty() {
            stderr.to_string()
        } else if !output.stdout.trim().is_empty() {
            output.stdout.trim().to_string()
        } else {
            format!("{program} exited with status {}", output.code)
        };
        Self::Exit {
            code: output.code,
            message,
        }
    }
}
