//! External command execution.
//!
//! Generators and the signature verifier drive external tools (`kcl`,
//! `helm`, `cosign`). They do so through [`CommandRunner`] so tests can
//! substitute canned output.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, error};

/// Runs a program and returns its stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`. Non-zero exit is [`Error::Command`].
    async fn run(&self, program: &str, args: &[String]) -> Result<Vec<u8>>;
}

/// Runs commands on the local host via `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct LocalCommandRunner {
    working_dir: Option<PathBuf>,
}

impl LocalCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every command from `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: Some(dir.into()),
        }
    }
}

#[async_trait]
impl CommandRunner for LocalCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<Vec<u8>> {
        debug!(program, ?args, "Executing command");

        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|e| Error::Command {
            program: program.to_string(),
            status: "spawn failed".to_string(),
            stderr: e.to_string(),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(program, status = %output.status, "Command failed: {}", stderr);
            return Err(Error::Command {
                program: program.to_string(),
                status: output.status.to_string(),
                stderr,
            });
        }

        Ok(output.stdout)
    }
}
