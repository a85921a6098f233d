//! Container CLI command abstraction and builder utilities.
//!
//! This module provides a centralized interface for executing container CLI
//! commands (docker or a CLI-compatible runtime) with consistent error
//! classification and logging.

use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{InfraError, Result};

/// Builder for container CLI commands with fluent interface.
///
/// Commands are spawned with `kill_on_drop`, so dropping the future (for
/// example when a deadline elapses) terminates the CLI process.
#[derive(Debug, Clone)]
pub struct ContainerCommand {
    binary: String,
    subcommand: Option<String>,
    args: Vec<String>,
}

impl ContainerCommand {
    /// Create a new command for the given CLI binary.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            subcommand: None,
            args: Vec::new(),
        }
    }

    /// Set the subcommand (e.g., "create", "commit", "rm").
    pub fn subcommand<S: Into<String>>(mut self, cmd: S) -> Self {
        self.subcommand = Some(cmd.into());
        self
    }

    /// Add a single argument to the command.
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments to the command.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Execute the command and return trimmed stdout.
    ///
    /// A non-zero exit status is turned into an [`InfraError`] by
    /// [`classify_failure`].
    pub async fn output(self) -> Result<String> {
        let description = self.describe();
        let mut cmd = self.build_command();

        debug!("Executing container command: {}", description);

        let output = cmd.output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

        if output.status.success() {
            trace!(stdout = %stdout, "Container command succeeded");
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(classify_failure(&description, &stderr))
        }
    }

    /// Execute the command, treating "no such ..." failures as success.
    ///
    /// Used by the idempotent operations (stop, remove, image removal).
    pub async fn output_ignoring_missing(self) -> Result<()> {
        let description = self.describe();
        match self.output().await {
            Ok(_) => Ok(()),
            Err(InfraError::SourceNotFound(msg)) | Err(InfraError::Provider(msg))
                if is_missing_target(&msg) =>
            {
                debug!("{} target already gone: {}", description, msg);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Spawn the command with piped stdout for streaming subcommands.
    pub fn spawn_streaming(self) -> Result<tokio::process::Child> {
        let mut cmd = self.build_command();
        cmd.stdout(Stdio::piped());
        Ok(cmd.spawn()?)
    }

    fn describe(&self) -> String {
        let mut parts = vec![self.binary.clone()];
        parts.extend(self.subcommand.iter().cloned());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    fn build_command(self) -> Command {
        let mut cmd = Command::new(&self.binary);

        if let Some(subcmd) = self.subcommand {
            cmd.arg(subcmd);
        }

        cmd.args(self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd
    }
}

fn is_missing_target(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("no such container")
        || lower.contains("no such image")
        || lower.contains("no such object")
        || lower.contains("no container with name or id")
        || lower.contains("image not known")
}

/// Map CLI stderr onto the infrastructure error taxonomy.
pub fn classify_failure(command: &str, stderr: &str) -> InfraError {
    let lower = stderr.to_lowercase();
    let message = if stderr.is_empty() {
        format!("`{command}` failed")
    } else {
        format!("`{command}` failed: {stderr}")
    };

    if lower.contains("no such image")
        || lower.contains("pull access denied")
        || lower.contains("manifest unknown")
        || lower.contains("repository does not exist")
        || lower.contains("image not known")
    {
        InfraError::SourceNotFound(message)
    } else if lower.contains("unauthorized") || lower.contains("authentication required") {
        InfraError::Unauthorized(message)
    } else if lower.contains("cannot connect to the docker daemon")
        || lower.contains("connection refused")
        || lower.contains("i/o timeout")
        || lower.contains("tls handshake timeout")
        || lower.contains("context deadline exceeded")
        || lower.contains("temporary failure in name resolution")
    {
        InfraError::Transient(message)
    } else {
        InfraError::Provider(message)
    }
}
