//! Thin wrapper around `tokio::process` for the CLI tools the adapters drive.

use std::{ffi::OsStr, process::Stdio, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, warn};

/// Captured output of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CommandOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_owned()
    }
}

/// Runs `program args...` to completion. The child is killed if `timeout`
/// elapses or the future is dropped; a zero timeout waits indefinitely.
/// A non-zero exit status is an error carrying stderr.
pub async fn run_command<I, S>(program: &OsStr, args: I, timeout: Duration) -> Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let program_name = program.to_string_lossy().into_owned();
    debug!(program = %program_name, "spawning command");
    let child = command
        .spawn()
        .with_context(|| format!("failed to spawn {program_name}"))?;

    let output = if timeout.is_zero() {
        child.wait_with_output().await?
    } else {
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(program = %program_name, ?timeout, "command timed out, terminating process");
                return Err(anyhow!("{program_name} timed out after {timeout:?}"));
            }
        }
    };

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
    if !output.status.success() {
        match output.status.code() {
            Some(code) => bail!("{program_name} exited with status {code}: {stderr}"),
            None => bail!("{program_name} terminated by signal: {stderr}"),
        }
    }

    Ok(CommandOutput {
        stdout: output.stdout,
        stderr,
    })
}
