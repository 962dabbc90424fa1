//! External process invocation shared by the build tool and runtime adapters

use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Captured result of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run a command to completion and capture its output
pub async fn capture(program: &str, args: &[String]) -> Result<ExecOutput> {
    debug!(program = %program, args = ?args, "Running command");

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("Failed to run {}", program))?;

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim_end().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
    })
}

/// Run a command to completion, forwarding each output line to the log.
///
/// Returns the exit code; -1 when the process was killed by a signal.
pub async fn stream(program: &str, args: &[String], tool: &str) -> Result<i32> {
    debug!(program = %program, args = ?args, "Running command");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn {}", program))?;

    let stdout = child
        .stdout
        .take()
        .context("Child stdout was not captured")?;
    let stderr = child
        .stderr
        .take()
        .context("Child stderr was not captured")?;

    let mut stdout_reader = BufReader::new(stdout).lines();
    let mut stderr_reader = BufReader::new(stderr).lines();
    let mut stdout_open = true;
    let mut stderr_open = true;

    // Read both streams concurrently
    while stdout_open || stderr_open {
        tokio::select! {
            line = stdout_reader.next_line(), if stdout_open => {
                match line {
                    Ok(Some(line)) => debug!(tool = %tool, "{}", line),
                    Ok(None) => stdout_open = false,
                    Err(e) => {
                        warn!(tool = %tool, "Error reading stdout: {}", e);
                        stdout_open = false;
                    }
                }
            }
            line = stderr_reader.next_line(), if stderr_open => {
                match line {
                    Ok(Some(line)) => debug!(tool = %tool, stream = "stderr", "{}", line),
                    Ok(None) => stderr_open = false,
                    Err(e) => {
                        warn!(tool = %tool, "Error reading stderr: {}", e);
                        stderr_open = false;
                    }
                }
            }
        }
    }

    let status = child.wait().await.context("Failed to wait for process")?;
    Ok(status.code().unwrap_or(-1))
}
