//! Time-bounded child process execution.
//!
//! Every OS side effect (daemon control, mount, unmount, discovery) goes
//! through [`run`], which kills the child if it outlives its timeout.
//! Secrets travel over stdin or the environment, never argv.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{StorageError, StorageResult};

/// Captured output of a finished child.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// One invocation: a configured command line plus per-call extras.
#[derive(Debug, Default)]
pub struct Invocation<'a> {
    pub args: Vec<String>,
    pub env: Vec<(&'static str, &'a str)>,
    pub stdin: Option<String>,
}

impl<'a> Invocation<'a> {
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: &'static str, value: &'a str) -> Self {
        self.env.push((key, value));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

/// Run `command_line` with `inv` appended, bounded by `timeout`.
///
/// A non-zero exit is returned as output, not an error; callers decide how
/// to classify stderr. Spawn failure and timeout are errors.
pub async fn run(
    command_line: &[String],
    inv: Invocation<'_>,
    timeout: Duration,
) -> StorageResult<CommandOutput> {
    let (program, base_args) = command_line
        .split_first()
        .ok_or_else(|| StorageError::command("<empty>", "empty command line"))?;

    let mut cmd = Command::new(program);
    cmd.args(base_args)
        .args(&inv.args)
        .stdin(if inv.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &inv.env {
        cmd.env(key, value);
    }

    let exec = async {
        let mut child = cmd
            .spawn()
            .map_err(|e| StorageError::command(program.clone(), e.to_string()))?;
        if let Some(input) = &inv.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes()).await?;
            }
        }
        let output = child.wait_with_output().await?;
        Ok::<_, StorageError>(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    };

    match tokio::time::timeout(timeout, exec).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::timeout(program.clone(), timeout)),
    }
}

/// Run and require success.
pub async fn run_checked(
    command_line: &[String],
    inv: Invocation<'_>,
    timeout: Duration,
) -> StorageResult<CommandOutput> {
    let output = run(command_line, inv, timeout).await?;
    if output.success {
        Ok(output)
    } else {
        let program = command_line.first().cloned().unwrap_or_default();
        Err(StorageError::command(program, output.stderr.trim()))
    }
}
