//! Bounded external command execution.
//!
//! Every analyzer-facing step (branch listing, index creation, the analysis
//! run itself) goes through [`run_command`]: captured stdout/stderr, a fixed
//! timeout, and a timeout error that is distinct from a non-zero exit. A
//! non-zero exit still carries the captured output so callers can parse
//! whatever the tool managed to print.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command timed out after {timeout_secs}s: {command}")]
    TimedOut { command: String, timeout_secs: u64 },

    #[error("command failed with exit code {code:?}: {command}; stderr: {stderr}")]
    NonZeroExit {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("failed to execute command: {0}")]
    Io(#[from] std::io::Error),
}

/// Render a command line for diagnostics and result records.
pub fn render_command(program: &str, args: &[String]) -> String {
    if args.is_empty() {
        return program.to_string();
    }
    format!("{program} {}", args.join(" "))
}

/// Run `program` with `args` in `cwd`, injecting `envs` on top of the
/// inherited environment, bounded by `timeout`. The child is killed when the
/// timeout elapses.
pub async fn run_command(
    program: &str,
    args: &[String],
    cwd: &Path,
    envs: &[(String, String)],
    timeout: Duration,
) -> Result<CommandOutput, ExecError> {
    let command = render_command(program, args);
    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .envs(envs.iter().map(|(k, v)| (k, v)))
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()?;

    let mut stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("stdout pipe missing"))?;
    let mut stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("stderr pipe missing"))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout_pipe.read_to_end(&mut buf).await?;
        Ok::<Vec<u8>, std::io::Error>(buf)
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr_pipe.read_to_end(&mut buf).await?;
        Ok::<Vec<u8>, std::io::Error>(buf)
    });

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => return Err(ExecError::Io(e)),
        Err(_) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            let _ = stdout_task.await;
            let _ = stderr_task.await;
            return Err(ExecError::TimedOut {
                command,
                timeout_secs: timeout.as_secs(),
            });
        }
    };

    let stdout = stdout_task
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))??;
    let stderr = stderr_task
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))??;
    let stdout = String::from_utf8_lossy(&stdout).to_string();
    let stderr = String::from_utf8_lossy(&stderr).to_string();
    let exit_code = status.code();

    if !status.success() {
        return Err(ExecError::NonZeroExit {
            command,
            code: exit_code,
            stdout,
            stderr,
        });
    }

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code,
    })
}
