//! Branch guard: put a repository on the requested branch before a test runs.
//!
//! The guard refuses ref-unsafe names up front, confirms the branch exists as
//! a local or remote-tracking ref, then checks it out. Each git invocation is
//! bounded by the caller's timeout. Callers fold every variant into a single
//! checkout-failed outcome; the variants exist so the reported reason stays
//! concrete.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::exec::{run_command, ExecError};

pub const DEFAULT_BRANCH_OP_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_BRANCH_NAME_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum BranchError {
    #[error("branch name '{name}' is not usable: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("failed to list branches: {0}")]
    ListFailed(String),

    #[error("branch '{0}' not found as a local or remote-tracking ref")]
    NotFound(String),

    #[error("checkout of '{name}' failed: {reason}")]
    CheckoutFailed { name: String, reason: String },

    #[error("branch operation timed out after {timeout_secs}s")]
    TimedOut { timeout_secs: u64 },
}

/// Reject names git itself would refuse, before any process is spawned.
fn validate_branch_name(branch: &str) -> Result<(), String> {
    if branch.is_empty() {
        return Err("name is empty".into());
    }
    if branch.len() > MAX_BRANCH_NAME_LEN {
        return Err(format!("name exceeds {MAX_BRANCH_NAME_LEN} characters"));
    }
    if branch.starts_with('/') || branch.ends_with('/') {
        return Err("name cannot start or end with '/'".into());
    }
    if branch.contains("..") {
        return Err("name cannot contain '..'".into());
    }
    if branch.contains("@{") {
        return Err("name cannot contain '@{'".into());
    }
    if branch.ends_with(".lock") {
        return Err("name cannot end with '.lock'".into());
    }
    for ch in branch.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '/' | '-' | '_' | '.') {
            continue;
        }
        return Err(format!("unsupported character '{ch}'"));
    }
    Ok(())
}

/// Check out `branch` in `repo_path`.
///
/// Protocol: validate the name, list local and remote-tracking branches,
/// confirm the name appears in either, then `git checkout`.
pub async fn checkout_branch(
    repo_path: &Path,
    branch: &str,
    timeout: Duration,
) -> Result<(), BranchError> {
    if let Err(reason) = validate_branch_name(branch) {
        return Err(BranchError::InvalidName {
            name: branch.to_string(),
            reason,
        });
    }

    if !branch_exists(repo_path, branch, timeout).await? {
        return Err(BranchError::NotFound(branch.to_string()));
    }

    debug!(branch, repo = %repo_path.display(), "checking out branch");
    run_command(
        "git",
        &["checkout".to_string(), branch.to_string()],
        repo_path,
        &[],
        timeout,
    )
    .await
    .map_err(|e| match e {
        ExecError::TimedOut { timeout_secs, .. } => BranchError::TimedOut { timeout_secs },
        ExecError::NonZeroExit { stderr, .. } => BranchError::CheckoutFailed {
            name: branch.to_string(),
            reason: stderr.trim().to_string(),
        },
        ExecError::Io(e) => BranchError::CheckoutFailed {
            name: branch.to_string(),
            reason: e.to_string(),
        },
    })?;

    Ok(())
}

async fn branch_exists(
    repo_path: &Path,
    branch: &str,
    timeout: Duration,
) -> Result<bool, BranchError> {
    let local = list_branches(repo_path, &["branch".to_string(), "--list".to_string(), branch.to_string()], timeout).await?;
    if local
        .lines()
        .any(|l| l.trim_start_matches(|c: char| c == '*' || c == ' ').trim() == branch)
    {
        return Ok(true);
    }

    let remote = list_branches(repo_path, &["branch".to_string(), "-r".to_string()], timeout).await?;
    let found = remote
        .lines()
        .map(str::trim)
        .any(|l| l == branch || l.ends_with(&format!("/{branch}")));
    Ok(found)
}

async fn list_branches(
    repo_path: &Path,
    args: &[String],
    timeout: Duration,
) -> Result<String, BranchError> {
    match run_command("git", args, repo_path, &[], timeout).await {
        Ok(out) => Ok(out.stdout),
        Err(ExecError::TimedOut { timeout_secs, .. }) => {
            Err(BranchError::TimedOut { timeout_secs })
        }
        Err(ExecError::NonZeroExit { stderr, .. }) => {
            Err(BranchError::ListFailed(stderr.trim().to_string()))
        }
        Err(ExecError::Io(e)) => Err(BranchError::ListFailed(e.to_string())),
    }
}
