//! Raw output persistence.
//!
//! Whatever the analyzer printed — on success, failure, or timeout — lands on
//! disk so a run is never unrecoverable. Artifact names embed repository,
//! input, run number, and a fresh timestamp; concurrent tasks cannot collide
//! without any locking. Persistence failure degrades to `None` and a warning,
//! never to a failed task.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Locations of the persisted stdout/stderr artifacts for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedArtifacts {
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
}

/// Writes captured process output under a repository's output directory.
#[derive(Debug, Clone)]
pub struct ArtifactSink {
    output_dir: PathBuf,
}

impl ArtifactSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Persist captured stdout and stderr. Returns the artifact locations,
    /// or `None` if persistence failed (logged, non-fatal).
    pub fn save(
        &self,
        repo_name: &str,
        input_name: &str,
        run_number: u32,
        stdout: &str,
        stderr: &str,
        success: bool,
    ) -> Option<SavedArtifacts> {
        match self.try_save(repo_name, input_name, run_number, stdout, stderr, success) {
            Ok(saved) => Some(saved),
            Err(e) => {
                warn!(
                    repo = repo_name,
                    input = input_name,
                    run_number,
                    error = %e,
                    "failed to persist raw output"
                );
                None
            }
        }
    }

    fn try_save(
        &self,
        repo_name: &str,
        input_name: &str,
        run_number: u32,
        stdout: &str,
        stderr: &str,
        success: bool,
    ) -> std::io::Result<SavedArtifacts> {
        std::fs::create_dir_all(&self.output_dir)?;

        let timestamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let outcome = if success { "pass" } else { "fail" };
        let stem = format!(
            "{}__{}__run{}__{}__{}",
            sanitize(repo_name),
            sanitize(input_stem(input_name)),
            run_number,
            timestamp,
            outcome
        );

        let stdout_path = self.output_dir.join(format!("{stem}.stdout.log"));
        let stderr_path = self.output_dir.join(format!("{stem}.stderr.log"));
        std::fs::write(&stdout_path, stdout)?;
        std::fs::write(&stderr_path, stderr)?;

        Ok(SavedArtifacts {
            stdout_path,
            stderr_path,
        })
    }
}

fn input_stem(input_name: &str) -> &str {
    Path::new(input_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(input_name)
}

/// Keep artifact names filesystem-safe regardless of what the config called
/// the repository.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
