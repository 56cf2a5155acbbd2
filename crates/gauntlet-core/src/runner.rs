//! Process runner: executes one test case end to end.
//!
//! A run is branch guard (optional), index creation, then the analysis
//! invocation, with a progress line published to the task's session around
//! every external call. `run` is infallible by contract: every failure path
//! is folded into a `TestResult` with `success = false`, and captured output
//! is handed to the artifact sink on every terminal state so no run is
//! unrecoverable.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::branch::{checkout_branch, BranchError};
use crate::broadcast::LogBroadcaster;
use crate::config::AnalyzerConfig;
use crate::exec::{render_command, run_command, ExecError};
use crate::extract::{self, ToolAnalytics};
use crate::sink::{ArtifactSink, SavedArtifacts};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One unit of work: a repository, one input file, one run number.
#[derive(Debug, Clone)]
pub struct TestTask {
    pub repo_name: String,
    pub repo_path: PathBuf,
    pub input_file: String,
    pub inputs_path: PathBuf,
    pub output_path: PathBuf,
    pub run_number: u32,
    pub branch: Option<String>,
    /// Session id for progress logs; generated when absent.
    pub session_id: Option<String>,
}

/// Outcome of the branch guard step.
#[derive(Debug, Clone, Serialize)]
pub struct BranchCheckoutOutcome {
    pub branch: String,
    pub success: bool,
    pub error: Option<String>,
}

/// Command lines recorded for operator inspection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandRecord {
    pub create_index: Option<String>,
    pub analyze: Option<String>,
    pub index_path: Option<String>,
}

/// The per-task result returned to the orchestrator. Immutable.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub repo: String,
    pub input_file: String,
    pub run_number: u32,
    pub success: bool,
    /// Structured payload extracted from the analyzer's output, if any.
    pub output: Option<Value>,
    /// Cleaned analyzer stdout. Literal raw bytes live in the sink artifacts.
    pub raw_output: String,
    pub raw_error: String,
    pub tool_analytics: ToolAnalytics,
    pub error: Option<String>,
    pub duration_secs: f64,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub commands: CommandRecord,
    pub branch_checkout: Option<BranchCheckoutOutcome>,
    pub saved_files: Option<SavedArtifacts>,
}

/// Terminal failure reasons for a single task.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("branch checkout failed: {0}")]
    BranchCheckout(#[from] BranchError),

    #[error("index creation failed with exit code {code:?}: {stderr}")]
    IndexCreationFailed { code: Option<i32>, stderr: String },

    #[error("index creation timed out after {0}s")]
    IndexCreationTimeout(u64),

    #[error("index creation succeeded but reported no index path")]
    MissingIndexPath,

    #[error("analysis exited with code {code:?}")]
    AnalysisNonZeroExit { code: Option<i32> },

    #[error("analysis timed out after {0}s")]
    AnalysisTimeout(u64),

    #[error("analysis could not be executed: {0}")]
    AnalysisException(String),
}

/// Per-step timeouts. Defaults match the deployed harness; tests shrink them.
#[derive(Debug, Clone)]
pub struct RunnerTimeouts {
    pub branch_op: Duration,
    pub index_creation: Duration,
    pub analysis: Duration,
}

impl Default for RunnerTimeouts {
    fn default() -> Self {
        Self {
            branch_op: Duration::from_secs(30),
            index_creation: Duration::from_secs(60),
            analysis: Duration::from_secs(300),
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct TestRunner {
    analyzer: AnalyzerConfig,
    broadcaster: LogBroadcaster,
    timeouts: RunnerTimeouts,
}

impl TestRunner {
    pub fn new(analyzer: AnalyzerConfig, broadcaster: LogBroadcaster) -> Self {
        Self {
            analyzer,
            broadcaster,
            timeouts: RunnerTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: RunnerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Run one task to completion. Never returns an error: failures become
    /// `TestResult { success: false, error: Some(..) }`.
    pub async fn run(&self, task: &TestTask) -> TestResult {
        let started = Instant::now();
        let session_id = task
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let sink = ArtifactSink::new(&task.output_path);
        let label = format!(
            "[{} / {} run {}]",
            task.repo_name, task.input_file, task.run_number
        );

        self.publish(&session_id, format!("{label} starting"));

        // Branch guard.
        let mut branch_checkout = None;
        if let Some(branch) = &task.branch {
            self.publish(&session_id, format!("{label} checking out branch '{branch}'"));
            match checkout_branch(&task.repo_path, branch, self.timeouts.branch_op).await {
                Ok(()) => {
                    self.publish(&session_id, format!("{label} on branch '{branch}'"));
                    branch_checkout = Some(BranchCheckoutOutcome {
                        branch: branch.clone(),
                        success: true,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(repo = %task.repo_name, %branch, error = %e, "branch guard failed");
                    self.publish(&session_id, format!("{label} branch checkout failed: {e}"));
                    branch_checkout = Some(BranchCheckoutOutcome {
                        branch: branch.clone(),
                        success: false,
                        error: Some(e.to_string()),
                    });
                    let saved = sink.save(
                        &task.repo_name,
                        &task.input_file,
                        task.run_number,
                        "",
                        "",
                        false,
                    );
                    return self.failed(
                        task,
                        &session_id,
                        started,
                        CommandRecord::default(),
                        branch_checkout,
                        TaskError::BranchCheckout(e).to_string(),
                        "",
                        "",
                        saved,
                    );
                }
            }
        }

        // Index creation. The index is rebuilt for every task so it reflects
        // whatever the branch guard just put in the working tree.
        let mut commands = CommandRecord::default();
        let base_env: Vec<(String, String)> = self
            .analyzer
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let indexer = self.analyzer.indexer_path.to_string_lossy().to_string();
        let index_args = vec![
            "create_index".to_string(),
            "-r".to_string(),
            task.repo_path.to_string_lossy().to_string(),
        ];
        commands.create_index = Some(render_command(&indexer, &index_args));

        self.publish(&session_id, format!("{label} creating code index"));
        let index_path = match run_command(
            &indexer,
            &index_args,
            &task.repo_path,
            &base_env,
            self.timeouts.index_creation,
        )
        .await
        {
            Ok(out) => match parse_index_path(&out.stdout) {
                Some(path) => {
                    self.publish(&session_id, format!("{label} index ready at {path}"));
                    commands.index_path = Some(path.clone());
                    path
                }
                None => {
                    self.publish(&session_id, format!("{label} index creation reported no path"));
                    let saved = sink.save(
                        &task.repo_name,
                        &task.input_file,
                        task.run_number,
                        &out.stdout,
                        &out.stderr,
                        false,
                    );
                    return self.failed(
                        task,
                        &session_id,
                        started,
                        commands,
                        branch_checkout,
                        TaskError::MissingIndexPath.to_string(),
                        &out.stdout,
                        &out.stderr,
                        saved,
                    );
                }
            },
            Err(e) => {
                let (task_err, stdout, stderr) = match e {
                    ExecError::TimedOut { timeout_secs, .. } => (
                        TaskError::IndexCreationTimeout(timeout_secs),
                        String::new(),
                        String::new(),
                    ),
                    ExecError::NonZeroExit {
                        code,
                        stdout,
                        stderr,
                        ..
                    } => (
                        TaskError::IndexCreationFailed {
                            code,
                            stderr: stderr.trim().to_string(),
                        },
                        stdout,
                        stderr,
                    ),
                    ExecError::Io(e) => (
                        TaskError::IndexCreationFailed {
                            code: None,
                            stderr: e.to_string(),
                        },
                        String::new(),
                        String::new(),
                    ),
                };
                self.publish(&session_id, format!("{label} index creation failed: {task_err}"));
                let saved = sink.save(
                    &task.repo_name,
                    &task.input_file,
                    task.run_number,
                    &stdout,
                    &stderr,
                    false,
                );
                return self.failed(
                    task,
                    &session_id,
                    started,
                    commands,
                    branch_checkout,
                    task_err.to_string(),
                    &stdout,
                    &stderr,
                    saved,
                );
            }
        };

        // Analysis. The index location travels with this task's environment,
        // never through the harness's own process environment.
        let mut analysis_env = base_env;
        analysis_env.push((self.analyzer.index_path_env.clone(), index_path));

        let analyzer_bin = self.analyzer.binary_path.to_string_lossy().to_string();
        let input_path = task.inputs_path.join(&task.input_file);
        let analysis_args = vec![
            "-v".to_string(),
            "-c".to_string(),
            self.analyzer.config_path.to_string_lossy().to_string(),
            "-p".to_string(),
            input_path.to_string_lossy().to_string(),
            "-s".to_string(),
            session_id.clone(),
        ];
        commands.analyze = Some(render_command(&analyzer_bin, &analysis_args));

        self.publish(&session_id, format!("{label} running analysis"));
        match run_command(
            &analyzer_bin,
            &analysis_args,
            &task.repo_path,
            &analysis_env,
            self.timeouts.analysis,
        )
        .await
        {
            Ok(out) => {
                let duration = started.elapsed();
                self.publish(
                    &session_id,
                    format!("{label} analysis completed in {:.1}s", duration.as_secs_f64()),
                );
                info!(
                    repo = %task.repo_name,
                    input = %task.input_file,
                    run = task.run_number,
                    secs = duration.as_secs_f64(),
                    "analysis completed"
                );

                let saved = sink.save(
                    &task.repo_name,
                    &task.input_file,
                    task.run_number,
                    &out.stdout,
                    &out.stderr,
                    true,
                );
                let cleaned = extract::clean(&out.stdout);
                let output = extract::extract_structured(&cleaned);

                TestResult {
                    repo: task.repo_name.clone(),
                    input_file: task.input_file.clone(),
                    run_number: task.run_number,
                    success: true,
                    output,
                    raw_output: cleaned,
                    raw_error: out.stderr,
                    tool_analytics: extract::extract_analytics(&out.stdout),
                    error: None,
                    duration_secs: duration.as_secs_f64(),
                    timestamp: Utc::now(),
                    session_id,
                    commands,
                    branch_checkout,
                    saved_files: saved,
                }
            }
            Err(e) => {
                let (task_err, stdout, stderr) = match e {
                    ExecError::TimedOut { timeout_secs, .. } => (
                        TaskError::AnalysisTimeout(timeout_secs),
                        String::new(),
                        String::new(),
                    ),
                    ExecError::NonZeroExit {
                        code,
                        stdout,
                        stderr,
                        ..
                    } => (TaskError::AnalysisNonZeroExit { code }, stdout, stderr),
                    ExecError::Io(e) => (
                        TaskError::AnalysisException(e.to_string()),
                        String::new(),
                        String::new(),
                    ),
                };
                self.publish(&session_id, format!("{label} analysis failed: {task_err}"));
                let saved = sink.save(
                    &task.repo_name,
                    &task.input_file,
                    task.run_number,
                    &stdout,
                    &stderr,
                    false,
                );
                self.failed(
                    task,
                    &session_id,
                    started,
                    commands,
                    branch_checkout,
                    task_err.to_string(),
                    &stdout,
                    &stderr,
                    saved,
                )
            }
        }
    }

    fn publish(&self, session_id: &str, message: String) {
        self.broadcaster.publish(session_id, message);
    }

    /// Assemble a failed result. Extraction still runs over whatever stdout
    /// was captured, so a tool that printed results before dying keeps them.
    #[allow(clippy::too_many_arguments)]
    fn failed(
        &self,
        task: &TestTask,
        session_id: &str,
        started: Instant,
        commands: CommandRecord,
        branch_checkout: Option<BranchCheckoutOutcome>,
        error: String,
        stdout: &str,
        stderr: &str,
        saved_files: Option<SavedArtifacts>,
    ) -> TestResult {
        let cleaned = extract::clean(stdout);
        TestResult {
            repo: task.repo_name.clone(),
            input_file: task.input_file.clone(),
            run_number: task.run_number,
            success: false,
            output: extract::extract_structured(&cleaned),
            raw_output: cleaned,
            raw_error: stderr.to_string(),
            tool_analytics: extract::extract_analytics(stdout),
            error: Some(error),
            duration_secs: started.elapsed().as_secs_f64(),
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            commands,
            branch_checkout,
            saved_files,
        }
    }
}

// ---------------------------------------------------------------------------
// Index path discovery
// ---------------------------------------------------------------------------

/// The indexer reports its index location either as JSON
/// (`{"output": [{"index_path": ...}]}`) or as a bare `INDEX_PATH=` line,
/// depending on version.
fn parse_index_path(stdout: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<Value>(stdout.trim()) {
        if let Some(path) = value
            .get("output")
            .and_then(|o| o.get(0))
            .and_then(|first| first.get("index_path"))
            .and_then(|p| p.as_str())
        {
            return Some(path.to_string());
        }
    }

    for line in stdout.lines() {
        if let Some((_, path)) = line.split_once("INDEX_PATH=") {
            let path = path.trim();
            if !path.is_empty() {
                return Some(path.to_string());
            }
        }
    }
    None
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        task: TestTask,
        analyzer: AnalyzerConfig,
        broadcaster: LogBroadcaster,
    }

    /// A working setup: indexer reports a path, analyzer emits fenced JSON.
    fn fixture(indexer_body: &str, analyzer_body: &str) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("repo");
        let inputs = tmp.path().join("inputs");
        let outputs = tmp.path().join("outputs");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::create_dir_all(&inputs).unwrap();
        std::fs::write(inputs.join("case.txt"), "prompt text").unwrap();

        let indexer = write_script(tmp.path(), "indexer", indexer_body);
        let analyzer_bin = write_script(tmp.path(), "analyzer", analyzer_body);

        let analyzer = AnalyzerConfig {
            binary_path: analyzer_bin,
            config_path: tmp.path().join("analyzer.toml"),
            indexer_path: indexer,
            index_path_env: "ANALYZER_INDEX_PATH".into(),
            env: Default::default(),
        };
        let task = TestTask {
            repo_name: "repo".into(),
            repo_path: repo,
            input_file: "case.txt".into(),
            inputs_path: inputs,
            output_path: outputs,
            run_number: 1,
            branch: None,
            session_id: None,
        };

        Fixture {
            _tmp: tmp,
            task,
            analyzer,
            broadcaster: LogBroadcaster::new(),
        }
    }

    fn fast_timeouts() -> RunnerTimeouts {
        RunnerTimeouts {
            branch_op: Duration::from_secs(5),
            index_creation: Duration::from_secs(5),
            analysis: Duration::from_secs(5),
        }
    }

    const GOOD_INDEXER: &str = "echo INDEX_PATH=/tmp/gauntlet-test-index";
    const GOOD_ANALYZER: &str = r#"echo 'Tool search execution time: 42ms'
echo '```json'
echo '{"analysis_results": {"score": 7}}'
echo '```'"#;

    #[tokio::test]
    async fn successful_run_extracts_structured_output() {
        let fx = fixture(GOOD_INDEXER, GOOD_ANALYZER);
        let runner = TestRunner::new(fx.analyzer.clone(), fx.broadcaster.clone())
            .with_timeouts(fast_timeouts());

        let result = runner.run(&fx.task).await;

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.output.as_ref().unwrap()["analysis_results"]["score"], 7);
        assert_eq!(result.tool_analytics.tool_count, 1);
        assert_eq!(result.tool_analytics.tools_executed[0].tool, "search");
        // Visible raw output is the cleaned text: timing noise stripped.
        assert!(!result.raw_output.contains("execution time"));
        assert!(result.error.is_none());
        assert_eq!(
            result.commands.index_path.as_deref(),
            Some("/tmp/gauntlet-test-index")
        );
        assert!(result.commands.create_index.is_some());
        assert!(result.commands.analyze.is_some());

        let saved = result.saved_files.expect("artifacts persisted");
        let raw = std::fs::read_to_string(&saved.stdout_path).unwrap();
        // The sink keeps the literal output, including the noise.
        assert!(raw.contains("Tool search execution time: 42ms"));
    }

    #[tokio::test]
    async fn progress_lines_are_published_to_the_session() {
        let fx = fixture(GOOD_INDEXER, GOOD_ANALYZER);
        let runner = TestRunner::new(fx.analyzer.clone(), fx.broadcaster.clone())
            .with_timeouts(fast_timeouts());

        let result = runner.run(&fx.task).await;

        let history = fx.broadcaster.snapshot(&result.session_id);
        assert!(history.len() >= 4, "expected progress lines, got {}", history.len());
        assert!(history[0].message.contains("starting"));
        assert!(history.iter().any(|e| e.message.contains("creating code index")));
        assert!(history.iter().any(|e| e.message.contains("running analysis")));
        assert!(history
            .last()
            .unwrap()
            .message
            .contains("analysis completed"));
    }

    #[tokio::test]
    async fn caller_supplied_session_id_is_used() {
        let mut fx = fixture(GOOD_INDEXER, GOOD_ANALYZER);
        fx.task.session_id = Some("fixed-session".into());
        let runner = TestRunner::new(fx.analyzer.clone(), fx.broadcaster.clone())
            .with_timeouts(fast_timeouts());

        let result = runner.run(&fx.task).await;
        assert_eq!(result.session_id, "fixed-session");
        assert!(!fx.broadcaster.snapshot("fixed-session").is_empty());
    }

    #[tokio::test]
    async fn index_path_reaches_analyzer_environment() {
        let fx = fixture(GOOD_INDEXER, "echo \"index is $ANALYZER_INDEX_PATH\"");
        let runner = TestRunner::new(fx.analyzer.clone(), fx.broadcaster.clone())
            .with_timeouts(fast_timeouts());

        let result = runner.run(&fx.task).await;
        assert!(result.success);
        assert!(result.raw_output.contains("index is /tmp/gauntlet-test-index"));
    }

    #[tokio::test]
    async fn analyzer_nonzero_exit_still_parses_output() {
        let fx = fixture(
            GOOD_INDEXER,
            r#"echo '{"analysis_results": "partial"}'
echo diagnostics >&2
exit 2"#,
        );
        let runner = TestRunner::new(fx.analyzer.clone(), fx.broadcaster.clone())
            .with_timeouts(fast_timeouts());

        let result = runner.run(&fx.task).await;

        assert!(!result.success);
        assert!(result.error.as_ref().unwrap().contains("exited with code"));
        // Output captured before the failure is still extracted.
        assert_eq!(result.output.unwrap()["analysis_results"], "partial");
        assert_eq!(result.raw_error.trim(), "diagnostics");
        assert!(result.saved_files.is_some());
    }

    #[tokio::test]
    async fn analysis_timeout_reports_and_persists() {
        let fx = fixture(GOOD_INDEXER, "sleep 5");
        let mut timeouts = fast_timeouts();
        timeouts.analysis = Duration::from_millis(100);
        let runner =
            TestRunner::new(fx.analyzer.clone(), fx.broadcaster.clone()).with_timeouts(timeouts);

        let result = runner.run(&fx.task).await;

        assert!(!result.success);
        assert!(result.error.as_ref().unwrap().contains("timed out"));
        // Persistence is still attempted with the (empty) captured output.
        assert!(result.saved_files.is_some());
    }

    #[tokio::test]
    async fn missing_index_path_is_terminal() {
        let fx = fixture("echo no path here", "touch analyzer-ran");
        let runner = TestRunner::new(fx.analyzer.clone(), fx.broadcaster.clone())
            .with_timeouts(fast_timeouts());

        let result = runner.run(&fx.task).await;

        assert!(!result.success);
        assert!(result.error.as_ref().unwrap().contains("no index path"));
        // The analysis step never ran.
        assert!(!fx.task.repo_path.join("analyzer-ran").exists());
    }

    #[tokio::test]
    async fn index_creation_failure_is_terminal() {
        let fx = fixture("echo indexer broke >&2; exit 1", "touch analyzer-ran");
        let runner = TestRunner::new(fx.analyzer.clone(), fx.broadcaster.clone())
            .with_timeouts(fast_timeouts());

        let result = runner.run(&fx.task).await;

        assert!(!result.success);
        assert!(result.error.as_ref().unwrap().contains("index creation failed"));
        assert!(!fx.task.repo_path.join("analyzer-ran").exists());
    }

    #[tokio::test]
    async fn failed_branch_guard_skips_all_later_steps() {
        let mut fx = fixture("touch indexer-ran", "touch analyzer-ran");
        // The repo fixture dir is not a git repository, so listing fails.
        fx.task.branch = Some("main".into());
        let runner = TestRunner::new(fx.analyzer.clone(), fx.broadcaster.clone())
            .with_timeouts(fast_timeouts());

        let result = runner.run(&fx.task).await;

        assert!(!result.success);
        let checkout = result.branch_checkout.expect("branch outcome recorded");
        assert!(!checkout.success);
        assert!(checkout.error.is_some());
        assert!(!fx.task.repo_path.join("indexer-ran").exists());
        assert!(!fx.task.repo_path.join("analyzer-ran").exists());
    }

    #[tokio::test]
    async fn json_index_report_is_parsed() {
        let fx = fixture(
            r#"echo '{"output": [{"index_path": "/tmp/from-json"}]}'"#,
            GOOD_ANALYZER,
        );
        let runner = TestRunner::new(fx.analyzer.clone(), fx.broadcaster.clone())
            .with_timeouts(fast_timeouts());

        let result = runner.run(&fx.task).await;
        assert!(result.success);
        assert_eq!(result.commands.index_path.as_deref(), Some("/tmp/from-json"));
    }

    #[test]
    fn parse_index_path_prefers_json_report() {
        let stdout = r#"{"output": [{"index_path": "/idx/a"}]}"#;
        assert_eq!(parse_index_path(stdout).as_deref(), Some("/idx/a"));
    }

    #[test]
    fn parse_index_path_falls_back_to_marker_line() {
        let stdout = "building...\nINDEX_PATH=/idx/b\ndone";
        assert_eq!(parse_index_path(stdout).as_deref(), Some("/idx/b"));
    }

    #[test]
    fn parse_index_path_none_when_absent() {
        assert_eq!(parse_index_path("nothing useful"), None);
        assert_eq!(parse_index_path("INDEX_PATH=   "), None);
        assert_eq!(parse_index_path(r#"{"output": []}"#), None);
    }
}
