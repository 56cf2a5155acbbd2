//! Top-level scheduler.
//!
//! Repositories run strictly one at a time: every task rebuilds the shared
//! analyzer index for its repository, so overlapping two repositories would
//! hand one repository's index to the other's analysis. Within a repository,
//! tasks fan out onto a bounded worker pool and results are collected in
//! completion order.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::broadcast::LogBroadcaster;
use crate::config::{list_input_files, GauntletConfig, RepoConfig};
use crate::runner::{
    CommandRecord, RunnerTimeouts, TestResult, TestRunner, TestTask,
};
use crate::Result;

pub struct Orchestrator {
    config: GauntletConfig,
    broadcaster: LogBroadcaster,
    timeouts: RunnerTimeouts,
}

impl Orchestrator {
    pub fn new(config: GauntletConfig, broadcaster: LogBroadcaster) -> Self {
        Self {
            config,
            broadcaster,
            timeouts: RunnerTimeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: RunnerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Expand one repository into its task list: input files × run count.
    pub fn expand_repo_tasks(&self, repo: &RepoConfig) -> Result<Vec<TestTask>> {
        let input_files = list_input_files(&repo.inputs_path)?;
        let mut tasks = Vec::with_capacity(input_files.len() * self.config.general.run_count as usize);
        for input_file in &input_files {
            for run_number in 1..=self.config.general.run_count {
                tasks.push(TestTask {
                    repo_name: repo.repo_name(),
                    repo_path: repo.repo_path.clone(),
                    input_file: input_file.clone(),
                    inputs_path: repo.inputs_path.clone(),
                    output_path: repo.output_path.clone(),
                    run_number,
                    branch: repo.branch.clone(),
                    session_id: None,
                });
            }
        }
        Ok(tasks)
    }

    /// Run every configured repository's full task list.
    ///
    /// Results arrive in completion order within a repository; repositories
    /// themselves are strictly sequential. A repository whose inputs cannot
    /// be listed is logged and skipped; a worker that dies becomes a
    /// synthetic failed result rather than aborting the batch.
    pub async fn run_all(&self) -> Vec<TestResult> {
        let mut results = Vec::new();

        for repo in &self.config.repos {
            let tasks = match self.expand_repo_tasks(repo) {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(repo = %repo.repo_name(), error = %e, "skipping repository: cannot list inputs");
                    continue;
                }
            };

            info!(
                repo = %repo.repo_name(),
                tasks = tasks.len(),
                workers = self.config.general.parallel_workers,
                "running repository batch"
            );
            results.extend(self.run_repo_tasks(tasks).await);
        }

        info!(total = results.len(), "batch complete");
        results
    }

    /// Run a single ad-hoc task.
    pub async fn run_single(&self, task: TestTask) -> TestResult {
        let runner = TestRunner::new(self.config.analyzer.clone(), self.broadcaster.clone())
            .with_timeouts(self.timeouts.clone());
        runner.run(&task).await
    }

    async fn run_repo_tasks(&self, tasks: Vec<TestTask>) -> Vec<TestResult> {
        let semaphore = Arc::new(Semaphore::new(self.config.general.parallel_workers));
        let runner = Arc::new(
            TestRunner::new(self.config.analyzer.clone(), self.broadcaster.clone())
                .with_timeouts(self.timeouts.clone()),
        );
        let task_count = tasks.len();

        let mut join_set = JoinSet::new();
        for task in tasks {
            let semaphore = Arc::clone(&semaphore);
            let runner = Arc::clone(&runner);
            join_set.spawn(async move {
                // The semaphore is never closed while the JoinSet lives.
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("worker semaphore closed");

                // Run the task on its own spawn so a panic surfaces as a
                // JoinError here instead of tearing down the batch.
                let worker_task = task.clone();
                let worker = tokio::spawn(async move { runner.run(&worker_task).await });
                match worker.await {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(
                            repo = %task.repo_name,
                            input = %task.input_file,
                            run = task.run_number,
                            error = %e,
                            "worker died; recording synthetic failure"
                        );
                        synthetic_failure(&task, &e.to_string())
                    }
                }
            });
        }

        let mut results = Vec::with_capacity(task_count);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => warn!(error = %e, "worker wrapper died"),
            }
        }
        results
    }
}

/// A result standing in for a worker that panicked or was aborted before it
/// could produce one.
fn synthetic_failure(task: &TestTask, error: &str) -> TestResult {
    TestResult {
        repo: task.repo_name.clone(),
        input_file: task.input_file.clone(),
        run_number: task.run_number,
        success: false,
        output: None,
        raw_output: String::new(),
        raw_error: String::new(),
        tool_analytics: Default::default(),
        error: Some(format!("worker failed before producing a result: {error}")),
        duration_secs: 0.0,
        timestamp: Utc::now(),
        session_id: task
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        commands: CommandRecord::default(),
        branch_checkout: None,
        saved_files: None,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
