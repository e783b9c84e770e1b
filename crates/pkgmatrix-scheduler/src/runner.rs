//! Matrix runner - builds every entry of a finalized matrix in order.

use futures::StreamExt;
use pkgmatrix_core::executor::{Executor, JobSpec, JobStatus, LogLine, VolumeMount};
use pkgmatrix_core::{BuildEntry, ConanInvocation, JobId};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Where the recipe directory is mounted inside build containers.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

/// State of a single build during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BuildState {
    Pending,
    Running { job_id: JobId },
    Succeeded,
    Failed { message: String },
    Skipped { reason: String },
}

impl BuildState {
    pub fn is_success(&self) -> bool {
        matches!(self, BuildState::Succeeded)
    }
}

/// Event emitted while the matrix runs. `index` is the entry's position.
#[derive(Debug, Clone)]
pub enum RunEvent {
    BuildStarted { index: usize, label: String },
    BuildLog { index: usize, line: LogLine },
    BuildCompleted { index: usize, success: bool },
    MatrixCompleted { success: bool },
}

/// Outcome of one entry.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub label: String,
    pub command: Vec<String>,
    pub state: BuildState,
}

/// Outcome of a whole run, one report per entry in matrix order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub builds: Vec<BuildReport>,
}

impl RunReport {
    /// True when every entry succeeded. An empty run is a success.
    pub fn success(&self) -> bool {
        self.builds.iter().all(|b| b.state.is_success())
    }

    pub fn succeeded(&self) -> usize {
        self.count(|s| s.is_success())
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, BuildState::Failed { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, BuildState::Skipped { .. }))
    }

    fn count(&self, f: impl Fn(&BuildState) -> bool) -> usize {
        self.builds.iter().filter(|b| f(&b.state)).count()
    }
}

/// Runs matrix entries through an executor.
pub struct MatrixRunner {
    executor: Arc<dyn Executor>,
    conan: ConanInvocation,
    /// Host directory holding the recipe
    working_dir: Option<PathBuf>,
    /// Container image; when set, builds run in `CONTAINER_WORKSPACE`
    image: Option<String>,
    timeout: Option<Duration>,
    fail_fast: bool,
}

impl MatrixRunner {
    pub fn new(executor: Arc<dyn Executor>, conan: ConanInvocation) -> Self {
        Self {
            executor,
            conan,
            working_dir: None,
            image: None,
            timeout: None,
            fail_fast: false,
        }
    }

    pub fn with_working_dir(mut self, working_dir: PathBuf) -> Self {
        self.working_dir = Some(working_dir);
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Skip the remaining entries after the first failure.
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Build the job spec for one entry.
    pub fn job_spec(&self, entry: &BuildEntry, env: &HashMap<String, String>) -> JobSpec {
        let mut spec = JobSpec::new(entry.label(), self.conan.create_command(entry));
        spec.env = env.clone();
        spec.timeout = self.timeout;

        match &self.image {
            Some(image) => {
                spec.image = Some(image.clone());
                spec.working_dir = Some(CONTAINER_WORKSPACE.to_string());
                if let Some(wd) = &self.working_dir {
                    spec.volumes.push(VolumeMount {
                        source: wd.to_string_lossy().to_string(),
                        mount_path: CONTAINER_WORKSPACE.to_string(),
                        read_only: false,
                    });
                }
            }
            None => {
                spec.working_dir = self
                    .working_dir
                    .as_ref()
                    .map(|wd| wd.to_string_lossy().to_string());
            }
        }

        spec
    }

    /// Run `entries`, returning a channel of events and a handle to the final report.
    ///
    /// `env` is passed to every build on top of the inherited environment.
    pub fn execute(
        &self,
        entries: Vec<BuildEntry>,
        env: HashMap<String, String>,
    ) -> (mpsc::Receiver<RunEvent>, tokio::task::JoinHandle<RunReport>) {
        let (tx, rx) = mpsc::channel(100);
        let executor = self.executor.clone();
        let specs: Vec<JobSpec> = entries.iter().map(|e| self.job_spec(e, &env)).collect();
        let fail_fast = self.fail_fast;

        let handle =
            tokio::spawn(async move { Self::execute_inner(executor, specs, fail_fast, tx).await });

        (rx, handle)
    }

    async fn execute_inner(
        executor: Arc<dyn Executor>,
        specs: Vec<JobSpec>,
        fail_fast: bool,
        tx: mpsc::Sender<RunEvent>,
    ) -> RunReport {
        if specs.is_empty() {
            warn!("Build matrix is empty, nothing to run");
        }

        let mut report = RunReport {
            builds: specs
                .iter()
                .map(|s| BuildReport {
                    label: s.label.clone(),
                    command: s.command.clone(),
                    state: BuildState::Pending,
                })
                .collect(),
        };

        let total = specs.len();
        let mut failed = false;

        for (index, spec) in specs.into_iter().enumerate() {
            if failed && fail_fast {
                report.builds[index].state = BuildState::Skipped {
                    reason: "an earlier build failed".to_string(),
                };
                continue;
            }

            info!(index, total, label = %spec.label, "Starting build");
            report.builds[index].state = BuildState::Running { job_id: spec.id };
            let _ = tx
                .send(RunEvent::BuildStarted {
                    index,
                    label: spec.label.clone(),
                })
                .await;

            let label = spec.label.clone();
            let state = match Self::run_build(&executor, index, spec, &tx).await {
                Ok(()) => {
                    info!(index, label = %label, "Build succeeded");
                    BuildState::Succeeded
                }
                Err(message) => {
                    error!(index, label = %label, error = %message, "Build failed");
                    failed = true;
                    BuildState::Failed { message }
                }
            };

            let success = state.is_success();
            report.builds[index].state = state;
            let _ = tx.send(RunEvent::BuildCompleted { index, success }).await;
        }

        let success = report.success();
        info!(
            success,
            succeeded = report.succeeded(),
            failed = report.failed(),
            skipped = report.skipped(),
            "Matrix completed"
        );
        let _ = tx.send(RunEvent::MatrixCompleted { success }).await;

        report
    }

    async fn run_build(
        executor: &Arc<dyn Executor>,
        index: usize,
        spec: JobSpec,
        tx: &mpsc::Sender<RunEvent>,
    ) -> Result<(), String> {
        if !executor.can_execute(&spec).await {
            return Err(format!("executor '{}' cannot run this build", executor.name()));
        }

        let handle = executor
            .spawn(spec)
            .await
            .map_err(|e| format!("Failed to spawn job: {}", e))?;

        let log_stream = executor
            .logs(&handle)
            .await
            .map_err(|e| format!("Failed to get logs: {}", e))?;

        let tx_clone = tx.clone();
        let log_handle = tokio::spawn(async move {
            let mut stream = log_stream;
            while let Some(line) = stream.next().await {
                let _ = tx_clone.send(RunEvent::BuildLog { index, line }).await;
            }
        });

        let result = executor
            .wait(&handle)
            .await
            .map_err(|e| format!("Failed to wait for job: {}", e));

        // Local pipes close on exit, so let buffered lines drain. A followed
        // container log stream may not end on its own.
        let mut log_handle = log_handle;
        if tokio::time::timeout(Duration::from_secs(2), &mut log_handle)
            .await
            .is_err()
        {
            log_handle.abort();
        }

        match result?.status {
            JobStatus::Succeeded { .. } => Ok(()),
            JobStatus::Failed { message, .. } => Err(format!("Job failed: {}", message)),
            JobStatus::Cancelled { .. } => Err("Job was cancelled".to_string()),
            _ => Err("Job ended in unexpected state".to_string()),
        }
    }
}
