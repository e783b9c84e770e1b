//! Local process executor.
//!
//! Runs the job's command directly on the host with stdout and stderr piped.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use pkgmatrix_core::executor::*;
use pkgmatrix_core::{Error, JobId, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{Mutex, Notify};
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, info, warn};

struct LocalJob {
    /// Taken by `wait` while it is waiting.
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    started_at: DateTime<Utc>,
    timeout: Option<std::time::Duration>,
    cancel: Arc<Notify>,
    outcome: Option<JobStatus>,
}

/// Executor that spawns host processes.
#[derive(Default)]
pub struct LocalExecutor {
    /// One record per spawned job. After `wait` it holds only the outcome.
    jobs: Mutex<HashMap<JobId, LocalJob>>,
}

enum Waited {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn exit_status(started_at: DateTime<Utc>, exit: ExitStatus) -> JobStatus {
        let finished_at = Utc::now();
        if exit.success() {
            JobStatus::Succeeded {
                started_at,
                finished_at,
            }
        } else {
            JobStatus::Failed {
                started_at: Some(started_at),
                finished_at,
                exit_code: exit.code(),
                message: format!("process exited with {}", exit),
            }
        }
    }
}

/// Resolve `program` the way a shell would: paths as-is, bare names via `PATH`.
fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains(std::path::MAIN_SEPARATOR) {
        let path = Path::new(program);
        return path.is_file().then(|| path.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn can_execute(&self, spec: &JobSpec) -> bool {
        spec.command
            .first()
            .is_some_and(|program| find_program(program).is_some())
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| Error::InvalidInput("empty command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        info!(job = %spec.id, label = %spec.label, program = %program, "Spawning process");
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ExecutionFailed(format!("failed to spawn {}: {}", program, e)))?;

        let executor_id = child.id().map(|pid| pid.to_string()).unwrap_or_default();
        let job = LocalJob {
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child: Some(child),
            started_at: Utc::now(),
            timeout: spec.timeout,
            cancel: Arc::new(Notify::new()),
            outcome: None,
        };
        self.jobs.lock().await.insert(spec.id, job);

        Ok(JobHandle {
            id: spec.id,
            executor_id,
            executor_name: self.name().to_string(),
        })
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let (stdout, stderr) = {
            let mut jobs = self.jobs.lock().await;
            let job = jobs
                .get_mut(&handle.id)
                .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))?;
            (job.stdout.take(), job.stderr.take())
        };

        if stdout.is_none() && stderr.is_none() {
            return Err(Error::InvalidInput(format!(
                "logs for job {} were already taken",
                handle.id
            )));
        }

        let stdout_lines = match stdout {
            Some(out) => LinesStream::new(BufReader::new(out).lines())
                .map(|line| (LogStream::Stdout, line))
                .boxed(),
            None => futures::stream::empty().boxed(),
        };
        let stderr_lines = match stderr {
            Some(err) => LinesStream::new(BufReader::new(err).lines())
                .map(|line| (LogStream::Stderr, line))
                .boxed(),
            None => futures::stream::empty().boxed(),
        };

        let merged = futures::stream::select(stdout_lines, stderr_lines).filter_map(
            |(stream, line)| async move {
                match line {
                    Ok(content) => Some(LogLine::new(stream, content.trim_end())),
                    Err(e) => {
                        warn!(error = %e, "Log stream error");
                        None
                    }
                }
            },
        );

        Ok(Box::pin(merged))
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&handle.id)
            .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))?;

        if let Some(outcome) = &job.outcome {
            return Ok(outcome.clone());
        }

        let started_at = job.started_at;
        match job.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(exit)) => Ok(Self::exit_status(started_at, exit)),
                Ok(None) => Ok(JobStatus::Running { started_at }),
                Err(e) => Err(Error::Internal(format!("failed to poll process: {}", e))),
            },
            // Being waited on
            None => Ok(JobStatus::Running { started_at }),
        }
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        let (mut child, started_at, timeout, cancel) = {
            let mut jobs = self.jobs.lock().await;
            let job = jobs
                .get_mut(&handle.id)
                .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))?;

            if let Some(outcome) = &job.outcome {
                return Ok(JobResult {
                    exit_code: outcome.exit_code(),
                    status: outcome.clone(),
                });
            }

            let child = job.child.take().ok_or_else(|| {
                Error::InvalidInput(format!("job {} is already being waited on", handle.id))
            })?;
            (child, job.started_at, job.timeout, job.cancel.clone())
        };

        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        let waited = tokio::select! {
            exit = child.wait() => Waited::Exited(exit),
            _ = deadline => Waited::TimedOut,
            _ = cancel.notified() => Waited::Cancelled,
        };

        let status = match waited {
            Waited::Exited(Ok(exit)) => Self::exit_status(started_at, exit),
            Waited::Exited(Err(e)) => {
                return Err(Error::ExecutionFailed(format!(
                    "failed to wait for process: {}",
                    e
                )));
            }
            Waited::TimedOut => {
                warn!(job = %handle.id, "Job timed out, killing process");
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed out process");
                }
                JobStatus::timed_out(Some(started_at), timeout.unwrap_or_default())
            }
            Waited::Cancelled => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill cancelled process");
                }
                JobStatus::Cancelled {
                    started_at: Some(started_at),
                    cancelled_at: Utc::now(),
                }
            }
        };

        debug!(job = %handle.id, ?status, "Job finished");
        // Finished jobs keep only their outcome; unread pipes are closed here
        if let Some(job) = self.jobs.lock().await.get_mut(&handle.id) {
            job.stdout = None;
            job.stderr = None;
            job.outcome = Some(status.clone());
        }

        Ok(JobResult {
            exit_code: status.exit_code(),
            status,
        })
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&handle.id)
            .ok_or_else(|| Error::NotFound(format!("job {}", handle.id)))?;

        if job.outcome.is_some() {
            return Ok(());
        }

        match job.child.as_mut() {
            Some(child) => {
                child
                    .start_kill()
                    .map_err(|e| Error::ExecutionFailed(format!("failed to kill process: {}", e)))?;
                job.outcome = Some(JobStatus::Cancelled {
                    started_at: Some(job.started_at),
                    cancelled_at: Utc::now(),
                });
            }
            // `wait` holds the child; it kills it and records the outcome
            None => job.cancel.notify_one(),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> JobSpec {
        JobSpec::new(
            "test",
            vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
        )
    }

    #[tokio::test]
    async fn test_successful_job_with_logs() {
        let executor = LocalExecutor::new();
        let handle = executor
            .spawn(sh("echo hello; echo oops >&2"))
            .await
            .unwrap();
        assert_eq!(handle.executor_name, "local");

        let lines: Vec<LogLine> = executor.logs(&handle).await.unwrap().collect().await;
        let result = executor.wait(&handle).await.unwrap();

        assert!(result.status.is_success());
        assert_eq!(result.exit_code, Some(0));
        assert!(
            lines
                .iter()
                .any(|l| l.stream == LogStream::Stdout && l.content == "hello")
        );
        assert!(
            lines
                .iter()
                .any(|l| l.stream == LogStream::Stderr && l.content == "oops")
        );
    }

    #[tokio::test]
    async fn test_failing_job() {
        let executor = LocalExecutor::new();
        let handle = executor.spawn(sh("exit 3")).await.unwrap();
        let result = executor.wait(&handle).await.unwrap();

        assert_eq!(result.exit_code, Some(3));
        assert!(matches!(result.status, JobStatus::Failed { .. }));

        // Outcome is remembered
        let status = executor.status(&handle).await.unwrap();
        assert!(status.is_terminal());
    }

    #[tokio::test]
    async fn test_env_and_working_dir() {
        let executor = LocalExecutor::new();
        let mut spec = sh("test \"$USE_MPI\" = with-mpi && test \"$(pwd)\" = /");
        spec.env.insert("USE_MPI".to_string(), "with-mpi".to_string());
        spec.working_dir = Some("/".to_string());

        let handle = executor.spawn(spec).await.unwrap();
        let result = executor.wait(&handle).await.unwrap();
        assert!(result.status.is_success());
    }

    #[tokio::test]
    async fn test_timeout() {
        let executor = LocalExecutor::new();
        let mut spec = sh("sleep 5");
        spec.timeout = Some(Duration::from_millis(100));

        let handle = executor.spawn(spec).await.unwrap();
        let result = executor.wait(&handle).await.unwrap();
        match result.status {
            JobStatus::Failed { message, .. } => assert!(message.contains("timed out")),
            other => panic!("Expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_before_wait() {
        let executor = LocalExecutor::new();
        let handle = executor.spawn(sh("sleep 5")).await.unwrap();
        executor.cancel(&handle).await.unwrap();

        let result = executor.wait(&handle).await.unwrap();
        assert!(matches!(result.status, JobStatus::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let executor = LocalExecutor::new();
        let spec = JobSpec::new(
            "missing",
            vec!["/nonexistent/pkgmatrix-test-binary".to_string()],
        );
        assert!(!executor.can_execute(&spec).await);
        assert!(matches!(
            executor.spawn(spec).await,
            Err(Error::ExecutionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_empty_command() {
        let executor = LocalExecutor::new();
        let spec = JobSpec::new("empty", vec![]);
        assert!(!executor.can_execute(&spec).await);
        assert!(matches!(
            executor.spawn(spec).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_releases_unread_pipes() {
        let executor = LocalExecutor::new();
        let handle = executor.spawn(sh("echo never read")).await.unwrap();
        executor.wait(&handle).await.unwrap();

        let jobs = executor.jobs.lock().await;
        let job = jobs.get(&handle.id).unwrap();
        assert!(job.child.is_none());
        assert!(job.stdout.is_none());
        assert!(job.stderr.is_none());
        assert!(job.outcome.as_ref().is_some_and(|s| s.is_success()));
    }

    #[tokio::test]
    async fn test_logs_taken_once() {
        let executor = LocalExecutor::new();
        let handle = executor.spawn(sh("true")).await.unwrap();
        let _first = executor.logs(&handle).await.unwrap();
        assert!(executor.logs(&handle).await.is_err());
        executor.wait(&handle).await.unwrap();
    }
}
