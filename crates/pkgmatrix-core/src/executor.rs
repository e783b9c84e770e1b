//! Executor trait and job types.
//!
//! Executors run a single build command, either as a local process or inside
//! a container, and report its logs and outcome.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::{JobId, Result};

/// Specification for a job to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique identifier for this job.
    pub id: JobId,
    /// Human-readable description, usually the entry label.
    pub label: String,
    /// Command to execute (argv, program first).
    pub command: Vec<String>,
    /// Working directory. For containers this is the path inside the container.
    pub working_dir: Option<String>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// Container image. Ignored by the local executor.
    pub image: Option<String>,
    /// Maximum execution time.
    pub timeout: Option<Duration>,
    /// Host paths to mount. Ignored by the local executor.
    pub volumes: Vec<VolumeMount>,
}

impl JobSpec {
    pub fn new(label: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            id: JobId::new(),
            label: label.into(),
            command,
            working_dir: None,
            env: HashMap::new(),
            image: None,
            timeout: None,
            volumes: Vec::new(),
        }
    }
}

/// A volume mount specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Host path.
    pub source: String,
    /// Path to mount in the container.
    pub mount_path: String,
    pub read_only: bool,
}

/// Handle to a running or completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: JobId,
    /// Executor-specific identifier (process id, container id).
    pub executor_id: String,
    /// Name of the executor running this job.
    pub executor_name: String,
}

/// Status of a job execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobStatus {
    /// Job is waiting to start.
    Pending,
    /// Job is currently running.
    Running { started_at: DateTime<Utc> },
    /// Job completed successfully.
    Succeeded {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    /// Job failed.
    Failed {
        started_at: Option<DateTime<Utc>>,
        finished_at: DateTime<Utc>,
        exit_code: Option<i32>,
        message: String,
    },
    /// Job was cancelled.
    Cancelled {
        started_at: Option<DateTime<Utc>>,
        cancelled_at: DateTime<Utc>,
    },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded { .. } | JobStatus::Failed { .. } | JobStatus::Cancelled { .. }
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Succeeded { .. })
    }

    /// A job killed for running longer than `limit`.
    pub fn timed_out(started_at: Option<DateTime<Utc>>, limit: Duration) -> Self {
        JobStatus::Failed {
            started_at,
            finished_at: Utc::now(),
            exit_code: None,
            message: format!("timed out after {:?}", limit),
        }
    }

    /// Process exit code, when the job ran to completion.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            JobStatus::Succeeded { .. } => Some(0),
            JobStatus::Failed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

/// Result of a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobStatus,
    pub exit_code: Option<i32>,
}

/// A line of log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    pub fn new(stream: LogStream, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// Trait for job executors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Check if this executor can handle the given job spec.
    async fn can_execute(&self, spec: &JobSpec) -> bool;

    /// Spawn a new job.
    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle>;

    /// Get a stream of log lines from a job. Can only be taken once per job.
    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>>;

    /// Get the current status of a job.
    async fn status(&self, handle: &JobHandle) -> Result<JobStatus>;

    /// Wait for a job to complete.
    async fn wait(&self, handle: &JobHandle) -> Result<JobResult>;

    /// Cancel a running job.
    async fn cancel(&self, handle: &JobHandle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(
            !JobStatus::Running {
                started_at: Utc::now()
            }
            .is_terminal()
        );

        let failed = JobStatus::Failed {
            started_at: None,
            finished_at: Utc::now(),
            exit_code: Some(2),
            message: "conan create failed".to_string(),
        };
        assert!(failed.is_terminal());
        assert!(!failed.is_success());

        let ok = JobStatus::Succeeded {
            started_at: Utc::now(),
            finished_at: Utc::now(),
        };
        assert!(ok.is_success());
    }

    #[test]
    fn test_timed_out_status() {
        let status = JobStatus::timed_out(None, Duration::from_millis(100));
        assert!(status.is_terminal());
        assert!(!status.is_success());
        assert_eq!(status.exit_code(), None);
        match status {
            JobStatus::Failed { message, .. } => assert_eq!(message, "timed out after 100ms"),
            other => panic!("Expected Failed, got {:?}", other),
        }
        assert!(matches!(
            JobStatus::timed_out(None, Duration::from_secs(5)),
            JobStatus::Failed { ref message, .. } if message == "timed out after 5s"
        ));
    }

    #[test]
    fn test_job_spec_defaults() {
        let spec = JobSpec::new("gcc 9", vec!["conan".to_string(), "create".to_string()]);
        assert_eq!(spec.label, "gcc 9");
        assert!(spec.image.is_none());
        assert!(spec.env.is_empty());
        assert!(spec.volumes.is_empty());
    }
}
