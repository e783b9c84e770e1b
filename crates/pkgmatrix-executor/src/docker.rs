//! Docker executor: runs each build inside a container.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use pkgmatrix_core::executor::*;
use pkgmatrix_core::{Error, JobId, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Executor that runs jobs in containers on the local Docker daemon.
pub struct DockerExecutor {
    docker: Docker,
    /// Remove containers once `wait` has collected their status.
    auto_remove: bool,
    /// Start time and limit of jobs spawned with a timeout.
    deadlines: Mutex<HashMap<JobId, (DateTime<Utc>, Duration)>>,
}

impl DockerExecutor {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self::with_client(docker))
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self {
            docker,
            auto_remove: true,
            deadlines: Mutex::new(HashMap::new()),
        }
    }

    /// Keep finished containers around, e.g. for debugging a failed build.
    pub fn keep_containers(mut self) -> Self {
        self.auto_remove = false;
        self
    }

    fn container_name(job_id: &JobId) -> String {
        format!("pkgmatrix-build-{}", job_id.short())
    }

    async fn pull_image(&self, image: &str) {
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    // A locally built image cannot be pulled but may still run
                    warn!(error = %e, "Pull warning");
                }
            }
        }
    }

    async fn remove(&self, job_id: &JobId) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(&Self::container_name(job_id), Some(options))
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to remove container: {}", e)))
    }
}

fn parse_docker_time(value: Option<String>) -> Option<chrono::DateTime<Utc>> {
    value
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl Executor for DockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn can_execute(&self, spec: &JobSpec) -> bool {
        spec.image.is_some() && !spec.command.is_empty() && self.docker.ping().await.is_ok()
    }

    async fn spawn(&self, spec: JobSpec) -> Result<JobHandle> {
        let image = spec
            .image
            .clone()
            .ok_or_else(|| Error::InvalidInput("docker jobs need an image".to_string()))?;
        if spec.command.is_empty() {
            return Err(Error::InvalidInput("empty command".to_string()));
        }
        let container_name = Self::container_name(&spec.id);

        self.pull_image(&image).await;

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let binds: Option<Vec<String>> = if spec.volumes.is_empty() {
            None
        } else {
            Some(
                spec.volumes
                    .iter()
                    .map(|v| {
                        let mode = if v.read_only { "ro" } else { "rw" };
                        format!("{}:{}:{}", v.source, v.mount_path, mode)
                    })
                    .collect(),
            )
        };

        let host_config = HostConfig {
            binds,
            ..Default::default()
        };

        let config = Config {
            image: Some(image),
            cmd: Some(spec.command.clone()),
            env: Some(env),
            working_dir: spec.working_dir.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(container = %container_name, label = %spec.label, "Creating container");
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to create container: {}", e)))?;

        info!(container = %container_name, "Starting container");
        if let Err(e) = self
            .docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(remove_err) = self.remove(&spec.id).await {
                warn!(error = %remove_err, container = %container_name, "Failed to remove container");
            }
            return Err(Error::ExecutionFailed(format!(
                "Failed to start container: {}",
                e
            )));
        }

        if let Some(limit) = spec.timeout {
            self.deadlines
                .lock()
                .await
                .insert(spec.id, (Utc::now(), limit));
        }

        Ok(JobHandle {
            id: spec.id,
            executor_id: container.id,
            executor_name: self.name().to_string(),
        })
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let container_name = Self::container_name(&handle.id);

        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let stream = self.docker.logs(&container_name, Some(options));

        let mapped_stream = stream.filter_map(|result| async move {
            match result {
                Ok(output) => {
                    let (stream, message) = match output {
                        LogOutput::StdErr { message } => (LogStream::Stderr, message),
                        LogOutput::StdOut { message }
                        | LogOutput::Console { message }
                        | LogOutput::StdIn { message } => (LogStream::Stdout, message),
                    };
                    Some(LogLine::new(
                        stream,
                        String::from_utf8_lossy(&message).trim_end(),
                    ))
                }
                Err(e) => {
                    warn!(error = %e, "Log stream error");
                    None
                }
            }
        });

        Ok(Box::pin(mapped_stream))
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let container_name = Self::container_name(&handle.id);

        let inspect = self
            .docker
            .inspect_container(&container_name, None)
            .await
            .map_err(|e| Error::NotFound(format!("Container not found: {}", e)))?;

        let state = inspect
            .state
            .ok_or_else(|| Error::Internal("No state".to_string()))?;

        let started_at = parse_docker_time(state.started_at);

        let status = if state.running.unwrap_or(false) {
            JobStatus::Running {
                started_at: started_at.unwrap_or_else(Utc::now),
            }
        } else if state.paused.unwrap_or(false) {
            JobStatus::Pending
        } else {
            let exit_code = state.exit_code.map(|c| c as i32);
            let finished_at = parse_docker_time(state.finished_at).unwrap_or_else(Utc::now);

            if exit_code == Some(0) {
                JobStatus::Succeeded {
                    started_at: started_at.unwrap_or(finished_at),
                    finished_at,
                }
            } else {
                let message = match state.error.filter(|e| !e.is_empty()) {
                    Some(error) => error,
                    None => format!("container exited with code {:?}", exit_code),
                };
                JobStatus::Failed {
                    started_at,
                    finished_at,
                    exit_code,
                    message,
                }
            }
        };

        Ok(status)
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        let container_name = Self::container_name(&handle.id);

        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(&container_name, Some(options));
        let deadline = self.deadlines.lock().await.remove(&handle.id);

        let next = match deadline {
            Some((_, limit)) => tokio::time::timeout(limit, stream.next()).await.ok(),
            None => Some(stream.next().await),
        };

        let status = match (next, deadline) {
            (None, Some((started_at, limit))) => {
                warn!(container = %container_name, ?limit, "Job timed out, stopping container");
                if let Err(e) = self.docker.stop_container(&container_name, None).await {
                    warn!(error = %e, container = %container_name, "Failed to stop container");
                }
                JobStatus::timed_out(Some(started_at), limit)
            }
            (next, _) => {
                // A non-zero exit is reported as an error by the wait stream;
                // the container state is authoritative either way.
                if let Some(Some(Err(e))) = next {
                    debug!(error = %e, "Wait returned error");
                }
                self.status(handle).await?
            }
        };
        let exit_code = status.exit_code();

        if self.auto_remove {
            if let Err(e) = self.remove(&handle.id).await {
                warn!(error = %e, container = %container_name, "Failed to remove container");
            }
        }

        Ok(JobResult { status, exit_code })
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let container_name = Self::container_name(&handle.id);

        self.docker
            .stop_container(&container_name, None)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to stop container: {}", e)))?;

        self.remove(&handle.id).await
    }
}
