//! Matrix execution command.

use anyhow::{Context, Result};
use pkgmatrix_config::BuildEnvironment;
use pkgmatrix_core::ConanInvocation;
use pkgmatrix_core::executor::{Executor, LogStream};
use pkgmatrix_executor::{DockerExecutor, LocalExecutor};
use pkgmatrix_scheduler::{BuildState, MatrixRunner, RunEvent};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Variables forwarded from the environment to every build.
const FORWARDED_VARS: &[&str] = &["USE_MPI", "CONAN_LOGIN_USERNAME", "CONAN_PASSWORD"];

pub struct RunOptions {
    pub docker: bool,
    /// Leave build containers in place after they finish
    pub keep_containers: bool,
    pub fail_fast: bool,
    /// `(current, total)`, 1-based
    pub page: Option<(usize, usize)>,
    pub timeout: Option<Duration>,
    pub dry_run: bool,
}

/// Build the matrix and run every entry.
pub async fn run(config_path: &str, options: RunOptions) -> Result<()> {
    let env = BuildEnvironment::capture();
    let (definition, matrix) = super::finalized_matrix(config_path, &env, options.page)?;

    let reference = definition
        .reference(&env)
        .context("Failed to resolve the package reference")?;
    let conan = ConanInvocation::new(definition.recipe_dir.clone(), reference);

    if options.dry_run {
        for entry in matrix.entries() {
            println!("{}", conan.shell_line(entry));
        }
        return Ok(());
    }

    let working_dir = working_dir(config_path)?;
    println!("Working directory: {}", working_dir.display());
    println!("Builds: {}", matrix.len());

    let mut runner;
    if options.docker {
        let image = definition
            .docker_image(&env)?
            .context("Docker builds need an image: set `docker` in the definition or CONAN_DOCKER_IMAGE")?;
        let mut docker = DockerExecutor::new().context("Failed to connect to Docker")?;
        if options.keep_containers {
            info!("Keeping build containers after they finish");
            docker = docker.keep_containers();
        }
        let executor: Arc<dyn Executor> = Arc::new(docker);
        println!("Image: {}", image);
        runner = MatrixRunner::new(executor, conan).with_image(image);
    } else {
        runner = MatrixRunner::new(Arc::new(LocalExecutor::new()), conan);
    }
    runner = runner
        .with_working_dir(working_dir)
        .fail_fast(options.fail_fast);
    if let Some(timeout) = options.timeout {
        runner = runner.with_timeout(timeout);
    }

    println!("\n--- Starting matrix ---\n");

    let (mut rx, result_handle) = runner.execute(matrix.into_entries(), build_env(&env));

    while let Some(event) = rx.recv().await {
        match event {
            RunEvent::BuildStarted { index, label } => {
                println!("▶ [{}] {}", index + 1, label);
            }
            RunEvent::BuildLog { index, line } => {
                let stream_marker = match line.stream {
                    LogStream::Stdout => " ",
                    LogStream::Stderr => "!",
                    LogStream::System => "*",
                };
                println!("  [{}]{} {}", index + 1, stream_marker, line.content);
            }
            RunEvent::BuildCompleted { index, success } => {
                if success {
                    println!("✓ [{}] succeeded\n", index + 1);
                } else {
                    println!("✗ [{}] failed\n", index + 1);
                }
            }
            RunEvent::MatrixCompleted { success } => {
                if success {
                    println!("--- Matrix completed successfully ---");
                } else {
                    println!("--- Matrix failed ---");
                }
            }
        }
    }

    let report = result_handle.await.context("Matrix execution task failed")?;

    println!("\n--- Build Summary ---");
    for (index, build) in report.builds.iter().enumerate() {
        let status = match &build.state {
            BuildState::Succeeded => "✓ succeeded".to_string(),
            BuildState::Failed { message } => format!("✗ failed: {}", message),
            BuildState::Skipped { reason } => format!("⊘ skipped: {}", reason),
            BuildState::Pending => "○ pending".to_string(),
            BuildState::Running { .. } => "▶ running".to_string(),
        };
        println!("  {:>3}. {} - {}", index + 1, build.label, status);
    }

    if report.success() {
        println!("\n✓ All {} build(s) succeeded", report.builds.len());
        Ok(())
    } else {
        anyhow::bail!(
            "{} of {} build(s) failed",
            report.failed(),
            report.builds.len()
        );
    }
}

/// Environment passed to each build.
fn build_env(env: &BuildEnvironment) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert("CI".to_string(), "true".to_string());
    vars.insert("CONAN_NON_INTERACTIVE".to_string(), "1".to_string());
    for name in FORWARDED_VARS {
        if let Some(value) = env.get(name) {
            vars.insert(name.to_string(), value.to_string());
        }
    }
    vars
}

/// Directory containing the config file, or the current directory.
fn working_dir(config_path: &str) -> Result<PathBuf> {
    Path::new(config_path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty() && p.exists())
        .unwrap_or(Path::new("."))
        .canonicalize()
        .context("Failed to resolve working directory")
}
