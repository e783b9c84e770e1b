//! Build execution backends for pkgmatrix.
//!
//! Provides executor implementations for running one build command:
//! - Local process (default)
//! - Docker container (`CONAN_DOCKER_IMAGE`)

pub mod docker;
pub mod local;

pub use docker::DockerExecutor;
pub use local::LocalExecutor;
pub use pkgmatrix_core::executor::{
    Executor, JobHandle, JobResult, JobSpec, JobStatus, LogLine, LogStream, VolumeMount,
};
