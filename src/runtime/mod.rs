mod docker;

#[cfg(test)]
pub(crate) mod stub;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;

pub use docker::DockerCli;

/// Result of running a command inside a sandbox.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Everything needed to build a runtime image.
#[derive(Debug, Clone)]
pub struct ImageBuildSpec {
    /// Primary tag for the built image
    pub tag: String,
    /// Additional tags applied in the same build (e.g. a latest alias)
    pub extra_tags: Vec<String>,
    /// Dockerfile path
    pub dockerfile: PathBuf,
    /// Build context directory
    pub context: PathBuf,
    /// --build-arg KEY=VALUE pairs
    pub build_args: Vec<(String, String)>,
    /// Optional platform override (e.g. linux/amd64)
    pub platform: Option<String>,
}

/// A bind mount from the host into a container.
#[derive(Debug, Clone)]
pub struct BindMount {
    pub host_path: PathBuf,
    pub guest_path: String,
    pub readonly: bool,
}

/// Everything needed to start a detached sandbox container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name (carries the application prefix used for reconciliation)
    pub name: String,
    /// Image tag to instantiate
    pub image: String,
    /// Memory limit in MB
    pub memory_limit_mb: u64,
    /// CPU share as a percentage of one core
    pub cpu_percent: u32,
    /// Network mode (e.g. none, bridge)
    pub network_mode: String,
    /// Size of the writable /tmp tmpfs in MB; the rootfs itself is read-only
    pub tmpfs_size_mb: u64,
    /// Bind mounts
    pub mounts: Vec<BindMount>,
    /// Environment variables
    pub env_vars: Vec<(String, String)>,
    /// Working directory inside the container
    pub workdir: String,
    /// Non-root user to run as (uid:gid)
    pub user: String,
}

/// Narrow command surface of the external container runtime.
///
/// The orchestrator drives the runtime exclusively through this trait, so
/// tests can substitute a scripted implementation and the rest of the code
/// never shells out directly.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Probe that the runtime daemon is reachable
    async fn ping(&self) -> Result<()>;

    /// Check whether an image tag exists locally
    async fn image_exists(&self, tag: &str) -> bool;

    /// Build an image
    async fn build_image(&self, spec: &ImageBuildSpec) -> Result<()>;

    /// Start a detached container, returning the runtime's container id
    async fn start_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Run a command inside a running container to completion
    async fn exec(&self, container_id: &str, argv: &[String]) -> Result<CommandResult>;

    /// Spawn a command inside a running container with piped stdout/stderr,
    /// for callers that stream output or enforce their own timeout
    fn exec_spawn(&self, container_id: &str, argv: &[String]) -> Result<tokio::process::Child>;

    /// List ids of all containers (including stopped) whose name starts
    /// with the given prefix
    async fn list_containers(&self, name_prefix: &str) -> Result<Vec<String>>;

    /// Force-remove a container
    async fn remove_container(&self, container_id: &str) -> Result<()>;
}
