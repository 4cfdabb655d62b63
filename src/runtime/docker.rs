use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{PycellError, Result};
use crate::runtime::{
    CommandResult, ContainerRuntime, ContainerSpec, ImageBuildSpec,
};

/// Docker-compatible CLI runtime.
///
/// Every operation shells out to the configured program (`docker` by
/// default; podman works too) with non-blocking `tokio::process` calls.
pub struct DockerCli {
    program: String,
}

impl DockerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.program)
    }

    async fn output(&self, args: &[&str], context: &str) -> Result<CommandResult> {
        let output = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| PycellError::SandboxExecution(format!("Failed to run {context}: {e}")))?;

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ping(&self) -> Result<()> {
        let status = self
            .command()
            .arg("info")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(_) => Err(PycellError::RuntimeUnavailable {
                reason: format!(
                    "{} daemon is not accessible. Ensure it is installed and running.",
                    self.program
                ),
            }),
            Err(e) => Err(PycellError::RuntimeUnavailable {
                reason: format!("Failed to run {}: {}", self.program, e),
            }),
        }
    }

    async fn image_exists(&self, tag: &str) -> bool {
        match self
            .command()
            .args(["image", "inspect", tag])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    async fn build_image(&self, spec: &ImageBuildSpec) -> Result<()> {
        info!(tag = %spec.tag, "Building sandbox image...");

        let mut cmd = self.command();
        cmd.args(["build", "-t", &spec.tag]);
        for tag in &spec.extra_tags {
            cmd.args(["-t", tag]);
        }
        if let Some(platform) = &spec.platform {
            cmd.args(["--platform", platform]);
        }
        for (key, value) in &spec.build_args {
            cmd.arg("--build-arg");
            cmd.arg(format!("{key}={value}"));
        }
        cmd.arg("-f");
        cmd.arg(&spec.dockerfile);
        cmd.arg(&spec.context);

        let output = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| PycellError::BuildFailed {
                tag: spec.tag.clone(),
                message: format!("Failed to run build command: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PycellError::BuildFailed {
                tag: spec.tag.clone(),
                message: stderr.trim().to_string(),
            });
        }

        info!(tag = %spec.tag, "Sandbox image built successfully");
        Ok(())
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut cmd = self.command();
        cmd.args(["run", "-d", "--name", &spec.name]);

        cmd.arg(format!("--network={}", spec.network_mode));
        cmd.arg(format!("--memory={}m", spec.memory_limit_mb));
        cmd.arg(format!("--cpus={:.2}", spec.cpu_percent as f64 / 100.0));

        // Read-only rootfs with an explicit writable scratch mount
        cmd.arg("--read-only");
        cmd.arg("--tmpfs");
        cmd.arg(format!("/tmp:rw,size={}m", spec.tmpfs_size_mb));

        for mount in &spec.mounts {
            if !mount.host_path.exists() {
                return Err(PycellError::SandboxCreateFailed(format!(
                    "Mount path does not exist: {}",
                    mount.host_path.display()
                )));
            }
            let mode = if mount.readonly { "ro" } else { "rw" };
            cmd.arg("-v");
            cmd.arg(format!(
                "{}:{}:{}",
                mount.host_path.display(),
                mount.guest_path,
                mode
            ));
        }

        for (key, value) in &spec.env_vars {
            cmd.arg("-e");
            cmd.arg(format!("{key}={value}"));
        }

        cmd.args(["-w", &spec.workdir]);
        cmd.args(["--user", &spec.user]);

        // Image and a command that keeps the container alive
        cmd.arg(&spec.image);
        cmd.args(["tail", "-f", "/dev/null"]);

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = cmd.output().await.map_err(|e| {
            PycellError::SandboxCreateFailed(format!("Failed to start container: {e}"))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PycellError::SandboxCreateFailed(format!(
                "Failed to start container: {}",
                stderr.trim()
            )));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(container_id = %container_id, name = %spec.name, "Sandbox container started");
        Ok(container_id)
    }

    async fn exec(&self, container_id: &str, argv: &[String]) -> Result<CommandResult> {
        debug!(container_id = %container_id, argv = ?argv, "Executing via exec");

        let mut cmd = self.command();
        cmd.arg("exec");
        cmd.arg(container_id);
        cmd.args(argv);

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let output = cmd
            .output()
            .await
            .map_err(|e| PycellError::SandboxExecution(format!("Failed to run exec: {e}")))?;

        let result = CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(1),
        };

        debug!(
            exit_code = result.exit_code,
            stdout_len = result.stdout.len(),
            stderr_len = result.stderr.len(),
            "Exec completed"
        );

        Ok(result)
    }

    fn exec_spawn(&self, container_id: &str, argv: &[String]) -> Result<tokio::process::Child> {
        debug!(container_id = %container_id, argv = ?argv, "Spawning exec");

        let mut cmd = self.command();
        cmd.arg("exec");
        cmd.arg(container_id);
        cmd.args(argv);

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        cmd.spawn()
            .map_err(|e| PycellError::SandboxExecution(format!("Failed to spawn exec: {e}")))
    }

    async fn list_containers(&self, name_prefix: &str) -> Result<Vec<String>> {
        let result = self
            .output(
                &[
                    "ps",
                    "-a",
                    "--filter",
                    &format!("name={name_prefix}"),
                    "--format",
                    "{{.ID}}",
                ],
                "ps",
            )
            .await?;

        if !result.success() {
            return Err(PycellError::SandboxExecution(format!(
                "Failed to list containers: {}",
                result.stderr.trim()
            )));
        }

        Ok(result
            .stdout
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let result = self.output(&["rm", "-f", container_id], "rm").await?;

        if !result.success() {
            warn!(container_id = %container_id, error = %result.stderr.trim(), "Failed to remove container");
            return Err(PycellError::SandboxExecution(format!(
                "Failed to remove container: {}",
                result.stderr.trim()
            )));
        }

        debug!(container_id = %container_id, "Container removed");
        Ok(())
    }
}
