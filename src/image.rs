//! Runtime image provisioning.
//!
//! Ensures the sandbox image for a given interpreter version exists
//! locally, building it on demand. Concurrent requests for the same tag
//! share one in-flight build; different tags build fully in parallel.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use crate::config::types::RuntimeConfig;
use crate::error::{PycellError, Result};
use crate::runtime::{ContainerRuntime, ImageBuildSpec};

/// Path to the sandbox Dockerfile relative to the crate root
const DOCKERFILE_PATH: &str = "docker/Dockerfile.sandbox";

/// Outcome broadcast to callers awaiting an in-flight build
type BuildOutcome = std::result::Result<(), String>;

pub struct ImageProvisioner {
    runtime: Arc<dyn ContainerRuntime>,
    config: RuntimeConfig,
    in_flight: Mutex<HashMap<String, broadcast::Sender<BuildOutcome>>>,
}

impl ImageProvisioner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: RuntimeConfig) -> Self {
        Self {
            runtime,
            config,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Expected image tag for an interpreter version.
    pub fn image_tag(&self, version: &str) -> String {
        self.config.image_template.replace("{version}", version)
    }

    /// Ensure the image for `version` exists locally, returning its tag.
    ///
    /// Missing image with auto-build disabled is an error; otherwise the
    /// image is built, with concurrent same-tag requests awaiting the one
    /// in-flight build instead of racing duplicates.
    pub async fn ensure_image(&self, version: &str) -> Result<String> {
        let tag = self.image_tag(version);

        if self.runtime.image_exists(&tag).await {
            debug!(tag = %tag, "Image present locally");
            return Ok(tag);
        }

        if !self.config.auto_build {
            return Err(PycellError::ImageMissing {
                hint: format!(
                    "{} build -t {} -f {} .",
                    self.config.program, tag, DOCKERFILE_PATH
                ),
                tag,
            });
        }

        // Register as builder, or subscribe to the build already in flight.
        let waiter = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&tag) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    in_flight.insert(tag.clone(), tx);
                    None
                }
            }
        };

        if let Some(mut rx) = waiter {
            debug!(tag = %tag, "Awaiting in-flight image build");
            return match rx.recv().await {
                Ok(Ok(())) => Ok(tag),
                Ok(Err(message)) => Err(PycellError::BuildFailed { tag, message }),
                Err(_) => Err(PycellError::BuildFailed {
                    tag,
                    message: "in-flight build ended without a result".to_string(),
                }),
            };
        }

        let outcome = self.build(&tag, version).await;

        // Settle the in-flight entry whatever the outcome, so a failed
        // build can be retried by a later request.
        let sender = self.in_flight.lock().await.remove(&tag);
        if let Some(tx) = sender {
            let _ = tx.send(match &outcome {
                Ok(()) => Ok(()),
                Err(e) => Err(e.to_string()),
            });
        }

        outcome.map(|()| tag)
    }

    async fn build(&self, tag: &str, version: &str) -> Result<()> {
        let dockerfile = self.find_dockerfile(tag)?;
        let context = dockerfile
            .parent()
            .and_then(|p| p.parent())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut extra_tags = Vec::new();
        if let Some(alias) = latest_alias(tag) {
            extra_tags.push(alias);
        }

        let spec = ImageBuildSpec {
            tag: tag.to_string(),
            extra_tags,
            dockerfile,
            context,
            build_args: vec![("PYTHON_VERSION".to_string(), version.to_string())],
            platform: self.config.platform.clone(),
        };

        self.runtime.build_image(&spec).await?;
        info!(tag = %tag, version = %version, "Runtime image ready");
        Ok(())
    }

    /// Find the sandbox Dockerfile: config override first, then common
    /// locations relative to the working directory and the executable.
    fn find_dockerfile(&self, tag: &str) -> Result<PathBuf> {
        if let Some(path) = &self.config.dockerfile {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(PycellError::BuildFailed {
                tag: tag.to_string(),
                message: format!("Configured Dockerfile not found: {}", path.display()),
            });
        }

        let local_path = PathBuf::from(DOCKERFILE_PATH);
        if local_path.exists() {
            return Ok(local_path);
        }

        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let mut parent = exe_dir.to_path_buf();
                for _ in 0..5 {
                    let candidate = parent.join(DOCKERFILE_PATH);
                    if candidate.exists() {
                        return Ok(candidate);
                    }
                    if let Some(p) = parent.parent() {
                        parent = p.to_path_buf();
                    } else {
                        break;
                    }
                }
            }
        }

        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let cargo_dockerfile = PathBuf::from(manifest_dir).join(DOCKERFILE_PATH);
            if cargo_dockerfile.exists() {
                return Ok(cargo_dockerfile);
            }
        }

        Err(PycellError::BuildFailed {
            tag: tag.to_string(),
            message: format!(
                "Dockerfile not found at {}. Build the image manually with: {} build -t {} -f {} .",
                DOCKERFILE_PATH, self.config.program, tag, DOCKERFILE_PATH
            ),
        })
    }
}

/// `name:latest` alias for a tag, unless the tag already is `latest`.
fn latest_alias(tag: &str) -> Option<String> {
    match tag.rsplit_once(':') {
        Some((_, "latest")) => None,
        Some((name, _)) => Some(format!("{name}:latest")),
        None => Some(format!("{tag}:latest")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::stub::StubRuntime;
    use std::sync::atomic::Ordering;

    fn provisioner_with(
        stub: Arc<StubRuntime>,
        mutate: impl FnOnce(&mut RuntimeConfig),
    ) -> ImageProvisioner {
        let mut config = RuntimeConfig::default();
        mutate(&mut config);
        ImageProvisioner::new(stub, config)
    }

    #[test]
    fn tag_comes_from_template() {
        let stub = Arc::new(StubRuntime::default());
        let provisioner = provisioner_with(stub, |c| {
            c.image_template = "acme-py:{version}".to_string();
        });
        assert_eq!(provisioner.image_tag("3.11"), "acme-py:3.11");
    }

    #[test]
    fn latest_alias_skips_latest() {
        assert_eq!(latest_alias("img:3.11"), Some("img:latest".to_string()));
        assert_eq!(latest_alias("img:latest"), None);
    }

    #[tokio::test]
    async fn present_image_short_circuits() {
        let stub = Arc::new(StubRuntime::default());
        let provisioner = provisioner_with(stub.clone(), |_| {});
        let tag = provisioner.ensure_image("3.11").await.unwrap();
        assert_eq!(tag, "pycell-python:3.11");
        assert_eq!(stub.build_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_image_without_auto_build_fails() {
        let stub = Arc::new(StubRuntime::default());
        stub.image_present.store(false, Ordering::SeqCst);
        let provisioner = provisioner_with(stub, |c| c.auto_build = false);
        let err = provisioner.ensure_image("3.11").await.unwrap_err();
        assert!(matches!(err, PycellError::ImageMissing { .. }));
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_build() {
        let dir = tempfile::tempdir().unwrap();
        let dockerfile = dir.path().join("Dockerfile.sandbox");
        std::fs::write(&dockerfile, "FROM scratch\n").unwrap();

        let stub = Arc::new(StubRuntime {
            build_delay_ms: 50,
            ..StubRuntime::default()
        });
        stub.image_present.store(false, Ordering::SeqCst);

        let provisioner = Arc::new(provisioner_with(stub.clone(), |c| {
            c.dockerfile = Some(dockerfile);
        }));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let provisioner = provisioner.clone();
            handles.push(tokio::spawn(
                async move { provisioner.ensure_image("3.12").await },
            ));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(stub.build_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_build_can_be_retried() {
        let dir = tempfile::tempdir().unwrap();
        let dockerfile = dir.path().join("Dockerfile.sandbox");
        std::fs::write(&dockerfile, "FROM scratch\n").unwrap();

        let stub = Arc::new(StubRuntime {
            fail_build: true,
            ..StubRuntime::default()
        });
        stub.image_present.store(false, Ordering::SeqCst);

        let provisioner = provisioner_with(stub.clone(), |c| {
            c.dockerfile = Some(dockerfile);
        });

        assert!(provisioner.ensure_image("3.12").await.is_err());
        // The in-flight entry was cleared, so the next request builds again
        // instead of waiting on a settled task.
        assert!(provisioner.ensure_image("3.12").await.is_err());
        assert_eq!(stub.build_count.load(Ordering::SeqCst), 2);
    }
}
