//! Top-level service wiring the orchestrator together.
//!
//! Constructed once at process start; components share the registry and
//! runtime by reference instead of through process-wide state.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::types::PycellConfig;
use crate::error::{PycellError, Result};
use crate::exec::ExecutionEngine;
use crate::image::ImageProvisioner;
use crate::packages::PackageManager;
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::registry::SandboxRegistry;
use crate::runtime::{ContainerRuntime, DockerCli};

pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    provisioner: Arc<ImageProvisioner>,
    registry: Arc<SandboxRegistry>,
    engine: ExecutionEngine,
    packages: PackageManager,
    reconciler: Reconciler,
    sweep_interval: Duration,
    sweep_max_idle: Duration,
    sweeper: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Construct against the configured container runtime, probing its
    /// availability first so every later operation can assume a reachable
    /// daemon.
    pub async fn new(config: PycellConfig) -> Result<Self> {
        if !config.runtime.enabled {
            return Err(PycellError::RuntimeUnavailable {
                reason: "container runtime is disabled in configuration".to_string(),
            });
        }
        let runtime: Arc<dyn ContainerRuntime> =
            Arc::new(DockerCli::new(config.runtime.program.clone()));
        runtime.ping().await?;
        Ok(Self::with_runtime(runtime, config))
    }

    /// Wire the service against an already-constructed runtime.
    pub fn with_runtime(runtime: Arc<dyn ContainerRuntime>, config: PycellConfig) -> Self {
        let provisioner = Arc::new(ImageProvisioner::new(
            runtime.clone(),
            config.runtime.clone(),
        ));
        let registry = Arc::new(SandboxRegistry::new(
            runtime.clone(),
            provisioner.clone(),
            &config,
        ));
        let engine = ExecutionEngine::new(
            runtime.clone(),
            registry.clone(),
            Duration::from_millis(config.execution.timeout_ms),
        );
        let packages = PackageManager::new(
            runtime.clone(),
            registry.clone(),
            Duration::from_secs(config.packages.install_timeout_secs),
        );
        let reconciler = Reconciler::new(runtime.clone(), config.storage.workspace_root.clone());

        Self {
            runtime,
            provisioner,
            registry,
            engine,
            packages,
            reconciler,
            sweep_interval: Duration::from_secs(config.sweep.interval_secs),
            sweep_max_idle: Duration::from_secs(config.sweep.max_idle_secs),
            sweeper: std::sync::Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub fn packages(&self) -> &PackageManager {
        &self.packages
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Ensure the runtime image for an interpreter version exists.
    pub async fn ensure_image(&self, version: &str) -> Result<String> {
        self.provisioner.ensure_image(version).await
    }

    /// Reclaim sandboxes and workspaces left behind by a previous run.
    /// Called once at boot, before any execution request.
    pub async fn reconcile(&self) -> ReconcileReport {
        self.reconciler.reconcile().await
    }

    /// Start the owned idle-sweep ticker. Idempotent; the previous ticker
    /// is kept if one is already running.
    pub fn start_sweeper(&self) {
        let mut sweeper = self.sweeper.lock().unwrap();
        if sweeper.is_none() {
            *sweeper = Some(
                self.registry
                    .spawn_idle_sweeper(self.sweep_interval, self.sweep_max_idle),
            );
            info!(
                interval_secs = self.sweep_interval.as_secs(),
                max_idle_secs = self.sweep_max_idle.as_secs(),
                "Idle sweeper started"
            );
        }
    }

    /// Stop the sweeper and tear down every tracked sandbox.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
        self.registry.destroy_all().await;
        info!("Orchestrator shut down");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        // The ticker must not outlive the service it sweeps for.
        if let Ok(mut sweeper) = self.sweeper.lock() {
            if let Some(handle) = sweeper.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::stub::StubRuntime;

    fn test_config(dir: &std::path::Path) -> PycellConfig {
        let mut config = PycellConfig::default();
        config.storage.workspace_root = dir.join("workspaces");
        config.storage.dataset_dir = dir.join("datasets");
        config
    }

    #[tokio::test]
    async fn disabled_runtime_fails_fast() {
        let mut config = PycellConfig::default();
        config.runtime.enabled = false;
        let err = Orchestrator::new(config).await.unwrap_err();
        assert!(matches!(err, PycellError::RuntimeUnavailable { .. }));
    }

    #[tokio::test]
    async fn shutdown_tears_down_all_sandboxes() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubRuntime::default());
        let orchestrator = Orchestrator::with_runtime(stub.clone(), test_config(dir.path()));

        orchestrator
            .registry()
            .create("a", "3.11")
            .await
            .unwrap();
        orchestrator
            .registry()
            .create("b", "3.11")
            .await
            .unwrap();

        orchestrator.start_sweeper();
        orchestrator.shutdown().await;

        assert!(orchestrator.registry().list().await.is_empty());
        assert_eq!(stub.removed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn sweeper_task_evicts_idle_sandboxes() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubRuntime::default());
        let orchestrator = Orchestrator::with_runtime(stub, test_config(dir.path()));

        let sandbox = orchestrator.registry().create("a", "3.11").await.unwrap();

        let handle = orchestrator
            .registry()
            .spawn_idle_sweeper(Duration::from_millis(50), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();

        assert!(orchestrator.registry().get(&sandbox.id).await.is_none());
    }
}
