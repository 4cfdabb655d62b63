//! In-memory table of live sandboxes.
//!
//! Owns creation (workspace tree + image + container), reuse by
//! `(project, version)`, idle eviction, and teardown. Constructed once at
//! process start and shared by reference with the execution engine, the
//! package manager, and the reconciler.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::types::{PycellConfig, SandboxConfig, StorageConfig};
use crate::error::Result;
use crate::image::ImageProvisioner;
use crate::runtime::{BindMount, ContainerRuntime, ContainerSpec};
use crate::workspace::{
    Workspace, GUEST_DATASETS, GUEST_WORKSPACE, PIP_CACHE_DIR, SITE_DIR, TMP_DIR,
};

/// Name prefix for every container this application starts; reconciliation
/// discovers orphans by it.
pub const CONTAINER_PREFIX: &str = "pycell-";

/// Non-root user the sandbox process runs as
const SANDBOX_USER: &str = "1000:1000";

/// One externally-isolated execution environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    /// Orchestrator-generated handle, stable across the sandbox's life
    pub id: String,
    /// Identifier returned by the container runtime
    pub external_id: String,
    pub project_id: String,
    pub python_version: String,
    /// Host directory bind-mounted into the sandbox
    pub workspace_path: PathBuf,
    pub created_at: SystemTime,
    pub last_used_at: SystemTime,
}

impl Sandbox {
    pub fn workspace(&self) -> Workspace {
        Workspace::new(self.workspace_path.clone())
    }
}

pub struct SandboxRegistry {
    runtime: Arc<dyn ContainerRuntime>,
    provisioner: Arc<ImageProvisioner>,
    sandbox_config: SandboxConfig,
    storage: StorageConfig,
    sandboxes: Mutex<HashMap<String, Sandbox>>,
}

impl SandboxRegistry {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        provisioner: Arc<ImageProvisioner>,
        config: &PycellConfig,
    ) -> Self {
        Self {
            runtime,
            provisioner,
            sandbox_config: config.sandbox.clone(),
            storage: config.storage.clone(),
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a live sandbox by id.
    pub async fn get(&self, id: &str) -> Option<Sandbox> {
        self.sandboxes.lock().await.get(id).cloned()
    }

    /// All tracked sandboxes.
    pub async fn list(&self) -> Vec<Sandbox> {
        self.sandboxes.lock().await.values().cloned().collect()
    }

    /// Refresh a sandbox's last-used timestamp.
    pub async fn touch(&self, id: &str) {
        if let Some(sandbox) = self.sandboxes.lock().await.get_mut(id) {
            sandbox.last_used_at = SystemTime::now();
        }
    }

    /// Return the sandbox for `(project, version)` if one exists, else
    /// create one.
    ///
    /// Best-effort reuse only: concurrent calls for the same key may race
    /// and create two sandboxes. Callers needing stronger guarantees must
    /// serialize at a higher layer.
    pub async fn get_or_create(&self, project_id: &str, version: &str) -> Result<Sandbox> {
        {
            let mut sandboxes = self.sandboxes.lock().await;
            let hit = sandboxes
                .values_mut()
                .find(|s| s.project_id == project_id && s.python_version == version);
            if let Some(sandbox) = hit {
                sandbox.last_used_at = SystemTime::now();
                debug!(id = %sandbox.id, project = %project_id, version = %version, "Reusing sandbox");
                return Ok(sandbox.clone());
            }
        }
        self.create(project_id, version).await
    }

    /// Create a fresh sandbox regardless of any existing one for the pair.
    pub async fn create(&self, project_id: &str, version: &str) -> Result<Sandbox> {
        let id = generate_sandbox_id();
        tokio::fs::create_dir_all(&self.storage.dataset_dir).await?;
        let workspace = Workspace::new(self.storage.workspace_root.join(&id));
        workspace.create().await?;

        // Anything failing past this point must not leave a half-built
        // workspace behind.
        match self.start_sandbox(&id, version, &workspace).await {
            Ok(external_id) => {
                let now = SystemTime::now();
                let sandbox = Sandbox {
                    id: id.clone(),
                    external_id,
                    project_id: project_id.to_string(),
                    python_version: version.to_string(),
                    workspace_path: workspace.root().to_path_buf(),
                    created_at: now,
                    last_used_at: now,
                };
                self.sandboxes
                    .lock()
                    .await
                    .insert(id.clone(), sandbox.clone());
                info!(id = %id, project = %project_id, version = %version, "Sandbox created");
                Ok(sandbox)
            }
            Err(e) => {
                if let Err(cleanup) = workspace.remove().await {
                    warn!(id = %id, error = %cleanup, "Failed to roll back workspace");
                }
                Err(e)
            }
        }
    }

    async fn start_sandbox(
        &self,
        id: &str,
        version: &str,
        workspace: &Workspace,
    ) -> Result<String> {
        let image = self.provisioner.ensure_image(version).await?;

        let spec = ContainerSpec {
            name: format!("{CONTAINER_PREFIX}{id}"),
            image,
            memory_limit_mb: self.sandbox_config.memory_limit_mb,
            cpu_percent: self.sandbox_config.cpu_percent,
            network_mode: self.sandbox_config.network_mode.clone(),
            tmpfs_size_mb: self.sandbox_config.tmpfs_size_mb,
            mounts: vec![
                BindMount {
                    host_path: workspace.root().to_path_buf(),
                    guest_path: GUEST_WORKSPACE.to_string(),
                    readonly: false,
                },
                BindMount {
                    host_path: self.storage.dataset_dir.clone(),
                    guest_path: GUEST_DATASETS.to_string(),
                    readonly: true,
                },
            ],
            env_vars: vec![
                (
                    "PYTHONPATH".to_string(),
                    format!("{GUEST_WORKSPACE}/{SITE_DIR}"),
                ),
                (
                    "PIP_CACHE_DIR".to_string(),
                    format!("{GUEST_WORKSPACE}/{PIP_CACHE_DIR}"),
                ),
                ("TMPDIR".to_string(), format!("{GUEST_WORKSPACE}/{TMP_DIR}")),
                ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
            ],
            workdir: GUEST_WORKSPACE.to_string(),
            user: SANDBOX_USER.to_string(),
        };

        self.runtime.start_container(&spec).await
    }

    /// Destroy a sandbox: container, workspace, registry entry.
    ///
    /// Idempotent; destroying an unknown id is a no-op. Removal errors are
    /// logged, not raised, because cleanup must never block shutdown.
    pub async fn destroy(&self, id: &str) -> bool {
        let Some(sandbox) = self.sandboxes.lock().await.remove(id) else {
            debug!(id = %id, "Destroy of untracked sandbox ignored");
            return false;
        };

        if let Err(e) = self.runtime.remove_container(&sandbox.external_id).await {
            warn!(id = %id, error = %e, "Failed to remove sandbox container");
        }
        if let Err(e) = sandbox.workspace().remove().await {
            warn!(id = %id, error = %e, "Failed to remove sandbox workspace");
        }
        info!(id = %id, "Sandbox destroyed");
        true
    }

    /// Destroy every sandbox idle longer than `max_idle`; returns how many
    /// were destroyed.
    pub async fn sweep_idle(&self, max_idle: Duration) -> usize {
        let stale: Vec<String> = {
            let sandboxes = self.sandboxes.lock().await;
            sandboxes
                .values()
                .filter(|s| {
                    s.last_used_at
                        .elapsed()
                        .map(|idle| idle > max_idle)
                        .unwrap_or(false)
                })
                .map(|s| s.id.clone())
                .collect()
        };

        for id in &stale {
            debug!(id = %id, "Evicting idle sandbox");
            self.destroy(id).await;
        }
        stale.len()
    }

    /// Destroy all tracked sandboxes concurrently; per-sandbox failures do
    /// not abort the batch. Used at process shutdown.
    pub async fn destroy_all(&self) {
        let ids: Vec<String> = self.sandboxes.lock().await.keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "Destroying all sandboxes");
        futures::future::join_all(ids.iter().map(|id| self.destroy(id))).await;
    }

    /// Spawn the owned idle-sweep ticker. The returned handle is aborted
    /// at shutdown.
    pub fn spawn_idle_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        max_idle: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                let evicted = registry.sweep_idle(max_idle).await;
                if evicted > 0 {
                    info!(count = evicted, "Idle sweep evicted sandboxes");
                }
            }
        })
    }
}

/// Generate a short, unique sandbox id (base36 timestamp + counter).
fn generate_sandbox_id() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);

    let combined = (timestamp & 0xFFFFFF) << 8 | (counter as u64 & 0xFF);
    format_base36(combined)
}

fn format_base36(mut n: u64) -> String {
    const CHARS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if n == 0 {
        return "0".to_string();
    }

    let mut result = Vec::new();
    while n > 0 {
        result.push(CHARS[(n % 36) as usize]);
        n /= 36;
    }
    result.reverse();
    String::from_utf8(result).unwrap_or_else(|_| "error".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::stub::StubRuntime;

    fn test_registry(stub: Arc<StubRuntime>, root: &std::path::Path) -> SandboxRegistry {
        let mut config = PycellConfig::default();
        config.storage.workspace_root = root.join("workspaces");
        config.storage.dataset_dir = root.join("datasets");
        let provisioner = Arc::new(ImageProvisioner::new(stub.clone(), config.runtime.clone()));
        SandboxRegistry::new(stub, provisioner, &config)
    }

    #[test]
    fn base36_formatting() {
        assert_eq!(format_base36(0), "0");
        assert_eq!(format_base36(35), "z");
        assert_eq!(format_base36(36), "10");
    }

    #[tokio::test]
    async fn get_or_create_reuses_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubRuntime::default());
        let registry = test_registry(stub, dir.path());

        let first = registry.get_or_create("proj", "3.11").await.unwrap();
        let second = registry.get_or_create("proj", "3.11").await.unwrap();
        assert_eq!(first.id, second.id);

        let other = registry.get_or_create("proj", "3.12").await.unwrap();
        assert_ne!(first.id, other.id);
        assert_eq!(registry.list().await.len(), 2);
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubRuntime::default());
        let registry = test_registry(stub.clone(), dir.path());

        let sandbox = registry.create("proj", "3.11").await.unwrap();
        assert!(registry.destroy(&sandbox.id).await);
        assert!(!registry.destroy(&sandbox.id).await);
        assert_eq!(stub.removed.lock().unwrap().len(), 1);
        assert!(!sandbox.workspace_path.exists());
    }

    #[tokio::test]
    async fn failed_start_rolls_back_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubRuntime {
            fail_start: true,
            ..StubRuntime::default()
        });
        let registry = test_registry(stub, dir.path());

        assert!(registry.create("proj", "3.11").await.is_err());
        assert!(registry.list().await.is_empty());
        // No half-built workspace left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("workspaces"))
            .map(|entries| entries.collect())
            .unwrap_or_default();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn container_spec_pins_isolation_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubRuntime::default());
        let registry = test_registry(stub.clone(), dir.path());

        let sandbox = registry.create("proj", "3.11").await.unwrap();
        let started = stub.started.lock().unwrap();
        let spec = &started[0];
        assert_eq!(spec.name, format!("{CONTAINER_PREFIX}{}", sandbox.id));
        assert_eq!(spec.network_mode, "none");
        assert_eq!(spec.workdir, GUEST_WORKSPACE);
        assert!(spec.mounts.iter().any(|m| m.guest_path == GUEST_WORKSPACE && !m.readonly));
        assert!(spec.mounts.iter().any(|m| m.guest_path == GUEST_DATASETS && m.readonly));
        assert!(spec
            .env_vars
            .iter()
            .any(|(k, v)| k == "PYTHONPATH" && v == "/workspace/.python"));
        assert!(spec
            .env_vars
            .iter()
            .any(|(k, v)| k == "TMPDIR" && v == "/workspace/.tmp"));
    }

    #[tokio::test]
    async fn idle_sweep_destroys_only_stale_sandboxes() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubRuntime::default());
        let registry = test_registry(stub, dir.path());

        let stale = registry.create("old", "3.11").await.unwrap();
        let fresh = registry.create("new", "3.11").await.unwrap();

        {
            let mut sandboxes = registry.sandboxes.lock().await;
            sandboxes.get_mut(&stale.id).unwrap().last_used_at =
                SystemTime::now() - Duration::from_secs(3600);
        }

        let evicted = registry.sweep_idle(Duration::from_secs(1800)).await;
        assert_eq!(evicted, 1);
        assert!(registry.get(&stale.id).await.is_none());
        assert!(registry.get(&fresh.id).await.is_some());
    }

    #[tokio::test]
    async fn destroy_all_clears_every_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(StubRuntime::default());
        let registry = test_registry(stub.clone(), dir.path());

        for i in 0..3 {
            registry.create(&format!("proj-{i}"), "3.11").await.unwrap();
        }
        registry.destroy_all().await;
        assert!(registry.list().await.is_empty());
        assert_eq!(stub.removed.lock().unwrap().len(), 3);
    }
}
