//! Boot-time reclamation of sandboxes orphaned by a previous process
//! lifetime.
//!
//! Runs once before any execution request is accepted, while the registry
//! is still empty; everything matching the application's container prefix
//! and everything under the workspace root is fair game.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::registry::CONTAINER_PREFIX;
use crate::runtime::ContainerRuntime;

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileReport {
    pub containers_removed: usize,
    pub workspaces_removed: usize,
}

pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntime>,
    workspace_root: PathBuf,
}

impl Reconciler {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, workspace_root: PathBuf) -> Self {
        Self {
            runtime,
            workspace_root,
        }
    }

    /// Discover and destroy leftovers from a previous run. Every failure
    /// is logged and skipped; the orchestrator must come up regardless.
    pub async fn reconcile(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        match self.runtime.list_containers(CONTAINER_PREFIX).await {
            Ok(orphans) => {
                for container_id in orphans {
                    match self.runtime.remove_container(&container_id).await {
                        Ok(()) => report.containers_removed += 1,
                        Err(e) => {
                            warn!(container_id = %container_id, error = %e, "Failed to remove orphaned container")
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "Failed to list orphaned containers"),
        }

        report.workspaces_removed = self.clear_workspace_root().await;

        info!(
            containers = report.containers_removed,
            workspaces = report.workspaces_removed,
            "Reconciliation finished"
        );
        report
    }

    async fn clear_workspace_root(&self) -> usize {
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.workspace_root).await {
            Ok(entries) => entries,
            // Nothing to clean on a fresh host
            Err(_) => return 0,
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to remove orphaned workspace")
                }
            }
        }
        removed
    }
}
