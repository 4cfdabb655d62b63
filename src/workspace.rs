//! Host-side directory tree backing one sandbox.
//!
//! The workspace is bind-mounted read-write into the container at
//! [`GUEST_WORKSPACE`]; the shared dataset store is mounted read-only at
//! [`GUEST_DATASETS`].

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::error::Result;

/// Workspace mount point inside the container
pub const GUEST_WORKSPACE: &str = "/workspace";
/// Read-only dataset store mount point inside the container
pub const GUEST_DATASETS: &str = "/data";

/// pip install --target destination, relative to the workspace root
pub const SITE_DIR: &str = ".python";
/// TMPDIR, relative to the workspace root
pub const TMP_DIR: &str = ".tmp";
/// pip cache, relative to the workspace root
pub const PIP_CACHE_DIR: &str = ".cache/pip";
/// Read-write dataset copies, relative to the workspace root
pub const DATASETS_DIR: &str = "datasets";

const CODE_FILE_STEM: &str = "_exec_code";
const OUTPUTS_FILE_STEM: &str = "_outputs";

/// Paths of one sandbox workspace on the host.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn site_dir(&self) -> PathBuf {
        self.root.join(SITE_DIR)
    }

    pub fn datasets_dir(&self) -> PathBuf {
        self.root.join(DATASETS_DIR)
    }

    /// Host path of the transient code file for an execution
    pub fn code_file(&self, correlation: Option<&str>) -> PathBuf {
        self.root.join(transient_name(CODE_FILE_STEM, correlation, "py"))
    }

    /// Host path of the transient outputs file for an execution
    pub fn outputs_file(&self, correlation: Option<&str>) -> PathBuf {
        self.root
            .join(transient_name(OUTPUTS_FILE_STEM, correlation, "json"))
    }

    /// Guest path of the transient code file for an execution
    pub fn guest_code_file(&self, correlation: Option<&str>) -> String {
        format!(
            "{}/{}",
            GUEST_WORKSPACE,
            transient_name(CODE_FILE_STEM, correlation, "py")
        )
    }

    /// Guest path of the transient outputs file for an execution
    pub fn guest_outputs_file(&self, correlation: Option<&str>) -> String {
        format!(
            "{}/{}",
            GUEST_WORKSPACE,
            transient_name(OUTPUTS_FILE_STEM, correlation, "json")
        )
    }

    /// Create the full directory tree.
    pub async fn create(&self) -> Result<()> {
        fs::create_dir_all(self.datasets_dir()).await?;
        fs::create_dir_all(self.site_dir()).await?;
        fs::create_dir_all(self.root.join(TMP_DIR)).await?;
        fs::create_dir_all(self.root.join(PIP_CACHE_DIR)).await?;
        debug!(root = %self.root.display(), "Created workspace");
        Ok(())
    }

    /// Delete the whole workspace tree.
    pub async fn remove(&self) -> Result<()> {
        fs::remove_dir_all(&self.root).await?;
        debug!(root = %self.root.display(), "Removed workspace");
        Ok(())
    }

    /// Best-effort removal of transient execution files older than
    /// `max_age`. Timed-out executions leave their files behind; a later
    /// execution collects them here.
    pub async fn sweep_stale_exec_files(&self, max_age: std::time::Duration) {
        let Ok(mut entries) = fs::read_dir(&self.root).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(CODE_FILE_STEM) && !name.starts_with(OUTPUTS_FILE_STEM) {
                continue;
            }
            let stale = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified
                    .elapsed()
                    .map(|elapsed| elapsed > max_age)
                    .unwrap_or(false),
                Err(_) => false,
            };
            if stale {
                debug!(file = %name, "Removing stale execution file");
                let _ = fs::remove_file(entry.path()).await;
            }
        }
    }
}

/// Sanitize a caller-supplied correlation id into a filename-safe suffix.
pub fn sanitize_correlation(correlation: &str) -> String {
    correlation
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(32)
        .collect()
}

fn transient_name(stem: &str, correlation: Option<&str>, ext: &str) -> String {
    match correlation.map(sanitize_correlation) {
        Some(id) if !id.is_empty() => format!("{stem}_{id}.{ext}"),
        _ => format!("{stem}.{ext}"),
    }
}
