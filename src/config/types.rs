use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::loader::get_data_dir;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PycellConfig {
    pub runtime: RuntimeConfig,
    pub sandbox: SandboxConfig,
    pub execution: ExecutionConfig,
    pub packages: PackagesConfig,
    pub storage: StorageConfig,
    pub sweep: SweepConfig,
}

/// Container runtime and image provisioning settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Whether the container runtime is enabled at all. When false every
    /// orchestrator operation fails fast instead of probing the daemon.
    pub enabled: bool,
    /// Runtime CLI program (docker-compatible)
    pub program: String,
    /// Image name template; `{version}` is replaced with the interpreter version
    pub image_template: String,
    /// Automatically build the image if it doesn't exist
    pub auto_build: bool,
    /// Dockerfile to build the sandbox image from (auto-detected if not set)
    pub dockerfile: Option<PathBuf>,
    /// Build platform override (e.g. linux/amd64)
    pub platform: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "docker".to_string(),
            image_template: "pycell-python:{version}".to_string(),
            auto_build: true,
            dockerfile: None,
            platform: None,
        }
    }
}

/// Resource constraints applied to every sandbox container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Memory limit in MB
    pub memory_limit_mb: u64,
    /// CPU share as a percentage of one core
    pub cpu_percent: u32,
    /// Container network mode (default: none)
    pub network_mode: String,
    /// Size of the writable /tmp tmpfs in MB (rootfs is read-only)
    pub tmpfs_size_mb: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: 1024,
            cpu_percent: 50,
            network_mode: "none".to_string(),
            tmpfs_size_mb: 64,
        }
    }
}

/// Code execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Execution timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

/// Package installation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackagesConfig {
    /// Upper bound for a non-streaming install, in seconds
    pub install_timeout_secs: u64,
}

impl Default for PackagesConfig {
    fn default() -> Self {
        Self {
            install_timeout_secs: 120,
        }
    }
}

/// Host-side directory roots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory under which per-sandbox workspaces are created
    pub workspace_root: PathBuf,
    /// Read-only dataset store mounted into every sandbox
    pub dataset_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data = get_data_dir();
        Self {
            workspace_root: data.join("workspaces"),
            dataset_dir: data.join("datasets"),
        }
    }
}

/// Idle sandbox eviction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// How often the idle sweeper runs, in seconds
    pub interval_secs: u64,
    /// Sandboxes idle longer than this are destroyed, in seconds
    pub max_idle_secs: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_idle_secs: 1800,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PycellConfig::default();
        assert!(config.runtime.enabled);
        assert_eq!(config.runtime.program, "docker");
        assert_eq!(config.runtime.image_template, "pycell-python:{version}");
        assert_eq!(config.sandbox.network_mode, "none");
        assert_eq!(config.execution.timeout_ms, 30_000);
        assert_eq!(config.packages.install_timeout_secs, 120);
        assert_eq!(config.sweep.interval_secs, 300);
        assert_eq!(config.sweep.max_idle_secs, 1800);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: PycellConfig = toml::from_str(
            r#"
            [sandbox]
            memory_limit_mb = 2048

            [runtime]
            auto_build = false
            "#,
        )
        .unwrap();
        assert_eq!(config.sandbox.memory_limit_mb, 2048);
        assert_eq!(config.sandbox.cpu_percent, 50);
        assert!(!config.runtime.auto_build);
        assert_eq!(config.runtime.program, "docker");
    }
}
