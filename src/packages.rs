//! Package management inside sandboxes.
//!
//! Installs are binary-first with a source fallback, scoped to the
//! workspace's isolated target directory; the streaming variant parses
//! line-buffered pip output into ordered progress events.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{PycellError, Result};
use crate::registry::{Sandbox, SandboxRegistry};
use crate::runtime::{CommandResult, ContainerRuntime};
use crate::workspace::{GUEST_WORKSPACE, SITE_DIR};

const PYTHON_BIN: &str = "python3";

/// Outcome of an install/uninstall, returned rather than thrown: callers
/// inspect `success` instead of catching errors for expected failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageOutcome {
    pub success: bool,
    pub message: String,
    /// Ordered progress events (streaming installs only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<ProgressEvent>,
    /// Raw log lines (streaming installs only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<String>,
}

impl PackageOutcome {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            events: Vec::new(),
            log: Vec::new(),
        }
    }

    fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            events: Vec::new(),
            log: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub stage: String,
    pub percent: u8,
}

/// Event pushed to the caller of a streaming install.
#[derive(Debug, Clone)]
pub enum InstallEvent {
    Progress(ProgressEvent),
    Log(String),
}

/// One installed distribution, as reported from inside the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub homepage: String,
}

/// Why an install failed, classified from pip's stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    MissingBinary,
    DiskExhausted,
    BuildFailed,
    Other,
}

/// In-sandbox introspection script enumerating installed distributions.
const LIST_SCRIPT: &str = r#"import json
from importlib import metadata

rows = []
for dist in metadata.distributions(path=["/workspace/.python"]):
    info = dist.metadata
    rows.append({
        "name": info.get("Name") or "",
        "version": dist.version or "",
        "summary": info.get("Summary") or "",
        "homepage": info.get("Home-page") or "",
    })
print(json.dumps(rows))
"#;

pub struct PackageManager {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<SandboxRegistry>,
    install_timeout: Duration,
}

impl PackageManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<SandboxRegistry>,
        install_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            registry,
            install_timeout,
        }
    }

    /// Install packages, trying prebuilt binaries first and falling back
    /// to a source build only when a binary attempt failed for reasons
    /// other than "no compatible wheel exists".
    pub async fn install(&self, sandbox_id: &str, spec: &str) -> Result<PackageOutcome> {
        let sandbox = self.require(sandbox_id).await?;
        let (tokens, notices) = normalize_spec(spec);
        if tokens.is_empty() {
            return Ok(PackageOutcome::failure("No packages requested"));
        }

        info!(sandbox = %sandbox.id, packages = ?tokens, "Installing packages (binary first)");
        let outcome = self.install_attempts(&sandbox, &tokens, &notices).await;

        self.registry.touch(sandbox_id).await;
        Ok(outcome)
    }

    async fn install_attempts(
        &self,
        sandbox: &Sandbox,
        tokens: &[String],
        notices: &[String],
    ) -> PackageOutcome {
        let binary = match self.run_pip(sandbox, tokens, true).await {
            Ok(result) => result,
            Err(outcome) => return outcome,
        };
        if binary.success() {
            return with_notices(success_outcome(tokens, &binary.stdout), notices);
        }

        let binary_stderr = combined_output(&binary);
        if classify_failure(&binary_stderr) == FailureKind::MissingBinary {
            // A source build would almost certainly fail too; stop here
            // with a clear answer instead of burning minutes on it.
            debug!(sandbox = %sandbox.id, "No compatible wheel; skipping source fallback");
            return with_notices(
                PackageOutcome::failure(format!(
                    "No prebuilt binary available for {}: {}. The package publishes no \
                     compatible wheel for this platform, so it cannot be installed here.",
                    tokens.join(", "),
                    error_tail(&binary_stderr)
                )),
                notices,
            );
        }

        debug!(sandbox = %sandbox.id, "Binary install failed; retrying with source builds allowed");
        let source = match self.run_pip(sandbox, tokens, false).await {
            Ok(result) => result,
            Err(outcome) => return outcome,
        };
        if source.success() {
            return with_notices(success_outcome(tokens, &source.stdout), notices);
        }

        let source_stderr = combined_output(&source);
        with_notices(
            PackageOutcome::failure(failure_message(
                classify_failure(&source_stderr),
                tokens,
                &source_stderr,
            )),
            notices,
        )
    }

    async fn run_pip(
        &self,
        sandbox: &Sandbox,
        tokens: &[String],
        binary_only: bool,
    ) -> std::result::Result<CommandResult, PackageOutcome> {
        let argv = pip_install_argv(tokens, binary_only);
        match tokio::time::timeout(
            self.install_timeout,
            self.runtime.exec(&sandbox.external_id, &argv),
        )
        .await
        {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(PackageOutcome::failure(format!(
                "Installation failed to run: {e}"
            ))),
            Err(_) => Err(PackageOutcome::failure(format!(
                "Installation timed out after {} s",
                self.install_timeout.as_secs()
            ))),
        }
    }

    /// Streaming install: a single spawned pip invocation whose output is
    /// parsed line-by-line into progress events. No timeout on this path.
    pub async fn install_streaming<F>(
        &self,
        sandbox_id: &str,
        spec: &str,
        mut on_event: F,
    ) -> Result<PackageOutcome>
    where
        F: FnMut(InstallEvent) + Send,
    {
        let sandbox = self.require(sandbox_id).await?;
        let (tokens, notices) = normalize_spec(spec);
        if tokens.is_empty() {
            return Ok(PackageOutcome::failure("No packages requested"));
        }

        info!(sandbox = %sandbox.id, packages = ?tokens, "Installing packages (streaming)");

        let argv = pip_install_argv(&tokens, false);
        let mut child = self.runtime.exec_spawn(&sandbox.external_id, &argv)?;

        let (tx, mut rx) = mpsc::channel::<String>(64);
        let stdout_task = child.stdout.take().map(|s| forward_lines(s, tx.clone()));
        let stderr_task = child.stderr.take().map(|s| forward_lines(s, tx.clone()));
        drop(tx);

        let mut progress = InstallProgress::default();
        let mut events = Vec::new();
        let mut log = Vec::new();

        while let Some(line) = rx.recv().await {
            if let Some(event) = progress.observe(&line) {
                events.push(event.clone());
                on_event(InstallEvent::Progress(event));
            }
            on_event(InstallEvent::Log(line.clone()));
            log.push(line);
        }

        if let Some(task) = stdout_task {
            let _ = task.await;
        }
        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let status = child.wait().await.map_err(|e| {
            PycellError::SandboxExecution(format!("Failed to await install: {e}"))
        })?;

        let mut outcome = if status.success() {
            if let Some(event) = progress.finish() {
                events.push(event.clone());
                on_event(InstallEvent::Progress(event));
            }
            with_notices(
                success_outcome(&tokens, &log.join("\n")),
                &notices,
            )
        } else {
            let stderr = log.join("\n");
            with_notices(
                PackageOutcome::failure(failure_message(
                    classify_failure(&stderr),
                    &tokens,
                    &stderr,
                )),
                &notices,
            )
        };
        outcome.events = events;
        outcome.log = log;

        self.registry.touch(sandbox_id).await;
        Ok(outcome)
    }

    /// Uninstall a package from the sandbox's isolated directory.
    /// "Not installed" is a successful no-op.
    pub async fn uninstall(&self, sandbox_id: &str, name: &str) -> Result<PackageOutcome> {
        let sandbox = self.require(sandbox_id).await?;

        let argv: Vec<String> = [PYTHON_BIN, "-m", "pip", "uninstall", "-y", name]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let result = match tokio::time::timeout(
            self.install_timeout,
            self.runtime.exec(&sandbox.external_id, &argv),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Ok(PackageOutcome::failure(format!(
                    "Uninstall timed out after {} s",
                    self.install_timeout.as_secs()
                )))
            }
        };

        self.registry.touch(sandbox_id).await;

        let combined = combined_output(&result).to_lowercase();
        if combined.contains("not installed") {
            return Ok(PackageOutcome::success(format!(
                "'{name}' was not installed; nothing to do"
            )));
        }
        if result.success() {
            Ok(PackageOutcome::success(format!("Uninstalled '{name}'")))
        } else {
            Ok(PackageOutcome::failure(format!(
                "Failed to uninstall '{name}': {}",
                error_tail(&combined_output(&result))
            )))
        }
    }

    /// List installed distributions, sorted case-insensitively by name.
    /// Best-effort telemetry: any failure yields an empty list.
    pub async fn list(&self, sandbox_id: &str) -> Result<Vec<PackageInfo>> {
        let sandbox = self.require(sandbox_id).await?;

        let argv: Vec<String> = [PYTHON_BIN, "-c", LIST_SCRIPT]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let result = match self.runtime.exec(&sandbox.external_id, &argv).await {
            Ok(result) => result,
            Err(e) => {
                warn!(sandbox = %sandbox.id, error = %e, "Package listing failed");
                return Ok(Vec::new());
            }
        };

        self.registry.touch(sandbox_id).await;

        if !result.success() {
            warn!(sandbox = %sandbox.id, stderr = %result.stderr.trim(), "Package listing failed");
            return Ok(Vec::new());
        }

        let mut packages: Vec<PackageInfo> =
            serde_json::from_str(result.stdout.trim()).unwrap_or_default();
        packages.sort_by_key(|p| p.name.to_lowercase());
        Ok(packages)
    }

    async fn require(&self, sandbox_id: &str) -> Result<Sandbox> {
        self.registry
            .get(sandbox_id)
            .await
            .ok_or_else(|| PycellError::SandboxNotFound {
                id: sandbox_id.to_string(),
            })
    }
}

// ============================================================================
// Requirement normalization
// ============================================================================

/// Split a comma/space-separated requirement spec into tokens, rewriting
/// legacy import names to their published distribution names. Returns the
/// tokens plus one human-readable notice per rewrite.
pub fn normalize_spec(spec: &str) -> (Vec<String>, Vec<String>) {
    let mut tokens = Vec::new();
    let mut notices = Vec::new();

    for raw in spec.split(',').flat_map(str::split_whitespace) {
        let token = raw.trim();
        if token.is_empty() {
            continue;
        }
        let (name, rest) = split_requirement(token);
        let normalized = name.to_lowercase().replace('_', "-");
        match alias_for(&normalized) {
            Some(alias) => {
                notices.push(format!(
                    "'{name}' is published as '{alias}'; installing {alias} instead"
                ));
                tokens.push(format!("{alias}{rest}"));
            }
            None => tokens.push(token.to_string()),
        }
    }

    (tokens, notices)
}

/// Split a requirement token into its bare name and the trailing
/// version/extras/marker part.
fn split_requirement(token: &str) -> (&str, &str) {
    let idx = token
        .find(|c: char| "=<>!~;[@".contains(c))
        .unwrap_or(token.len());
    token.split_at(idx)
}

/// Legacy or import-style names mapped to current distribution names.
fn alias_for(name: &str) -> Option<&'static str> {
    Some(match name {
        "sklearn" => "scikit-learn",
        "cv2" | "opencv" => "opencv-python",
        "pil" => "pillow",
        "bs4" => "beautifulsoup4",
        "yaml" => "pyyaml",
        _ => return None,
    })
}

fn pip_install_argv(tokens: &[String], binary_only: bool) -> Vec<String> {
    let mut argv: Vec<String> = [
        PYTHON_BIN,
        "-m",
        "pip",
        "install",
        "--disable-pip-version-check",
        "--no-warn-script-location",
        "--target",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    argv.push(format!("{GUEST_WORKSPACE}/{SITE_DIR}"));
    if binary_only {
        argv.push("--only-binary".to_string());
        argv.push(":all:".to_string());
    }
    argv.extend(tokens.iter().cloned());
    argv
}

// ============================================================================
// Failure classification and messages
// ============================================================================

fn classify_failure(stderr: &str) -> FailureKind {
    let lower = stderr.to_lowercase();

    const DISK: &[&str] = &["no space left on device", "disk quota exceeded", "enospc"];
    const MISSING_BINARY: &[&str] = &[
        "no matching distribution found",
        "could not find a version that satisfies",
        "is not a supported wheel",
        "none of the wheels",
    ];
    const BUILD: &[&str] = &[
        "failed building wheel",
        "error: subprocess-exited-with-error",
        "legacy-install-failure",
        "error: command",
        "microsoft visual c++",
        "failed to build",
    ];

    if DISK.iter().any(|p| lower.contains(p)) {
        FailureKind::DiskExhausted
    } else if MISSING_BINARY.iter().any(|p| lower.contains(p)) {
        FailureKind::MissingBinary
    } else if BUILD.iter().any(|p| lower.contains(p)) {
        FailureKind::BuildFailed
    } else {
        FailureKind::Other
    }
}

fn failure_message(kind: FailureKind, tokens: &[String], stderr: &str) -> String {
    let packages = tokens.join(", ");
    let detail = error_tail(stderr);
    match kind {
        FailureKind::MissingBinary => format!(
            "No distribution of {packages} is installable on this platform: {detail}"
        ),
        FailureKind::DiskExhausted => format!(
            "Installing {packages} ran out of disk space. Increase the sandbox tmpfs size \
             or clean the container runtime's storage."
        ),
        FailureKind::BuildFailed => format!(
            "Building {packages} from source failed (a missing compiler toolchain inside \
             the sandbox is the usual cause): {detail}"
        ),
        FailureKind::Other => format!("Failed to install {packages}: {detail}"),
    }
}

/// Last non-empty line of a command's output, for compact messages.
fn error_tail(output: &str) -> String {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no output")
        .to_string()
}

fn combined_output(result: &CommandResult) -> String {
    let mut combined = result.stderr.clone();
    if !result.stdout.is_empty() {
        combined.push('\n');
        combined.push_str(&result.stdout);
    }
    combined
}

fn success_outcome(tokens: &[String], output: &str) -> PackageOutcome {
    let summary = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| line.starts_with("Successfully installed"));
    match summary {
        Some(line) => PackageOutcome::success(line),
        None => PackageOutcome::success(format!("Installed {}", tokens.join(", "))),
    }
}

fn with_notices(mut outcome: PackageOutcome, notices: &[String]) -> PackageOutcome {
    if !notices.is_empty() {
        outcome.message = format!("{} ({})", outcome.message, notices.join("; "));
    }
    outcome
}

// ============================================================================
// Streaming progress
// ============================================================================

/// Ordered pip output markers and the stage/percent they map to.
const PROGRESS_MARKERS: &[(&str, &str, u8)] = &[
    ("Collecting", "collecting", 15),
    ("Downloading", "downloading", 40),
    ("Building wheel", "building", 60),
    ("Installing collected packages", "installing", 85),
    ("Successfully installed", "done", 100),
];

/// Marker-driven install progress; percentages never regress.
#[derive(Debug, Default)]
struct InstallProgress {
    percent: u8,
}

impl InstallProgress {
    fn observe(&mut self, line: &str) -> Option<ProgressEvent> {
        let trimmed = line.trim_start();
        for (marker, stage, percent) in PROGRESS_MARKERS {
            if trimmed.starts_with(marker) && *percent > self.percent {
                self.percent = *percent;
                return Some(ProgressEvent {
                    stage: stage.to_string(),
                    percent: *percent,
                });
            }
        }
        None
    }

    /// Terminal event for successful installs whose output never reached
    /// the final marker (e.g. everything already satisfied).
    fn finish(&mut self) -> Option<ProgressEvent> {
        if self.percent < 100 {
            self.percent = 100;
            Some(ProgressEvent {
                stage: "done".to_string(),
                percent: 100,
            })
        } else {
            None
        }
    }
}

fn forward_lines(
    stream: impl AsyncRead + Unpin + Send + 'static,
    tx: mpsc::Sender<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::PycellConfig;
    use crate::image::ImageProvisioner;
    use crate::runtime::stub::StubRuntime;

    async fn fixture(
        dir: &std::path::Path,
    ) -> (Arc<StubRuntime>, Arc<SandboxRegistry>, PackageManager, String) {
        let stub = Arc::new(StubRuntime::default());
        let mut config = PycellConfig::default();
        config.storage.workspace_root = dir.join("workspaces");
        config.storage.dataset_dir = dir.join("datasets");
        let provisioner = Arc::new(ImageProvisioner::new(stub.clone(), config.runtime.clone()));
        let registry = Arc::new(SandboxRegistry::new(stub.clone(), provisioner, &config));
        let sandbox = registry.create("proj", "3.11").await.unwrap();
        let manager = PackageManager::new(stub.clone(), registry.clone(), Duration::from_secs(120));
        (stub, registry, manager, sandbox.id)
    }

    #[test]
    fn spec_normalization_rewrites_aliases() {
        let (tokens, notices) = normalize_spec("sklearn pandas==2.0");
        assert_eq!(tokens, vec!["scikit-learn", "pandas==2.0"]);
        assert_eq!(notices.len(), 1);
        assert!(notices[0].contains("scikit-learn"));

        let (tokens, notices) = normalize_spec("PIL,requests");
        assert_eq!(tokens, vec!["pillow", "requests"]);
        assert_eq!(notices.len(), 1);

        let (tokens, _) = normalize_spec("opencv>=4.8");
        assert_eq!(tokens, vec!["opencv-python>=4.8"]);

        let (tokens, notices) = normalize_spec("numpy");
        assert_eq!(tokens, vec!["numpy"]);
        assert!(notices.is_empty());
    }

    #[test]
    fn requirement_split_keeps_version_part() {
        assert_eq!(split_requirement("pandas==2.0"), ("pandas", "==2.0"));
        assert_eq!(split_requirement("foo[extra]>=1"), ("foo", "[extra]>=1"));
        assert_eq!(split_requirement("bare"), ("bare", ""));
    }

    #[test]
    fn failure_classification_patterns() {
        assert_eq!(
            classify_failure("ERROR: No matching distribution found for foo"),
            FailureKind::MissingBinary
        );
        assert_eq!(
            classify_failure("OSError: [Errno 28] No space left on device"),
            FailureKind::DiskExhausted
        );
        assert_eq!(
            classify_failure("error: subprocess-exited-with-error\ngcc: not found"),
            FailureKind::BuildFailed
        );
        assert_eq!(classify_failure("something odd"), FailureKind::Other);
        // Disk exhaustion wins even when wrapped in a build error
        assert_eq!(
            classify_failure("Failed building wheel: No space left on device"),
            FailureKind::DiskExhausted
        );
    }

    #[test]
    fn progress_never_regresses() {
        let mut progress = InstallProgress::default();
        let events: Vec<_> = [
            "Collecting requests",
            "  Downloading requests-2.31.0-py3-none-any.whl (62 kB)",
            "Collecting idna",
            "  Downloading idna-3.6-py3-none-any.whl",
            "Installing collected packages: idna, requests",
            "Successfully installed idna-3.6 requests-2.31.0",
        ]
        .iter()
        .filter_map(|line| progress.observe(line))
        .collect();

        let percents: Vec<u8> = events.iter().map(|e| e.percent).collect();
        assert_eq!(percents, vec![15, 40, 85, 100]);
        assert_eq!(events[0].stage, "collecting");
        assert_eq!(events.last().unwrap().stage, "done");
        assert!(progress.finish().is_none());
    }

    #[tokio::test]
    async fn binary_failure_falls_back_to_source() {
        let dir = tempfile::tempdir().unwrap();
        let (stub, _registry, manager, id) = fixture(dir.path()).await;

        stub.push_exec(1, "", "error: subprocess-exited-with-error");
        stub.push_exec(0, "Successfully installed lxml-5.1.0", "");

        let outcome = manager.install(&id, "lxml").await.unwrap();
        assert!(outcome.success);
        assert!(outcome.message.contains("Successfully installed lxml-5.1.0"));

        let log = stub.exec_log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[0].iter().any(|a| a == "--only-binary"));
        assert!(!log[1].iter().any(|a| a == "--only-binary"));
        assert!(log[0].iter().any(|a| a == "/workspace/.python"));
    }

    #[tokio::test]
    async fn missing_wheel_stops_without_source_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let (stub, _registry, manager, id) = fixture(dir.path()).await;

        stub.push_exec(
            1,
            "",
            "ERROR: Could not find a version that satisfies the requirement weirdpkg\n\
             ERROR: No matching distribution found for weirdpkg",
        );

        let outcome = manager.install(&id, "weirdpkg").await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.contains("No distribution of weirdpkg"));
        // Only the binary attempt ran
        assert_eq!(stub.exec_log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn alias_notice_reaches_the_message() {
        let dir = tempfile::tempdir().unwrap();
        let (stub, _registry, manager, id) = fixture(dir.path()).await;

        stub.push_exec(0, "Successfully installed scikit-learn-1.4.0", "");

        let outcome = manager.install(&id, "sklearn").await.unwrap();
        assert!(outcome.success);
        assert!(outcome.message.contains("'sklearn' is published as 'scikit-learn'"));
    }

    #[tokio::test]
    async fn streaming_install_emits_ordered_events() {
        let dir = tempfile::tempdir().unwrap();
        let (stub, _registry, manager, id) = fixture(dir.path()).await;

        stub.set_spawn_script(
            "printf 'Collecting requests\\n  Downloading requests-2.31.0-py3-none-any.whl\\nInstalling collected packages: requests\\nSuccessfully installed requests-2.31.0\\n'",
        );

        let mut seen = Vec::new();
        let outcome = manager
            .install_streaming(&id, "requests", |event| seen.push(event))
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.log.len(), 4);
        let percents: Vec<u8> = outcome.events.iter().map(|e| e.percent).collect();
        assert_eq!(percents, vec![15, 40, 85, 100]);
        assert!(seen
            .iter()
            .any(|e| matches!(e, InstallEvent::Log(line) if line.contains("Collecting"))));
    }

    #[tokio::test]
    async fn streaming_failure_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let (stub, _registry, manager, id) = fixture(dir.path()).await;

        stub.set_spawn_script(
            "printf 'Collecting numpy\\n' ; printf 'Failed building wheel for numpy\\n' >&2; exit 1",
        );

        let outcome = manager
            .install_streaming(&id, "numpy", |_| {})
            .await
            .unwrap();

        assert!(!outcome.success);
        assert!(outcome.message.contains("Building numpy from source failed"));
    }

    #[tokio::test]
    async fn uninstall_of_absent_package_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (stub, _registry, manager, id) = fixture(dir.path()).await;

        stub.push_exec(0, "WARNING: Skipping weirdpkg as it is not installed.\n", "");

        let outcome = manager.uninstall(&id, "weirdpkg").await.unwrap();
        assert!(outcome.success);
        assert!(outcome.message.contains("not installed"));

        stub.push_exec(0, "Successfully uninstalled requests-2.31.0\n", "");
        let outcome = manager.uninstall(&id, "requests").await.unwrap();
        assert!(outcome.success);
        assert!(outcome.message.contains("Uninstalled 'requests'"));
    }

    #[tokio::test]
    async fn list_sorts_case_insensitively_and_swallows_failures() {
        let dir = tempfile::tempdir().unwrap();
        let (stub, _registry, manager, id) = fixture(dir.path()).await;

        stub.push_exec(
            0,
            r#"[{"name":"requests","version":"2.31.0","summary":"HTTP","homepage":""},{"name":"Flask","version":"3.0.0","summary":"","homepage":""}]"#,
            "",
        );
        let packages = manager.list(&id).await.unwrap();
        assert_eq!(packages.len(), 2);
        assert_eq!(packages[0].name, "Flask");
        assert_eq!(packages[1].name, "requests");

        stub.push_exec(1, "", "python3: not found");
        assert!(manager.list(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn package_operations_refresh_last_used() {
        let dir = tempfile::tempdir().unwrap();
        let (stub, registry, manager, id) = fixture(dir.path()).await;

        stub.push_exec(0, "Successfully installed requests-2.31.0", "");
        let before = registry.get(&id).await.unwrap().last_used_at;
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.install(&id, "requests").await.unwrap();
        let after = registry.get(&id).await.unwrap().last_used_at;
        assert!(after > before);
    }
}
