//! Scripted in-process runtime used by unit tests in place of a real
//! container daemon.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{PycellError, Result};
use crate::runtime::{CommandResult, ContainerRuntime, ContainerSpec, ImageBuildSpec};

pub(crate) struct StubRuntime {
    pub image_present: AtomicBool,
    pub build_count: AtomicUsize,
    pub build_delay_ms: u64,
    pub fail_build: bool,
    pub fail_start: bool,
    pub started: Mutex<Vec<ContainerSpec>>,
    pub removed: Mutex<Vec<String>>,
    pub listed: Mutex<Vec<String>>,
    pub exec_log: Mutex<Vec<Vec<String>>>,
    pub exec_results: Mutex<VecDeque<CommandResult>>,
    /// Shell script run locally in place of the next spawned exec
    pub spawn_script: Mutex<Option<String>>,
    pub next_id: AtomicUsize,
}

impl Default for StubRuntime {
    fn default() -> Self {
        Self {
            image_present: AtomicBool::new(true),
            build_count: AtomicUsize::new(0),
            build_delay_ms: 0,
            fail_build: false,
            fail_start: false,
            started: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            listed: Mutex::new(Vec::new()),
            exec_log: Mutex::new(Vec::new()),
            exec_results: Mutex::new(VecDeque::new()),
            spawn_script: Mutex::new(None),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl StubRuntime {
    pub fn push_exec(&self, exit_code: i32, stdout: &str, stderr: &str) {
        self.exec_results.lock().unwrap().push_back(CommandResult {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code,
        });
    }

    pub fn set_spawn_script(&self, script: &str) {
        *self.spawn_script.lock().unwrap() = Some(script.to_string());
    }
}

#[async_trait]
impl ContainerRuntime for StubRuntime {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn image_exists(&self, _tag: &str) -> bool {
        self.image_present.load(Ordering::SeqCst)
    }

    async fn build_image(&self, spec: &ImageBuildSpec) -> Result<()> {
        self.build_count.fetch_add(1, Ordering::SeqCst);
        if self.build_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.build_delay_ms)).await;
        }
        if self.fail_build {
            return Err(PycellError::BuildFailed {
                tag: spec.tag.clone(),
                message: "scripted build failure".to_string(),
            });
        }
        self.image_present.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<String> {
        if self.fail_start {
            return Err(PycellError::SandboxCreateFailed(
                "scripted start failure".to_string(),
            ));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().push(spec.clone());
        Ok(format!("stub-{n}"))
    }

    async fn exec(&self, _container_id: &str, argv: &[String]) -> Result<CommandResult> {
        self.exec_log.lock().unwrap().push(argv.to_vec());
        let scripted = self.exec_results.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or(CommandResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        }))
    }

    fn exec_spawn(&self, _container_id: &str, argv: &[String]) -> Result<tokio::process::Child> {
        self.exec_log.lock().unwrap().push(argv.to_vec());
        let script = self
            .spawn_script
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "exit 0".to_string());

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c");
        cmd.arg(script);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd.spawn()
            .map_err(|e| PycellError::SandboxExecution(format!("Failed to spawn stub exec: {e}")))
    }

    async fn list_containers(&self, _name_prefix: &str) -> Result<Vec<String>> {
        Ok(self.listed.lock().unwrap().clone())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.removed.lock().unwrap().push(container_id.to_string());
        Ok(())
    }
}
