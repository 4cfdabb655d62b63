use chrono::Utc;
use std::time::Duration;
use tracing::info;

use crate::cli::args::{
    ImageArgs, InitArgs, InstallArgs, OutputFormat, PackagesArgs, PsArgs, ReconcileArgs, RmArgs,
    RunArgs, SandboxOpts, UninstallArgs,
};
use crate::config::loader::get_config_path;
use crate::config::types::PycellConfig;
use crate::error::{PycellError, Result};
use crate::exec::{ExecOptions, OutputKind};
use crate::orchestrator::Orchestrator;
use crate::packages::InstallEvent;
use crate::registry::{Sandbox, CONTAINER_PREFIX};

// ============================================================================
// Code execution
// ============================================================================

/// Execute a snippet in a (possibly fresh) sandbox
pub async fn run(args: RunArgs, config: PycellConfig, format: OutputFormat) -> Result<()> {
    let code = read_code(&args)?;

    let orchestrator = Orchestrator::new(config).await?;
    let sandbox = acquire(&orchestrator, &args.sandbox).await?;

    if let Some(spec) = &args.install {
        let outcome = orchestrator.packages().install(&sandbox.id, spec).await?;
        if !outcome.success {
            release(&orchestrator, &args.sandbox).await;
            return Err(PycellError::SandboxExecution(outcome.message));
        }
        info!(message = %outcome.message, "Pre-install finished");
    }

    let opts = ExecOptions {
        timeout: args.timeout_ms.map(Duration::from_millis),
        correlation_id: args.correlation_id.clone(),
    };
    let result = orchestrator.engine().execute(&sandbox.id, &code, opts).await?;

    match format {
        OutputFormat::Text => {
            for output in &result.outputs {
                match output.kind {
                    OutputKind::Error => eprint!("{}", ensure_newline(&output.content)),
                    _ => print!("{}", ensure_newline(&output.content)),
                }
            }
            println!("status: {} ({} ms)", status_label(&result), result.elapsed_ms);
        }
        OutputFormat::Json => {
            let mut value = serde_json::to_value(&result)?;
            if let Some(map) = value.as_object_mut() {
                map.insert(
                    "finished_at".to_string(),
                    serde_json::Value::String(Utc::now().to_rfc3339()),
                );
                map.insert(
                    "sandbox".to_string(),
                    serde_json::Value::String(sandbox.id.clone()),
                );
            }
            println!("{value}");
        }
    }

    release(&orchestrator, &args.sandbox).await;
    Ok(())
}

fn read_code(args: &RunArgs) -> Result<String> {
    if let Some(code) = &args.code {
        return Ok(code.clone());
    }
    if let Some(file) = &args.file {
        return Ok(std::fs::read_to_string(file)?);
    }
    // No file and no snippet: read from stdin
    use std::io::Read;
    let mut code = String::new();
    std::io::stdin().read_to_string(&mut code)?;
    Ok(code)
}

fn status_label(result: &crate::exec::ExecutionResult) -> &'static str {
    match result.status {
        crate::exec::ExecStatus::Success => "success",
        crate::exec::ExecStatus::Error => "error",
        crate::exec::ExecStatus::Timeout => "timeout",
    }
}

fn ensure_newline(content: &str) -> String {
    if content.ends_with('\n') {
        content.to_string()
    } else {
        format!("{content}\n")
    }
}

// ============================================================================
// Package commands
// ============================================================================

/// Install packages into a sandbox
pub async fn install(args: InstallArgs, config: PycellConfig, format: OutputFormat) -> Result<()> {
    let orchestrator = Orchestrator::new(config).await?;
    let sandbox = acquire(&orchestrator, &args.sandbox).await?;

    let outcome = if args.stream {
        let text = format == OutputFormat::Text;
        orchestrator
            .packages()
            .install_streaming(&sandbox.id, &args.spec, |event| {
                if text {
                    match event {
                        InstallEvent::Progress(progress) => {
                            eprintln!("[{:3}%] {}", progress.percent, progress.stage)
                        }
                        InstallEvent::Log(line) => eprintln!("  {line}"),
                    }
                }
            })
            .await?
    } else {
        orchestrator.packages().install(&sandbox.id, &args.spec).await?
    };

    match format {
        OutputFormat::Text => println!("{}", outcome.message),
        OutputFormat::Json => println!("{}", serde_json::to_string(&outcome)?),
    }

    release(&orchestrator, &args.sandbox).await;
    Ok(())
}

/// Uninstall a package from a sandbox
pub async fn uninstall(
    args: UninstallArgs,
    config: PycellConfig,
    format: OutputFormat,
) -> Result<()> {
    let orchestrator = Orchestrator::new(config).await?;
    let sandbox = acquire(&orchestrator, &args.sandbox).await?;

    let outcome = orchestrator.packages().uninstall(&sandbox.id, &args.name).await?;

    match format {
        OutputFormat::Text => println!("{}", outcome.message),
        OutputFormat::Json => println!("{}", serde_json::to_string(&outcome)?),
    }

    release(&orchestrator, &args.sandbox).await;
    Ok(())
}

/// List installed packages
pub async fn packages(
    args: PackagesArgs,
    config: PycellConfig,
    format: OutputFormat,
) -> Result<()> {
    let orchestrator = Orchestrator::new(config).await?;
    let sandbox = acquire(&orchestrator, &args.sandbox).await?;

    let packages = orchestrator.packages().list(&sandbox.id).await?;

    match format {
        OutputFormat::Text => {
            for package in &packages {
                println!("{} {}  {}", package.name, package.version, package.summary);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string(&packages)?),
    }

    release(&orchestrator, &args.sandbox).await;
    Ok(())
}

// ============================================================================
// Runtime maintenance
// ============================================================================

/// List sandbox containers known to the runtime
pub async fn ps(_args: PsArgs, config: PycellConfig, format: OutputFormat) -> Result<()> {
    let orchestrator = Orchestrator::new(config).await?;
    let containers = orchestrator.runtime().list_containers(CONTAINER_PREFIX).await?;

    match format {
        OutputFormat::Text => {
            for container in &containers {
                println!("{container}");
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "containers": containers }))
        }
    }
    Ok(())
}

/// Force-remove sandbox containers
pub async fn rm(args: RmArgs, config: PycellConfig, format: OutputFormat) -> Result<()> {
    let orchestrator = Orchestrator::new(config).await?;

    let targets = if args.all {
        orchestrator.runtime().list_containers(CONTAINER_PREFIX).await?
    } else {
        args.containers.clone()
    };

    let mut removed = Vec::new();
    for container in &targets {
        orchestrator.runtime().remove_container(container).await?;
        removed.push(container.clone());
    }

    match format {
        OutputFormat::Text => println!("Removed {} container(s)", removed.len()),
        OutputFormat::Json => println!("{}", serde_json::json!({ "removed": removed })),
    }
    Ok(())
}

/// Ensure the runtime image for an interpreter version exists
pub async fn image(args: ImageArgs, config: PycellConfig, format: OutputFormat) -> Result<()> {
    let orchestrator = Orchestrator::new(config).await?;
    let tag = orchestrator.ensure_image(&args.version).await?;

    match format {
        OutputFormat::Text => println!("{tag}"),
        OutputFormat::Json => println!("{}", serde_json::json!({ "tag": tag })),
    }
    Ok(())
}

/// Destroy sandboxes and workspaces left behind by a previous run
pub async fn reconcile(
    _args: ReconcileArgs,
    config: PycellConfig,
    format: OutputFormat,
) -> Result<()> {
    let orchestrator = Orchestrator::new(config).await?;
    let report = orchestrator.reconcile().await;

    match format {
        OutputFormat::Text => println!(
            "Removed {} container(s), {} workspace(s)",
            report.containers_removed, report.workspaces_removed
        ),
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "containers_removed": report.containers_removed,
                "workspaces_removed": report.workspaces_removed,
            })
        ),
    }
    Ok(())
}

/// Write a default configuration file
pub async fn init(args: InitArgs) -> Result<()> {
    let path = get_config_path();
    if path.exists() && !args.force {
        return Err(PycellError::Config(format!(
            "Configuration already exists at {} (use --force to overwrite)",
            path.display()
        )));
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let config = PycellConfig::default();
    let rendered = toml::to_string_pretty(&config)
        .map_err(|e| PycellError::Config(format!("Failed to render configuration: {e}")))?;
    tokio::fs::write(&path, rendered).await?;

    println!("Wrote {}", path.display());
    Ok(())
}

// ============================================================================
// Shared helpers
// ============================================================================

async fn acquire(orchestrator: &Orchestrator, opts: &SandboxOpts) -> Result<Sandbox> {
    let sandbox = orchestrator
        .registry()
        .get_or_create(&opts.project, &opts.python)
        .await?;
    info!(id = %sandbox.id, project = %opts.project, python = %opts.python, "Sandbox ready");
    Ok(sandbox)
}

/// Destroy the sandbox unless the user asked to keep it.
async fn release(orchestrator: &Orchestrator, opts: &SandboxOpts) {
    if opts.keep {
        for sandbox in orchestrator.registry().list().await {
            eprintln!("sandbox kept: {} ({})", sandbox.id, sandbox.external_id);
        }
    } else {
        orchestrator.shutdown().await;
    }
}
