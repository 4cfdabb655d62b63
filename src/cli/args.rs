use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "pycell")]
#[clap(version, about = "Sandboxed Python code execution orchestrator")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "PYCELL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a Python snippet in a sandbox
    Run(RunArgs),

    /// Install packages into a sandbox
    Install(InstallArgs),

    /// Uninstall a package from a sandbox
    Uninstall(UninstallArgs),

    /// List packages installed in a sandbox
    Packages(PackagesArgs),

    /// List sandbox containers known to the runtime
    Ps(PsArgs),

    /// Force-remove sandbox containers
    Rm(RmArgs),

    /// Ensure the runtime image for an interpreter version exists
    Image(ImageArgs),

    /// Destroy sandboxes and workspaces left behind by a previous run
    Reconcile(ReconcileArgs),

    /// Initialize a new pycell configuration
    Init(InitArgs),
}

// ============================================================================
// Sandbox selection shared by code/package commands
// ============================================================================

#[derive(Args, Debug)]
pub struct SandboxOpts {
    /// Project the sandbox belongs to (reuse key, together with --python)
    #[clap(long, default_value = "default")]
    pub project: String,

    /// Interpreter version for the sandbox image
    #[clap(long, default_value = "3.11")]
    pub python: String,

    /// Leave the sandbox container running afterwards instead of
    /// destroying it
    #[clap(long)]
    pub keep: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Python file to execute (reads stdin when omitted and -c is unset)
    pub file: Option<PathBuf>,

    /// Inline code snippet to execute
    #[clap(short = 'c', long = "code", conflicts_with = "file")]
    pub code: Option<String>,

    /// Packages to install before executing
    #[clap(long)]
    pub install: Option<String>,

    /// Execution timeout in milliseconds (overrides configuration)
    #[clap(long)]
    pub timeout_ms: Option<u64>,

    /// Correlation id namespacing this execution's transient files
    #[clap(long)]
    pub correlation_id: Option<String>,

    #[clap(flatten)]
    pub sandbox: SandboxOpts,
}

#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Packages to install (comma/space separated requirement specs)
    pub spec: String,

    /// Stream install progress instead of waiting for completion
    #[clap(long)]
    pub stream: bool,

    #[clap(flatten)]
    pub sandbox: SandboxOpts,
}

#[derive(Args, Debug)]
pub struct UninstallArgs {
    /// Package name
    pub name: String,

    #[clap(flatten)]
    pub sandbox: SandboxOpts,
}

#[derive(Args, Debug)]
pub struct PackagesArgs {
    #[clap(flatten)]
    pub sandbox: SandboxOpts,
}

#[derive(Args, Debug)]
pub struct PsArgs {}

#[derive(Args, Debug)]
pub struct RmArgs {
    /// Container ids to remove
    #[clap(required_unless_present = "all")]
    pub containers: Vec<String>,

    /// Remove every sandbox container
    #[clap(long, conflicts_with = "containers")]
    pub all: bool,
}

#[derive(Args, Debug)]
pub struct ImageArgs {
    /// Interpreter version (e.g. 3.11)
    pub version: String,
}

#[derive(Args, Debug)]
pub struct ReconcileArgs {}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing configuration file
    #[clap(long)]
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
