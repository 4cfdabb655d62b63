use clap::Parser;

use pycell::cli::args::{Cli, Commands};
use pycell::cli::commands;
use pycell::config::loader::load_config;
use pycell::error::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.global_opts.verbose);

    // Load configuration (file + CLI overrides)
    let config = load_config(cli.global_opts.config.as_deref())?;
    let format = cli.global_opts.format.clone();

    // Dispatch to subcommand handler
    match cli.command {
        Commands::Run(args) => {
            commands::run(args, config, format).await?;
        }
        Commands::Install(args) => {
            commands::install(args, config, format).await?;
        }
        Commands::Uninstall(args) => {
            commands::uninstall(args, config, format).await?;
        }
        Commands::Packages(args) => {
            commands::packages(args, config, format).await?;
        }
        Commands::Ps(args) => {
            commands::ps(args, config, format).await?;
        }
        Commands::Rm(args) => {
            commands::rm(args, config, format).await?;
        }
        Commands::Image(args) => {
            commands::image(args, config, format).await?;
        }
        Commands::Reconcile(args) => {
            commands::reconcile(args, config, format).await?;
        }
        Commands::Init(args) => {
            commands::init(args).await?;
        }
    }

    Ok(())
}

fn init_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
