mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => commands::version::run()?,
        Commands::Check { reflexion_url } => commands::check::run(reflexion_url).await?,
        Commands::Watch {
            namespace,
            reflexion_url,
            executor_addr,
            interval,
            workers,
            dry_run,
        } => {
            commands::watch::run(
                namespace,
                reflexion_url,
                executor_addr,
                interval,
                workers,
                dry_run,
            )
            .await?
        }
        Commands::Serve {
            addr,
            db_path,
            llm_base_url,
            llm_api_key,
            llm_model,
            diagnostic_bin,
            no_seed,
        } => {
            commands::serve::run(
                addr,
                db_path,
                llm_base_url,
                llm_api_key,
                llm_model,
                diagnostic_bin,
                no_seed,
            )
            .await?
        }
        Commands::Memory {
            reflexion_url,
            action,
        } => commands::memory::run(reflexion_url, action).await?,
    }

    Ok(())
}
