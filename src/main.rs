mod cli;
mod cli_utils;
mod commands;

use anyhow::Result;
use clap::Parser;

use ifcache::logging::{self, LogFormat};

use cli::{Cli, Commands};
use commands::Session;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Configuration decides the log level, so it is resolved first; a broken
    // configuration is reported by the command itself
    let session = Session::load(&cli.common);
    let (level, format) = match &session {
        Ok(session) => (
            session.config.observability.log_level.clone(),
            LogFormat::resolve(session.config.observability.log_format.as_deref()),
        ),
        Err(_) => ("info".to_string(), LogFormat::resolve(None)),
    };

    // Initialize structured logging
    logging::init(&level, format);

    // Dispatch to appropriate command handler
    match cli.command {
        Commands::Runner(args) => commands::runner::run(session, args).await,
        Commands::Run(args) => commands::run::run(session?, args).await,
        Commands::Export(args) => commands::export::run(session?, args),
        Commands::Inspect(args) => commands::inspect::run(session?, args),
        Commands::Cache(args) => commands::cache::cache(session?, args),
        Commands::Config(args) => commands::config::run(session, args.command),
    }
}
