use anyhow::Result;
use std::path::PathBuf;
use tracing::info;

use ifcache::config::EngineConfig;
use ifcache::config_discovery::load_config_with_discovery;

use crate::cli::ConfigCommands;
use crate::commands::Session;

pub fn run(session: Result<Session>, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Example => example(),
        ConfigCommands::Validate { path } => validate(session, path),
        ConfigCommands::Show => show(session?),
    }
}

fn example() -> Result<()> {
    println!("{}", EngineConfig::example()?);
    Ok(())
}

fn validate(session: Result<Session>, path: Option<PathBuf>) -> Result<()> {
    let (config, path) = match path {
        Some(path) => (load_config_with_discovery(Some(&path))?, Some(path)),
        None => {
            let session = session?;
            (session.config, session.config_path)
        }
    };

    let Some(path) = path else {
        println!("No configuration file found, defaults apply");
        return Ok(());
    };
    info!("Validated config file: {}", path.display());

    println!("✓ Configuration file is valid: {}", path.display());
    println!("\nSummary:");
    println!(
        "  - Store directory: {}",
        config.store_dir(None).display()
    );
    println!("  - Stale after: {}", config.store.stale_after);
    println!("  - Execution mode: {}", config.execution.mode);
    println!("  - On running: {}", config.execution.on_running);
    println!("  - Hash method: {}", config.hashing.method);

    Ok(())
}

fn show(session: Session) -> Result<()> {
    info!("Showing effective configuration");

    match &session.config_path {
        Some(path) => println!("# Loaded from {}", path.display()),
        None => println!("# No configuration file found, defaults apply"),
    }
    println!("# Store directory: {}\n", session.store_dir.display());
    println!("{}", toml::to_string_pretty(&session.config)?);

    Ok(())
}
