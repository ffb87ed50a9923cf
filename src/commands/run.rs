/// `ifcache run` command implementation
///
/// Re-hydrates an exported unit of work with the builtin registry and runs it
/// through the cache-aware executor.
use anyhow::{Context, Result};
use std::sync::Arc;

use ifcache::builtin::builtin_registry;
use ifcache::executor::{CacheAwareExecutor, RunOptions, RunOutcome};
use ifcache::export::StateExporter;

use crate::cli::RunArgs;
use crate::cli_utils::ifcache_prefix;
use crate::commands::Session;

pub async fn run(session: Session, args: RunArgs) -> Result<()> {
    tokio::task::spawn_blocking(move || execute(session, &args))
        .await
        .context("run task failed")?
}

fn execute(mut session: Session, args: &RunArgs) -> Result<()> {
    if args.isolated {
        session.config.execution.mode = "isolated".to_string();
    }

    let executor = CacheAwareExecutor::from_config(
        &session.config,
        &session.store_dir,
        Arc::new(builtin_registry()),
        session.config_path.clone(),
    )?;

    let exporter = StateExporter::default();
    let exported = exporter.read(&args.artifact)?;
    let unit = exporter.import(&exported, executor.registry())?;
    exporter
        .verify(&exported, &unit)
        .with_context(|| format!("Artifact failed verification: {}", args.artifact.display()))?;

    let outcome = executor
        .run_with(
            &unit,
            RunOptions {
                cache: !args.no_cache,
                force: args.force,
                allow_redundant: args.allow_redundant,
            },
        )
        .with_context(|| format!("Failed to run {}", unit.implementation()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome.resolved_outputs())?);
    } else {
        print_outcome(&outcome)?;
    }

    Ok(())
}

fn print_outcome(outcome: &RunOutcome) -> Result<()> {
    let source = match (&outcome.fingerprint, outcome.cache_hit) {
        (None, _) => "executed (uncached)",
        (Some(_), true) => "cache hit",
        (Some(_), false) => "executed",
    };
    eprintln!("{} {}", ifcache_prefix(), source);

    if let Some(fingerprint) = &outcome.fingerprint {
        println!("Fingerprint: {}", fingerprint);
    }
    if let Some(dir) = &outcome.working_dir {
        println!("Working directory: {}", dir.display());
    }

    println!("Outputs:");
    for (name, value) in outcome.resolved_outputs().iter() {
        println!("  {} = {}", name, serde_json::to_string(value)?);
    }

    Ok(())
}
