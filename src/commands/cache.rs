/// `ifcache cache` command implementation
///
/// Manages result store entries (list, show, invalidate, clean, stats).
use anyhow::{bail, Context, Result};
use chrono::Utc;

use ifcache::fingerprint::Fingerprint;
use ifcache::store::{EntryState, FilesystemResultStore, ResultStore};

use crate::cli::{CacheArgs, CacheCommands};
use crate::cli_utils::ifcache_prefix;
use crate::commands::Session;

pub fn cache(session: Session, args: CacheArgs) -> Result<()> {
    let store = session.open_store()?;

    match args.command {
        CacheCommands::List { verbose } => list(&store, verbose),
        CacheCommands::Show { fingerprint } => show(&store, &parse_fingerprint(&fingerprint)?),
        CacheCommands::Invalidate { fingerprint } => {
            invalidate(&store, &parse_fingerprint(&fingerprint)?)
        }
        CacheCommands::Clean { all } => clean(&store, all),
        CacheCommands::Stats => stats(&store),
    }
}

fn parse_fingerprint(value: &str) -> Result<Fingerprint> {
    value
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))
}

/// List all entries
fn list(store: &FilesystemResultStore, verbose: bool) -> Result<()> {
    let fingerprints = store.list()?;

    if fingerprints.is_empty() {
        println!("No cache entries found");
        return Ok(());
    }

    let stale_after = store.options().stale_after;
    let now = Utc::now();

    for fingerprint in &fingerprints {
        let (status, detail) = match store.entry(fingerprint)? {
            Some(entry) => (
                entry.status().to_string(),
                format!(
                    "{}  {}",
                    entry.implementation,
                    entry.created_at.format("%Y-%m-%d %H:%M:%S")
                ),
            ),
            None => match store.reservation(fingerprint)? {
                Some(reservation) if reservation.is_stale(stale_after, now) => (
                    "stale".to_string(),
                    format!("{}  owner {}", reservation.token.implementation, reservation.owner),
                ),
                Some(reservation) => (
                    "running".to_string(),
                    format!("{}  owner {}", reservation.token.implementation, reservation.owner),
                ),
                None => ("incomplete".to_string(), String::new()),
            },
        };

        if verbose {
            println!("{}  {:<10}  {}", fingerprint, status, detail);
        } else {
            println!("{}  {}", fingerprint.short(), status);
        }
    }

    println!();
    println!("Total: {} entries", fingerprints.len());

    Ok(())
}

/// Show one entry
fn show(store: &FilesystemResultStore, fingerprint: &Fingerprint) -> Result<()> {
    let entry = match store.entry(fingerprint)? {
        Some(entry) => entry,
        None => match store.reservation(fingerprint)? {
            Some(reservation) => {
                println!("Fingerprint: {}", fingerprint);
                println!("Status: running");
                println!("Implementation: {}", reservation.token.implementation);
                println!("Owner: {}", reservation.owner);
                println!(
                    "Heartbeat: {}",
                    reservation.heartbeat_at.format("%Y-%m-%d %H:%M:%S")
                );
                return Ok(());
            }
            None => bail!("No cache entry for {}", fingerprint),
        },
    };

    println!("Fingerprint: {}", entry.fingerprint);
    println!("Status: {}", entry.status());
    println!("Implementation: {}", entry.implementation);
    println!("Created: {}", entry.created_at.format("%Y-%m-%d %H:%M:%S"));

    if let Some(provenance) = &entry.provenance {
        println!("Host: {} ({})", provenance.hostname, provenance.platform);
        println!("Duration: {:.2}s", provenance.duration_ms as f64 / 1000.0);
        if let Some(dir) = &provenance.working_dir {
            println!("Working directory: {}", dir.display());
        }
    }

    match &entry.state {
        EntryState::Success(outputs) => {
            println!("Outputs:");
            for (name, value) in outputs.iter() {
                println!("  {} = {}", name, serde_json::to_string(value)?);
            }
        }
        EntryState::Failed(failure) => {
            println!("Failure: {}", failure);
            for line in &failure.details {
                println!("  {}", line);
            }
        }
        EntryState::Running(_) => {}
    }

    Ok(())
}

fn invalidate(store: &FilesystemResultStore, fingerprint: &Fingerprint) -> Result<()> {
    if store.invalidate(fingerprint)? {
        eprintln!("{} Invalidated {}", ifcache_prefix(), fingerprint.short());
    } else {
        eprintln!("{} No cache entry for {}", ifcache_prefix(), fingerprint.short());
    }
    Ok(())
}

/// Remove all entries
fn clean(store: &FilesystemResultStore, all: bool) -> Result<()> {
    if !all {
        bail!("Refusing to remove every entry without --all");
    }

    let count = store.list()?.len();
    store
        .clean_all()
        .with_context(|| format!("Failed to clean store: {}", store.root().display()))?;
    eprintln!("{} Removed {} cache entries", ifcache_prefix(), count);

    Ok(())
}

/// Show cache statistics
fn stats(store: &FilesystemResultStore) -> Result<()> {
    let stats = store.stats()?;

    println!("Cache Statistics");
    println!("================");
    println!();
    println!("Store: {}", stats.root.display());
    println!("Total entries: {}", stats.total_entries);
    println!("  success: {}", stats.success);
    println!("  failed: {}", stats.failed);
    println!("  running: {}", stats.running);
    println!("  stale reservations: {}", stats.stale_reservations);
    println!(
        "Total size: {:.2} MB",
        stats.total_bytes as f64 / 1_048_576.0
    );

    Ok(())
}
