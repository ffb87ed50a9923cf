/// `ifcache inspect` command implementation
use anyhow::Result;
use serde_json::json;

use ifcache::builtin::builtin_registry;
use ifcache::export::StateExporter;
use ifcache::store::ResultStore;

use crate::cli::InspectArgs;
use crate::commands::Session;

pub fn run(session: Session, args: InspectArgs) -> Result<()> {
    let exporter = StateExporter::default();
    let exported = exporter.read(&args.artifact)?;

    // Reported, not enforced
    let integrity = exporter
        .import(&exported, &builtin_registry())
        .and_then(|unit| exporter.verify(&exported, &unit))
        .map(|_| "ok".to_string())
        .unwrap_or_else(|e| e.to_string());

    let store = session.open_store()?;
    let status = match store.lookup(&exported.fingerprint, &exported.implementation.version)? {
        Some(entry) => entry.status().to_string(),
        None => "absent".to_string(),
    };

    if args.json {
        let document = json!({
            "implementation": exported.implementation.to_string(),
            "fingerprint": exported.fingerprint,
            "hash_method": exported.hash_method,
            "inputs": exported.inputs,
            "environment": exported.environment,
            "integrity": integrity,
            "cache_status": status,
        });
        println!("{}", serde_json::to_string_pretty(&document)?);
        return Ok(());
    }

    println!("Implementation: {}", exported.implementation);
    println!("Fingerprint: {}", exported.fingerprint);
    println!("Hash method: {:?}", exported.hash_method);
    println!(
        "Exported: {} on {} ({})",
        exported.environment.created_at.format("%Y-%m-%d %H:%M:%S"),
        exported.environment.hostname,
        exported.environment.platform
    );
    println!("Inputs:");
    for input in &exported.inputs {
        let marker = if input.canonical.is_some() { "" } else { " (not hashed)" };
        println!("  {} = {}{}", input.name, serde_json::to_string(&input.value)?, marker);
    }
    println!("Integrity: {}", integrity);
    println!("Cache status: {}", status);

    Ok(())
}
