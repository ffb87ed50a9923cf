/// `ifcache export` command implementation
use anyhow::{Context, Result};

use ifcache::builtin::builtin_registry;
use ifcache::export::StateExporter;
use ifcache::fingerprint::Fingerprinter;
use ifcache::unit::Inputs;

use crate::cli::ExportArgs;
use crate::cli_utils::ifcache_prefix;
use crate::commands::Session;

pub fn run(session: Session, args: ExportArgs) -> Result<()> {
    let mut inputs = Inputs::new();
    inputs.load_json(&args.inputs, true)?;

    let unit = builtin_registry()
        .instantiate(&args.implementation, inputs)
        .with_context(|| format!("Failed to build unit of work for {}", args.implementation))?;

    let exporter = StateExporter::new(Fingerprinter::new(session.config.hash_method()?))
        .with_env_passthrough(session.config.execution.env.clone());
    let exported = exporter.export(&unit)?;
    exporter.write(&exported, &args.output)?;

    eprintln!(
        "{} Exported {} to {}",
        ifcache_prefix(),
        exported.implementation,
        args.output.display()
    );
    println!("{}", exported.fingerprint);

    Ok(())
}
