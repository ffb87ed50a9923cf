//! Exported state: everything needed to re-run a unit of work elsewhere
//!
//! An artifact is a self-describing JSON document. It names the
//! implementation, carries every defined input in portable form next to its
//! canonical form, and records the fingerprint the exporting side computed so
//! the importing side can prove it rebuilt the same unit of work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::atomic::write_atomic;
use crate::error::{EngineError, Result};
use crate::fingerprint::{self, Fingerprint, Fingerprinter, HashMethod};
use crate::logging::{operations, services, status};
use crate::store::{hostname_string, platform_string};
use crate::unit::{ImplementationId, ImplementationRegistry, Inputs, UnitOfWork, Value};

pub const FORMAT: &str = "ifcache.exported-state";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedInput {
    pub name: String,
    pub value: Value,
    /// Canonical form used for the fingerprint; absent for `nohash` fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub hostname: String,
    pub platform: String,
    /// Variables passed through to the execution
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory the unit should run in; the runner picks one if unset
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedState {
    pub format: String,
    pub format_version: u32,
    pub implementation: ImplementationId,
    pub fingerprint: Fingerprint,
    pub hash_method: HashMethod,
    pub inputs: Vec<ExportedInput>,
    pub environment: EnvironmentSnapshot,
}

impl ExportedState {
    pub fn inputs(&self) -> Inputs {
        self.inputs
            .iter()
            .map(|input| (input.name.clone(), input.value.clone()))
            .collect()
    }
}

/// Captures, writes, reads and re-hydrates exported state
#[derive(Debug, Clone, Default)]
pub struct StateExporter {
    fingerprinter: Fingerprinter,
    env_passthrough: Vec<String>,
}

impl StateExporter {
    pub fn new(fingerprinter: Fingerprinter) -> Self {
        Self {
            fingerprinter,
            env_passthrough: Vec::new(),
        }
    }

    /// Capture these process environment variables into every artifact
    pub fn with_env_passthrough(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.env_passthrough = names.into_iter().collect();
        self
    }

    /// Capture `unit` without modifying it
    pub fn export(&self, unit: &UnitOfWork) -> Result<ExportedState> {
        for (name, value) in unit.inputs().iter() {
            check_portable(name, value)?;
        }

        let canonical = self.fingerprinter.canonicalize(unit)?;
        let fingerprint = fingerprint::digest(unit.implementation(), &canonical);
        let cwd = std::env::current_dir().ok();

        let inputs = unit
            .inputs()
            .iter()
            .map(|(name, value)| {
                // Content-hashed files keep their fingerprint when made absolute
                let value = match &cwd {
                    Some(cwd) if unit.schema().hashes_file_content(name) => absolutize(value, cwd),
                    _ => value.clone(),
                };
                ExportedInput {
                    name: name.clone(),
                    value,
                    canonical: canonical.get(name).cloned(),
                }
            })
            .collect();

        let env = self
            .env_passthrough
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.clone(), v)))
            .collect();

        debug!(
            service = services::EXPORT,
            operation = operations::EXPORT,
            implementation = %unit.implementation(),
            fingerprint = %fingerprint,
            "exported unit of work"
        );

        Ok(ExportedState {
            format: FORMAT.to_string(),
            format_version: FORMAT_VERSION,
            implementation: unit.implementation().clone(),
            fingerprint,
            hash_method: self.fingerprinter.method(),
            inputs,
            environment: EnvironmentSnapshot {
                hostname: hostname_string(),
                platform: platform_string(),
                env,
                working_dir: None,
                created_at: Utc::now(),
            },
        })
    }

    /// Write atomically; on failure nothing appears at `destination`
    pub fn write(&self, exported: &ExportedState, destination: &Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(exported)?;
        write_atomic(destination, &bytes)
            .map_err(|e| EngineError::store("write artifact", destination, e))?;

        info!(
            service = services::EXPORT,
            operation = operations::EXPORT,
            status = status::SUCCESS,
            fingerprint = %exported.fingerprint,
            path = %destination.display(),
            "wrote artifact"
        );
        Ok(())
    }

    pub fn read(&self, path: &Path) -> Result<ExportedState> {
        let bytes = fs::read(path).map_err(|e| EngineError::store("read artifact", path, e))?;

        let document: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| EngineError::InvalidArtifact {
                path: path.to_path_buf(),
                reason: format!("not JSON: {}", e),
            })?;

        let format = document.get("format").and_then(|v| v.as_str());
        if format != Some(FORMAT) {
            return Err(EngineError::InvalidArtifact {
                path: path.to_path_buf(),
                reason: format!("expected format '{}', found {:?}", FORMAT, format),
            });
        }

        let version = document.get("format_version").and_then(|v| v.as_u64());
        if version != Some(u64::from(FORMAT_VERSION)) {
            return Err(EngineError::InvalidArtifact {
                path: path.to_path_buf(),
                reason: format!(
                    "unsupported format_version {:?} (supported: {})",
                    version, FORMAT_VERSION
                ),
            });
        }

        serde_json::from_value(document).map_err(|e| EngineError::InvalidArtifact {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Rebuild the unit of work using only the artifact and the registry
    pub fn import(
        &self,
        exported: &ExportedState,
        registry: &ImplementationRegistry,
    ) -> Result<UnitOfWork> {
        let unit = registry.rehydrate(exported.implementation.clone(), exported.inputs())?;

        debug!(
            service = services::EXPORT,
            operation = operations::IMPORT,
            implementation = %exported.implementation,
            fingerprint = %exported.fingerprint,
            "imported unit of work"
        );
        Ok(unit)
    }

    /// Recompute the fingerprint of an imported unit with the artifact's hash
    /// method and compare it to the one the artifact declares
    pub fn verify(&self, exported: &ExportedState, unit: &UnitOfWork) -> Result<Fingerprint> {
        let actual = Fingerprinter::new(exported.hash_method).fingerprint(unit)?;
        if actual != exported.fingerprint {
            return Err(EngineError::Integrity {
                expected: exported.fingerprint.clone(),
                actual,
            });
        }
        Ok(actual)
    }
}

fn check_portable(name: &str, value: &Value) -> Result<()> {
    match value {
        Value::Stream(description) => Err(EngineError::UnserializableState {
            name: name.to_string(),
            reason: format!("stream '{}' cannot be captured", description),
        }),
        Value::Sequence(items) => items.iter().try_for_each(|v| check_portable(name, v)),
        Value::Mapping(map) => map.values().try_for_each(|v| check_portable(name, v)),
        _ => Ok(()),
    }
}

fn absolutize(value: &Value, cwd: &Path) -> Value {
    match value {
        Value::File(path) if path.is_relative() => Value::File(cwd.join(path)),
        Value::Sequence(items) => Value::Sequence(items.iter().map(|v| absolutize(v, cwd)).collect()),
        Value::Mapping(map) => Value::Mapping(
            map.iter()
                .map(|(k, v)| (k.clone(), absolutize(v, cwd)))
                .collect(),
        ),
        other => other.clone(),
    }
}
