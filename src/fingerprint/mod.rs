//! Fingerprints for units of work
//!
//! A fingerprint is the SHA-256 of a canonical document built from:
//! - the implementation identifier (name and version)
//! - every defined, hashed input, sorted by name, in canonical form
//!
//! Undefined inputs and `nohash` fields take no part in it.

pub mod canonical;
pub mod files;

pub use canonical::CanonicalInputs;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::error::Result;
use crate::logging::{operations, services};
use crate::unit::{ImplementationId, UnitOfWork};
use canonical::canonical_value;

/// Version of the canonical document layout; part of every digest
const CANONICAL_FORMAT: u32 = 1;

/// How file-reference inputs are digested
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashMethod {
    /// SHA-256 of the file content
    #[default]
    Content,
    /// Modification time and size; cheaper, but copies may not match
    Timestamp,
}

impl FromStr for HashMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "content" => Ok(HashMethod::Content),
            "timestamp" => Ok(HashMethod::Timestamp),
            other => Err(format!("unknown hash method '{}': use content or timestamp", other)),
        }
    }
}

/// 64 lowercase hex characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: &str) -> Option<Self> {
        let valid = hex.len() == 64
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        valid.then(|| Fingerprint(hex.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 16 characters, for display
    pub fn short(&self) -> &str {
        &self.0[..16]
    }

    /// Two-character prefix used to shard store directories
    pub fn shard(&self) -> &str {
        &self.0[..2]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Fingerprint::from_hex(s).ok_or_else(|| format!("invalid fingerprint: {}", s))
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.0
    }
}

/// Computes fingerprints; pure apart from reading input files
#[derive(Debug, Clone, Copy, Default)]
pub struct Fingerprinter {
    method: HashMethod,
}

impl Fingerprinter {
    pub fn new(method: HashMethod) -> Self {
        Self { method }
    }

    pub fn method(&self) -> HashMethod {
        self.method
    }

    /// Canonical form of every hashed input of `unit`
    pub fn canonicalize(&self, unit: &UnitOfWork) -> Result<CanonicalInputs> {
        let schema = unit.schema();
        let mut canonical = CanonicalInputs::default();

        for (name, value) in unit.inputs().iter() {
            if !schema.is_hashed(name) {
                continue;
            }
            let form = canonical_value(name, value, schema.hashes_file_content(name), self.method)?;
            canonical.insert(name.clone(), form);
        }

        Ok(canonical)
    }

    pub fn fingerprint(&self, unit: &UnitOfWork) -> Result<Fingerprint> {
        let canonical = self.canonicalize(unit)?;
        let fingerprint = digest(unit.implementation(), &canonical);

        debug!(
            service = services::FINGERPRINT,
            operation = operations::FINGERPRINT,
            implementation = %unit.implementation(),
            fingerprint = %fingerprint,
            hashed_inputs = canonical.len(),
            "computed fingerprint"
        );

        Ok(fingerprint)
    }
}

/// Digest of an implementation identifier and canonical inputs
pub fn digest(implementation: &ImplementationId, canonical: &CanonicalInputs) -> Fingerprint {
    let document = json!({
        "format": CANONICAL_FORMAT,
        "implementation": {
            "name": implementation.name,
            "version": implementation.version,
        },
        "inputs": canonical.to_json(),
    });

    let mut hasher = Sha256::new();
    hasher.update(document.to_string().as_bytes());
    Fingerprint(hex::encode(hasher.finalize()))
}
