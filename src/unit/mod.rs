//! Units of work: the narrow contract the engine consumes from interfaces.
//!
//! A [`UnitOfWork`] pairs an [`ImplementationId`] with validated [`Inputs`]
//! and the [`Interface`] able to execute them.

pub mod failure;
pub mod registry;
pub mod schema;
pub mod value;

pub use failure::{FailureKind, FailureRecord};
pub use registry::ImplementationRegistry;
pub use schema::{FieldSpec, InputSchema};
pub use value::{Inputs, Outputs, Value};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;
use crate::fingerprint::Fingerprint;

/// Implementation identifier: name plus version.
///
/// Both parts feed the fingerprint, so bumping the version invalidates every
/// result computed by earlier versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImplementationId {
    pub name: String,
    pub version: String,
}

impl ImplementationId {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ImplementationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Everything an interface may touch while executing
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Side effects are confined to this directory
    pub working_dir: PathBuf,
    pub fingerprint: Option<Fingerprint>,
    /// Environment captured for the execution (not the process environment)
    pub env: BTreeMap<String, String>,
}

impl ExecutionContext {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            fingerprint: None,
            env: BTreeMap::new(),
        }
    }

    pub fn output_path(&self, name: impl AsRef<Path>) -> PathBuf {
        self.working_dir.join(name)
    }

    pub fn env(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }
}

/// Contract implemented by the computations being cached
pub trait Interface: Send + Sync {
    /// Declared inputs. The default schema accepts anything.
    fn schema(&self) -> InputSchema {
        InputSchema::default()
    }

    fn execute(&self, inputs: &Inputs, ctx: &ExecutionContext) -> anyhow::Result<Outputs>;
}

/// A single executable computation with validated inputs
#[derive(Clone)]
pub struct UnitOfWork {
    implementation: ImplementationId,
    inputs: Inputs,
    schema: InputSchema,
    interface: Arc<dyn Interface>,
}

impl UnitOfWork {
    pub fn new(
        implementation: ImplementationId,
        interface: Arc<dyn Interface>,
        inputs: Inputs,
    ) -> Result<Self> {
        let schema = interface.schema();
        schema.validate(&implementation, &inputs)?;

        Ok(Self {
            implementation,
            inputs,
            schema,
            interface,
        })
    }

    pub fn implementation(&self) -> &ImplementationId {
        &self.implementation
    }

    pub fn inputs(&self) -> &Inputs {
        &self.inputs
    }

    pub fn schema(&self) -> &InputSchema {
        &self.schema
    }

    /// Run the interface, turning errors and panics into a [`FailureRecord`].
    ///
    /// File outputs created under the working directory come back relative
    /// to it.
    pub fn execute(&self, ctx: &ExecutionContext) -> std::result::Result<Outputs, FailureRecord> {
        let interface = self.implementation.to_string();
        let outcome =
            panic::catch_unwind(AssertUnwindSafe(|| self.interface.execute(&self.inputs, ctx)));

        match outcome {
            Ok(Ok(outputs)) => Ok(outputs.relativize(&ctx.working_dir)),
            Ok(Err(err)) => Err(FailureRecord::from_error(&err, interface)),
            Err(payload) => Err(FailureRecord::from_panic(payload.as_ref(), interface)),
        }
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("implementation", &self.implementation)
            .field("inputs", &self.inputs)
            .finish_non_exhaustive()
    }
}
