// Library interface for ifcache
// The binary, integration tests and embedding applications all go through
// these modules

pub mod atomic;
pub mod builtin;
pub mod config;
pub mod config_discovery;
pub mod error;
pub mod executor;
pub mod export;
pub mod fingerprint;
pub mod logging;
pub mod runner;
pub mod store;
pub mod unit;
pub mod xdg;

// Re-export commonly used types
pub use error::{EngineError, Result};
pub use executor::{CacheAwareExecutor, ExecutionMode, OnRunning, RunOptions, RunOutcome};
pub use export::{ExportedState, StateExporter};
pub use fingerprint::{Fingerprint, Fingerprinter, HashMethod};
pub use runner::{run_exported, IsolatedRunner, RunnerOptions, RunnerReport};
pub use store::{CacheEntry, EntryStatus, FilesystemResultStore, ResultStore};
pub use unit::{
    ExecutionContext, FailureKind, FailureRecord, ImplementationId, ImplementationRegistry,
    Inputs, Interface, Outputs, UnitOfWork, Value,
};
