// Common test utilities shared across acceptance tests
//
// Every test gets its own temporary workspace holding the result store, the
// input files and a private XDG config directory, so no global configuration
// or store is ever touched and tests can run in parallel.

#![allow(dead_code)]

use assert_cmd::Command;
use ifcache::store::{FilesystemResultStore, StoreOptions};
use ifcache::unit::{
    ExecutionContext, FieldSpec, InputSchema, Inputs, Interface, Outputs, Value,
};
use ifcache::{Fingerprinter, ImplementationRegistry, StateExporter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("xdg-config")).unwrap();
        Self { temp_dir }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn store_dir(&self) -> PathBuf {
        self.temp_dir.path().join("store")
    }

    /// `ifcache` binary isolated to this workspace
    pub fn ifcache(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_ifcache"));
        cmd.current_dir(self.path())
            .env("IFCACHE_STORE_DIR", self.store_dir())
            .env("XDG_CONFIG_HOME", self.path().join("xdg-config"))
            .env("IFCACHE_LOG_FORMAT", "compact")
            .env_remove("IFCACHE_CONFIG")
            .env_remove("RUST_LOG");
        cmd
    }

    pub fn store(&self) -> FilesystemResultStore {
        self.store_with(StoreOptions::default())
    }

    pub fn store_with(&self, options: StoreOptions) -> FilesystemResultStore {
        FilesystemResultStore::new(self.store_dir(), options).unwrap()
    }

    pub fn create_file(&self, path: &str, content: &str) -> PathBuf {
        let file_path = self.path().join(path);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&file_path, content).unwrap();
        file_path
    }

    /// Export a builtin unit of work to `name` inside the workspace
    pub fn export(&self, name: &str, implementation: &str, inputs: Inputs) -> PathBuf {
        let unit = ifcache::builtin::builtin_registry()
            .instantiate(implementation, inputs)
            .unwrap();
        let exporter = StateExporter::new(Fingerprinter::default());
        let exported = exporter.export(&unit).unwrap();
        let path = self.path().join(name);
        exporter.write(&exported, &path).unwrap();
        path
    }
}

/// Test double counting its executions
pub struct Counting {
    pub calls: Arc<AtomicUsize>,
    pub delay: Duration,
}

impl Counting {
    pub fn registry(delay: Duration) -> (ImplementationRegistry, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = ImplementationRegistry::new().with(
            "count",
            "1",
            Arc::new(Counting {
                calls: Arc::clone(&calls),
                delay,
            }),
        );
        (registry, calls)
    }
}

impl Interface for Counting {
    fn schema(&self) -> InputSchema {
        InputSchema::new().field("x", FieldSpec::new().mandatory())
    }

    fn execute(&self, inputs: &Inputs, _ctx: &ExecutionContext) -> anyhow::Result<Outputs> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        let x = inputs.get("x").and_then(Value::as_i64).unwrap_or_default();
        Ok(Outputs::new()
            .with("doubled", x * 2)
            .with("inverse", 1.0 / x as f64))
    }
}
