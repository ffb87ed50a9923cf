//! Cache-aware execution
//!
//! `run(unit, cache = true)`:
//! 1. fingerprint the unit of work
//! 2. look the fingerprint up: `success` returns the stored outputs,
//!    `failed` replays the stored failure, `running` waits or fails
//! 3. otherwise reserve it, re-check for a result committed meanwhile, then
//!    execute (in-process or through the isolated runner) and record the
//!    outcome

use anyhow::Context;
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{parse_duration, EngineConfig};
use crate::error::{EngineError, Result};
use crate::export::StateExporter;
use crate::fingerprint::{Fingerprint, Fingerprinter};
use crate::logging::{operations, services, status};
use crate::runner::{IsolatedRunner, RunnerReport};
use crate::store::{
    heartbeat_interval, with_heartbeat, BeginOptions, CacheEntry, EntryState, EntryStatus,
    FilesystemResultStore, Provenance, Reservation, ReservationToken, ResultStore,
};
use crate::unit::{ExecutionContext, ImplementationRegistry, Inputs, Outputs, UnitOfWork};

const MAX_WAIT_BACKOFF: Duration = Duration::from_secs(10);

/// Where units of work execute
#[derive(Debug, Clone)]
pub enum ExecutionMode {
    /// In this process
    Local,
    /// In a separate runner process, from exported state
    Isolated(IsolatedRunner),
}

/// What to do when another worker holds a live reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnRunning {
    /// Poll with exponential backoff until the result appears or `timeout` elapses
    Wait {
        poll_interval: Duration,
        timeout: Duration,
    },
    /// Return `AlreadyRunning` immediately
    Fail,
}

impl Default for OnRunning {
    fn default() -> Self {
        OnRunning::Wait {
            poll_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Consult and record results in the store
    pub cache: bool,
    /// Invalidate any previous result and execute again
    pub force: bool,
    /// Execute even while another worker holds a live reservation
    pub allow_redundant: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            cache: true,
            force: false,
            allow_redundant: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// File outputs are relative to `working_dir`
    pub outputs: Outputs,
    /// Absent for uncached runs
    pub fingerprint: Option<Fingerprint>,
    pub cache_hit: bool,
    pub working_dir: Option<PathBuf>,
}

impl RunOutcome {
    /// Outputs with file paths resolved against the working directory
    pub fn resolved_outputs(&self) -> Outputs {
        match &self.working_dir {
            Some(dir) => self.outputs.resolve(dir),
            None => self.outputs.clone(),
        }
    }
}

pub struct CacheAwareExecutor<S: ResultStore> {
    store: Arc<S>,
    registry: Arc<ImplementationRegistry>,
    fingerprinter: Fingerprinter,
    exporter: StateExporter,
    mode: ExecutionMode,
    on_running: OnRunning,
    work_root: PathBuf,
    artifact_dir: PathBuf,
    env_passthrough: Vec<String>,
}

impl<S: ResultStore> CacheAwareExecutor<S> {
    /// Local execution with per-fingerprint working directories under
    /// `work_root/work` and artifacts under `work_root/artifacts`
    pub fn new(store: Arc<S>, registry: Arc<ImplementationRegistry>, work_root: &Path) -> Self {
        Self {
            store,
            registry,
            fingerprinter: Fingerprinter::default(),
            exporter: StateExporter::default(),
            mode: ExecutionMode::Local,
            on_running: OnRunning::default(),
            work_root: work_root.join("work"),
            artifact_dir: work_root.join("artifacts"),
            env_passthrough: Vec::new(),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_on_running(mut self, on_running: OnRunning) -> Self {
        self.on_running = on_running;
        self
    }

    pub fn with_fingerprinter(mut self, fingerprinter: Fingerprinter) -> Self {
        self.fingerprinter = fingerprinter;
        self.exporter =
            StateExporter::new(fingerprinter).with_env_passthrough(self.env_passthrough.clone());
        self
    }

    pub fn with_env_passthrough(mut self, names: Vec<String>) -> Self {
        self.exporter = StateExporter::new(self.fingerprinter).with_env_passthrough(names.clone());
        self.env_passthrough = names;
        self
    }

    pub fn with_work_dir(mut self, work_root: PathBuf) -> Self {
        self.work_root = work_root;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &ImplementationRegistry {
        &self.registry
    }

    pub fn fingerprinter(&self) -> Fingerprinter {
        self.fingerprinter
    }

    /// Build a unit of work for the current version of `name`
    pub fn unit(&self, name: &str, inputs: Inputs) -> Result<UnitOfWork> {
        self.registry.instantiate(name, inputs)
    }

    pub fn run(&self, unit: &UnitOfWork, cache: bool) -> Result<Outputs> {
        self.run_with(
            unit,
            RunOptions {
                cache,
                ..Default::default()
            },
        )
        .map(|outcome| outcome.outputs)
    }

    pub fn run_with(&self, unit: &UnitOfWork, options: RunOptions) -> Result<RunOutcome> {
        if !options.cache {
            return self.run_uncached(unit);
        }

        let fingerprint = self.fingerprinter.fingerprint(unit)?;
        let version = unit.implementation().version.as_str();

        if options.force && self.store.invalidate(&fingerprint)? {
            warn!(
                service = services::EXECUTOR,
                operation = operations::INVALIDATE,
                fingerprint = %fingerprint,
                implementation = %unit.implementation(),
                "forced re-run: discarded previous result"
            );
        }

        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            match self.store.lookup(&fingerprint, version)? {
                Some(CacheEntry {
                    state: EntryState::Running(reservation),
                    ..
                }) if !options.allow_redundant => {
                    self.wait_for(&fingerprint, already_running(&reservation), started, attempt)?;
                    attempt += 1;
                    continue;
                }
                Some(entry) if entry.status() != EntryStatus::Running => {
                    return self.replay(entry);
                }
                _ => {}
            }

            debug!(
                service = services::EXECUTOR,
                operation = operations::LOOKUP,
                status = status::MISS,
                fingerprint = %fingerprint,
                implementation = %unit.implementation(),
                "cache miss"
            );

            let begin = BeginOptions {
                allow_redundant: options.allow_redundant,
            };
            let token = match self.store.begin(&fingerprint, unit.implementation(), begin) {
                Ok(token) => token,
                Err(busy @ EngineError::AlreadyRunning { .. }) => {
                    // Lost the race to another worker
                    self.wait_for(&fingerprint, busy, started, attempt)?;
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            // A peer may have committed between lookup and begin
            if let Some(entry) = self.store.entry(&fingerprint)? {
                if entry.implementation.version == version && !options.force {
                    self.release_quietly(&token);
                    return self.replay(entry);
                }
            }

            return self.execute_reserved(unit, &fingerprint, &token);
        }
    }

    fn replay(&self, entry: CacheEntry) -> Result<RunOutcome> {
        let working_dir = entry.provenance.as_ref().and_then(|p| p.working_dir.clone());
        match entry.state {
            EntryState::Success(outputs) => {
                info!(
                    service = services::EXECUTOR,
                    operation = operations::LOOKUP,
                    status = status::HIT,
                    fingerprint = %entry.fingerprint,
                    implementation = %entry.implementation,
                    "cache hit"
                );
                Ok(RunOutcome {
                    outputs,
                    fingerprint: Some(entry.fingerprint),
                    cache_hit: true,
                    working_dir,
                })
            }
            EntryState::Failed(failure) => {
                info!(
                    service = services::EXECUTOR,
                    operation = operations::LOOKUP,
                    status = status::HIT,
                    fingerprint = %entry.fingerprint,
                    implementation = %entry.implementation,
                    "replaying recorded failure"
                );
                Err(EngineError::ExecutionFailed(Box::new(failure)))
            }
            EntryState::Running(reservation) => Err(already_running(&reservation)),
        }
    }

    /// Sleep before the next lookup, or give up with `busy` per the
    /// `on_running` policy
    fn wait_for(
        &self,
        fingerprint: &Fingerprint,
        busy: EngineError,
        started: Instant,
        attempt: u32,
    ) -> Result<()> {
        let (poll_interval, timeout) = match self.on_running {
            OnRunning::Fail => return Err(busy),
            OnRunning::Wait {
                poll_interval,
                timeout,
            } => (poll_interval, timeout),
        };

        if started.elapsed() >= timeout {
            return Err(busy);
        }

        let backoff = poll_interval
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
            .min(MAX_WAIT_BACKOFF);
        // Up to 25% jitter so waiters do not poll in lockstep
        let jitter = backoff.mul_f64(rand::random::<f64>() * 0.25);
        let delay = (backoff + jitter).min(timeout.saturating_sub(started.elapsed()));

        debug!(
            service = services::EXECUTOR,
            operation = operations::WAIT,
            status = status::BUSY,
            fingerprint = %fingerprint,
            delay_ms = delay.as_millis() as u64,
            "{}",
            busy
        );
        thread::sleep(delay);
        Ok(())
    }

    fn execute_reserved(
        &self,
        unit: &UnitOfWork,
        fingerprint: &Fingerprint,
        token: &ReservationToken,
    ) -> Result<RunOutcome> {
        let work_dir = self.work_root.join(fingerprint.as_str());
        if let Err(e) = fs::create_dir_all(&work_dir) {
            self.release_quietly(token);
            return Err(EngineError::store("create working directory", &work_dir, e));
        }

        let result = match &self.mode {
            ExecutionMode::Local => self.execute_local(unit, fingerprint, token, &work_dir),
            ExecutionMode::Isolated(runner) => {
                self.execute_isolated(runner, unit, fingerprint, token, &work_dir)
            }
        };

        // Domain failures are already recorded; anything else leaves the reservation behind
        if let Err(ref e) = result {
            if !matches!(e, EngineError::ExecutionFailed(_)) {
                self.release_quietly(token);
            }
        }
        result
    }

    fn execute_local(
        &self,
        unit: &UnitOfWork,
        fingerprint: &Fingerprint,
        token: &ReservationToken,
        work_dir: &Path,
    ) -> Result<RunOutcome> {
        let ctx = ExecutionContext {
            working_dir: work_dir.to_path_buf(),
            fingerprint: Some(fingerprint.clone()),
            env: self.captured_env(),
        };

        info!(
            service = services::EXECUTOR,
            operation = operations::EXECUTE,
            fingerprint = %fingerprint,
            implementation = %unit.implementation(),
            "executing"
        );

        let started_at = Utc::now();
        let interval = heartbeat_interval(self.store.options().stale_after);
        let outcome = with_heartbeat(self.store.as_ref(), token, interval, || unit.execute(&ctx));
        let provenance = Some(Provenance::capture(Some(work_dir), started_at));

        let entry = match outcome {
            Ok(outputs) => self.store.commit(token, &outputs, provenance)?,
            Err(failure) => self.store.fail(token, &failure, provenance)?,
        };

        // An immutable store may hand back an earlier result from another directory
        let recorded_dir = entry.provenance.as_ref().and_then(|p| p.working_dir.clone());
        match entry.state {
            EntryState::Success(outputs) => Ok(RunOutcome {
                outputs,
                fingerprint: Some(fingerprint.clone()),
                cache_hit: false,
                working_dir: recorded_dir.or_else(|| Some(work_dir.to_path_buf())),
            }),
            EntryState::Failed(failure) => Err(EngineError::ExecutionFailed(Box::new(failure))),
            EntryState::Running(reservation) => Err(already_running(&reservation)),
        }
    }

    fn execute_isolated(
        &self,
        runner: &IsolatedRunner,
        unit: &UnitOfWork,
        fingerprint: &Fingerprint,
        token: &ReservationToken,
        work_dir: &Path,
    ) -> Result<RunOutcome> {
        let exported = self.exporter.export(unit)?;
        if &exported.fingerprint != fingerprint {
            return Err(EngineError::Integrity {
                expected: fingerprint.clone(),
                actual: exported.fingerprint,
            });
        }

        let artifact = self.artifact_dir.join(format!("{}.json", fingerprint));
        self.exporter.write(&exported, &artifact)?;

        info!(
            service = services::EXECUTOR,
            operation = operations::EXECUTE,
            fingerprint = %fingerprint,
            implementation = %unit.implementation(),
            runner = %runner.program().display(),
            "executing in isolated runner"
        );

        match runner.run(self.store.as_ref(), &artifact, token, work_dir)? {
            RunnerReport::Success {
                outputs,
                working_dir,
                ..
            } => Ok(RunOutcome {
                outputs,
                fingerprint: Some(fingerprint.clone()),
                cache_hit: false,
                working_dir: Some(working_dir),
            }),
            RunnerReport::Failed { failure, .. } => {
                Err(EngineError::ExecutionFailed(Box::new(failure)))
            }
            RunnerReport::EngineError { kind, message, .. } => {
                Err(EngineError::Runner(format!("{}: {}", kind, message)))
            }
        }
    }

    /// Execute directly, never touching the store
    fn run_uncached(&self, unit: &UnitOfWork) -> Result<RunOutcome> {
        let work_dir = self
            .work_root
            .join(format!("uncached-{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&work_dir)
            .map_err(|e| EngineError::store("create working directory", &work_dir, e))?;

        debug!(
            service = services::EXECUTOR,
            operation = operations::EXECUTE,
            status = status::SKIPPED,
            implementation = %unit.implementation(),
            "executing without cache"
        );

        let ctx = ExecutionContext {
            working_dir: work_dir.clone(),
            fingerprint: None,
            env: self.captured_env(),
        };

        match unit.execute(&ctx) {
            Ok(outputs) => Ok(RunOutcome {
                outputs,
                fingerprint: None,
                cache_hit: false,
                working_dir: Some(work_dir),
            }),
            Err(failure) => Err(EngineError::ExecutionFailed(Box::new(failure))),
        }
    }

    fn captured_env(&self) -> BTreeMap<String, String> {
        self.env_passthrough
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.clone(), v)))
            .collect()
    }

    fn release_quietly(&self, token: &ReservationToken) {
        if let Err(e) = self.store.release(token) {
            warn!(
                service = services::EXECUTOR,
                fingerprint = %token.fingerprint,
                error = %e,
                "failed to release reservation"
            );
        }
    }
}

impl CacheAwareExecutor<FilesystemResultStore> {
    /// Build an executor over a filesystem store from configuration
    pub fn from_config(
        config: &EngineConfig,
        store_dir: &Path,
        registry: Arc<ImplementationRegistry>,
        config_path: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let store = FilesystemResultStore::new(store_dir, config.store_options()?)
            .with_context(|| format!("Failed to open result store: {}", store_dir.display()))?;

        let on_running = match config.execution.on_running.as_str() {
            "fail" => OnRunning::Fail,
            _ => OnRunning::Wait {
                poll_interval: parse_duration(&config.execution.poll_interval)?,
                timeout: parse_duration(&config.execution.wait_timeout)?,
            },
        };

        let mode = match config.execution.mode.as_str() {
            "isolated" => {
                let program = IsolatedRunner::locate(config.execution.runner.as_deref())?;
                let timeout = config
                    .execution
                    .runner_timeout
                    .as_deref()
                    .map(parse_duration)
                    .transpose()?;
                ExecutionMode::Isolated(
                    IsolatedRunner::new(program, store_dir)
                        .with_timeout(timeout)
                        .with_config(config_path),
                )
            }
            _ => ExecutionMode::Local,
        };

        let mut executor = CacheAwareExecutor::new(Arc::new(store), registry, store_dir)
            .with_fingerprinter(Fingerprinter::new(config.hash_method()?))
            .with_env_passthrough(config.execution.env.clone())
            .with_on_running(on_running)
            .with_mode(mode);
        if let Some(dir) = &config.execution.work_dir {
            executor = executor.with_work_dir(PathBuf::from(dir));
        }

        Ok(executor)
    }
}

fn already_running(reservation: &Reservation) -> EngineError {
    EngineError::AlreadyRunning {
        fingerprint: reservation.token.fingerprint.clone(),
        owner: reservation.owner.clone(),
        age_secs: reservation.age(Utc::now()).num_seconds(),
    }
}
