//! Isolated execution of exported state
//!
//! The parent side ([`IsolatedRunner`]) spawns `ifcache runner <artifact>` and
//! waits for it; the child side ([`run_exported`]) rebuilds the unit of work
//! from the artifact, proves it hashes to the declared fingerprint, executes
//! it and records the outcome in the shared store. The two sides talk through
//! the store and a small JSON report file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::atomic::write_atomic;
use crate::error::{EngineError, Result};
use crate::export::StateExporter;
use crate::fingerprint::Fingerprint;
use crate::logging::{operations, services, status};
use crate::store::{
    heartbeat_interval, with_heartbeat, BeginOptions, EntryState, Provenance, ReservationToken,
    ResultStore,
};
use crate::unit::{ExecutionContext, FailureKind, FailureRecord, ImplementationRegistry, Outputs};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_UNIT_FAILED: i32 = 1;
pub const EXIT_ENGINE_ERROR: i32 = 2;
pub const EXIT_ALREADY_RUNNING: i32 = 3;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What the child reports back to the parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunnerReport {
    Success {
        fingerprint: Fingerprint,
        outputs: Outputs,
        working_dir: PathBuf,
    },
    Failed {
        fingerprint: Fingerprint,
        failure: FailureRecord,
    },
    EngineError {
        kind: String,
        message: String,
        retryable: bool,
    },
}

impl RunnerReport {
    pub fn engine_error(err: &EngineError) -> Self {
        RunnerReport::EngineError {
            kind: err.kind().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RunnerReport::Success { .. } => EXIT_SUCCESS,
            RunnerReport::Failed { .. } => EXIT_UNIT_FAILED,
            RunnerReport::EngineError { retryable: true, .. } => EXIT_ALREADY_RUNNING,
            RunnerReport::EngineError { .. } => EXIT_ENGINE_ERROR,
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_atomic(path, &serde_json::to_vec_pretty(self)?)
            .map_err(|e| EngineError::store("write report", path, e))
    }
}

/// Child-side settings
#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    /// Reservation taken by the parent; without one the runner reserves itself
    pub reservation: Option<Uuid>,
    /// Explicit working directory
    pub work_dir: Option<PathBuf>,
    /// Parent of per-fingerprint working directories when none is given
    pub work_root: PathBuf,
    pub allow_redundant: bool,
}

/// Re-hydrate and execute an exported unit of work
///
/// Never panics and never returns an error: every outcome, including engine
/// errors, becomes a [`RunnerReport`].
pub fn run_exported<S: ResultStore + ?Sized>(
    artifact: &Path,
    store: &S,
    registry: &ImplementationRegistry,
    options: &RunnerOptions,
) -> RunnerReport {
    match execute_artifact(artifact, store, registry, options) {
        Ok(report) => report,
        Err(err) => {
            error!(
                service = services::RUNNER,
                operation = operations::EXECUTE,
                status = status::ERROR,
                artifact = %artifact.display(),
                error = %err,
                "runner failed"
            );
            RunnerReport::engine_error(&err)
        }
    }
}

fn execute_artifact<S: ResultStore + ?Sized>(
    artifact: &Path,
    store: &S,
    registry: &ImplementationRegistry,
    options: &RunnerOptions,
) -> Result<RunnerReport> {
    let exporter = StateExporter::default();
    let exported = exporter.read(artifact)?;
    let unit = exporter.import(&exported, registry)?;
    let fingerprint = exporter.verify(&exported, &unit)?;

    let token = match options.reservation {
        Some(id) => ReservationToken::new(fingerprint.clone(), exported.implementation.clone(), id),
        None => store.begin(
            &fingerprint,
            unit.implementation(),
            BeginOptions {
                allow_redundant: options.allow_redundant,
            },
        )?,
    };

    let work_dir = options
        .work_dir
        .clone()
        .or_else(|| exported.environment.working_dir.clone())
        .unwrap_or_else(|| options.work_root.join(fingerprint.as_str()));
    if let Err(e) = fs::create_dir_all(&work_dir) {
        if options.reservation.is_none() {
            store.release(&token)?;
        }
        return Err(EngineError::store("create working directory", &work_dir, e));
    }

    let ctx = ExecutionContext {
        working_dir: work_dir.clone(),
        fingerprint: Some(fingerprint.clone()),
        env: exported.environment.env.clone(),
    };

    info!(
        service = services::RUNNER,
        operation = operations::EXECUTE,
        implementation = %unit.implementation(),
        fingerprint = %fingerprint,
        working_dir = %work_dir.display(),
        "executing exported unit of work"
    );

    let started_at = Utc::now();
    let interval = heartbeat_interval(store.options().stale_after);
    let outcome = with_heartbeat(store, &token, interval, || unit.execute(&ctx));
    let provenance = Provenance::capture(Some(&work_dir), started_at);

    match outcome {
        Ok(outputs) => {
            store.commit(&token, &outputs, Some(provenance))?;
            Ok(RunnerReport::Success {
                fingerprint,
                outputs,
                working_dir: work_dir,
            })
        }
        Err(failure) => {
            store.fail(&token, &failure, Some(provenance))?;
            Ok(RunnerReport::Failed {
                fingerprint,
                failure,
            })
        }
    }
}

/// Parent side: runs exported state in a separate `ifcache runner` process
#[derive(Debug, Clone)]
pub struct IsolatedRunner {
    program: PathBuf,
    store_dir: PathBuf,
    timeout: Option<Duration>,
    config: Option<PathBuf>,
}

impl IsolatedRunner {
    pub fn new(program: impl Into<PathBuf>, store_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            store_dir: store_dir.into(),
            timeout: None,
            config: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Configuration file handed to the child explicitly
    pub fn with_config(mut self, config: Option<PathBuf>) -> Self {
        self.config = config;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Find the runner program: the configured one, this executable when it
    /// is `ifcache`, else `ifcache` on PATH
    pub fn locate(configured: Option<&str>) -> Result<PathBuf> {
        if let Some(program) = configured {
            return which::which(program)
                .or_else(|_| {
                    let path = PathBuf::from(program);
                    if path.exists() {
                        Ok(path)
                    } else {
                        Err(EngineError::Runner(format!("runner program not found: {}", program)))
                    }
                });
        }

        if let Ok(exe) = std::env::current_exe() {
            if exe.file_stem().is_some_and(|stem| stem == "ifcache") {
                return Ok(exe);
            }
        }

        which::which("ifcache")
            .map_err(|e| EngineError::Runner(format!("cannot locate the ifcache binary: {}", e)))
    }

    /// Execute `artifact` under the reservation `token` and wait for the
    /// outcome. A child that dies without reporting, or outlives the timeout,
    /// has its failure recorded here.
    pub fn run<S: ResultStore + ?Sized>(
        &self,
        store: &S,
        artifact: &Path,
        token: &ReservationToken,
        work_dir: &Path,
    ) -> Result<RunnerReport> {
        let report_file = tempfile::Builder::new()
            .prefix("report-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| EngineError::store("create report file", std::env::temp_dir(), e))?;
        let report_path = report_file.path().to_path_buf();

        let mut command = Command::new(&self.program);
        command
            .arg("runner")
            .arg(artifact)
            .arg("--store-dir")
            .arg(&self.store_dir)
            .arg("--reservation")
            .arg(token.id.to_string())
            .arg("--report")
            .arg(&report_path)
            .arg("--work-dir")
            .arg(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        if let Some(config) = &self.config {
            command.arg("--config").arg(config);
        }
        if std::env::var_os("IFCACHE_LOG_FORMAT").is_none() {
            command.env("IFCACHE_LOG_FORMAT", "compact");
        }

        debug!(
            service = services::RUNNER,
            program = %self.program.display(),
            artifact = %artifact.display(),
            fingerprint = %token.fingerprint,
            "spawning runner"
        );

        let started_at = Utc::now();
        let mut child = command.spawn().map_err(|e| {
            EngineError::Runner(format!("failed to spawn {}: {}", self.program.display(), e))
        })?;

        let exit = match self.timeout {
            Some(timeout) => wait_with_timeout(&mut child, timeout),
            None => child.wait().map(Some),
        }
        .map_err(|e| EngineError::Runner(format!("failed to wait for runner: {}", e)))?;

        if let Some(report) = read_report(&report_path) {
            debug!(
                service = services::RUNNER,
                fingerprint = %token.fingerprint,
                exit_code = report.exit_code(),
                "runner reported"
            );
            return Ok(report);
        }

        if let Some(report) = recorded_since(store, token, work_dir, started_at)? {
            info!(
                service = services::RUNNER,
                fingerprint = %token.fingerprint,
                exit_code = report.exit_code(),
                "runner recorded its outcome without reporting"
            );
            return Ok(report);
        }

        let interface = token.implementation.to_string();
        let failure = match exit {
            None => FailureRecord::new(
                FailureKind::Timeout,
                interface,
                format!(
                    "runner killed after {}s",
                    self.timeout.map(|t| t.as_secs()).unwrap_or_default()
                ),
            ),
            Some(status) => FailureRecord::new(
                FailureKind::Crash,
                interface,
                format!("runner exited without a report ({})", describe_exit(status)),
            ),
        };

        warn!(
            service = services::RUNNER,
            operation = operations::FAIL,
            fingerprint = %token.fingerprint,
            kind = %failure.kind,
            "{}",
            failure.message
        );

        let provenance = Provenance::capture(Some(work_dir), started_at);
        if let Err(e) = store.fail(token, &failure, Some(provenance)) {
            warn!(
                service = services::RUNNER,
                fingerprint = %token.fingerprint,
                error = %e,
                "could not record runner failure"
            );
        }

        Ok(RunnerReport::Failed {
            fingerprint: token.fingerprint.clone(),
            failure,
        })
    }
}

/// Outcome the child committed before dying, if the reservation was consumed
/// by a result recorded after `started_at`
fn recorded_since<S: ResultStore + ?Sized>(
    store: &S,
    token: &ReservationToken,
    work_dir: &Path,
    started_at: DateTime<Utc>,
) -> Result<Option<RunnerReport>> {
    let fingerprint = &token.fingerprint;
    if matches!(store.reservation(fingerprint)?, Some(r) if r.token.id == token.id) {
        return Ok(None);
    }

    let entry = match store.entry(fingerprint)? {
        Some(entry) if entry.created_at >= started_at => entry,
        _ => return Ok(None),
    };
    let report = match entry.state {
        EntryState::Success(outputs) => RunnerReport::Success {
            fingerprint: fingerprint.clone(),
            outputs,
            working_dir: entry
                .provenance
                .and_then(|p| p.working_dir)
                .unwrap_or_else(|| work_dir.to_path_buf()),
        },
        EntryState::Failed(failure) => RunnerReport::Failed {
            fingerprint: fingerprint.clone(),
            failure,
        },
        EntryState::Running(_) => return Ok(None),
    };
    Ok(Some(report))
}

/// Poll the child until it exits or `timeout` elapses; `None` means it was
/// killed
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let start = Instant::now();

    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                if start.elapsed() >= timeout {
                    child.kill()?;
                    child.wait()?; // Reap zombie
                    return Ok(None);
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn read_report(path: &Path) -> Option<RunnerReport> {
    let bytes = fs::read(path).ok()?;
    if bytes.is_empty() {
        return None;
    }
    serde_json::from_slice(&bytes).ok()
}

fn describe_exit(status: ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("killed by signal {}", signal);
        }
    }
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => "unknown status".to_string(),
    }
}
