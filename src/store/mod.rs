//! Result store: persisted outcomes keyed by fingerprint
//!
//! State per fingerprint: `absent → running → {success, failed}`. A `running`
//! reservation whose heartbeat is older than `stale_after` is stale and may be
//! reclaimed by another worker; an entry recorded by a different
//! implementation version is a miss.

pub mod filesystem;
pub mod heartbeat;
mod lock;

pub use filesystem::FilesystemResultStore;
pub use heartbeat::{heartbeat_interval, with_heartbeat};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::logging::{operations, services};
use crate::unit::{FailureRecord, ImplementationId, Outputs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Running,
    Success,
    Failed,
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntryStatus::Running => "running",
            EntryStatus::Success => "success",
            EntryStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Proof of a reservation, required to record a result
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationToken {
    pub fingerprint: Fingerprint,
    pub implementation: ImplementationId,
    pub id: Uuid,
}

impl ReservationToken {
    pub fn new(fingerprint: Fingerprint, implementation: ImplementationId, id: Uuid) -> Self {
        Self {
            fingerprint,
            implementation,
            id,
        }
    }
}

/// Running marker persisted while a unit of work executes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub token: ReservationToken,
    /// `hostname:pid` of the reserving worker
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl Reservation {
    pub fn new(token: ReservationToken) -> Self {
        let now = Utc::now();
        Self {
            token,
            owner: owner_id(),
            created_at: now,
            heartbeat_at: now,
        }
    }

    /// Time since the last heartbeat
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.heartbeat_at
    }

    pub fn is_stale(&self, stale_after: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(stale_after) {
            Ok(limit) => self.age(now) > limit,
            Err(_) => false,
        }
    }
}

/// Where and when an execution happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub hostname: String,
    pub platform: String,
    pub working_dir: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl Provenance {
    /// Capture provenance for an execution that started at `started_at` and
    /// just finished
    pub fn capture(working_dir: Option<&Path>, started_at: DateTime<Utc>) -> Self {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            hostname: hostname_string(),
            platform: platform_string(),
            working_dir: working_dir.map(Path::to_path_buf),
            started_at,
            finished_at,
            duration_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryState {
    Running(Reservation),
    Success(Outputs),
    Failed(FailureRecord),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    /// Implementation (and so version) recorded at write time
    pub implementation: ImplementationId,
    pub created_at: DateTime<Utc>,
    pub state: EntryState,
    pub provenance: Option<Provenance>,
}

impl CacheEntry {
    pub fn running(reservation: Reservation) -> Self {
        Self {
            fingerprint: reservation.token.fingerprint.clone(),
            implementation: reservation.token.implementation.clone(),
            created_at: reservation.created_at,
            state: EntryState::Running(reservation),
            provenance: None,
        }
    }

    pub fn status(&self) -> EntryStatus {
        match self.state {
            EntryState::Running(_) => EntryStatus::Running,
            EntryState::Success(_) => EntryStatus::Success,
            EntryState::Failed(_) => EntryStatus::Failed,
        }
    }

    pub fn outputs(&self) -> Option<&Outputs> {
        match &self.state {
            EntryState::Success(outputs) => Some(outputs),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureRecord> {
        match &self.state {
            EntryState::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BeginOptions {
    /// Reserve even if another live reservation exists
    pub allow_redundant: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// Reservations without a heartbeat for this long are stale
    pub stale_after: Duration,
    /// Never replace a `success` entry once written
    pub immutable_success: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(3600),
            immutable_success: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub total_entries: usize,
    pub success: usize,
    pub failed: usize,
    pub running: usize,
    pub stale_reservations: usize,
    pub total_bytes: u64,
    pub root: PathBuf,
}

/// Storage backend for cache entries.
///
/// All mutation is atomic per fingerprint; no operation locks across
/// fingerprints. Implementations must be safe to share between threads and
/// between processes using the same backing location.
pub trait ResultStore: Send + Sync {
    fn options(&self) -> StoreOptions;

    /// Completed (`success`/`failed`) entry, if one is recorded and intact
    fn entry(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>>;

    /// Current reservation, live or stale
    fn reservation(&self, fingerprint: &Fingerprint) -> Result<Option<Reservation>>;

    /// Record a `running` reservation
    fn begin(
        &self,
        fingerprint: &Fingerprint,
        implementation: &ImplementationId,
        options: BeginOptions,
    ) -> Result<ReservationToken>;

    /// Refresh the reservation heartbeat; false if the token no longer holds it
    fn renew(&self, token: &ReservationToken) -> Result<bool>;

    fn commit(
        &self,
        token: &ReservationToken,
        outputs: &Outputs,
        provenance: Option<Provenance>,
    ) -> Result<CacheEntry>;

    fn fail(
        &self,
        token: &ReservationToken,
        failure: &FailureRecord,
        provenance: Option<Provenance>,
    ) -> Result<CacheEntry>;

    /// Drop a reservation without recording a result
    fn release(&self, token: &ReservationToken) -> Result<()>;

    /// Remove everything recorded for `fingerprint`; true if anything existed
    fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool>;

    fn list(&self) -> Result<Vec<Fingerprint>>;

    fn stats(&self) -> Result<StoreStats>;

    fn clean_all(&self) -> Result<()>;

    /// Completed entry for the current implementation version, else a live
    /// reservation, else nothing.
    fn lookup(
        &self,
        fingerprint: &Fingerprint,
        current_version: &str,
    ) -> Result<Option<CacheEntry>> {
        if let Some(entry) = self.entry(fingerprint)? {
            if entry.implementation.version == current_version {
                return Ok(Some(entry));
            }
            debug!(
                service = services::STORE,
                operation = operations::LOOKUP,
                fingerprint = %fingerprint,
                recorded_version = %entry.implementation.version,
                current_version = %current_version,
                "entry recorded by another version, treating as miss"
            );
        }

        match self.reservation(fingerprint)? {
            Some(reservation) if !reservation.is_stale(self.options().stale_after, Utc::now()) => {
                Ok(Some(CacheEntry::running(reservation)))
            }
            _ => Ok(None),
        }
    }
}

pub(crate) fn hostname_string() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

pub(crate) fn platform_string() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

fn owner_id() -> String {
    format!("{}:{}", hostname_string(), std::process::id())
}
