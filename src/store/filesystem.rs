use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use super::lock::EntryLock;
use super::{
    BeginOptions, CacheEntry, EntryState, EntryStatus, Provenance, Reservation, ResultStore,
    ReservationToken, StoreOptions, StoreStats,
};
use crate::atomic::write_atomic;
use crate::error::{EngineError, Result};
use crate::fingerprint::Fingerprint;
use crate::logging::{operations, services, status};
use crate::unit::{FailureRecord, ImplementationId, Outputs};

/// Bumped whenever the on-disk entry layout changes
const ENTRY_FORMAT_VERSION: u32 = 1;

const ENTRY_FILE: &str = "entry.json";
const RESERVATION_FILE: &str = "reservation.json";
const PAYLOAD_PREFIX: &str = "payload-";

/// Committed entry metadata, written last so it only ever names a payload
/// that is already on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryRecord {
    format_version: u32,
    fingerprint: Fingerprint,
    status: EntryStatus,
    implementation: ImplementationId,
    created_at: DateTime<Utc>,
    payload: String,
    payload_sha256: String,
    provenance: Option<Provenance>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Payload {
    Success { outputs: Outputs },
    Failed { failure: FailureRecord },
}

impl Payload {
    fn status(&self) -> EntryStatus {
        match self {
            Payload::Success { .. } => EntryStatus::Success,
            Payload::Failed { .. } => EntryStatus::Failed,
        }
    }

    fn into_state(self) -> EntryState {
        match self {
            Payload::Success { outputs } => EntryState::Success(outputs),
            Payload::Failed { failure } => EntryState::Failed(failure),
        }
    }
}

/// Result store on a local or shared filesystem
///
/// Layout:
/// - `<root>/entries/ab/ab12.../entry.json` - committed entry metadata
/// - `<root>/entries/ab/ab12.../payload-<digest>.json` - outputs or failure
/// - `<root>/entries/ab/ab12.../reservation.json` - running marker
/// - `<root>/entries/ab/ab12.../.lock` - advisory lock for mutations
///
/// Readers never take the lock. Every file is replaced by rename, so a reader
/// sees either the previous or the next state of an entry.
#[derive(Debug, Clone)]
pub struct FilesystemResultStore {
    root: PathBuf,
    entries_dir: PathBuf,
    options: StoreOptions,
}

impl FilesystemResultStore {
    pub fn new(root: impl Into<PathBuf>, options: StoreOptions) -> Result<Self> {
        let root = root.into();
        let entries_dir = root.join("entries");
        fs::create_dir_all(&entries_dir)
            .map_err(|e| EngineError::store("create store directory", &entries_dir, e))?;

        debug!(
            service = services::STORE,
            root = %root.display(),
            stale_after_secs = options.stale_after.as_secs(),
            immutable_success = options.immutable_success,
            "opened result store"
        );

        Ok(Self {
            root,
            entries_dir,
            options,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding everything recorded for `fingerprint`
    pub fn entry_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.entries_dir
            .join(fingerprint.shard())
            .join(fingerprint.as_str())
    }

    fn read_reservation_in(&self, dir: &Path) -> Result<Option<Reservation>> {
        let path = dir.join(RESERVATION_FILE);
        match read_json::<Reservation>(&path) {
            Ok(found) => Ok(found),
            Err(ReadError::Io(e)) => Err(EngineError::store("read reservation", &path, e)),
            Err(ReadError::Corrupt(e)) => {
                // begin() ages an unparseable marker by its mtime instead
                warn!(
                    service = services::STORE,
                    path = %path.display(),
                    error = %e,
                    "unreadable reservation, treating as stale"
                );
                Ok(None)
            }
        }
    }

    fn remove_reservation_in(&self, dir: &Path) -> Result<()> {
        let path = dir.join(RESERVATION_FILE);
        remove_if_exists(&path).map_err(|e| EngineError::store("remove reservation", &path, e))?;
        Ok(())
    }

    fn holds_reservation(&self, dir: &Path, token: &ReservationToken) -> Result<bool> {
        Ok(matches!(
            self.read_reservation_in(dir)?,
            Some(current) if current.token.id == token.id
        ))
    }

    /// Record a terminal state for the reserved fingerprint
    fn complete(
        &self,
        token: &ReservationToken,
        payload: Payload,
        provenance: Option<Provenance>,
    ) -> Result<CacheEntry> {
        let fingerprint = &token.fingerprint;
        let dir = self.entry_dir(fingerprint);
        let _lock = EntryLock::acquire(&dir)?;
        let operation = match payload.status() {
            EntryStatus::Failed => operations::FAIL,
            _ => operations::COMMIT,
        };

        let held = self.holds_reservation(&dir, token)?;
        if !held {
            warn!(
                service = services::STORE,
                operation = operation,
                fingerprint = %fingerprint,
                "reservation no longer held, recording result anyway"
            );
        }

        if self.options.immutable_success {
            if let Some(existing) = self.entry(fingerprint)? {
                if existing.status() == EntryStatus::Success {
                    info!(
                        service = services::STORE,
                        operation = operation,
                        status = status::SKIPPED,
                        fingerprint = %fingerprint,
                        "keeping existing success entry"
                    );
                    if held {
                        self.remove_reservation_in(&dir)?;
                    }
                    return Ok(existing);
                }
            }
        }

        let entry_status = payload.status();
        let bytes = serde_json::to_vec_pretty(&payload)?;
        let digest = hex::encode(Sha256::digest(&bytes));
        let payload_name = format!("{}{}.json", PAYLOAD_PREFIX, &digest[..16]);
        let payload_path = dir.join(&payload_name);
        write_atomic(&payload_path, &bytes)
            .map_err(|e| EngineError::store("write payload", &payload_path, e))?;

        let record = EntryRecord {
            format_version: ENTRY_FORMAT_VERSION,
            fingerprint: fingerprint.clone(),
            status: entry_status,
            implementation: token.implementation.clone(),
            created_at: Utc::now(),
            payload: payload_name.clone(),
            payload_sha256: digest,
            provenance: provenance.clone(),
        };
        let record_path = dir.join(ENTRY_FILE);
        write_atomic(&record_path, &serde_json::to_vec_pretty(&record)?)
            .map_err(|e| EngineError::store("write entry", &record_path, e))?;

        if held {
            self.remove_reservation_in(&dir)?;
        }
        self.remove_stale_payloads(&dir, &payload_name)?;

        info!(
            service = services::STORE,
            operation = operation,
            status = status::SUCCESS,
            fingerprint = %fingerprint,
            implementation = %token.implementation,
            entry_status = %entry_status,
            "recorded entry"
        );

        Ok(CacheEntry {
            fingerprint: fingerprint.clone(),
            implementation: record.implementation,
            created_at: record.created_at,
            state: payload.into_state(),
            provenance,
        })
    }

    /// One attempt at reading the committed entry in `dir`
    fn read_entry_in(&self, dir: &Path, fingerprint: &Fingerprint) -> Result<EntryRead> {
        let record_path = dir.join(ENTRY_FILE);

        let record = match read_json::<EntryRecord>(&record_path) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(EntryRead::Absent),
            Err(ReadError::Io(e)) => return Err(EngineError::store("read entry", &record_path, e)),
            Err(ReadError::Corrupt(e)) => {
                warn!(
                    service = services::STORE,
                    operation = operations::LOOKUP,
                    fingerprint = %fingerprint,
                    error = %e,
                    "unreadable entry, treating as absent"
                );
                return Ok(EntryRead::Absent);
            }
        };

        if record.format_version != ENTRY_FORMAT_VERSION || &record.fingerprint != fingerprint {
            debug!(
                service = services::STORE,
                operation = operations::LOOKUP,
                fingerprint = %fingerprint,
                format_version = record.format_version,
                "entry written in another layout, treating as absent"
            );
            return Ok(EntryRead::Absent);
        }

        let payload_path = dir.join(&record.payload);
        let bytes = match fs::read(&payload_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(EntryRead::PayloadMissing),
            Err(e) => return Err(EngineError::store("read payload", &payload_path, e)),
        };

        if hex::encode(Sha256::digest(&bytes)) != record.payload_sha256 {
            warn!(
                service = services::STORE,
                operation = operations::LOOKUP,
                fingerprint = %fingerprint,
                "entry payload digest mismatch, treating as absent"
            );
            return Ok(EntryRead::Absent);
        }

        let payload = match serde_json::from_slice::<Payload>(&bytes) {
            Ok(payload) if payload.status() == record.status => payload,
            Ok(_) | Err(_) => {
                warn!(
                    service = services::STORE,
                    operation = operations::LOOKUP,
                    fingerprint = %fingerprint,
                    "entry payload does not match its record, treating as absent"
                );
                return Ok(EntryRead::Absent);
            }
        };

        Ok(EntryRead::Found(CacheEntry {
            fingerprint: record.fingerprint,
            implementation: record.implementation,
            created_at: record.created_at,
            state: payload.into_state(),
            provenance: record.provenance,
        }))
    }

    /// Delete payload files the committed entry no longer refers to
    fn remove_stale_payloads(&self, dir: &Path, keep: &str) -> Result<()> {
        let listing = fs::read_dir(dir).map_err(|e| EngineError::store("list entry", dir, e))?;
        for item in listing {
            let item = item.map_err(|e| EngineError::store("list entry", dir, e))?;
            let name = item.file_name().to_string_lossy().to_string();
            if name.starts_with(PAYLOAD_PREFIX) && name != keep {
                remove_if_exists(&item.path())
                    .map_err(|e| EngineError::store("remove payload", item.path(), e))?;
            }
        }
        Ok(())
    }

    fn is_entry_dir(path: &Path) -> bool {
        path.join(ENTRY_FILE).exists() || path.join(RESERVATION_FILE).exists()
    }
}

impl ResultStore for FilesystemResultStore {
    fn options(&self) -> StoreOptions {
        self.options
    }

    fn entry(&self, fingerprint: &Fingerprint) -> Result<Option<CacheEntry>> {
        let dir = self.entry_dir(fingerprint);

        // A re-commit deletes the payload the previous record named
        for attempt in 0..2 {
            match self.read_entry_in(&dir, fingerprint)? {
                EntryRead::Found(entry) => return Ok(Some(entry)),
                EntryRead::Absent => return Ok(None),
                EntryRead::PayloadMissing if attempt == 0 => {
                    debug!(
                        service = services::STORE,
                        operation = operations::LOOKUP,
                        fingerprint = %fingerprint,
                        "entry payload replaced while reading, reading again"
                    );
                }
                EntryRead::PayloadMissing => {}
            }
        }

        warn!(
            service = services::STORE,
            operation = operations::LOOKUP,
            fingerprint = %fingerprint,
            "entry payload missing, treating as absent"
        );
        Ok(None)
    }

    fn reservation(&self, fingerprint: &Fingerprint) -> Result<Option<Reservation>> {
        self.read_reservation_in(&self.entry_dir(fingerprint))
    }

    fn begin(
        &self,
        fingerprint: &Fingerprint,
        implementation: &ImplementationId,
        options: BeginOptions,
    ) -> Result<ReservationToken> {
        let dir = self.entry_dir(fingerprint);
        let _lock = EntryLock::acquire(&dir)?;
        let now = Utc::now();

        if let Some(existing) = self.read_reservation_in(&dir)? {
            if !existing.is_stale(self.options.stale_after, now) {
                if !options.allow_redundant {
                    debug!(
                        service = services::STORE,
                        operation = operations::BEGIN,
                        status = status::BUSY,
                        fingerprint = %fingerprint,
                        owner = %existing.owner,
                        "fingerprint already running"
                    );
                    let age_secs = existing.age(now).num_seconds();
                    return Err(EngineError::AlreadyRunning {
                        fingerprint: fingerprint.clone(),
                        owner: existing.owner,
                        age_secs,
                    });
                }
                info!(
                    service = services::STORE,
                    operation = operations::BEGIN,
                    fingerprint = %fingerprint,
                    owner = %existing.owner,
                    "starting redundant execution alongside live reservation"
                );
            } else {
                warn!(
                    service = services::STORE,
                    operation = operations::BEGIN,
                    fingerprint = %fingerprint,
                    owner = %existing.owner,
                    age_secs = existing.age(now).num_seconds(),
                    "reclaiming stale reservation"
                );
            }
        } else if let Some(age) = orphan_marker_age(&dir.join(RESERVATION_FILE)) {
            // Marker exists but could not be parsed
            if age < self.options.stale_after && !options.allow_redundant {
                return Err(EngineError::AlreadyRunning {
                    fingerprint: fingerprint.clone(),
                    owner: "unknown".to_string(),
                    age_secs: age.as_secs() as i64,
                });
            }
        }

        let token = ReservationToken::new(fingerprint.clone(), implementation.clone(), Uuid::new_v4());
        let reservation = Reservation::new(token.clone());
        let path = dir.join(RESERVATION_FILE);
        write_atomic(&path, &serde_json::to_vec_pretty(&reservation)?)
            .map_err(|e| EngineError::store("write reservation", &path, e))?;

        debug!(
            service = services::STORE,
            operation = operations::BEGIN,
            status = status::SUCCESS,
            fingerprint = %fingerprint,
            implementation = %implementation,
            "reserved fingerprint"
        );

        Ok(token)
    }

    fn renew(&self, token: &ReservationToken) -> Result<bool> {
        let dir = self.entry_dir(&token.fingerprint);
        let _lock = EntryLock::acquire(&dir)?;

        let mut reservation = match self.read_reservation_in(&dir)? {
            Some(r) if r.token.id == token.id => r,
            _ => return Ok(false),
        };

        reservation.heartbeat_at = Utc::now();
        let path = dir.join(RESERVATION_FILE);
        write_atomic(&path, &serde_json::to_vec_pretty(&reservation)?)
            .map_err(|e| EngineError::store("renew reservation", &path, e))?;
        Ok(true)
    }

    fn commit(
        &self,
        token: &ReservationToken,
        outputs: &Outputs,
        provenance: Option<Provenance>,
    ) -> Result<CacheEntry> {
        self.complete(
            token,
            Payload::Success {
                outputs: outputs.clone(),
            },
            provenance,
        )
    }

    fn fail(
        &self,
        token: &ReservationToken,
        failure: &FailureRecord,
        provenance: Option<Provenance>,
    ) -> Result<CacheEntry> {
        self.complete(
            token,
            Payload::Failed {
                failure: failure.clone(),
            },
            provenance,
        )
    }

    fn release(&self, token: &ReservationToken) -> Result<()> {
        let dir = self.entry_dir(&token.fingerprint);
        let _lock = EntryLock::acquire(&dir)?;

        if self.holds_reservation(&dir, token)? {
            self.remove_reservation_in(&dir)?;
            debug!(
                service = services::STORE,
                fingerprint = %token.fingerprint,
                "released reservation"
            );
        }
        Ok(())
    }

    fn invalidate(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let dir = self.entry_dir(fingerprint);
        if !dir.exists() {
            return Ok(false);
        }
        let _lock = EntryLock::acquire(&dir)?;

        let mut removed = false;
        let listing = fs::read_dir(&dir).map_err(|e| EngineError::store("list entry", &dir, e))?;
        for item in listing {
            let item = item.map_err(|e| EngineError::store("list entry", &dir, e))?;
            let name = item.file_name().to_string_lossy().to_string();
            if EntryLock::is_lock_file(&name) {
                continue;
            }
            removed |= remove_if_exists(&item.path())
                .map_err(|e| EngineError::store("invalidate entry", item.path(), e))?;
        }

        info!(
            service = services::STORE,
            operation = operations::INVALIDATE,
            fingerprint = %fingerprint,
            removed = removed,
            "invalidated entry"
        );
        Ok(removed)
    }

    fn list(&self) -> Result<Vec<Fingerprint>> {
        let mut fingerprints = Vec::new();

        for entry in WalkDir::new(&self.entries_dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
        {
            let name = entry.file_name().to_string_lossy();
            if let Some(fingerprint) = Fingerprint::from_hex(&name) {
                if Self::is_entry_dir(entry.path()) {
                    fingerprints.push(fingerprint);
                }
            }
        }

        fingerprints.sort();
        Ok(fingerprints)
    }

    fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats {
            root: self.root.clone(),
            ..Default::default()
        };
        let now = Utc::now();

        for fingerprint in self.list()? {
            stats.total_entries += 1;
            match self.entry(&fingerprint)?.map(|e| e.status()) {
                Some(EntryStatus::Success) => stats.success += 1,
                Some(EntryStatus::Failed) => stats.failed += 1,
                _ => match self.reservation(&fingerprint)? {
                    Some(r) if r.is_stale(self.options.stale_after, now) => {
                        stats.stale_reservations += 1
                    }
                    Some(_) => stats.running += 1,
                    None => {}
                },
            }
        }

        stats.total_bytes = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum();

        Ok(stats)
    }

    fn clean_all(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)
                .map_err(|e| EngineError::store("clean store", &self.root, e))?;
        }
        fs::create_dir_all(&self.entries_dir)
            .map_err(|e| EngineError::store("create store directory", &self.entries_dir, e))?;

        info!(
            service = services::STORE,
            root = %self.root.display(),
            "cleaned result store"
        );
        Ok(())
    }
}

enum EntryRead {
    Found(CacheEntry),
    Absent,
    PayloadMissing,
}

enum ReadError {
    Io(io::Error),
    Corrupt(serde_json::Error),
}

fn read_json<T: DeserializeOwned>(path: &Path) -> std::result::Result<Option<T>, ReadError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ReadError::Io(e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(ReadError::Corrupt)
}

/// Returns whether the file existed
fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Age of a reservation file going by its modification time
fn orphan_marker_age(path: &Path) -> Option<std::time::Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    Some(modified.elapsed().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{FailureKind, Value};
    use std::time::Duration;
    use tempfile::TempDir;

    fn fp(c: char) -> Fingerprint {
        Fingerprint::from_hex(&c.to_string().repeat(64)).unwrap()
    }

    fn smooth() -> ImplementationId {
        ImplementationId::new("smooth", "1")
    }

    fn store(temp: &TempDir) -> FilesystemResultStore {
        FilesystemResultStore::new(temp.path(), StoreOptions::default()).unwrap()
    }

    #[test]
    fn test_absent_then_running_then_success() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let fingerprint = fp('a');

        assert!(store.lookup(&fingerprint, "1").unwrap().is_none());

        let token = store.begin(&fingerprint, &smooth(), BeginOptions::default()).unwrap();
        let running = store.lookup(&fingerprint, "1").unwrap().unwrap();
        assert_eq!(running.status(), EntryStatus::Running);

        let outputs = Outputs::new().with("smoothed", Value::file("out.nii"));
        store.commit(&token, &outputs, None).unwrap();

        let entry = store.lookup(&fingerprint, "1").unwrap().unwrap();
        assert_eq!(entry.status(), EntryStatus::Success);
        assert_eq!(entry.outputs(), Some(&outputs));
        assert!(store.reservation(&fingerprint).unwrap().is_none());

        let dir = store.entry_dir(&fingerprint);
        assert!(dir.starts_with(temp.path().join("entries").join("aa")));
    }

    #[test]
    fn test_begin_while_running_is_rejected() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let fingerprint = fp('b');

        store.begin(&fingerprint, &smooth(), BeginOptions::default()).unwrap();
        let err = store
            .begin(&fingerprint, &smooth(), BeginOptions::default())
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyRunning { .. }));

        let redundant = store
            .begin(&fingerprint, &smooth(), BeginOptions { allow_redundant: true })
            .unwrap();
        assert!(store.renew(&redundant).unwrap());
    }

    #[test]
    fn test_stale_reservation_is_reclaimed() {
        let temp = TempDir::new().unwrap();
        let store = FilesystemResultStore::new(
            temp.path(),
            StoreOptions {
                stale_after: Duration::from_millis(50),
                immutable_success: false,
            },
        )
        .unwrap();
        let fingerprint = fp('c');

        let first = store.begin(&fingerprint, &smooth(), BeginOptions::default()).unwrap();
        std::thread::sleep(Duration::from_millis(120));

        assert!(store.lookup(&fingerprint, "1").unwrap().is_none());
        let second = store.begin(&fingerprint, &smooth(), BeginOptions::default()).unwrap();
        assert_ne!(first.id, second.id);

        // The first worker lost its reservation but may still record a result
        assert!(!store.renew(&first).unwrap());
        store.commit(&first, &Outputs::new().with("n", 1), None).unwrap();
        assert_eq!(
            store.reservation(&fingerprint).unwrap().unwrap().token.id,
            second.id
        );
    }

    #[test]
    fn test_failure_is_recorded() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let fingerprint = fp('d');

        let token = store.begin(&fingerprint, &smooth(), BeginOptions::default()).unwrap();
        let failure = FailureRecord::new(FailureKind::Error, "smooth@1", "sigma out of range");
        store.fail(&token, &failure, None).unwrap();

        let entry = store.lookup(&fingerprint, "1").unwrap().unwrap();
        assert_eq!(entry.status(), EntryStatus::Failed);
        assert_eq!(entry.failure().unwrap().message, "sigma out of range");
    }

    #[test]
    fn test_other_version_is_a_miss() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let fingerprint = fp('e');

        let token = store.begin(&fingerprint, &smooth(), BeginOptions::default()).unwrap();
        store.commit(&token, &Outputs::new(), None).unwrap();

        assert!(store.lookup(&fingerprint, "1").unwrap().is_some());
        assert!(store.lookup(&fingerprint, "2").unwrap().is_none());
        assert!(store.entry(&fingerprint).unwrap().is_some());
    }

    #[test]
    fn test_tampered_payload_is_treated_as_absent() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let fingerprint = fp('f');

        let token = store.begin(&fingerprint, &smooth(), BeginOptions::default()).unwrap();
        store.commit(&token, &Outputs::new().with("n", 1), None).unwrap();

        let dir = store.entry_dir(&fingerprint);
        let payload = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .find(|p| p.file_name().unwrap().to_string_lossy().starts_with(PAYLOAD_PREFIX))
            .unwrap();
        fs::write(&payload, "{\"status\":\"success\",\"outputs\":{}}").unwrap();

        assert!(store.entry(&fingerprint).unwrap().is_none());
    }

    #[test]
    fn test_recommit_replaces_payload() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let fingerprint = fp('1');

        for n in 0..3 {
            let token = store.begin(&fingerprint, &smooth(), BeginOptions::default()).unwrap();
            store.commit(&token, &Outputs::new().with("n", n), None).unwrap();
        }

        let payloads = fs::read_dir(store.entry_dir(&fingerprint))
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(PAYLOAD_PREFIX)
            })
            .count();
        assert_eq!(payloads, 1);

        let entry = store.entry(&fingerprint).unwrap().unwrap();
        assert_eq!(entry.outputs().unwrap().get("n"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_reader_racing_recommits_always_sees_an_entry() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let fingerprint = fp('6');

        let token = store.begin(&fingerprint, &smooth(), BeginOptions::default()).unwrap();
        store.commit(&token, &Outputs::new().with("n", 0), None).unwrap();

        let misses = std::thread::scope(|scope| {
            let writer = scope.spawn(|| {
                for n in 1..40 {
                    let token = store.begin(&fingerprint, &smooth(), BeginOptions::default()).unwrap();
                    store.commit(&token, &Outputs::new().with("n", n), None).unwrap();
                    std::thread::sleep(Duration::from_millis(5));
                }
            });
            let mut misses = 0;
            while !writer.is_finished() {
                if store.entry(&fingerprint).unwrap().is_none() {
                    misses += 1;
                }
            }
            misses
        });
        assert_eq!(misses, 0);
    }

    #[test]
    fn test_missing_payload_is_treated_as_absent() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let fingerprint = fp('7');

        let token = store.begin(&fingerprint, &smooth(), BeginOptions::default()).unwrap();
        store.commit(&token, &Outputs::new().with("n", 1), None).unwrap();
        for item in fs::read_dir(store.entry_dir(&fingerprint)).unwrap() {
            let path = item.unwrap().path();
            if path.file_name().unwrap().to_string_lossy().starts_with(PAYLOAD_PREFIX) {
                fs::remove_file(path).unwrap();
            }
        }

        assert!(store.entry(&fingerprint).unwrap().is_none());
    }

    #[test]
    fn test_immutable_success_keeps_first_result() {
        let temp = TempDir::new().unwrap();
        let store = FilesystemResultStore::new(
            temp.path(),
            StoreOptions {
                immutable_success: true,
                ..Default::default()
            },
        )
        .unwrap();
        let fingerprint = fp('2');

        let token = store.begin(&fingerprint, &smooth(), BeginOptions::default()).unwrap();
        store.commit(&token, &Outputs::new().with("n", 1), None).unwrap();

        let token = store.begin(&fingerprint, &smooth(), BeginOptions::default()).unwrap();
        let kept = store.commit(&token, &Outputs::new().with("n", 2), None).unwrap();
        assert_eq!(kept.outputs().unwrap().get("n"), Some(&Value::Int(1)));
        assert!(store.reservation(&fingerprint).unwrap().is_none());
    }

    #[test]
    fn test_release_invalidate_list_and_stats() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);

        let done = store.begin(&fp('3'), &smooth(), BeginOptions::default()).unwrap();
        store.commit(&done, &Outputs::new(), None).unwrap();
        let running = store.begin(&fp('4'), &smooth(), BeginOptions::default()).unwrap();
        let released = store.begin(&fp('5'), &smooth(), BeginOptions::default()).unwrap();
        store.release(&released).unwrap();

        assert_eq!(store.list().unwrap(), vec![fp('3'), fp('4')]);

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.running, 1);
        assert!(stats.total_bytes > 0);

        assert!(store.invalidate(&fp('3')).unwrap());
        assert!(!store.invalidate(&fp('3')).unwrap());
        assert!(store.lookup(&fp('3'), "1").unwrap().is_none());

        store.release(&running).unwrap();
        store.clean_all().unwrap();
        assert!(store.list().unwrap().is_empty());
    }
}
