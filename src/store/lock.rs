/// Per-fingerprint advisory lock
///
/// Serializes mutation of a single entry directory across threads and
/// processes. Held only for the duration of a read-decide-write step, never
/// while a unit of work executes.
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::Path;

use crate::error::{EngineError, Result};

const LOCK_FILE: &str = ".lock";

#[derive(Debug)]
pub(crate) struct EntryLock {
    file: File,
}

impl EntryLock {
    /// Block until the lock on `entry_dir` is held
    pub(crate) fn acquire(entry_dir: &Path) -> Result<Self> {
        fs::create_dir_all(entry_dir)
            .map_err(|e| EngineError::store("create entry directory", entry_dir, e))?;

        let lock_path = entry_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| EngineError::store("open lock file", &lock_path, e))?;

        file.lock_exclusive()
            .map_err(|e| EngineError::store("acquire entry lock", &lock_path, e))?;

        Ok(Self { file })
    }

    pub(crate) fn is_lock_file(name: &str) -> bool {
        name == LOCK_FILE
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_lock_is_exclusive_across_threads() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().to_path_buf();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dir = dir.clone();
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    let _lock = EntryLock::acquire(&dir).unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(dir.join(LOCK_FILE).exists());
    }
}
