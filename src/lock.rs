//! Store lock and atomic file replacement
//!
//! Two CLI invocations sharing a store must not interleave their
//! load-modify-save cycles, so the whole cycle runs under an exclusive
//! `fs2` lock on `store.lock`. The holder writes its pid into the lock file.
//! Data files are replaced through a named temp file in the same directory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

/// How long a CLI invocation waits for the store, in milliseconds
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5000;

const RETRY_EVERY: Duration = Duration::from_millis(50);

/// Exclusive lock on one file, released on drop.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Wait up to `timeout_ms` for the lock. Creates the lock file.
    pub fn acquire(path: impl AsRef<Path>, timeout_ms: u64) -> Result<Self> {
        let path = path.as_ref();
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut file = open_lock_file(path)?;
        loop {
            file = match Self::lock(file, path)? {
                Ok(lock) => return Ok(lock),
                Err(file) => file,
            };
            if Instant::now() >= deadline {
                tracing::warn!(path = %path.display(), timeout_ms, "store lock busy");
                return Err(Error::LockFailed(path.to_path_buf()));
            }
            std::thread::sleep(RETRY_EVERY);
        }
    }

    /// Try once. `Ok(None)` means someone else holds it.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>> {
        let path = path.as_ref();
        Ok(Self::lock(open_lock_file(path)?, path)?.ok())
    }

    /// Lock `file`, or hand it back when the lock is contended.
    fn lock(mut file: File, path: &Path) -> Result<std::result::Result<Self, File>> {
        match file.try_lock_exclusive() {
            Ok(()) => {
                file.set_len(0)?;
                file.seek(SeekFrom::Start(0))?;
                writeln!(file, "{}", std::process::id())?;
                Ok(Ok(FileLock {
                    file,
                    path: path.to_path_buf(),
                }))
            }
            Err(err) if contended(&err) => Ok(Err(file)),
            Err(err) => Err(Error::Io(err)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn contended(err: &io::Error) -> bool {
    // Windows reports a held lock as ERROR_LOCK_VIOLATION (33).
    err.kind() == io::ErrorKind::WouldBlock || (cfg!(windows) && err.raw_os_error() == Some(33))
}

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

/// Replace `path` with `data`. Readers see the old or the new contents,
/// never a mix. Takes no lock of its own.
pub fn write_atomic(path: impl AsRef<Path>, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(data)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| Error::Io(err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn store_dir() -> tempfile::TempDir {
        tempfile::tempdir().expect("tempdir")
    }

    #[test]
    fn second_holder_waits_for_drop() {
        let dir = store_dir();
        let path = dir.path().join("store.lock");

        let held = FileLock::acquire(&path, 1000).expect("first");
        assert!(FileLock::try_acquire(&path).expect("try").is_none());
        assert!(matches!(
            FileLock::acquire(&path, 60),
            Err(Error::LockFailed(failed)) if failed == path
        ));

        drop(held);
        assert!(FileLock::try_acquire(&path).expect("try").is_some());
    }

    #[test]
    fn holder_pid_is_recorded() {
        let dir = store_dir();
        let path = dir.path().join("nested").join("store.lock");

        let lock = FileLock::acquire(&path, 1000).expect("lock");
        assert_eq!(lock.path(), path.as_path());
        let recorded = fs::read_to_string(&path).expect("read");
        assert_eq!(recorded.trim(), std::process::id().to_string());
    }

    #[test]
    fn atomic_write_leaves_only_the_target() {
        let dir = store_dir();
        let path = dir.path().join("store.json");

        write_atomic(&path, br#"{"people":[]}"#).expect("first write");
        write_atomic(&path, b"{}").expect("second write");

        assert_eq!(fs::read_to_string(&path).expect("read"), "{}");
        let names: Vec<String> = fs::read_dir(dir.path())
            .expect("list")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["store.json".to_string()]);
    }

    #[test]
    fn concurrent_sessions_serialize() {
        let dir = store_dir();
        let path = dir.path().join("store.lock");
        let sessions = 6;
        let start = Arc::new(Barrier::new(sessions));
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..sessions)
            .map(|_| {
                let (start, inside, peak) = (start.clone(), inside.clone(), peak.clone());
                let path = path.clone();
                thread::spawn(move || {
                    start.wait();
                    let _lock = FileLock::acquire(&path, 5000).expect("lock");
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("session thread");
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
