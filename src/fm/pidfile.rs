use crate::fm::fsutil::{read_to_string_opt, remove_file_opt, write_atomic};
use anyhow::Context as _;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A single decimal PID persisted at a well-known path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when the file is missing, empty or not a positive integer.
    pub fn load(&self) -> Option<i32> {
        let raw = read_to_string_opt(&self.path).ok()??;
        raw.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
    }

    pub fn save(&self, pid: i32) -> anyhow::Result<()> {
        write_atomic(&self.path, pid.to_string().as_bytes())
    }

    pub fn remove(&self) -> anyhow::Result<()> {
        remove_file_opt(&self.path)
    }

    /// Take the singleton lock for this PID file and record our own PID in it.
    ///
    /// The returned guard holds an exclusive `flock` for as long as it lives; a second process
    /// asking for the same lock gets [`LockError::Held`].
    pub fn acquire(&self) -> Result<PidLock, LockError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create_dir_all {}", parent.display()))
                .map_err(LockError::Io)?;
        }
        // No truncate before the lock is ours: the holder's PID must stay readable.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .with_context(|| format!("open pid file {}", self.path.display()))
            .map_err(LockError::Io)?;
        let mut lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(l) => l,
            Err((_, Errno::EWOULDBLOCK)) => return Err(LockError::Held { holder: self.load() }),
            Err((_, e)) => {
                return Err(LockError::Io(anyhow::anyhow!(
                    "flock {} failed: {e}",
                    self.path.display()
                )))
            }
        };
        write_own_pid(&mut lock)
            .with_context(|| format!("write pid file {}", self.path.display()))
            .map_err(LockError::Io)?;
        Ok(PidLock {
            pid_file: self.clone(),
            _lock: lock,
        })
    }
}

fn write_own_pid(f: &mut File) -> std::io::Result<()> {
    f.set_len(0)?;
    f.seek(SeekFrom::Start(0))?;
    f.write_all(std::process::id().to_string().as_bytes())?;
    f.flush()
}

#[derive(Debug)]
pub enum LockError {
    /// Another live process holds the lock.
    Held { holder: Option<i32> },
    Io(anyhow::Error),
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Held { holder: Some(pid) } => write!(f, "already running (pid {pid})"),
            LockError::Held { holder: None } => f.write_str("already running"),
            LockError::Io(e) => write!(f, "{e:#}"),
        }
    }
}

impl std::error::Error for LockError {}

/// Held for a role's whole lifetime. Dropping it releases the lock and removes the PID file.
pub struct PidLock {
    pid_file: PidFile,
    _lock: Flock<File>,
}

impl PidLock {
    pub fn pid_file(&self) -> &PidFile {
        &self.pid_file
    }
}

impl std::fmt::Debug for PidLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PidLock").field("path", &self.pid_file.path).finish()
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = self.pid_file.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let pf = PidFile::new(dir.path().join("pid").join("job.pid"));
        assert_eq!(pf.load(), None);
        pf.save(4242).unwrap();
        assert_eq!(pf.load(), Some(4242));
        pf.remove().unwrap();
        assert_eq!(pf.load(), None);
    }

    #[test]
    fn garbage_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let pf = PidFile::new(dir.path().join("x.pid"));
        std::fs::write(pf.path(), "not-a-pid").unwrap();
        assert_eq!(pf.load(), None);
        std::fs::write(pf.path(), "-3").unwrap();
        assert_eq!(pf.load(), None);
        std::fs::write(pf.path(), " 17\n").unwrap();
        assert_eq!(pf.load(), Some(17));
    }

    #[test]
    fn second_acquire_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let pf = PidFile::new(dir.path().join("role.pid"));
        let guard = pf.acquire().unwrap();
        assert_eq!(pf.load(), Some(std::process::id() as i32));

        match pf.acquire() {
            Err(LockError::Held { holder }) => assert_eq!(holder, Some(std::process::id() as i32)),
            other => panic!("expected Held, got {other:?}"),
        }

        drop(guard);
        assert_eq!(pf.load(), None);
        let again = pf.acquire().unwrap();
        assert_eq!(again.pid_file().load(), Some(std::process::id() as i32));
    }
}
