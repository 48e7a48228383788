//! Per-work single-instance guard backed by `flock(2)` on `locks/<work_id>.lock`.
//!
//! The kernel drops the lock when the holding process dies, so a crashed
//! holder never leaves a work wedged. Lock files are never removed; releasing
//! only truncates the recorded pid.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::WorkError;

#[derive(Debug)]
pub struct WorkLock {
    file: File,
    path: PathBuf,
    work_id: Uuid,
}

#[must_use]
pub fn lock_path(lock_dir: &Path, work_id: Uuid) -> PathBuf {
    lock_dir.join(format!("{work_id}.lock"))
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn try_flock(file: &File, operation: libc::c_int) -> io::Result<bool> {
    // SAFETY: the descriptor is owned by `file` and stays open for the duration of the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), operation | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

impl WorkLock {
    /// Takes the exclusive lock for `work_id` and records the current pid in it.
    ///
    /// # Errors
    /// `WorkError::AlreadyRunning` when another process (or another handle in this
    /// process) holds the lock, `WorkError::Internal` for filesystem failures.
    pub fn try_acquire(lock_dir: &Path, work_id: Uuid) -> Result<Self, WorkError> {
        fs::create_dir_all(lock_dir)
            .with_context(|| format!("failed to create lock directory {}", lock_dir.display()))?;

        let path = lock_path(lock_dir, work_id);
        let mut file = open_lock_file(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        let acquired = try_flock(&file, libc::LOCK_EX)
            .with_context(|| format!("failed to lock {}", path.display()))?;
        if !acquired {
            let pid = read_pid(&mut file);
            return Err(WorkError::AlreadyRunning { id: work_id, pid });
        }

        file.set_len(0).context("failed to truncate lock file")?;
        file.seek(SeekFrom::Start(0))
            .context("failed to rewind lock file")?;
        write!(file, "{}", std::process::id()).context("failed to record pid")?;
        file.flush().context("failed to flush lock file")?;

        debug!(work_id = %work_id, path = %path.display(), "acquired work lock");
        Ok(Self {
            file,
            path,
            work_id,
        })
    }

    #[must_use]
    pub fn work_id(&self) -> Uuid {
        self.work_id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.set_len(0) {
            warn!(work_id = %self.work_id, error = %err, "failed to clear pid from lock file");
        }
        // SAFETY: the descriptor is still owned by `self.file`.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        debug!(work_id = %self.work_id, "released work lock");
    }
}

/// Returns the pid of the process currently holding the lock, if any.
///
/// # Errors
/// Fails only on unexpected filesystem errors; a missing lock file means "not held".
pub fn holder_pid(lock_dir: &Path, work_id: Uuid) -> anyhow::Result<Option<u32>> {
    let path = lock_path(lock_dir, work_id);
    let mut file = match OpenOptions::new().read(true).open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to open {}", path.display()));
        }
    };

    if try_flock(&file, libc::LOCK_SH)
        .with_context(|| format!("failed to probe {}", path.display()))?
    {
        // SAFETY: the descriptor is owned by `file`.
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
        return Ok(None);
    }
    Ok(read_pid(&mut file))
}

/// Sends `signal` to `pid`.
///
/// # Errors
/// Returns the OS error when the signal cannot be delivered.
pub fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
