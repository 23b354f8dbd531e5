//! Exclusive directory lock.
//!
//! A data directory may be opened by one process at a time. The lock is an
//! OS advisory lock on `<dir>/.lock`, released when the handle closes.

use std::fs::{File, OpenOptions};
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};

/// Held lock on a data directory. Dropping it releases the lock.
#[derive(Debug)]
pub struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    /// Name of the lock file inside the data directory.
    pub const FILE_NAME: &'static str = ".lock";

    /// Takes the lock without blocking.
    ///
    /// # Errors
    /// `WouldBlock` if another process holds it, other I/O errors otherwise.
    pub fn acquire(dir: &Path) -> IoResult<Self> {
        let path = dir.join(Self::FILE_NAME);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        lock_exclusive(&file)?;
        tracing::debug!(path = %path.display(), "data directory locked");
        Ok(Self { _file: file, path })
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> IoResult<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `file` and valid for this call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(());
    }
    let err = IoError::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Err(IoError::new(
            ErrorKind::WouldBlock,
            "data directory is locked by another process",
        ))
    } else {
        Err(err)
    }
}

#[cfg(windows)]
fn lock_exclusive(file: &File) -> IoResult<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    let handle = file.as_raw_handle() as HANDLE;
    // SAFETY: the handle is owned by `file`; OVERLAPPED is plain data.
    let ok = unsafe {
        let mut overlapped = std::mem::zeroed::<OVERLAPPED>();
        LockFileEx(
            handle,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            1,
            0,
            &mut overlapped,
        )
    };
    if ok == 0 {
        return Err(IoError::new(
            ErrorKind::WouldBlock,
            format!(
                "data directory is locked by another process: {}",
                IoError::last_os_error()
            ),
        ));
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn lock_exclusive(_file: &File) -> IoResult<()> {
    Err(IoError::new(
        ErrorKind::Unsupported,
        "directory locking is not supported on this platform",
    ))
}
