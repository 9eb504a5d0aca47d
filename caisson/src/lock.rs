//! Advisory file locks used as reference counts.
//!
//! A runtime image (and every temporary copy of one) carries a lock
//! file named `.ref`. Holding a read lock on it means "this runtime is
//! in use, do not delete it"; taking a write lock means "nobody is
//! using this runtime and I may delete it". The lock file contents are
//! never read; only the lock state matters.

use {
    bitflags::bitflags,
    os_ext::{
        EACCES, EAGAIN, EINVAL, ENOSYS,
        F_OFD_SETLK, F_OFD_SETLKW, F_RDLCK, F_SETLK, F_SETLKW, F_WRLCK,
        O_CREAT, O_NOCTTY, O_RDONLY, O_RDWR, SEEK_SET,
        fcntl_setlk, flock, openat,
    },
    std::{
        io,
        os::unix::io::{AsFd, BorrowedFd, OwnedFd},
        path::{Path, PathBuf},
    },
    thiserror::Error,
};

bitflags!
{
    /// How to take a [`FileLock`].
    pub struct LockFlags: u32
    {
        /// Create the lock file if it does not exist.
        const CREATE = 1 << 0;

        /// Take a write (exclusive) lock instead of
        /// a read (shared) lock.
        const WRITE = 1 << 1;

        /// Block until the lock can be taken.
        const WAIT = 1 << 2;
    }
}

/// Returned when a [`FileLock`] could not be taken.
#[derive(Debug, Error)]
pub enum LockError
{
    /// The lock file could not be opened or created.
    #[error("Unable to open lock file \"{path}\": {source}")]
    Open
    {
        path: PathBuf,
        source: io::Error,
    },

    /// Somebody else holds a conflicting lock.
    ///
    /// Only returned when [`LockFlags::WAIT`] was not given.
    #[error("Lock file \"{path}\" is held by another process")]
    Contended
    {
        path: PathBuf,
    },

    /// The lock could not be taken for any other reason.
    #[error("Unable to lock \"{path}\": {source}")]
    Lock
    {
        path: PathBuf,
        source: io::Error,
    },
}

/// An advisory lock on a `.ref` file, released on drop.
///
/// Open-file-description locks are preferred: they belong to the open
/// file description rather than to this process, so they survive fork
/// and can be handed to a child with [`steal_fd`][`Self::steal_fd`].
/// On kernels without OFD locks, process-associated locks are used
/// instead; [`is_ofd`][`Self::is_ofd`] tells the caller which kind it
/// got, so it can decide how to keep the lock alive across exec.
#[derive(Debug)]
pub struct FileLock
{
    fd: OwnedFd,
    ofd: bool,
}

impl FileLock
{
    /// Open (or create) the lock file at `path`,
    /// relative to `dirfd`, and acquire the requested lock.
    pub fn new(dirfd: Option<BorrowedFd>, path: &Path, flags: LockFlags)
        -> Result<Self, LockError>
    {
        let mut open_flags = O_NOCTTY;

        if flags.contains(LockFlags::WRITE) {
            open_flags |= O_RDWR;
        } else {
            open_flags |= O_RDONLY;
        }

        if flags.contains(LockFlags::CREATE) {
            open_flags |= O_CREAT;
        }

        let fd = openat(dirfd, path, open_flags, 0o600)
            .map_err(|source| LockError::Open{path: path.into(), source})?;

        let l_type =
            if flags.contains(LockFlags::WRITE) { F_WRLCK } else { F_RDLCK };

        let lock = flock{
            l_type:   l_type as _,
            l_whence: SEEK_SET as _,
            l_start:  0,
            l_len:    0,
            l_pid:    0,
        };

        let wait = flags.contains(LockFlags::WAIT);
        let ofd_cmd = if wait { F_OFD_SETLKW } else { F_OFD_SETLK };

        match fcntl_setlk(fd.as_fd(), ofd_cmd, &lock) {
            Ok(()) =>
                return Ok(Self{fd, ofd: true}),
            Err(err) if !ofd_unsupported(&err) =>
                return Err(classify(path, err, wait)),
            Err(_) => { },
        }

        // The kernel does not know about OFD locks.
        // Fall back to process-associated locks, which have the
        // drawback of not surviving fork and of being released when
        // *any* descriptor for the file is closed by this process.
        let cmd = if wait { F_SETLKW } else { F_SETLK };

        match fcntl_setlk(fd.as_fd(), cmd, &lock) {
            Ok(())   => Ok(Self{fd, ofd: false}),
            Err(err) => Err(classify(path, err, wait)),
        }
    }

    /// Whether this is an open-file-description lock.
    pub fn is_ofd(&self) -> bool
    {
        self.ofd
    }

    /// Give up ownership of the file descriptor without unlocking.
    ///
    /// Only meaningful for OFD locks: the lock lives on in the
    /// returned descriptor and is inherited by any child process
    /// that the descriptor is passed to.
    pub fn steal_fd(self) -> OwnedFd
    {
        self.fd
    }
}

fn ofd_unsupported(err: &io::Error) -> bool
{
    matches!(err.raw_os_error(), Some(EINVAL) | Some(ENOSYS))
}

fn classify(path: &Path, err: io::Error, wait: bool) -> LockError
{
    // Both errno values mean "held elsewhere" for the two lock
    // families; which one the kernel reports is historical accident.
    if !wait && matches!(err.raw_os_error(), Some(EAGAIN) | Some(EACCES)) {
        return LockError::Contended{path: path.into()};
    }

    LockError::Lock{path: path.into(), source: err}
}

#[cfg(test)]
mod tests
{
    use {super::*, os_ext::mkdtemp, std::fs::remove_dir_all};

    fn scratch() -> PathBuf
    {
        mkdtemp(Path::new("/tmp/caisson-test-XXXXXX")).unwrap()
    }

    #[test]
    fn read_locks_share()
    {
        let dir = scratch();
        let path = dir.join(".ref");

        let first = FileLock::new(None, &path, LockFlags::CREATE).unwrap();
        let second = FileLock::new(None, &path, LockFlags::CREATE).unwrap();
        assert!(first.is_ofd());

        drop((first, second));
        let _ = remove_dir_all(&dir);
    }

    #[test]
    fn write_locks_conflict()
    {
        let dir = scratch();
        let path = dir.join(".ref");

        let _held = FileLock::new(
            None, &path, LockFlags::CREATE | LockFlags::WRITE).unwrap();

        let result = FileLock::new(
            None, &path, LockFlags::CREATE | LockFlags::WRITE);
        assert!(matches!(result, Err(LockError::Contended{..})));

        let result = FileLock::new(None, &path, LockFlags::CREATE);
        assert!(matches!(result, Err(LockError::Contended{..})));

        let _ = remove_dir_all(&dir);
    }

    #[test]
    fn read_lock_blocks_writers_only()
    {
        let dir = scratch();
        let path = dir.join(".ref");

        let _held = FileLock::new(None, &path, LockFlags::CREATE).unwrap();

        let result = FileLock::new(
            None, &path, LockFlags::CREATE | LockFlags::WRITE);
        assert!(matches!(result, Err(LockError::Contended{..})));

        let _ = remove_dir_all(&dir);
    }

    #[test]
    fn stolen_fd_keeps_the_lock()
    {
        let dir = scratch();
        let path = dir.join(".ref");

        let held = FileLock::new(None, &path, LockFlags::CREATE).unwrap();
        assert!(held.is_ofd());
        let fd = held.steal_fd();

        let result = FileLock::new(
            None, &path, LockFlags::CREATE | LockFlags::WRITE);
        assert!(matches!(result, Err(LockError::Contended{..})));

        drop(fd);

        FileLock::new(None, &path, LockFlags::CREATE | LockFlags::WRITE)
            .unwrap();

        let _ = remove_dir_all(&dir);
    }
}
