use {
    crate::{path_to_cstring, retry_on_eintr},
    std::{
        io,
        os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
        path::Path,
    },
};

/// Equivalent to [`openat`] with [`None`] passed for `dirfd`.
pub fn open(pathname: &Path, flags: libc::c_int, mode: libc::mode_t)
    -> io::Result<OwnedFd>
{
    openat(None, pathname, flags, mode)
}

/// Call openat(2) with the given arguments.
///
/// If `dirfd` is [`None`], `AT_FDCWD` is passed.
pub fn openat(
    dirfd:    Option<BorrowedFd>,
    pathname: &Path,
    flags:    libc::c_int,
    mode:     libc::mode_t,
) -> io::Result<OwnedFd>
{
    let dirfd = dirfd.map(|fd| fd.as_raw_fd()).unwrap_or(libc::AT_FDCWD);
    let pathname = path_to_cstring(pathname)?;
    let flags = flags | libc::O_CLOEXEC;

    retry_on_eintr(|| {
        // SAFETY: pathname is NUL-terminated.
        let fd = unsafe {
            libc::openat(dirfd, pathname.as_ptr(), flags, mode)
        };

        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: fd is a new, open file descriptor.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    })
}

/// Call fcntl(2) with `F_SETLK`, `F_SETLKW`, `F_OFD_SETLK`, or `F_OFD_SETLKW`.
///
/// The caller chooses between the process-associated and the
/// open-file-description lock families through `cmd`.
/// Unlike the other wrappers, `F_SETLKW` is *not* retried on `EINTR`:
/// a blocking lock interrupted by a signal should report the interruption.
pub fn fcntl_setlk(fd: BorrowedFd, cmd: libc::c_int, lock: &libc::flock)
    -> io::Result<()>
{
    debug_assert!(matches!(
        cmd,
        libc::F_SETLK | libc::F_SETLKW | libc::F_OFD_SETLK | libc::F_OFD_SETLKW,
    ));

    // SAFETY: lock points to a valid struct flock.
    let result = unsafe { libc::fcntl(fd.as_raw_fd(), cmd, lock) };

    if result == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}
