use {
    crate::{path_to_cstring, stat},
    std::{
        io,
        mem::MaybeUninit,
        os::unix::io::{AsRawFd, BorrowedFd},
        path::Path,
    },
};

/// Call fstatat(2) with the given arguments.
///
/// If `dirfd` is [`None`], `AT_FDCWD` is passed.
pub fn fstatat(
    dirfd:    Option<BorrowedFd>,
    pathname: &Path,
    flags:    libc::c_int,
) -> io::Result<stat>
{
    let dirfd = dirfd.map(|fd| fd.as_raw_fd()).unwrap_or(libc::AT_FDCWD);
    let pathname = path_to_cstring(pathname)?;

    let mut statbuf = MaybeUninit::uninit();

    // SAFETY: pathname is NUL-terminated.
    let result = unsafe {
        libc::fstatat(
            dirfd,
            pathname.as_ptr(),
            statbuf.as_mut_ptr(),
            flags,
        )
    };

    if result == -1 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: fstatat initialized statbuf.
    Ok(unsafe { statbuf.assume_init() })
}

/// Equivalent to [`mkdirat`] with [`None`] passed for `dirfd`.
pub fn mkdir(pathname: &Path, mode: libc::mode_t) -> io::Result<()>
{
    mkdirat(None, pathname, mode)
}

/// Call mkdirat(2) with the given arguments.
///
/// If `dirfd` is [`None`], `AT_FDCWD` is passed.
pub fn mkdirat(dirfd: Option<BorrowedFd>, pathname: &Path, mode: libc::mode_t)
    -> io::Result<()>
{
    let dirfd = dirfd.map(|fd| fd.as_raw_fd()).unwrap_or(libc::AT_FDCWD);
    let pathname = path_to_cstring(pathname)?;

    // SAFETY: pathname is NUL-terminated.
    let result = unsafe { libc::mkdirat(dirfd, pathname.as_ptr(), mode) };

    if result == -1 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}
