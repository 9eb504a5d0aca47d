use {
    crate::{path_to_cstring, retry_on_eintr},
    std::{
        ffi::OsString,
        io,
        os::unix::{ffi::OsStringExt, io::{AsRawFd, BorrowedFd}},
        path::{Path, PathBuf},
    },
};

/// Equivalent to [`readlinkat`] with [`None`] passed for `dirfd`.
pub fn readlink(pathname: &Path) -> io::Result<PathBuf>
{
    readlinkat(None, pathname)
}

/// Call readlinkat(2) with the given arguments.
///
/// If `dirfd` is [`None`], `AT_FDCWD` is passed.
///
/// readlinkat(2) truncates the target if it does not fit into the buffer.
/// When this happens, the wrapper function automatically retries the call
/// with a bigger buffer, until it fits.
pub fn readlinkat(dirfd: Option<BorrowedFd>, pathname: &Path)
    -> io::Result<PathBuf>
{
    let dirfd = dirfd.map(|fd| fd.as_raw_fd()).unwrap_or(libc::AT_FDCWD);
    let pathname = path_to_cstring(pathname)?;

    let mut buf: Vec<u8> = Vec::with_capacity(256);

    retry_on_eintr(|| {
        loop {
            // SAFETY: pathname is NUL-terminated, buffer size is correct.
            let len = unsafe {
                libc::readlinkat(
                    dirfd,
                    pathname.as_ptr(),
                    buf.as_mut_ptr() as *mut libc::c_char,
                    buf.capacity(),
                )
            };

            if len == -1 {
                return Err(io::Error::last_os_error());
            }

            // SAFETY: readlinkat(2) wrote this many bytes.
            unsafe { buf.set_len(len as usize); }

            if buf.len() == buf.capacity() {
                // There may have been a truncation.
                // Grow the buffer and try again.
                buf.reserve(1);
                continue;
            }

            break Ok(());
        }
    })?;

    Ok(PathBuf::from(OsString::from_vec(buf)))
}

/// Equivalent to [`symlinkat`] with [`None`] passed for `newdirfd`.
pub fn symlink(target: &Path, linkpath: &Path) -> io::Result<()>
{
    symlinkat(target, None, linkpath)
}

/// Call symlinkat(2) with the given arguments.
///
/// If `newdirfd` is [`None`], `AT_FDCWD` is passed.
pub fn symlinkat(target: &Path, newdirfd: Option<BorrowedFd>, linkpath: &Path)
    -> io::Result<()>
{
    let newdirfd = newdirfd.map(|fd| fd.as_raw_fd()).unwrap_or(libc::AT_FDCWD);
    let target = path_to_cstring(target)?;
    let linkpath = path_to_cstring(linkpath)?;

    retry_on_eintr(|| {
        // SAFETY: target and linkpath are NUL-terminated.
        let result = unsafe {
            libc::symlinkat(target.as_ptr(), newdirfd, linkpath.as_ptr())
        };

        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    })
}

/// Call unlinkat(2) with the given arguments.
///
/// If `dirfd` is [`None`], `AT_FDCWD` is passed.
/// Pass [`AT_REMOVEDIR`][`crate::AT_REMOVEDIR`] in
/// `flags` to remove a directory instead of a file.
pub fn unlinkat(dirfd: Option<BorrowedFd>, pathname: &Path, flags: libc::c_int)
    -> io::Result<()>
{
    let dirfd = dirfd.map(|fd| fd.as_raw_fd()).unwrap_or(libc::AT_FDCWD);
    let pathname = path_to_cstring(pathname)?;

    retry_on_eintr(|| {
        // SAFETY: pathname is NUL-terminated.
        let result = unsafe {
            libc::unlinkat(dirfd, pathname.as_ptr(), flags)
        };

        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    })
}

/// Call linkat(2) with the given arguments.
///
/// If `olddirfd` or `newdirfd` is [`None`], `AT_FDCWD` is passed.
pub fn linkat(
    olddirfd: Option<BorrowedFd>,
    oldpath:  &Path,
    newdirfd: Option<BorrowedFd>,
    newpath:  &Path,
    flags:    libc::c_int,
) -> io::Result<()>
{
    let olddirfd = olddirfd.map(|fd| fd.as_raw_fd()).unwrap_or(libc::AT_FDCWD);
    let newdirfd = newdirfd.map(|fd| fd.as_raw_fd()).unwrap_or(libc::AT_FDCWD);
    let oldpath = path_to_cstring(oldpath)?;
    let newpath = path_to_cstring(newpath)?;

    retry_on_eintr(|| {
        // SAFETY: oldpath and newpath are NUL-terminated.
        let result = unsafe {
            libc::linkat(
                olddirfd, oldpath.as_ptr(),
                newdirfd, newpath.as_ptr(),
                flags,
            )
        };

        if result == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(())
    })
}

/// Call geteuid(2).
pub fn geteuid() -> libc::uid_t
{
    // SAFETY: This is always safe.
    unsafe { libc::geteuid() }
}
