//! Extra items for talking to the operating system.
//!
//! This crate provides a safe, low-level interface to the operating system.
//! The functions in this crate are named after their underlying system calls,
//! and their behavior is identical except for the differences listed below.
//! The exact semantics of each function can be found in their man pages.
//! This is in contrast with the std crate, which gives no such guarantees.
//! This is a trade-off against cross-platform compatibility.
//!
//! # Differences with underlying system calls
//!
//! Errors are reported using [`Result`] rather than
//! through `errno` and an arbitrary return value.
//!
//! Path arguments are accepted as [`Path`][`std::path::Path`] values
//! and are made NUL-terminated by the wrapper functions.
//! If an interior NUL is found within the path,
//! the wrapper function fails with `EINVAL`.
//!
//! When a new file descriptor is created by one of the functions,
//! it is created with the `FD_CLOEXEC` bit set (atomically).
//! That is, the `*_CLOEXEC` flag is set implicitly by the wrapper functions.
//! This ensures no resources are leaked in a threaded program that forks.
//!
//! If the system call fails with `EINTR` (interrupted),
//! the wrapper function automatically retries it.
//!
//! [`Result`]: `std::io::Result`

#![warn(missing_docs)]

pub use {
    self::{dirent_::*, fcntl::*, stdlib::*, sys_stat::*, unistd::*},
    libc::{
        AT_REMOVEDIR, AT_SYMLINK_FOLLOW, AT_SYMLINK_NOFOLLOW,
        DT_DIR, DT_LNK, DT_REG, DT_UNKNOWN,
        EACCES, EAGAIN, EINVAL, ELOOP, ENOSYS,
        F_OFD_SETLK, F_OFD_SETLKW, F_RDLCK, F_SETLK, F_SETLKW, F_UNLCK,
        F_WRLCK,
        O_CREAT, O_DIRECTORY, O_NOCTTY, O_NOFOLLOW, O_PATH, O_RDONLY,
        O_RDWR, O_WRONLY,
        SEEK_SET,
        S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, S_IXGRP, S_IXOTH, S_IXUSR,
    },
};

use std::{
    ffi::CString,
    io::{self, ErrorKind::Interrupted},
    os::unix::ffi::OsStrExt,
    path::Path,
};

mod dirent_;
mod fcntl;
mod stdlib;
mod sys_stat;
mod unistd;

// Cannot `pub use` as that would also export the stat function.
#[allow(missing_docs, non_camel_case_types)]
pub type stat = libc::stat;

#[allow(missing_docs, non_camel_case_types)]
pub type flock = libc::flock;

/// Call `f` until it no longer fails with `EINTR`.
fn retry_on_eintr<F, T>(mut f: F) -> io::Result<T>
    where F: FnMut() -> io::Result<T>
{
    loop {
        match f() {
            Err(err) if err.kind() == Interrupted => continue,
            result                                => return result,
        }
    }
}

/// Make a path NUL-terminated.
fn path_to_cstring(path: &Path) -> io::Result<CString>
{
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}
