use {
    crate::retry_on_eintr,
    std::{
        ffi::{CStr, OsString},
        io,
        mem::forget,
        os::unix::{ffi::OsStringExt, io::{AsRawFd, OwnedFd}},
        ptr::NonNull,
    },
};

/// DIR(3) structure.
pub struct DIR
{
    inner: NonNull<libc::DIR>,
}

// NOTE: Our DIR wrapper provides no interior mutability.
//       All wrapper functions must take `&mut DIR`!
unsafe impl Send for DIR { }
unsafe impl Sync for DIR { }

impl Drop for DIR
{
    fn drop(&mut self)
    {
        // SAFETY: self.inner is owning and not dangling.
        unsafe { libc::closedir(self.inner.as_ptr()); }
    }
}

/// dirent(3) structure.
#[allow(missing_docs, non_camel_case_types)]
pub struct dirent
{
    pub d_name: OsString,
    pub d_type: u8,
}

/// Call fdopendir(3) with the given arguments.
pub fn fdopendir(fd: OwnedFd) -> io::Result<DIR>
{
    let dir = retry_on_eintr(|| {
        // SAFETY: This is always safe.
        let dir = unsafe { libc::fdopendir(fd.as_raw_fd()) };

        if let Some(dir) = NonNull::new(dir) {
            Ok(DIR{inner: dir})
        } else {
            Err(io::Error::last_os_error())
        }
    })?;

    // fd is now owned by dir.
    forget(fd);

    Ok(dir)
}

/// Call readdir(3) with the given arguments.
///
/// The entries for `.` and `..` are reported like any other;
/// skipping them is up to the caller.
/// `d_type` may be [`DT_UNKNOWN`][`crate::DT_UNKNOWN`] on some file systems,
/// in which case the caller must fall back to [`fstatat`][`crate::fstatat`].
pub fn readdir(dirp: &mut DIR) -> io::Result<Option<dirent>>
{
    retry_on_eintr(|| {
        // SAFETY: This is always safe.
        unsafe { *libc::__errno_location() = 0; }

        // SAFETY: dirp points to a valid DIR.
        let entry = unsafe { libc::readdir(dirp.inner.as_ptr()) };

        // SAFETY: This is always safe.
        let errno = unsafe { *libc::__errno_location() };

        if entry.is_null() && errno != 0 {
            return Err(io::Error::from_raw_os_error(errno));
        }

        if entry.is_null() {
            return Ok(None);
        }

        // SAFETY: d_name is a NUL-terminated string.
        let d_name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        let d_name = OsString::from_vec(d_name.to_bytes().to_vec());

        // SAFETY: entry points to a valid dirent.
        let d_type = unsafe { (*entry).d_type };

        Ok(Some(dirent{d_name, d_type}))
    })
}
