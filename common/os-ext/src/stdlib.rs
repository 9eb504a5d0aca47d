use {
    crate::path_to_cstring,
    std::{
        ffi::OsString,
        io,
        os::unix::ffi::OsStringExt,
        path::{Path, PathBuf},
    },
};

/// Call mkdtemp(3) with the given arguments.
pub fn mkdtemp(template: &Path) -> io::Result<PathBuf>
{
    let template = path_to_cstring(template)?;
    let mut template = template.into_bytes_with_nul();

    // SAFETY: template is NUL-terminated.
    let ptr = unsafe {
        libc::mkdtemp(template.as_mut_ptr() as *mut libc::c_char)
    };

    if ptr.is_null() {
        return Err(io::Error::last_os_error());
    }

    // Drop the terminating NUL again.
    template.pop();

    Ok(PathBuf::from(OsString::from_vec(template)))
}
