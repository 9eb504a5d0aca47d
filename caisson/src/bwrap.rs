//! Assembling the sandbox launcher's argument vector.

use std::{
    ffi::{OsStr, OsString},
    os::unix::io::{AsRawFd, OwnedFd, RawFd},
    path::Path,
};

/// Append-only builder for the argument vector of a
/// bubblewrap-compatible sandbox launcher.
///
/// Instructions are recorded in the order they are appended and the
/// order is significant: a later bind can shadow an earlier one.
/// Some instructions refer to file descriptors; the plan keeps those
/// descriptors open so that they can be inherited by the launcher.
///
/// Once [`finish`][`Self::finish`] has been called the plan is
/// immutable; appending to a finished plan is a programming error.
#[derive(Debug, Default)]
pub struct MountPlan
{
    argv: Vec<OsString>,
    fds: Vec<OwnedFd>,
    finished: bool,
}

impl MountPlan
{
    /// Create an empty plan.
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Append raw arguments.
    pub fn add_args<I>(&mut self, args: I)
        where I: IntoIterator, I::Item: Into<OsString>
    {
        assert!(!self.finished, "plan is already finished");
        self.argv.extend(args.into_iter().map(Into::into));
    }

    /// Append `--ro-bind SRC DEST`.
    pub fn ro_bind(&mut self, source: &Path, dest: &Path)
    {
        self.add_args([OsStr::new("--ro-bind"),
                       source.as_os_str(), dest.as_os_str()]);
    }

    /// Append `--bind SRC DEST`.
    pub fn bind(&mut self, source: &Path, dest: &Path)
    {
        self.add_args([OsStr::new("--bind"),
                       source.as_os_str(), dest.as_os_str()]);
    }

    /// Append `--tmpfs DEST`.
    pub fn tmpfs(&mut self, dest: &Path)
    {
        self.add_args([OsStr::new("--tmpfs"), dest.as_os_str()]);
    }

    /// Append `--dir DEST`.
    pub fn dir(&mut self, dest: &Path)
    {
        self.add_args([OsStr::new("--dir"), dest.as_os_str()]);
    }

    /// Append `--symlink TARGET LINK`.
    pub fn symlink(&mut self, target: &Path, link: &Path)
    {
        self.add_args([OsStr::new("--symlink"),
                       target.as_os_str(), link.as_os_str()]);
    }

    /// Append `--setenv VAR VALUE`.
    pub fn setenv(&mut self, var: impl AsRef<OsStr>, value: impl AsRef<OsStr>)
    {
        self.add_args([OsStr::new("--setenv"),
                       var.as_ref(), value.as_ref()]);
    }

    /// Append `--unsetenv VAR`.
    pub fn unsetenv(&mut self, var: impl AsRef<OsStr>)
    {
        self.add_args([OsStr::new("--unsetenv"), var.as_ref()]);
    }

    /// Append `--lock-file PATH`.
    pub fn lock_file(&mut self, path: &Path)
    {
        self.add_args([OsStr::new("--lock-file"), path.as_os_str()]);
    }

    /// Take ownership of a file descriptor that an instruction refers to.
    ///
    /// The descriptor stays open for the lifetime of the plan,
    /// so that the number returned here remains meaningful
    /// when the launcher inherits it.
    pub fn add_fd(&mut self, fd: OwnedFd) -> RawFd
    {
        assert!(!self.finished, "plan is already finished");
        let raw = fd.as_raw_fd();
        self.fds.push(fd);
        raw
    }

    /// Append all instructions and file descriptors of another plan.
    pub fn append(&mut self, other: MountPlan)
    {
        assert!(!self.finished, "plan is already finished");
        assert!(!other.finished, "appending a finished plan");
        self.argv.extend(other.argv);
        self.fds.extend(other.fds);
    }

    /// Seal the plan.
    pub fn finish(&mut self)
    {
        assert!(!self.finished, "plan is already finished");
        self.finished = true;
    }

    /// Whether [`finish`][`Self::finish`] has been called.
    pub fn was_finished(&self) -> bool
    {
        self.finished
    }

    /// The instructions recorded so far.
    pub fn argv(&self) -> &[OsString]
    {
        &self.argv
    }

    /// Decompose the plan into its argument vector
    /// and the file descriptors it refers to.
    pub fn into_parts(self) -> (Vec<OsString>, Vec<OwnedFd>)
    {
        (self.argv, self.fds)
    }
}

#[cfg(test)]
mod tests
{
    use {super::*, os_ext::{O_RDONLY, open}};

    #[test]
    fn instructions_in_order()
    {
        let mut plan = MountPlan::new();
        plan.ro_bind(Path::new("/usr"), Path::new("/run/host/usr"));
        plan.tmpfs(Path::new("/run"));
        plan.symlink(Path::new("../run"), Path::new("/var/run"));
        plan.setenv("PATH", "/usr/bin:/bin");
        plan.unsetenv("LD_PRELOAD");
        plan.lock_file(Path::new("/.ref"));
        plan.dir(Path::new("/run/caisson"));
        plan.finish();

        let expected: Vec<OsString> = [
            "--ro-bind", "/usr", "/run/host/usr",
            "--tmpfs", "/run",
            "--symlink", "../run", "/var/run",
            "--setenv", "PATH", "/usr/bin:/bin",
            "--unsetenv", "LD_PRELOAD",
            "--lock-file", "/.ref",
            "--dir", "/run/caisson",
        ].map(OsString::from).into();
        assert_eq!(plan.argv(), expected);
        assert!(plan.was_finished());
    }

    #[test]
    #[should_panic(expected = "already finished")]
    fn finished_plans_are_immutable()
    {
        let mut plan = MountPlan::new();
        plan.finish();
        plan.tmpfs(Path::new("/run"));
    }

    #[test]
    fn append_merges_argv_and_fds()
    {
        let mut inner = MountPlan::new();
        let fd = open(Path::new("/dev/null"), O_RDONLY, 0).unwrap();
        let raw = inner.add_fd(fd);
        inner.add_args(["--fd".to_owned(), raw.to_string()]);

        let mut outer = MountPlan::new();
        outer.tmpfs(Path::new("/tmp"));
        outer.append(inner);

        let (argv, fds) = outer.into_parts();
        assert_eq!(argv.len(), 4);
        assert_eq!(fds.len(), 1);
        assert_eq!(fds[0].as_raw_fd(), raw);
    }
}
