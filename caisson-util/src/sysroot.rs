//! Resolving paths inside a sysroot.
//!
//! A runtime copy is a directory tree shaped like a filesystem root.
//! Symbolic links inside it must be interpreted as if the tree were
//! mounted at `/`: an absolute target points back into the tree,
//! never at the real host root.

use {
    os_ext::{
        AT_SYMLINK_NOFOLLOW, ELOOP, S_IFLNK, S_IFMT,
        fstatat, mkdir, readlink,
    },
    std::{
        collections::VecDeque,
        ffi::{OsStr, OsString},
        io::{self, ErrorKind::NotFound},
        path::{Component, Path, PathBuf},
    },
};

// Same bound as the kernel's.
const MAX_SYMLINK_HOPS: usize = 40;

/// Resolve `path` inside the sysroot at `root`.
///
/// Follows symbolic links without ever escaping `root`.
/// On success the returned path is relative to `root`
/// and contains no symbolic links.
pub fn resolve(root: &Path, path: &Path) -> io::Result<PathBuf>
{
    resolve_with(root, path, false)
}

/// Like [`resolve`], but create missing components as directories,
/// mode 0755, like `mkdir -p`.
pub fn resolve_mkdir_p(root: &Path, path: &Path) -> io::Result<PathBuf>
{
    resolve_with(root, path, true)
}

fn resolve_with(root: &Path, path: &Path, mkdir_p: bool)
    -> io::Result<PathBuf>
{
    let mut queue = VecDeque::new();
    push_components(&mut queue, path);

    let mut stack = Vec::<OsString>::new();
    let mut hops = MAX_SYMLINK_HOPS;

    while let Some(component) = queue.pop_front() {
        if component == OsStr::new("..") {
            // Like in a chroot, `..` at the root stays at the root.
            stack.pop();
            continue;
        }

        let mut current = root.to_path_buf();
        current.extend(&stack);
        current.push(&component);

        let statbuf = match fstatat(None, &current, AT_SYMLINK_NOFOLLOW) {
            Ok(statbuf) => statbuf,
            Err(err) if err.kind() == NotFound && mkdir_p => {
                mkdir(&current, 0o755)?;
                stack.push(component);
                continue;
            },
            Err(err) => return Err(err),
        };

        if statbuf.st_mode & S_IFMT == S_IFLNK {
            if hops == 0 {
                return Err(io::Error::from_raw_os_error(ELOOP));
            }
            hops -= 1;

            let target = readlink(&current)?;

            if target.is_absolute() {
                stack.clear();
            }

            // Splice the target in place of the link component.
            let mut rest = VecDeque::new();
            push_components(&mut rest, &target);
            while let Some(c) = rest.pop_back() {
                queue.push_front(c);
            }

            continue;
        }

        stack.push(component);
    }

    Ok(stack.iter().collect())
}

fn push_components(queue: &mut VecDeque<OsString>, path: &Path)
{
    for component in path.components() {
        match component {
            Component::Normal(c)  => queue.push_back(c.to_owned()),
            Component::ParentDir  => queue.push_back("..".into()),
            Component::RootDir    |
            Component::CurDir     |
            Component::Prefix(_)  => { },
        }
    }
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        os_ext::{mkdtemp, symlink},
        std::fs::{self, remove_dir_all},
    };

    fn scratch() -> PathBuf
    {
        mkdtemp(Path::new("/tmp/caisson-test-XXXXXX")).unwrap()
    }

    #[test]
    fn follows_relative_links()
    {
        let root = scratch();
        fs::create_dir_all(root.join("usr/lib/x86_64-linux-gnu")).unwrap();
        fs::create_dir_all(root.join("usr/lib64")).unwrap();
        fs::write(root.join("usr/lib/x86_64-linux-gnu/ld-2.31.so"), "").unwrap();
        symlink(Path::new("usr/lib64"), &root.join("lib64")).unwrap();
        symlink(Path::new("../lib/x86_64-linux-gnu/ld-2.31.so"),
                &root.join("usr/lib64/ld-linux-x86-64.so.2")).unwrap();

        let resolved =
            resolve(&root, Path::new("/lib64/ld-linux-x86-64.so.2")).unwrap();
        assert_eq!(resolved,
                   PathBuf::from("usr/lib/x86_64-linux-gnu/ld-2.31.so"));

        let _ = remove_dir_all(&root);
    }

    #[test]
    fn absolute_links_stay_inside()
    {
        let root = scratch();
        fs::create_dir_all(root.join("usr/share")).unwrap();
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::write(root.join("usr/share/zoneinfo"), "").unwrap();
        symlink(Path::new("/usr/share/zoneinfo"),
                &root.join("etc/localtime")).unwrap();

        let resolved = resolve(&root, Path::new("etc/localtime")).unwrap();
        assert_eq!(resolved, PathBuf::from("usr/share/zoneinfo"));

        let _ = remove_dir_all(&root);
    }

    #[test]
    fn missing_component_is_an_error()
    {
        let root = scratch();
        let err = resolve(&root, Path::new("no/such/file")).unwrap_err();
        assert_eq!(err.kind(), NotFound);
        let _ = remove_dir_all(&root);
    }

    #[test]
    fn loops_are_detected()
    {
        let root = scratch();
        symlink(Path::new("b"), &root.join("a")).unwrap();
        symlink(Path::new("a"), &root.join("b")).unwrap();
        let err = resolve(&root, Path::new("a")).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(ELOOP));
        let _ = remove_dir_all(&root);
    }

    #[test]
    fn mkdir_p_creates_directories()
    {
        let root = scratch();
        let resolved =
            resolve_mkdir_p(&root, Path::new("/usr/lib/caisson/overrides"))
                .unwrap();
        assert_eq!(resolved, PathBuf::from("usr/lib/caisson/overrides"));
        assert!(root.join("usr/lib/caisson/overrides").is_dir());
        let _ = remove_dir_all(&root);
    }
}
