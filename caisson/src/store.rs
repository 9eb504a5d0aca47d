//! The mutable runtime store.
//!
//! A runtime image is immutable, but composition sometimes needs to
//! edit the runtime (delete shadowed libraries, replace ld.so with a
//! symlink). For that we keep a *store*: a parent directory holding
//! temporary copies of the image, named `tmp-XXXXXX`. Each copy carries
//! its own `usr/.ref` lock; a copy whose lock can be taken for writing
//! is garbage, unless a `keep` marker says otherwise.
//!
//! Concurrent launches may share one store. The discipline is:
//! a read lock on `parent/.ref` is held for the whole preparation,
//! garbage collection only ever *tries* write locks and never blocks,
//! and a new copy takes its own read lock before the parent lock is
//! released.

use {
    crate::lock::{FileLock, LockError, LockFlags},
    anyhow::Context,
    log::{debug, warn},
    os_ext::{
        AT_SYMLINK_NOFOLLOW, DT_DIR,
        O_DIRECTORY, O_PATH, O_RDONLY,
        S_IFDIR, S_IFLNK, S_IFMT, S_IFREG,
        fdopendir, fstatat, linkat, mkdtemp, open, readdir, readlink,
        symlinkat, unlinkat,
    },
    std::{
        fs,
        io::ErrorKind::{AlreadyExists, NotFound},
        os::unix::io::AsFd,
        path::{Path, PathBuf},
    },
};

/// A prepared temporary copy of the runtime image.
///
/// The copy is read-locked for the lifetime of this value (or until
/// the lock is [taken][`Self::take_lock`] for handing over to the
/// in-container supervisor). Dropping it releases the lock but leaves
/// the directory behind: deleting it is the job of a *future*
/// launch's garbage collection, which is the only code that can know
/// nobody is using it any more.
#[derive(Debug)]
pub struct MutableRuntime
{
    path: PathBuf,
    lock: Option<FileLock>,
}

impl MutableRuntime
{
    /// Path of the copy, a complete sysroot.
    pub fn path(&self) -> &Path
    {
        &self.path
    }

    /// Take the copy's read lock out of the session.
    ///
    /// Panics if called twice.
    pub fn take_lock(&mut self) -> FileLock
    {
        self.lock.take().expect("runtime lock was already taken")
    }
}

/// Create a locked temporary copy of `image` inside `parent`.
///
/// Implements the store protocol: create and read-lock the parent,
/// optionally garbage-collect unused copies, copy the image cheaply,
/// break the hard-linked lock files, and read-lock the copy before
/// releasing the parent lock.
pub fn prepare_mutable(parent: &Path, image: &Path, gc: bool)
    -> anyhow::Result<MutableRuntime>
{
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new().recursive(true).mode(0o700).create(parent)
            .with_context(|| format!("Unable to create {parent:?}"))?;
    }

    let parent_fd = open(parent, O_DIRECTORY | O_PATH, 0)
        .with_context(|| format!("Unable to open {parent:?}"))?;

    // Lock the parent directory. Anything that directly manipulates
    // the temporary runtimes is expected to do the same, so that it
    // cannot be deleting temporary runtimes at the same time we're
    // creating them.
    //
    // This is a read-mode lock: it's OK to create more than one
    // temporary runtime in parallel, as long as nothing is deleting
    // them concurrently.
    let parent_lock =
        FileLock::new(Some(parent_fd.as_fd()), Path::new(".ref"),
                      LockFlags::CREATE)
        .with_context(|| format!("Unable to lock \"{}/.ref\"",
                                 parent.display()))?;

    // GC old runtimes (if they have become unused) before we create a
    // new one, so that one game run concurrently keeps at most one
    // temporary copy alive per launch.
    if gc {
        garbage_collect(parent, &parent_lock);
    }

    let temp_dir = mkdtemp(&parent.join("tmp-XXXXXX"))
        .with_context(|| format!("Cannot create temporary directory \
                                  in {parent:?}"))?;

    let source_usr = image.join("usr");
    let is_just_usr = !source_usr.is_dir();

    if is_just_usr {
        // ${image}/usr does not exist, so assume it's a merged /usr.
        // Copy ${image}/bin to ${temp_dir}/usr/bin, etc.
        cheap_tree_copy(image, &temp_dir.join("usr"))?;
    } else {
        // ${image}/usr exists, so assume it's a complete sysroot.
        // Copy ${image}/bin to ${temp_dir}/bin, etc.
        cheap_tree_copy(image, &temp_dir)?;
    }

    let temp_dir_fd = open(&temp_dir, O_DIRECTORY | O_PATH, 0)
        .with_context(|| format!("Unable to open {temp_dir:?}"))?;

    // We need to break the hard link for the lock files, otherwise the
    // temporary copy would share its locked/unlocked state with the
    // original.
    for ref_name in [".ref", "usr/.ref"] {
        match unlinkat(Some(temp_dir_fd.as_fd()), Path::new(ref_name), 0) {
            Ok(()) => { },
            Err(err) if err.kind() == NotFound => { },
            Err(err) =>
                return Err(err).with_context(|| format!(
                    "Cannot remove \"{}/{ref_name}\"", temp_dir.display())),
        }
    }

    // Create the copy in a pre-locked state, so that after the parent
    // lock is released the copy still cannot be deleted while in use,
    // even if a cleanup process takes a write lock on the parent.
    let copy_lock =
        FileLock::new(Some(temp_dir_fd.as_fd()), Path::new("usr/.ref"),
                      LockFlags::CREATE)
        .with_context(|| format!("Unable to lock \"{}/usr/.ref\" \
                                  in temporary runtime",
                                 temp_dir.display()))?;

    if is_just_usr {
        symlinkat(Path::new("usr/.ref"), Some(temp_dir_fd.as_fd()),
                  Path::new(".ref"))
            .with_context(|| format!(
                "Cannot create symlink \"{}/.ref\" -> usr/.ref",
                temp_dir.display()))?;
    }

    // Create symlinks ${temp_dir}/bin -> usr/bin, etc. if missing.
    //
    // Also make etc and var symlinks, for the benefit of tools like
    // the capture helper reading /etc/ld.so.cache in the incomplete
    // container (in the final container they are assembled from
    // individual binds instead).
    let members = if is_just_usr { image } else { source_usr.as_path() };

    for entry in fs::read_dir(members)
        .with_context(|| format!("Unable to list {members:?}"))?
    {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();

        let is_wanted = matches!(&*name_str, "bin" | "etc" | "sbin" | "var")
            || (name_str.starts_with("lib") && name_str != "libexec");

        if !is_wanted {
            continue;
        }

        let target = Path::new("usr").join(&name);

        match symlinkat(&target, Some(temp_dir_fd.as_fd()),
                        Path::new(&name)) {
            Ok(()) => { },
            // If the image was not just /usr, its root directory may
            // already have had directories or symlinks for these.
            Err(err) if err.kind() == AlreadyExists && !is_just_usr => { },
            Err(err) =>
                return Err(err).with_context(|| format!(
                    "Cannot create symlink \"{}/{}\" -> {:?}",
                    temp_dir.display(), name.to_string_lossy(), target)),
        }
    }

    // Hand over from holding a lock on the parent to just holding a
    // lock on the copy.
    drop(parent_lock);

    Ok(MutableRuntime{path: temp_dir, lock: Some(copy_lock)})
}

/// Delete every unused `tmp-*` entry of the store.
///
/// Never blocks and never fails the launch: every obstacle merely
/// keeps the affected entry around for a later attempt.
/// The caller must hold at least a read lock on the parent directory;
/// taking `parent_lock` as a parameter is how we remember that.
fn garbage_collect(parent: &Path, _parent_lock: &FileLock)
{
    let iter = open(parent, O_DIRECTORY | O_RDONLY, 0)
        .and_then(fdopendir);

    let mut iter = match iter {
        Ok(iter) => iter,
        Err(err) => {
            warn!("Unable to open {parent:?} for garbage collection: {err}");
            return;
        },
    };

    loop {
        let entry = match readdir(&mut iter) {
            Ok(Some(entry)) => entry,
            Ok(None)        => break,
            Err(err) => {
                warn!("Unable to iterate over {parent:?}: {err}");
                break;
            },
        };

        let name = entry.d_name;

        if entry.d_type != DT_DIR {
            debug!("Ignoring {parent:?}/{name:?}: not a directory");
            continue;
        }

        let name = match name.to_str() {
            Some(name) => name,
            None => continue,
        };

        if !name.starts_with("tmp-") {
            debug!("Ignoring {parent:?}/{name}: not tmp-*");
            continue;
        }

        debug!("Found temporary runtime {parent:?}/{name}, \
                considering whether to delete it...");

        let entry_path = parent.join(name);

        match fstatat(None, &entry_path.join("keep"), AT_SYMLINK_NOFOLLOW) {
            Ok(_) => {
                debug!("Not deleting {entry_path:?}: ./keep exists");
                continue;
            },
            Err(err) if err.kind() == NotFound => { },
            Err(err) => {
                // EACCES or something? Give it the benefit of the doubt.
                warn!("Not deleting {entry_path:?}: \
                       unable to stat ./keep: {err}");
                continue;
            },
        }

        // The lock file is usr/.ref. Entries whose /usr never got
        // copied have no lock file to consult; only for those
        // (never on contention!) fall back to a lock file at the top.
        let lock = match FileLock::new(None,
                                       &entry_path.join("usr/.ref"),
                                       LockFlags::WRITE) {
            Err(LockError::Open{source, ..})
                if source.kind() == NotFound =>
                FileLock::new(None, &entry_path.join(".ref"),
                              LockFlags::CREATE | LockFlags::WRITE),
            result => result,
        };

        if let Err(err) = lock {
            debug!("Ignoring {entry_path:?}: unable to get lock: {err}");
            continue;
        }

        debug!("Deleting {entry_path:?}...");

        // We have the lock, which would not have happened if someone
        // was still using the runtime, so we can safely delete it.
        if let Err(err) = fs::remove_dir_all(&entry_path) {
            debug!("Unable to delete {entry_path:?}: {err}");
        }
    }
}

/// Copy a tree as cheaply as possible.
///
/// Regular files become hard links where the filesystem allows it and
/// real copies where it does not; directories and symlinks are
/// recreated. Special files are skipped. The top-level destination
/// directory may already exist.
pub fn cheap_tree_copy(source: &Path, dest: &Path) -> anyhow::Result<()>
{
    let statbuf = fstatat(None, source, AT_SYMLINK_NOFOLLOW)
        .with_context(|| format!("Unable to stat {source:?}"))?;

    match statbuf.st_mode & S_IFMT {
        S_IFDIR => {
            match os_ext::mkdir(dest, statbuf.st_mode & 0o777) {
                Ok(()) => { },
                Err(err) if err.kind() == AlreadyExists => { },
                Err(err) =>
                    return Err(err).with_context(
                        || format!("Unable to create {dest:?}")),
            }

            for entry in fs::read_dir(source)
                .with_context(|| format!("Unable to list {source:?}"))?
            {
                let entry = entry?;
                let name = entry.file_name();
                cheap_tree_copy(&source.join(&name), &dest.join(&name))?;
            }
        },

        S_IFLNK => {
            let target = readlink(source)
                .with_context(|| format!("Unable to read link {source:?}"))?;
            symlinkat(&target, None, dest)
                .with_context(|| format!("Unable to create {dest:?}"))?;
        },

        S_IFREG => {
            match linkat(None, source, None, dest, 0) {
                Ok(()) => { },
                Err(_) => {
                    // Different filesystem, or hard links forbidden.
                    fs::copy(source, dest)
                        .with_context(|| format!(
                            "Unable to copy {source:?} to {dest:?}"))?;
                },
            }
        },

        _ => {
            debug!("Not copying special file {source:?}");
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        os_ext::symlink,
        std::{fs::remove_dir_all, os::linux::fs::MetadataExt},
    };

    fn scratch() -> PathBuf
    {
        mkdtemp(Path::new("/tmp/caisson-test-XXXXXX")).unwrap()
    }

    /// A sysroot-shaped image: /usr exists, some top-level
    /// symlinks already exist, some are missing.
    fn sysroot_image(dir: &Path) -> PathBuf
    {
        let image = dir.join("image");
        fs::create_dir_all(image.join("usr/bin")).unwrap();
        fs::create_dir_all(image.join("usr/lib")).unwrap();
        fs::create_dir_all(image.join("usr/sbin")).unwrap();
        fs::create_dir_all(image.join("etc")).unwrap();
        fs::write(image.join("usr/bin/env"), "#!").unwrap();
        fs::write(image.join("usr/lib/libz.so.1"), "").unwrap();
        fs::write(image.join("etc/ld.so.conf"), "").unwrap();
        fs::write(image.join(".ref"), "").unwrap();
        fs::write(image.join("usr/.ref"), "").unwrap();
        symlink(Path::new("usr/bin"), &image.join("bin")).unwrap();
        image
    }

    /// A merged-/usr image: /bin etc. live at the top level.
    fn merged_image(dir: &Path) -> PathBuf
    {
        let image = dir.join("merged");
        fs::create_dir_all(image.join("bin")).unwrap();
        fs::create_dir_all(image.join("lib/x86_64-linux-gnu")).unwrap();
        fs::write(image.join("bin/env"), "#!").unwrap();
        fs::write(image.join("lib/x86_64-linux-gnu/libz.so.1"), "").unwrap();
        fs::write(image.join(".ref"), "").unwrap();
        image
    }

    fn single_store_entry(parent: &Path) -> PathBuf
    {
        let mut entries: Vec<PathBuf> = fs::read_dir(parent).unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.file_name().unwrap()
                         .to_string_lossy().starts_with("tmp-"))
            .collect();
        assert_eq!(entries.len(), 1);
        entries.pop().unwrap()
    }

    #[test]
    fn prepare_from_sysroot_image()
    {
        let dir = scratch();
        let image = sysroot_image(&dir);
        let parent = dir.join("store");

        let runtime = prepare_mutable(&parent, &image, false).unwrap();
        let copy = single_store_entry(&parent);
        assert_eq!(runtime.path(), copy);

        // The tree arrived, with regular files hard-linked.
        assert!(copy.join("usr/bin/env").is_file());
        assert!(copy.join("etc/ld.so.conf").is_file());
        let source_ino = fs::metadata(image.join("usr/bin/env"))
            .unwrap().st_ino();
        let copy_ino = fs::metadata(copy.join("usr/bin/env"))
            .unwrap().st_ino();
        assert_eq!(source_ino, copy_ino);

        // The lock files do not share state with the image.
        let source_ref = fs::metadata(image.join("usr/.ref")).unwrap();
        let copy_ref = fs::metadata(copy.join("usr/.ref")).unwrap();
        assert_ne!(source_ref.st_ino(), copy_ref.st_ino());

        // Pre-existing top-level entries survive;
        // missing ones become symlinks into usr.
        assert!(copy.join("bin").symlink_metadata().unwrap()
                    .file_type().is_symlink());
        assert_eq!(fs::read_link(copy.join("sbin")).unwrap(),
                   PathBuf::from("usr/sbin"));

        let _ = remove_dir_all(&dir);
    }

    #[test]
    fn prepare_from_merged_image()
    {
        let dir = scratch();
        let image = merged_image(&dir);
        let parent = dir.join("store");

        let runtime = prepare_mutable(&parent, &image, false).unwrap();
        let copy = runtime.path();

        assert!(copy.join("usr/bin/env").is_file());
        assert!(copy.join("usr/lib/x86_64-linux-gnu/libz.so.1").is_file());

        // Lock file consistency for merged-/usr copies:
        // .ref is a symlink to usr/.ref, resolving to the same inode.
        assert_eq!(fs::read_link(copy.join(".ref")).unwrap(),
                   PathBuf::from("usr/.ref"));
        assert_eq!(fs::metadata(copy.join(".ref")).unwrap().st_ino(),
                   fs::metadata(copy.join("usr/.ref")).unwrap().st_ino());

        assert_eq!(fs::read_link(copy.join("bin")).unwrap(),
                   PathBuf::from("usr/bin"));
        assert_eq!(fs::read_link(copy.join("lib")).unwrap(),
                   PathBuf::from("usr/lib"));

        let _ = remove_dir_all(&dir);
    }

    #[test]
    fn gc_respects_locks_and_keep_markers()
    {
        let dir = scratch();
        let image = merged_image(&dir);
        let parent = dir.join("store");

        // An entry somebody is still using.
        let in_use = parent.join("tmp-inuse");
        fs::create_dir_all(in_use.join("usr")).unwrap();
        let _held = FileLock::new(None, &in_use.join("usr/.ref"),
                                  LockFlags::CREATE).unwrap();

        // An entry protected by a keep marker.
        let kept = parent.join("tmp-kept");
        fs::create_dir_all(kept.join("usr")).unwrap();
        fs::write(kept.join("usr/.ref"), "").unwrap();
        fs::write(kept.join("keep"), "").unwrap();

        // An unused entry.
        let garbage = parent.join("tmp-garbage");
        fs::create_dir_all(garbage.join("usr")).unwrap();
        fs::write(garbage.join("usr/.ref"), "").unwrap();

        // Distractions that GC must leave alone.
        fs::write(parent.join("tmp-notadir"), "").unwrap();
        fs::create_dir_all(parent.join("unrelated")).unwrap();

        let runtime = prepare_mutable(&parent, &image, true).unwrap();

        assert!(in_use.is_dir(), "locked entry must survive GC");
        assert!(kept.is_dir(), "keep marker must survive GC");
        assert!(!garbage.exists(), "unused entry must be deleted");
        assert!(parent.join("tmp-notadir").is_file());
        assert!(parent.join("unrelated").is_dir());
        assert!(runtime.path().is_dir());

        let _ = remove_dir_all(&dir);
    }

    #[test]
    fn released_copy_is_reclaimed_by_later_gc()
    {
        let dir = scratch();
        let image = merged_image(&dir);
        let parent = dir.join("store");

        let first = prepare_mutable(&parent, &image, false).unwrap();
        let first_path = first.path().to_owned();
        drop(first);
        assert!(first_path.is_dir(), "drop must not delete the copy");

        let second = prepare_mutable(&parent, &image, true).unwrap();
        assert!(!first_path.exists(),
                "released copy must be garbage-collected");
        assert!(second.path().is_dir());

        let _ = remove_dir_all(&dir);
    }
}
