//! Per-architecture pieces of the composition pass.

use {
    crate::{
        capture::{CaptureContext, Expr, LINK_TARGET, print_ld_so},
        probe::DriverSo,
    },
    anyhow::Context,
    caisson_util::elf,
    log::{debug, warn},
    std::{
        collections::BTreeSet,
        ffi::OsString,
        fs,
        path::{Path, PathBuf},
    },
};

/// Static description of a supported CPU architecture.
#[derive(Debug)]
pub struct ArchDef
{
    /// Debian-style multiarch tuple.
    pub tuple: &'static str,

    /// Legacy single-directory name (`lib64`, `lib32`).
    ///
    /// Not every architecture has one, so this is optional;
    /// by convention only the last tuple may lack it.
    pub libqual: Option<&'static str>,
}

/// The multiarch tuples we know how to compose, in priority order.
///
/// The order is observable: on basename collisions, a later entry's
/// drivers win, and emitted search paths list entries in this order.
pub const MULTIARCH_TUPLES: [ArchDef; 2] = [
    ArchDef{tuple: "x86_64-linux-gnu", libqual: Some("lib64")},
    ArchDef{tuple: "i386-linux-gnu",   libqual: Some("lib32")},
];

/// `${PLATFORM}` expansions that alias `i386-linux-gnu`.
pub const I386_PLATFORM_ALIASES: [&str; 3] = [
    "i486-linux-gnu",
    "i586-linux-gnu",
    "i686-linux-gnu",
];

/// A viable architecture, ready for composition.
#[derive(Debug)]
pub struct Architecture
{
    /// Debian-style multiarch tuple.
    pub tuple: &'static str,

    /// Legacy single-directory name, if any.
    pub libqual: Option<&'static str>,

    /// Path of this tuple's capture helper on the host.
    pub capture_tool: PathBuf,

    /// Where this tuple's overrides are written.
    pub libdir_on_host: PathBuf,

    /// Where this tuple's overrides appear inside the container.
    pub libdir_in_container: PathBuf,

    /// The interoperable loader path for this tuple,
    /// e.g. `/lib64/ld-linux-x86-64.so.2`.
    pub ld_so: PathBuf,
}

impl Architecture
{
    /// Probe one architecture.
    ///
    /// Running the capture helper doubles as the viability test:
    /// if the host cannot execute binaries for this tuple,
    /// [`None`] is returned and the architecture is skipped.
    pub fn new(
        def: &ArchDef,
        tools_dir: &Path,
        overrides: &Path,
        overrides_in_container: &Path,
    ) -> Option<Self>
    {
        let basename = format!("{}-capsule-capture-libs", def.tuple);
        let capture_tool = tools_dir.join(basename);

        let ld_so = match print_ld_so(&capture_tool) {
            Ok(ld_so) => ld_so,
            Err(err) => {
                debug!("Cannot determine ld.so for {}: {err}", def.tuple);
                return None;
            },
        };

        Some(Self{
            tuple: def.tuple,
            libqual: def.libqual,
            capture_tool,
            libdir_on_host: overrides.join("lib").join(def.tuple),
            libdir_in_container:
                overrides_in_container.join("lib").join(def.tuple),
            ld_so,
        })
    }

    /// Host directories that may hold this tuple's DRI drivers.
    ///
    /// Order matters: drivers from a later entry overwrite drivers
    /// from an earlier entry. Because `/lib` and `/usr/lib` may hold
    /// either word size, the unambiguous multiarch directories come
    /// last and therefore win.
    pub fn dri_search_dirs(&self) -> Vec<PathBuf>
    {
        let mut dirs = vec![
            PathBuf::from("/lib"),
            PathBuf::from("/usr/lib"),
        ];

        if let Some(libqual) = self.libqual {
            dirs.push(Path::new("/").join(libqual));
            dirs.push(Path::new("/usr").join(libqual));
        }

        dirs.push(Path::new("/lib").join(self.tuple));
        dirs.push(Path::new("/usr/lib").join(self.tuple));
        dirs
    }
}

/// How one driver ended up bound for one architecture.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IcdKind
{
    /// Not present for this architecture (or wrong ABI).
    Nonexistent,

    /// Referenced by absolute path; staged in a numbered directory.
    Absolute,

    /// Referenced by SONAME; found via the default search path.
    Soname,
}

/// One enumerated driver plus its per-architecture binding state.
#[derive(Debug)]
pub struct IcdDetails<T>
{
    /// The underlying descriptor from the host probe.
    pub icd: T,

    /// The driver's library, either an absolute path or a SONAME.
    pub resolved_library: String,

    /// Per-architecture outcome, indexed like [`MULTIARCH_TUPLES`].
    pub kinds: [IcdKind; MULTIARCH_TUPLES.len()],

    /// Final container path per architecture,
    /// set when the kind is [`IcdKind::Absolute`].
    pub paths_in_container:
        [Option<PathBuf>; MULTIARCH_TUPLES.len()],
}

impl<T> IcdDetails<T>
{
    /// Wrap a freshly enumerated descriptor.
    pub fn new(icd: T, resolved_library: String) -> Self
    {
        Self{
            icd,
            resolved_library,
            kinds: [IcdKind::Nonexistent; MULTIARCH_TUPLES.len()],
            paths_in_container: Default::default(),
        }
    }
}

impl IcdDetails<DriverSo>
{
    /// Wrap a VDPAU or VA-API driver, which is always an absolute path.
    pub fn from_driver(driver: DriverSo) -> Self
    {
        let resolved = driver.library_path().to_string_lossy().into_owned();
        Self::new(driver, resolved)
    }
}

/// Stage one driver into the overrides directory.
///
/// `sequence_number` picks the numbered subdirectory that keeps
/// same-basename drivers from different directories apart; VDPAU
/// passes [`None`] because its drivers can only live in a single
/// directory and thus cannot collide.
pub fn bind_icd<T>(
    arch: &Architecture,
    arch_index: usize,
    sequence_number: Option<usize>,
    subdir: &str,
    details: &mut IcdDetails<T>,
    ctx: &CaptureContext,
) -> anyhow::Result<()>
{
    assert_eq!(details.kinds[arch_index], IcdKind::Nonexistent);
    assert!(details.paths_in_container[arch_index].is_none());

    let resolved = &details.resolved_library;
    let is_absolute = resolved.starts_with('/');

    let on_host = if is_absolute {
        details.kinds[arch_index] = IcdKind::Absolute;

        // ICDs can collide among their basenames (differing only by
        // directory), so each one is staged in its own numbered
        // directory.
        let mut dir = arch.libdir_on_host.join(subdir);

        if let Some(seq) = sequence_number {
            dir.push(seq.to_string());
        }

        debug!("Ensuring {dir:?} exists");
        fs::create_dir_all(&dir)
            .with_context(|| format!("Unable to create {dir:?}"))?;

        Some(dir)
    } else {
        // ICDs in the default search path by definition can't collide:
        // the first one found is the one used.
        details.kinds[arch_index] = IcdKind::Soname;
        None
    };

    let subject = || if is_absolute {
        Expr::path(resolved.clone())
    } else {
        Expr::soname(resolved.clone())
    };

    let root_expr = subject()
        .no_dependencies().even_if_older().if_exists().if_same_abi();

    ctx.capture(
        on_host.as_deref().unwrap_or(&arch.libdir_on_host),
        &[root_expr],
    )?;

    if let Some(on_host) = &on_host {
        // Try to remove the directory we created. Success means the
        // helper captured nothing (the driver was nonexistent or of a
        // different ABI), so there is no point chasing dependencies.
        if fs::remove_dir(on_host).is_ok() {
            details.kinds[arch_index] = IcdKind::Nonexistent;
            return Ok(());
        }
    }

    let dep_expr = subject().only_dependencies().if_exists().if_same_abi();

    ctx.capture(&arch.libdir_on_host, &[dep_expr])?;

    if details.kinds[arch_index] == IcdKind::Absolute {
        let mut path = arch.libdir_in_container.join(subdir);

        if let Some(seq) = sequence_number {
            path.push(seq.to_string());
        }

        let basename = Path::new(resolved).file_name()
            .context("driver path has no basename")?;
        path.push(basename);

        details.paths_in_container[arch_index] = Some(path);
    }

    Ok(())
}

/// Delete runtime libraries that the captured overrides shadow.
///
/// Without this, the container would see both the runtime's and the
/// host's copy of a library under different basenames, and which one
/// `dlopen` finds would depend on the name used to ask for it.
///
/// The decision must be made for the *whole* scan before deleting
/// anything: reading the SONAME of a symlink's target would fail if
/// the target had already been unlinked.
pub fn remove_overridden_libraries(sysroot: &Path, arch: &Architecture)
    -> anyhow::Result<()>
{
    const LIBDIRS: [&str; 3] = ["lib", "usr/lib", "usr/lib/mesa"];

    let mut to_delete: Vec<(PathBuf, OsString, PathBuf)> = Vec::new();

    for libdir in LIBDIRS {
        let multiarch_libdir = Path::new(libdir).join(arch.tuple);

        // If the library directory cannot be resolved, presumably
        // there is nothing to delete from it.
        let resolved =
            match caisson_util::sysroot::resolve(sysroot, &multiarch_libdir) {
                Ok(resolved) => resolved,
                Err(err) => {
                    debug!("Cannot resolve {multiarch_libdir:?} in \
                            {sysroot:?}, so no need to delete libraries \
                            from it: {err}");
                    continue;
                },
            };

        let dir = sysroot.join(resolved);

        debug!("Removing overridden {} libraries from {dir:?}...",
               arch.tuple);

        let entries = fs::read_dir(&dir)
            .with_context(|| format!("Unable to iterate over {dir:?}"))?;

        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;

            if !file_type.is_file() && !file_type.is_symlink() {
                continue;
            }

            let name = entry.file_name();
            let name_str = match name.to_str() {
                Some(name_str) => name_str,
                None => continue,
            };

            if !name_str.starts_with("lib") {
                continue;
            }

            if !name_str.ends_with(".so") && !name_str.contains(".so.") {
                continue;
            }

            // If we found libfoo.so.1 in the runtime, and libfoo.so.1
            // also exists among the overrides, delete it.
            let soname_link = arch.libdir_on_host.join(name_str);
            if is_symlink(&soname_link) {
                to_delete.push((dir.clone(), name, soname_link));
                continue;
            }

            // If the runtime's symlink points to /foo/bar/libfoo.so.1,
            // and libfoo.so.1 also exists among the overrides,
            // delete it.
            if file_type.is_symlink() {
                if let Ok(target) = fs::read_link(entry.path()) {
                    if let Some(base) = target.file_name() {
                        let soname_link = arch.libdir_on_host.join(base);
                        if is_symlink(&soname_link) {
                            to_delete.push((dir.clone(), name, soname_link));
                            continue;
                        }
                    }
                }
            }

            // Last resort: ask the library itself what it is called.
            let soname = match elf::soname(&entry.path()) {
                Ok(Some(soname)) => soname,
                Ok(None) => continue,
                Err(err) => {
                    warn!("Unable to get SONAME of {:?}: {err}",
                          entry.path());
                    continue;
                },
            };

            let soname_link = arch.libdir_on_host.join(soname);
            if is_symlink(&soname_link) {
                to_delete.push((dir.clone(), name, soname_link));
            }
        }
    }

    for (dir, name, reason) in to_delete {
        let path = dir.join(&name);
        debug!("Deleting {path:?} because {reason:?} replaces it");

        if let Err(err) = fs::remove_file(&path) {
            warn!("Unable to delete {path:?}: {err}");
        }
    }

    Ok(())
}

/// Capture the DRI drivers of one host library directory.
///
/// Dependencies are captured into the architecture's main override
/// directory; the drivers themselves become per-file symlinks under
/// `dri/`, replacing any earlier directory's driver of the same name.
/// The s2tc compressed-texture shim rides along when present.
pub fn try_bind_dri(
    ctx: &CaptureContext,
    arch: &Architecture,
    host_libdir: &Path,
) -> anyhow::Result<()>
{
    let dri = host_libdir.join("dri");
    let s2tc = host_libdir.join("libtxc_dxtn.so");

    if dri.is_dir() {
        debug!("Collecting dependencies of DRI drivers in {dri:?}...");

        let expr = Expr::path_match(
            format!("{}/dri/*.so", host_libdir.display()))
            .only_dependencies().if_exists();
        ctx.capture(&arch.libdir_on_host, &[expr])?;

        let dri_on_host = arch.libdir_on_host.join("dri");
        fs::create_dir_all(&dri_on_host)
            .with_context(|| format!("Unable to create {dri_on_host:?}"))?;

        let mut members: Vec<OsString> = fs::read_dir(&dri)
            .with_context(|| format!("Unable to list {dri:?}"))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name())
            .collect();
        members.sort();

        for member in members {
            let relative = dri.strip_prefix("/").unwrap_or(&dri);
            let target = Path::new(LINK_TARGET).join(relative).join(&member);
            let dest = dri_on_host.join(&member);

            debug!("Creating symbolic link {dest:?} -> {target:?} \
                    for {} DRI driver", arch.tuple);

            // Delete an existing symlink if any, like ln -f.
            match fs::remove_file(&dest) {
                Ok(()) => { },
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => { },
                Err(err) =>
                    return Err(err).with_context(
                        || format!("Unable to remove {dest:?}")),
            }

            os_ext::symlink(&target, &dest)
                .with_context(|| format!(
                    "Unable to create symlink {dest:?} -> {target:?}"))?;
        }
    }

    if s2tc.exists() {
        debug!("Collecting s2tc {s2tc:?} and its dependencies...");

        let expr = Expr::path_match(s2tc.display().to_string());
        ctx.capture(&arch.libdir_on_host, &[expr])?;
    }

    Ok(())
}

/// Cross-architecture results of the graphics stack pass.
///
/// Kept separate from the session so a single architecture's pass can
/// be exercised on its own.
#[derive(Debug)]
pub struct StackAccumulator
{
    /// The host's libc was captured for at least one architecture.
    pub any_libc_from_host: bool,

    /// The host's libc was captured for every viable architecture.
    pub all_libc_from_host: bool,

    /// The host's libdrm was captured for every viable architecture.
    pub all_libdrm_from_host: bool,

    /// Candidate host directories for `share/libdrm` data.
    pub libdrm_data_from_host: BTreeSet<PathBuf>,

    /// Candidate host `gconv` module directories.
    pub gconv_from_host: BTreeSet<PathBuf>,
}

impl Default for StackAccumulator
{
    fn default() -> Self
    {
        Self{
            any_libc_from_host: false,
            all_libc_from_host: true,
            all_libdrm_from_host: true,
            libdrm_data_from_host: BTreeSet::new(),
            gconv_from_host: BTreeSet::new(),
        }
    }
}

fn is_symlink(path: &Path) -> bool
{
    path.symlink_metadata()
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}
