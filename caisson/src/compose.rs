//! Composing the container runtime view.
//!
//! [`Runtime`] is the per-launch session: it owns the (possibly
//! mutable) copy of the runtime image, the overrides directory, and
//! the lock that keeps the runtime alive, and it knows how to turn all
//! of that into launcher instructions.

use {
    crate::{
        arch::{
            Architecture, I386_PLATFORM_ALIASES, IcdDetails, IcdKind,
            MULTIARCH_TUPLES, StackAccumulator,
            bind_icd, remove_overridden_libraries, try_bind_dri,
        },
        bwrap::MountPlan,
        capture::{CaptureContext, Expr},
        lock::{FileLock, LockFlags},
        probe::{self, JsonIcd},
        store::{self, MutableRuntime},
    },
    anyhow::{Context, bail},
    bitflags::bitflags,
    caisson_util::{search_path::SearchPath, sysroot},
    log::{debug, warn},
    os_ext::{S_IFMT, S_IFREG, fstatat, geteuid, mkdtemp, symlink},
    std::{
        env,
        ffi::{OsStr, OsString},
        fs,
        io::ErrorKind::NotFound,
        path::{Component, Path, PathBuf},
        process::Command,
    },
};

/// Container path of the overrides when we have a mutable sysroot.
const OVERRIDES_IN_CONTAINER_MUTABLE: &str = "/usr/lib/caisson/overrides";

/// Container path of the overrides when they live in a tmpdir.
const OVERRIDES_IN_CONTAINER_TMPDIR: &str = "/overrides";

/// sysexits.h EX_OSFILE, reported by the locale helper
/// when it had to create missing locales.
const EX_OSFILE: i32 = 72;

/// Runtime entries bound read-only into the container piecewise.
const BIND_MUTABLE: [&str; 3] = ["etc", "var/cache", "var/lib"];

/// Container paths never taken from the runtime.
const DONT_BIND: [&str; 11] = [
    "/etc/group",
    "/etc/passwd",
    "/etc/host.conf",
    "/etc/hosts",
    "/etc/localtime",
    "/etc/machine-id",
    "/etc/resolv.conf",
    "/var/lib/dbus",
    "/var/lib/dhcp",
    "/var/lib/sudo",
    "/var/lib/urandom",
];

bitflags!
{
    /// Flags affecting how the runtime is set up.
    pub struct RuntimeFlags: u32
    {
        /// Delete unused temporary runtime copies
        /// before creating ours.
        const GC_RUNTIMES = 1 << 0;

        /// Use the host system's graphics stack.
        const HOST_GRAPHICS_STACK = 1 << 1;

        /// Generate locale files that the runtime is missing.
        const GENERATE_LOCALES = 1 << 2;
    }
}

bitflags!
{
    struct TakeFlags: u32
    {
        const IF_DIR = 1 << 0;
        const IF_EXISTS = 1 << 1;
        const IF_CONTAINER_COMPATIBLE = 1 << 2;
        const COPY_FALLBACK = 1 << 3;
    }
}

/// A runtime to be used as the `/usr` for a game.
///
/// Constructing one validates the inputs and locks the runtime image;
/// [`bind`][`Self::bind`] composes the container view.
/// Dropping the session removes its temporary directory (if any) but
/// deliberately leaves a mutable sysroot copy behind: a future
/// launch's garbage collection will reclaim it once it is unused.
#[derive(Debug)]
pub struct Runtime
{
    bubblewrap: PathBuf,
    source_files: PathBuf,
    tools_dir: PathBuf,
    flags: RuntimeFlags,
    host_root: PathBuf,

    runtime_lock: Option<FileLock>,
    mutable_sysroot: Option<MutableRuntime>,
    tmpdir: Option<PathBuf>,
    overrides: PathBuf,
    overrides_in_container: PathBuf,
    runtime_files: PathBuf,
    runtime_usr: PathBuf,
    runtime_is_just_usr: bool,

    container_access: Option<PathBuf>,
    container_access_adverb: Option<MountPlan>,
    any_libc_from_host: bool,
    bound: bool,
}

impl Runtime
{
    /// Create a session for the runtime image at `source_files`.
    ///
    /// With `mutable_parent` set, a temporary copy of the image is
    /// prepared under it (see [`store`]) and composition edits the
    /// copy in place; without it, the image is used read-only and
    /// overrides are staged in a temporary directory instead.
    pub fn new(
        source_files: &Path,
        mutable_parent: Option<&Path>,
        bubblewrap: &Path,
        tools_dir: &Path,
        flags: RuntimeFlags,
    ) -> anyhow::Result<Self>
    {
        if !is_executable(bubblewrap) {
            bail!("\"{}\" is not executable", bubblewrap.display());
        }

        let source_files = canonicalize_or_keep(source_files);

        if !source_files.is_dir() {
            bail!("\"{}\" is not a directory", source_files.display());
        }

        let mutable_parent = mutable_parent.map(canonicalize_or_keep);

        if let Some(parent) = &mutable_parent {
            if !parent.is_dir() {
                bail!("\"{}\" is not a directory", parent.display());
            }
        }

        if !tools_dir.is_dir() {
            bail!("\"{}\" is not a directory", tools_dir.display());
        }

        // Take a lock on the runtime until we're finished with setup,
        // to make sure it doesn't get deleted while in use. If the
        // runtime is mounted read-only in the container, the lock is
        // held until all processes in the container exit; a mutable
        // copy instead carries its own lock.
        let mut runtime_lock =
            FileLock::new(None, &source_files.join(".ref"),
                          LockFlags::CREATE)
            .with_context(|| format!("Unable to lock \"{}/.ref\"",
                                     source_files.display()))?;

        let mutable_sysroot = match &mutable_parent {
            Some(parent) => {
                let mut copy = store::prepare_mutable(
                    parent, &source_files,
                    flags.contains(RuntimeFlags::GC_RUNTIMES))?;

                // Hand over from holding a lock on the source to just
                // holding a lock on the copy.
                runtime_lock = copy.take_lock();
                Some(copy)
            },
            None => None,
        };

        let (overrides, overrides_in_container, runtime_files, tmpdir) =
            match &mutable_sysroot {
                Some(copy) => {
                    let in_container =
                        PathBuf::from(OVERRIDES_IN_CONTAINER_MUTABLE);
                    let overrides = copy.path().join(
                        &OVERRIDES_IN_CONTAINER_MUTABLE[1 ..]);
                    (overrides, in_container, copy.path().to_owned(), None)
                },
                None => {
                    // We only need a temporary directory if we don't
                    // have a mutable sysroot to work with.
                    let tmpdir =
                        mkdtemp(&env::temp_dir().join("caisson-wrap.XXXXXX"))
                        .context("Cannot create temporary directory")?;
                    (tmpdir.join("overrides"),
                     PathBuf::from(OVERRIDES_IN_CONTAINER_TMPDIR),
                     source_files.clone(),
                     Some(tmpdir))
                },
            };

        {
            use std::os::unix::fs::DirBuilderExt;
            fs::DirBuilder::new().recursive(true).mode(0o700)
                .create(&overrides)
                .with_context(|| format!("Unable to create {overrides:?}"))?;
        }

        let runtime_usr = runtime_files.join("usr");
        let (runtime_usr, runtime_is_just_usr) =
            if runtime_usr.is_dir() {
                (runtime_usr, false)
            } else {
                // runtime_files is just a merged /usr.
                (runtime_files.clone(), true)
            };

        Ok(Self{
            bubblewrap: bubblewrap.to_owned(),
            source_files,
            tools_dir: tools_dir.to_owned(),
            flags,
            host_root: PathBuf::from("/"),
            runtime_lock: Some(runtime_lock),
            mutable_sysroot,
            tmpdir,
            overrides,
            overrides_in_container,
            runtime_files,
            runtime_usr,
            runtime_is_just_usr,
            container_access: None,
            container_access_adverb: None,
            any_libc_from_host: false,
            bound: false,
        })
    }

    /// Pretend the host's root filesystem is at `root` instead of `/`.
    ///
    /// Composition then enumerates drivers, `/etc` files, and so on
    /// under `root`. Intended for tests.
    pub fn set_host_root(&mut self, root: &Path)
    {
        self.host_root = root.to_owned();
    }

    /// Path of the overrides directory on the host side.
    pub fn overrides(&self) -> &Path
    {
        &self.overrides
    }

    /// Canonicalized path of the runtime image this session uses.
    pub fn source_files(&self) -> &Path
    {
        &self.source_files
    }

    /// Compose the container view into `plan`.
    ///
    /// May only be called once per session.
    pub fn bind(&mut self, plan: &mut MountPlan) -> anyhow::Result<()>
    {
        assert!(!self.bound, "bind may only be called once");
        assert!(!plan.was_finished());

        self.bind_runtime(plan)?;

        // In-container tooling uses this to detect the composed
        // environment, so create it even though it will be empty.
        plan.dir(Path::new("/run/caisson"));

        self.set_search_paths(plan);
        self.bound = true;

        Ok(())
    }

    /// Append the runtime-lock handoff and the `--` terminator.
    ///
    /// With an OFD lock we pass the descriptor itself and exit without
    /// dropping the reference; otherwise the launcher is told to
    /// reacquire `/.ref`, accepting the short unlocked window.
    pub fn append_lock_args(&mut self, plan: &mut MountPlan)
    {
        assert!(self.bound, "bind must have succeeded first");

        match self.runtime_lock.take() {
            Some(lock) if lock.is_ofd() => {
                let raw = plan.add_fd(lock.steal_fd());
                debug!("Passing lock fd {raw} down to the supervisor");
                plan.add_args(["--fd".to_owned(), raw.to_string()]);
            },
            _ => {
                debug!("Telling process in container to lock /.ref");
                plan.lock_file(Path::new("/.ref"));
            },
        }

        plan.add_args(["--"]);
    }

    fn bind_runtime(&mut self, plan: &mut MountPlan) -> anyhow::Result<()>
    {
        bind_usr(plan, &self.runtime_files, Path::new("/"))?;

        // With a mutable sysroot the overrides are mounted as part of
        // /usr; keep /overrides working as a compatibility alias,
        // both in the plan and on disk for easier inspection.
        if let Some(copy) = &self.mutable_sysroot {
            let relative = &OVERRIDES_IN_CONTAINER_MUTABLE[1 ..];
            plan.symlink(Path::new(relative), Path::new("/overrides"));

            symlink(Path::new(relative), &copy.path().join("overrides"))
                .with_context(|| format!(
                    "Unable to create symlink \"{}/overrides\" \
                     -> \"{relative}\"",
                    copy.path().display()))?;
        }

        plan.setenv("XDG_RUNTIME_DIR",
                    format!("/run/user/{}", geteuid()));
        plan.tmpfs(Path::new("/run"));
        plan.tmpfs(Path::new("/tmp"));
        plan.tmpfs(Path::new("/var"));
        plan.symlink(Path::new("../run"), Path::new("/var/run"));

        bind_usr(plan, &self.host_root, Path::new("/run/host"))?;

        bind_etc_var(plan, &self.runtime_files);
        self.bind_host_etc(plan);

        if self.flags.contains(RuntimeFlags::HOST_GRAPHICS_STACK) {
            self.use_host_graphics_stack(plan)?;
        }

        // This must come after the graphics stack has decided whether
        // to bring in the host system's libc.
        if self.flags.contains(RuntimeFlags::GENERATE_LOCALES) {
            self.ensure_locales(plan);
        }

        if self.mutable_sysroot.is_none() {
            plan.ro_bind(&self.overrides,
                         Path::new(OVERRIDES_IN_CONTAINER_TMPDIR));
        }

        self.bind_localtime(plan)?;

        Ok(())
    }

    /// Bind the host's identity and name-resolution files.
    fn bind_host_etc(&self, plan: &mut MountPlan)
    {
        let machine_id = self.host(Path::new("/etc/machine-id"));
        let dbus_machine_id =
            self.host(Path::new("/var/lib/dbus/machine-id"));

        if machine_id.exists() {
            plan.ro_bind(&machine_id, Path::new("/etc/machine-id"));
            plan.symlink(Path::new("/etc/machine-id"),
                         Path::new("/var/lib/dbus/machine-id"));
        } else if dbus_machine_id.exists() {
            plan.ro_bind(&dbus_machine_id, Path::new("/etc/machine-id"));
            plan.symlink(Path::new("/etc/machine-id"),
                         Path::new("/var/lib/dbus/machine-id"));
        }

        for name in ["resolv.conf", "host.conf", "hosts",
                     "passwd", "group"] {
            let dest = Path::new("/etc").join(name);
            let source = self.host(&dest);

            if source.exists() {
                plan.ro_bind(&source, &dest);
            }
        }
    }

    /// `/etc/localtime` and a generated `/etc/timezone`.
    ///
    /// `/etc/localtime` can be missing or a dangling symlink, in
    /// which case creating bogus binds would make the launcher fail.
    fn bind_localtime(&self, plan: &mut MountPlan) -> anyhow::Result<()>
    {
        let localtime = self.host(Path::new("/etc/localtime"));

        if !localtime.exists() {
            return Ok(());
        }

        let target = fs::read_link(&localtime).ok();

        let is_reachable = target.as_ref().map_or(false, |target| {
            let canonical = if target.is_absolute() {
                lexical_normalize(target)
            } else {
                lexical_normalize(&Path::new("/etc").join(target))
            };
            canonical.starts_with("/usr")
        });

        if is_reachable {
            plan.symlink(&target.expect("reachable implies a target"),
                         Path::new("/etc/localtime"));
        } else {
            plan.ro_bind(&localtime, Path::new("/etc/localtime"));
        }

        let content = format!("{}\n", timezone_from(&self.host_root));

        match &self.mutable_sysroot {
            Some(copy) => {
                let etc = sysroot::resolve_mkdir_p(copy.path(),
                                                   Path::new("/etc"))?;
                fs::write(copy.path().join(etc).join("timezone"), content)
                    .context("Unable to write /etc/timezone")?;
            },
            None => {
                let tmpdir = self.tmpdir.as_ref()
                    .expect("tmpdir exists when there is no mutable sysroot");
                let file = tmpdir.join("timezone");
                fs::write(&file, content)
                    .context("Unable to write timezone file")?;
                plan.ro_bind(&file, Path::new("/etc/timezone"));
            },
        }

        Ok(())
    }

    /// Arrange for the composed root to be visible to the capture
    /// helper: directly by path when the runtime is a full sysroot,
    /// through a bubblewrap prefix when it is just a merged /usr.
    fn provide_container_access(&mut self) -> anyhow::Result<()>
    {
        if self.container_access_adverb.is_some() {
            return Ok(());
        }

        if !self.runtime_is_just_usr {
            // The runtime has the same shape as the final system,
            // so the helper can access it directly. This is always
            // the case for writeable copies.
            debug!("Setting up runtime without using bwrap");

            // Not an exhaustive check, just one that catches obvious
            // mistakes like forgetting the merged-/usr symlinks.
            for member in ["bin", "etc", "lib", "sbin"] {
                let path = self.runtime_files.join(member);

                if !path.is_dir() {
                    warn!("{path:?} does not exist, \
                           this probably won't work");
                }
            }

            self.container_access = Some(self.runtime_files.clone());
            self.container_access_adverb = Some(MountPlan::new());
        } else {
            debug!("Using bwrap to set up runtime that is just /usr");

            // Writeable copies of the runtime are complete sysroots,
            // never just a merged /usr.
            assert!(self.mutable_sysroot.is_none());
            let tmpdir = self.tmpdir.as_ref()
                .expect("tmpdir exists when there is no mutable sysroot");

            let mnt = tmpdir.join("mnt");
            fs::create_dir_all(&mnt)
                .with_context(|| format!("Unable to create {mnt:?}"))?;

            let mut adverb = MountPlan::new();
            adverb.add_args([self.bubblewrap.as_os_str()]);
            adverb.ro_bind(Path::new("/"), Path::new("/"));
            adverb.bind(&self.overrides, &self.overrides);
            adverb.tmpfs(&mnt);
            bind_usr(&mut adverb, &self.runtime_files, &mnt)?;

            self.container_access = Some(mnt);
            self.container_access_adverb = Some(adverb);
        }

        Ok(())
    }

    /// Where `ld.so` really lives inside the composed root,
    /// or [`None`] if the runtime cannot run this tuple at all.
    fn resolve_ld_so_in_runtime(&self, arch: &Architecture)
        -> Option<PathBuf>
    {
        match &self.mutable_sysroot {
            Some(copy) =>
                match sysroot::resolve(copy.path(), &arch.ld_so) {
                    Ok(resolved) => Some(Path::new("/").join(resolved)),
                    Err(err) => {
                        debug!("Cannot resolve {:?} in {:?}: {err}",
                               arch.ld_so, copy.path());
                        None
                    },
                },

            None => {
                // Do it the hard way, by asking a process running in
                // a container resembling the one we are going to use.
                let mut inner = MountPlan::new();
                bind_usr(&mut inner, &self.runtime_files, Path::new("/"))
                    .ok()?;
                bind_usr(&mut inner, &self.host_root,
                         Path::new("/run/host")).ok()?;

                let output = Command::new(&self.bubblewrap)
                    .args(inner.argv())
                    .args(["env", "PATH=/usr/bin:/bin", "readlink", "-e"])
                    .arg(&arch.ld_so)
                    .output();

                let output = match output {
                    Ok(output) if output.status.success() => output,
                    Ok(_) | Err(_) => return None,
                };

                let mut stdout = output.stdout;
                while stdout.last() == Some(&b'\n') {
                    stdout.pop();
                }

                if stdout.is_empty() {
                    return None;
                }

                use std::os::unix::ffi::OsStringExt;
                Some(PathBuf::from(OsString::from_vec(stdout)))
            },
        }
    }

    fn use_host_graphics_stack(&mut self, plan: &mut MountPlan)
        -> anyhow::Result<()>
    {
        self.provide_container_access()?;

        let adverb = self.container_access_adverb.as_ref()
            .expect("provide_container_access just ran");
        let container = self.container_access.clone()
            .expect("provide_container_access just ran");

        debug!("Enumerating EGL ICDs on host system...");
        let mut egl_icd_details = load_json_icds(
            probe::list_egl_icds(&self.host_root), "EGL");

        debug!("Enumerating Vulkan ICDs on host system...");
        let mut vulkan_icd_details = load_json_icds(
            probe::list_vulkan_icds(&self.host_root), "Vulkan");

        let mut acc = StackAccumulator::default();
        let mut any_architecture_works = false;

        let mut dri_path = SearchPath::new();
        let mut egl_path = SearchPath::new();
        let mut vulkan_path = SearchPath::new();
        let mut va_api_path = SearchPath::new();
        let mut va_api_icd_details = Vec::new();

        for (index, def) in MULTIARCH_TUPLES.iter().enumerate() {
            debug!("Checking for {} libraries...", def.tuple);

            let arch = match Architecture::new(
                def, &self.tools_dir,
                &self.overrides, &self.overrides_in_container)
            {
                Some(arch) => arch,
                None => continue,
            };

            let ld_so_in_runtime =
                match self.resolve_ld_so_in_runtime(&arch) {
                    Some(path) => path,
                    None => {
                        debug!("Container does not have {:?} so it \
                                cannot run {} binaries",
                               arch.ld_so, arch.tuple);
                        continue;
                    },
                };

            any_architecture_works = true;
            debug!("Container path: {:?} -> {:?}",
                   arch.ld_so, ld_so_in_runtime);

            dri_path.append(arch.libdir_in_container.join("dri"));

            fs::create_dir_all(&arch.libdir_on_host)
                .with_context(|| format!("Unable to create {:?}",
                                         arch.libdir_on_host))?;
            fs::create_dir_all(arch.libdir_on_host.join("dri"))
                .with_context(|| format!("Unable to create {:?}/dri",
                                         arch.libdir_on_host))?;

            let ctx = CaptureContext::new(
                &arch.capture_tool, adverb, &container);

            debug!("Collecting graphics drivers from host system...");
            ctx.capture(&arch.libdir_on_host, &graphics_stack_exprs())?;

            debug!("Collecting {} EGL drivers from host system...",
                   arch.tuple);

            for (j, details) in egl_icd_details.iter_mut().enumerate() {
                bind_icd(&arch, index, Some(j), "glvnd", details, &ctx)?;
            }

            debug!("Collecting {} Vulkan drivers from host system...",
                   arch.tuple);

            for (j, details) in vulkan_icd_details.iter_mut().enumerate() {
                bind_icd(&arch, index, Some(j), "vulkan", details, &ctx)?;
            }

            debug!("Enumerating {} VDPAU drivers on host system...",
                   arch.tuple);

            for driver in probe::list_vdpau_drivers(
                &self.host_root, arch.tuple, arch.libqual)
            {
                let mut details = IcdDetails::from_driver(driver);

                // VDPAU drivers can only be located in a single
                // directory, so by definition they cannot collide
                // and need no sequence number.
                bind_icd(&arch, index, None, "vdpau", &mut details, &ctx)?;
            }

            debug!("Enumerating {} VA-API drivers on host system...",
                   arch.tuple);

            for (j, driver) in probe::list_va_api_drivers(
                &self.host_root, arch.tuple, arch.libqual)
                .into_iter().enumerate()
            {
                let mut details = IcdDetails::from_driver(driver);
                bind_icd(&arch, index, Some(j), "dri", &mut details, &ctx)?;
                va_api_icd_details.push(details);
            }

            if let Some(copy) = &self.mutable_sysroot {
                remove_overridden_libraries(copy.path(), &arch)?;
            }

            let libc = arch.libdir_on_host.join("libc.so.6");

            // If we are going to use the host system's libc (likely)
            // then we have to use its ld.so too.
            if is_symlink(&libc) {
                self.take_ld_so_from_host(plan, &arch, &ld_so_in_runtime)?;

                // Collect miscellaneous libraries that libc might
                // dlopen. At the moment this is just libidn2.
                ctx.capture(
                    &arch.libdir_on_host,
                    &[Expr::soname("libidn2.so.0").if_exists()
                        .if_same_abi()],
                )?;

                if let Ok(libc_target) = fs::read_link(&libc) {
                    self.collect_gconv_dir(&libc_target, &mut acc);
                }

                acc.any_libc_from_host = true;
            } else {
                acc.all_libc_from_host = false;
            }

            let libdrm = arch.libdir_on_host.join("libdrm.so.2");

            // If libdrm comes from the host, its data files in
            // share/libdrm must come along.
            if is_symlink(&libdrm) {
                if let Ok(target) = fs::read_link(&libdrm) {
                    self.collect_libdrm_dir(&target, &arch, &mut acc);
                }
            } else {
                // For at least one architecture,
                // libdrm is newer in the container.
                acc.all_libdrm_from_host = false;
            }

            for libdir in arch.dri_search_dirs() {
                try_bind_dri(&ctx, &arch, &self.host(&libdir))?;
            }
        }

        if !any_architecture_works {
            let tried: Vec<&str> =
                MULTIARCH_TUPLES.iter().map(|def| def.tuple).collect();
            bail!("None of the supported CPU architectures are common \
                   to the host system and the container (tried: {})",
                  tried.join(", "));
        }

        if acc.any_libc_from_host && !acc.all_libc_from_host {
            // This would mean the container's libc version sits
            // between two different host architectures' versions.
            // If the host locales work with both of those, assume
            // they also work with the one in between.
            warn!("Using glibc from host system for some but not all \
                   architectures! Arbitrarily using host locales.");
        }

        self.any_libc_from_host = acc.any_libc_from_host;

        if acc.any_libc_from_host {
            self.take_host_locale_tools(plan, &acc)?;
        } else {
            debug!("Using included locale data from container");
            debug!("Using included gconv modules from container");
        }

        self.take_libdrm_data(plan, &acc)?;

        debug!("Setting up EGL ICD JSON...");
        self.write_icd_jsons(
            plan, &egl_icd_details,
            Path::new("share/glvnd/egl_vendor.d"), &mut egl_path)?;

        debug!("Setting up Vulkan ICD JSON...");
        self.write_icd_jsons(
            plan, &vulkan_icd_details,
            Path::new("share/vulkan/icd.d"), &mut vulkan_path)?;

        for details in &va_api_icd_details {
            for i in 0 .. MULTIARCH_TUPLES.len() {
                match details.kinds[i] {
                    IcdKind::Nonexistent => { },
                    kind => {
                        assert_eq!(kind, IcdKind::Absolute);
                        let path = details.paths_in_container[i].as_ref()
                            .expect("absolute drivers have container paths");
                        va_api_path.append(
                            path.parent().unwrap_or(Path::new("/")));
                    },
                }
            }
        }

        set_or_unset(plan, "LIBGL_DRIVERS_PATH", &dri_path);
        set_or_unset(plan, "__EGL_VENDOR_LIBRARY_FILENAMES", &egl_path);
        plan.unsetenv("__EGL_VENDOR_LIBRARY_DIRS");
        set_or_unset(plan, "VK_ICD_FILENAMES", &vulkan_path);
        set_or_unset(plan, "LIBVA_DRIVERS_PATH", &va_api_path);

        // VDPAU_DRIVER_PATH can hold only a single path, so let the
        // dynamic linker's ${PLATFORM} pick the word size.
        plan.setenv(
            "VDPAU_DRIVER_PATH",
            format!("{}/lib/${{PLATFORM}}-linux-gnu/vdpau",
                    self.overrides_in_container.display()));

        // ${PLATFORM} expands to i486/i586/i686 on 32-bit, never to
        // the directory we actually populate.
        create_platform_aliases(&self.overrides)?;

        Ok(())
    }

    /// Note the host gconv directory implied by where libc came from.
    fn collect_gconv_dir(&self, libc_target: &Path,
                         acc: &mut StackAccumulator)
    {
        let dir = strip_run_host(
            libc_target.parent().unwrap_or(Path::new("/")));

        // Assume glibc's upstream layout: gconv modules next to the
        // library, under $(libdir)/gconv. Check the /usr variant
        // first, so a merged-/usr host composed with a split-/usr
        // container still binds /usr/lib rather than /lib.
        let candidate = if dir.starts_with("/usr") {
            dir.join("gconv")
        } else {
            Path::new("/usr")
                .join(dir.strip_prefix("/").unwrap_or(&dir))
                .join("gconv")
        };

        if self.host(&candidate).is_dir() {
            acc.gconv_from_host.insert(candidate);
        } else {
            debug!("We were expecting the host gconv modules \
                    in {candidate:?}, but it is missing");
        }
    }

    /// Note the host `share/libdrm` implied by where libdrm came from.
    fn collect_libdrm_dir(&self, target: &Path, arch: &Architecture,
                          acc: &mut StackAccumulator)
    {
        let dir = target.parent().unwrap_or(Path::new("/"));
        let mut prefix = dir.to_string_lossy().into_owned();

        let lib_multiarch = format!("/lib/{}", arch.tuple);

        for suffix in [lib_multiarch.as_str(), "/lib64", "/lib32", "/lib"] {
            if prefix.ends_with(suffix) {
                prefix.truncate(prefix.len() - suffix.len());
                break;
            }
        }

        let prefix = strip_run_host(Path::new(&prefix));
        let candidate = prefix.join("share/libdrm");

        if self.host(&candidate).is_dir() {
            acc.libdrm_data_from_host.insert(candidate);
        } else {
            debug!("We were expecting the host libdrm data \
                    in {candidate:?}, but it is missing");
        }
    }

    /// Make the host's locale data and locale tooling visible.
    fn take_host_locale_tools(&self, plan: &mut MountPlan,
                              acc: &StackAccumulator)
        -> anyhow::Result<()>
    {
        debug!("Making host locale data visible in container");

        self.take_from_host(plan,
                            Path::new("/usr/lib/locale"),
                            Path::new("/usr/lib/locale"),
                            TakeFlags::IF_EXISTS)?;
        self.take_from_host(plan,
                            Path::new("/usr/share/i18n"),
                            Path::new("/usr/share/i18n"),
                            TakeFlags::IF_EXISTS)?;

        match find_program_in_path("localedef") {
            None =>
                warn!("Cannot find localedef in PATH"),
            Some(localedef) =>
                self.take_from_host(
                    plan, &localedef, Path::new("/usr/bin/localedef"),
                    TakeFlags::IF_CONTAINER_COMPATIBLE)?,
        }

        match find_program_in_path("locale") {
            None =>
                warn!("Cannot find locale in PATH"),
            Some(locale) =>
                self.take_from_host(
                    plan, &locale, Path::new("/usr/bin/locale"),
                    TakeFlags::IF_CONTAINER_COMPATIBLE)?,
        }

        let ldconfig = find_program_in_path("ldconfig")
            .or_else(|| ["/sbin/ldconfig", "/usr/sbin/ldconfig"]
                .into_iter()
                .map(PathBuf::from)
                .find(|path| is_executable(&self.host(path))));

        match ldconfig {
            None =>
                warn!("Cannot find ldconfig in PATH, /sbin or /usr/sbin"),
            Some(ldconfig) =>
                self.take_from_host(
                    plan, &ldconfig, Path::new("/sbin/ldconfig"),
                    TakeFlags::empty())?,
        }

        debug!("Making host gconv modules visible in container");

        for gconv in &acc.gconv_from_host {
            self.take_from_host(plan, gconv, gconv, TakeFlags::IF_DIR)?;
        }

        Ok(())
    }

    /// Pick and bind the best host `share/libdrm` candidate.
    fn take_libdrm_data(&self, plan: &mut MountPlan,
                        acc: &StackAccumulator)
        -> anyhow::Result<()>
    {
        if !acc.libdrm_data_from_host.is_empty()
            && !acc.all_libdrm_from_host
        {
            warn!("Using libdrm.so.2 from host system for some but not \
                   all architectures! Will take /usr/share/libdrm \
                   from host.");
        }

        let canonical = Path::new("/usr/share/libdrm");

        let best = if acc.libdrm_data_from_host.len() > 1 {
            warn!("Found more than one possible libdrm data directory \
                   from host");

            if acc.libdrm_data_from_host.contains(canonical) {
                Some(canonical.to_owned())
            } else {
                acc.libdrm_data_from_host.iter().next().cloned()
            }
        } else {
            acc.libdrm_data_from_host.iter().next().cloned()
        };

        if let Some(best) = best {
            self.take_from_host(plan, &best, canonical,
                                TakeFlags::IF_CONTAINER_COMPATIBLE)?;
        }

        Ok(())
    }

    /// Write rewritten ICD manifests and collect the env var entries.
    fn write_icd_jsons(
        &self,
        plan: &mut MountPlan,
        all_details: &[IcdDetails<JsonIcd>],
        share_subdir: &Path,
        search_path: &mut SearchPath,
    ) -> anyhow::Result<()>
    {
        let dir_on_host = self.overrides.join(share_subdir);
        fs::create_dir_all(&dir_on_host)
            .with_context(|| format!("Unable to create {dir_on_host:?}"))?;

        for (j, details) in all_details.iter().enumerate() {
            let mut need_host_json = false;

            for i in 0 .. MULTIARCH_TUPLES.len() {
                match details.kinds[i] {
                    IcdKind::Absolute => {
                        let json_base = format!(
                            "{j}-{}.json", MULTIARCH_TUPLES[i].tuple);
                        let json_in_container = self.overrides_in_container
                            .join(share_subdir).join(&json_base);

                        let path = details.paths_in_container[i].as_ref()
                            .expect("absolute drivers have container paths");

                        details.icd.write_replace_library_path(
                            &path.to_string_lossy(),
                            &dir_on_host.join(&json_base))
                            .with_context(|| format!(
                                "Unable to write {json_base:?}"))?;

                        search_path.append(&json_in_container);
                    },

                    IcdKind::Soname =>
                        need_host_json = true,

                    IcdKind::Nonexistent => { },
                }
            }

            // A SONAME-kind driver is found via the default search
            // path, so the host's manifest works inside the container
            // as it is.
            if need_host_json {
                let json_base = format!("{j}.json");
                let json_in_container = self.overrides_in_container
                    .join(share_subdir).join(&json_base);

                self.take_from_host(
                    plan,
                    &self.logical(details.icd.json_path()),
                    &json_in_container,
                    TakeFlags::COPY_FALLBACK)?;

                search_path.append(&json_in_container);
            }
        }

        Ok(())
    }

    /// Replace the runtime's ld.so with the host's.
    fn take_ld_so_from_host(
        &self,
        plan: &mut MountPlan,
        arch: &Architecture,
        ld_so_in_runtime: &Path,
    ) -> anyhow::Result<()>
    {
        debug!("Making host ld.so visible in container");

        let ld_so_in_host = fs::canonicalize(self.host(&arch.ld_so))
            .with_context(|| format!(
                "Unable to determine host path to {:?}", arch.ld_so))?;
        let ld_so_in_host = self.logical(&ld_so_in_host);

        debug!("Host path: {:?} -> {ld_so_in_host:?}", arch.ld_so);
        debug!("Container path: {:?} -> {ld_so_in_runtime:?}", arch.ld_so);

        // With a mutable sysroot the interoperable path becomes a
        // symlink straight at the resolved host loader, saving a
        // symlink chain walk on every exec.
        if self.mutable_sysroot.is_some() {
            self.take_from_host(plan, &ld_so_in_host, &arch.ld_so,
                                TakeFlags::empty())?;
        }

        // Without one we cannot replace symlinks and cannot mount
        // onto them either (they get dereferenced), so the only
        // choice is to bind the host loader onto the runtime's
        // resolved loader. With a mutable sysroot it is still worth
        // doing for robustness: any non-standard symlink chain ends
        // up at the loader that matches the libc in use.
        self.take_from_host(plan, &ld_so_in_host, ld_so_in_runtime,
                            TakeFlags::empty())
    }

    /// Use the host's copy of `source` at `dest` in the container.
    ///
    /// `source` is a host path as the container would name it
    /// (no test-root prefix); `dest` is a container path.
    fn take_from_host(
        &self,
        plan: &mut MountPlan,
        source: &Path,
        dest: &Path,
        flags: TakeFlags,
    ) -> anyhow::Result<()>
    {
        let real = self.host(source);

        if flags.contains(TakeFlags::IF_DIR) && !real.is_dir() {
            return Ok(());
        }

        if flags.contains(TakeFlags::IF_EXISTS) && !real.exists() {
            return Ok(());
        }

        if let Some(copy) = &self.mutable_sysroot {
            // Replace the in-sysroot path with a symlink to
            // /run/host/..., e.g. usr/lib/locale ->
            // /run/host/usr/lib/locale.
            let parent = dest.parent().unwrap_or(Path::new("/"));
            let parent = sysroot::resolve_mkdir_p(copy.path(), parent)
                .with_context(|| format!(
                    "Unable to resolve {:?} in {:?}",
                    dest, copy.path()))?;

            let base = dest.file_name()
                .context("destination has no basename")?;
            let dest_on_disk = copy.path().join(parent).join(base);

            remove_existing(&dest_on_disk)?;

            if !path_visible_in_run_host(source) {
                if flags.contains(TakeFlags::COPY_FALLBACK) {
                    fs::copy(&real, &dest_on_disk)
                        .with_context(|| format!(
                            "Unable to copy {real:?} to {dest_on_disk:?}"))?;
                    return Ok(());
                }

                warn!("{source:?} is unlikely to appear in /run/host");
                // ... but try it anyway, it can't hurt.
            }

            let target = Path::new("/run/host")
                .join(source.strip_prefix("/").unwrap_or(source));

            symlink(&target, &dest_on_disk)
                .with_context(|| format!(
                    "Unable to create symlink {dest_on_disk:?} \
                     -> {target:?}"))?;
        } else {
            // We can't edit the runtime in place, so tell the
            // launcher to mount the host's version over the top.
            if flags.contains(TakeFlags::IF_CONTAINER_COMPATIBLE) {
                let dest_in_runtime =
                    if let Ok(rest) = dest.strip_prefix("/usr") {
                        self.runtime_usr.join(rest)
                    } else {
                        self.runtime_files.join(
                            dest.strip_prefix("/").unwrap_or(dest))
                    };

                if real.is_dir() {
                    if !dest_in_runtime.is_dir() {
                        warn!("Not mounting {source:?} over \
                               non-directory file or nonexistent path \
                               {dest_in_runtime:?}");
                        return Ok(());
                    }
                } else if !dest_in_runtime.exists()
                    || dest_in_runtime.is_dir()
                {
                    warn!("Not mounting {source:?} over directory or \
                           nonexistent path {dest_in_runtime:?}");
                    return Ok(());
                }
            }

            plan.ro_bind(&real, dest);
        }

        Ok(())
    }

    /// Run the locale helper; carry on whatever happens.
    ///
    /// The helper must see the same libc the container will use, so
    /// it runs on the host when the host's libc won, and inside a
    /// bubblewrap mirroring the container otherwise.
    fn ensure_locales(&self, plan: &mut MountPlan)
    {
        let locales = self.overrides.join("locales");
        let locales_in_container =
            self.overrides_in_container.join("locales");

        if let Err(err) = fs::create_dir_all(&locales) {
            warn!("Unable to create {locales:?}: {err}");
            return;
        }

        let mut command;

        if self.any_libc_from_host {
            // No need for bwrap when running against the host libc.
            command = Command::new(self.tools_dir.join("caisson-locale-gen"));
            command.arg("--output-dir").arg(&locales);
            command.arg("--verbose");
        } else {
            command = Command::new(&self.bubblewrap);
            command.args(plan.argv());
            command.arg("--ro-bind").arg(&self.overrides)
                   .arg(&self.overrides_in_container);
            command.arg("--ro-bind").arg(&self.tools_dir)
                   .arg("/run/host/tools");
            command.arg("--bind").arg(&locales).arg(&locales_in_container);
            command.arg("/run/host/tools/caisson-locale-gen");
            command.arg("--output-dir").arg(&locales_in_container);
            command.arg("--verbose");
        }

        match command.status() {
            Ok(status) if status.success() =>
                debug!("No locales generated"),
            // The helper exits EX_OSFILE when it had to correct for
            // missing locales at OS level. This is not an error.
            Ok(status) if status.code() == Some(EX_OSFILE) =>
                debug!("caisson-locale-gen created missing locales"),
            Ok(status) =>
                warn!("Unable to generate locales: helper exited {status}"),
            Err(err) =>
                warn!("Unable to generate locales: {err}"),
        }

        let non_empty = fs::read_dir(&locales)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);

        if non_empty {
            debug!("{locales:?} is non-empty");

            let mut locpath = SearchPath::new();
            locpath.append(&locales_in_container);

            if let Some(inherited) = env::var_os("LOCPATH") {
                locpath.append(&inherited);
            }

            plan.setenv("LOCPATH", locpath.as_os_str());
        } else {
            debug!("{locales:?} is empty");
        }
    }

    fn set_search_paths(&self, plan: &mut MountPlan)
    {
        let mut ld_library_path = SearchPath::new();

        for def in &MULTIARCH_TUPLES {
            ld_library_path.append(
                self.overrides_in_container.join("lib").join(def.tuple));
        }

        // The PATH from outside the container doesn't make sense
        // inside: in principle the layout could be totally different.
        plan.setenv("PATH", "/usr/bin:/bin");
        plan.setenv("LD_LIBRARY_PATH", ld_library_path.as_os_str());
    }

    /// Map a container-style host path to where it really is,
    /// honouring [`set_host_root`][`Self::set_host_root`].
    fn host(&self, path: &Path) -> PathBuf
    {
        if self.host_root == Path::new("/") {
            path.to_owned()
        } else {
            self.host_root.join(path.strip_prefix("/").unwrap_or(path))
        }
    }

    /// Inverse of [`host`][`Self::host`].
    fn logical(&self, real: &Path) -> PathBuf
    {
        if self.host_root == Path::new("/") {
            return real.to_owned();
        }

        match real.strip_prefix(&self.host_root) {
            Ok(rest) => Path::new("/").join(rest),
            Err(_)   => real.to_owned(),
        }
    }
}

impl Drop for Runtime
{
    fn drop(&mut self)
    {
        if let Some(tmpdir) = &self.tmpdir {
            if let Err(err) = fs::remove_dir_all(tmpdir) {
                warn!("Unable to delete temporary directory: {err}");
            }
        }

        // The mutable sysroot copy is deliberately left behind:
        // a future launch's garbage collection reclaims it.
    }
}

/// Bind `source` (a runtime image or the host root) so that its /usr
/// and friends appear under `dest` in the container.
fn bind_usr(plan: &mut MountPlan, source: &Path, dest: &Path)
    -> anyhow::Result<()>
{
    let source_usr = source.join("usr");
    let merged = !source_usr.is_dir();

    if merged {
        plan.ro_bind(source, &dest.join("usr"));
    } else {
        plan.ro_bind(&source_usr, &dest.join("usr"));
    }

    let mut names: Vec<OsString> = fs::read_dir(source)
        .with_context(|| format!("Unable to list {source:?}"))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name())
        .filter(|name| {
            let name = name.to_string_lossy();
            matches!(&*name, "bin" | "sbin") || name.starts_with("lib")
        })
        .collect();
    names.sort();

    for name in names {
        let path = source.join(&name);

        if merged {
            plan.symlink(&Path::new("usr").join(&name), &dest.join(&name));
        } else {
            match fs::symlink_metadata(&path) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    let target = fs::read_link(&path)
                        .with_context(|| format!(
                            "Unable to read link {path:?}"))?;
                    plan.symlink(&target, &dest.join(&name));
                },
                _ => plan.ro_bind(&path, &dest.join(&name)),
            }
        }
    }

    // Arrange for the lock file to be reachable as /.ref, for
    // launchers that reacquire the runtime lock themselves.
    let ref_file = source.join(".ref");

    if merged {
        // The whole merged tree becomes /usr,
        // so its lock file is /usr/.ref.
        plan.symlink(Path::new("usr/.ref"), &dest.join(".ref"));
    } else {
        match fs::symlink_metadata(&ref_file) {
            Ok(meta) if meta.file_type().is_symlink() => {
                let target = fs::read_link(&ref_file)?;
                plan.symlink(&target, &dest.join(".ref"));
            },
            Ok(_) =>
                plan.ro_bind(&ref_file, &dest.join(".ref")),
            Err(_) if source_usr.join(".ref").is_file() =>
                plan.symlink(Path::new("usr/.ref"), &dest.join(".ref")),
            Err(_) => { },
        }
    }

    Ok(())
}

/// Bind the runtime's /etc and /var pieces, minus the blocklist.
fn bind_etc_var(plan: &mut MountPlan, runtime_files: &Path)
{
    for subdir in BIND_MUTABLE {
        let dir = runtime_files.join(subdir);

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };

        let mut names: Vec<OsString> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name())
            .collect();
        names.sort();

        for name in names {
            let dest = Path::new("/").join(subdir).join(&name);

            if DONT_BIND.iter().any(|skip| dest == Path::new(skip)) {
                continue;
            }

            let full = dir.join(&name);

            match fs::read_link(&full) {
                Ok(target) => plan.symlink(&target, &dest),
                Err(_)     => plan.ro_bind(&full, &dest),
            }
        }
    }
}

/// The expression list for the bulk host graphics capture.
fn graphics_stack_exprs() -> Vec<Expr>
{
    const VA_API_SONAMES: [&str; 8] = [
        "libva.so.1",
        "libva-drm.so.1",
        "libva-glx.so.1",
        "libva-x11.so.1",
        "libva.so.2",
        "libva-drm.so.2",
        "libva-glx.so.2",
        "libva-x11.so.2",
    ];

    // The glvnd dispatchers and the NVIDIA proprietary stack.
    // These carry even-if-older because the proprietary version
    // numbers are not comparable with the runtime's Mesa.
    const NVIDIA_GLOBS: [&str; 34] = [
        "libEGL.so.*",
        "libEGL_nvidia.so.*",
        "libGL.so.*",
        "libGLESv1_CM.so.*",
        "libGLESv1_CM_nvidia.so.*",
        "libGLESv2.so.*",
        "libGLESv2_nvidia.so.*",
        "libGLX.so.*",
        "libGLX_nvidia.so.*",
        "libGLX_indirect.so.*",
        "libGLdispatch.so.*",
        "libOpenGL.so.*",
        "libcuda.so.*",
        "libglx.so.*",
        "libnvidia-cbl.so.*",
        "libnvidia-cfg.so.*",
        "libnvidia-compiler.so.*",
        "libnvidia-egl-wayland.so.*",
        "libnvidia-eglcore.so.*",
        "libnvidia-encode.so.*",
        "libnvidia-fatbinaryloader.so.*",
        "libnvidia-fbc.so.*",
        "libnvidia-glcore.so.*",
        "libnvidia-glsi.so.*",
        "libnvidia-glvkspirv.so.*",
        "libnvidia-ifr.so.*",
        "libnvidia-ml.so.*",
        "libnvidia-opencl.so.*",
        "libnvidia-opticalflow.so.*",
        "libnvidia-ptxjitcompiler.so.*",
        "libnvidia-rtcore.so.*",
        "libnvidia-tls.so.*",
        "libOpenCL.so.*",
        "libvdpau_nvidia.so.*",
    ];

    let mut exprs = vec![
        // Mesa GLX, EGL, etc.
        Expr::gl_stack(),
        Expr::soname("libvulkan.so.1").if_exists().if_same_abi(),
        Expr::soname("libvdpau.so.1").if_exists().if_same_abi(),
    ];

    for soname in VA_API_SONAMES {
        exprs.push(Expr::soname(soname).if_exists().if_same_abi());
    }

    for glob in NVIDIA_GLOBS {
        exprs.push(Expr::soname_match(glob).if_exists().even_if_older());
    }

    exprs
}

/// Wrap the usable subset of enumerated JSON ICDs for binding.
fn load_json_icds(icds: Vec<JsonIcd>, what: &str)
    -> Vec<IcdDetails<JsonIcd>>
{
    let mut all_details = Vec::with_capacity(icds.len());

    for (j, icd) in icds.into_iter().enumerate() {
        match icd.check_error() {
            Ok(()) => { },
            Err(err) => {
                debug!("Failed to load {what} ICD #{j} from {:?}: {err}",
                       icd.json_path());
                continue;
            },
        }

        let resolved = icd.resolved_library()
            .expect("check_error passed, so the library is known");
        debug!("{what} ICD #{j} at {:?}: {resolved}", icd.json_path());

        all_details.push(IcdDetails::new(icd, resolved));
    }

    all_details
}

/// Create `i486-linux-gnu` (etc.) aliases of the i386 override
/// directory, so that `${PLATFORM}` expansion finds it.
fn create_platform_aliases(overrides: &Path) -> anyhow::Result<()>
{
    let i386_libdir = overrides.join("lib/i386-linux-gnu");

    for alias in I386_PLATFORM_ALIASES {
        let alias_dir = overrides.join("lib").join(alias);

        if alias_dir.symlink_metadata().is_err() && i386_libdir.is_dir() {
            let _ = fs::remove_file(&alias_dir);
            symlink(Path::new("i386-linux-gnu"), &alias_dir)
                .with_context(|| format!(
                    "Unable to create symlink {alias_dir:?} \
                     -> i386-linux-gnu"))?;
        }
    }

    Ok(())
}

fn set_or_unset(plan: &mut MountPlan, var: &str, value: &SearchPath)
{
    if value.is_empty() {
        plan.unsetenv(var);
    } else {
        plan.setenv(var, value.as_os_str());
    }
}

/// Whether `path` will be reachable under /run/host in the container.
///
/// Must be kept approximately in sync with what [`bind_usr`] exposes.
/// /etc is pessimistically assumed not to be shared.
fn path_visible_in_run_host(path: &Path) -> bool
{
    let first = path.components().find_map(|component| match component {
        Component::Normal(name) => Some(name.to_string_lossy()),
        _ => None,
    });

    match first {
        Some(first) =>
            matches!(&*first, "usr" | "bin" | "sbin")
                || first.starts_with("lib"),
        None => false,
    }
}

/// The host timezone name, guessed from /etc/localtime.
fn timezone_from(host_root: &Path) -> String
{
    let localtime = if host_root == Path::new("/") {
        PathBuf::from("/etc/localtime")
    } else {
        host_root.join("etc/localtime")
    };

    if let Ok(target) = fs::read_link(&localtime) {
        let mut components = target.components();

        for component in components.by_ref() {
            if component.as_os_str() == OsStr::new("zoneinfo") {
                let zone: PathBuf = components.collect();
                if let Some(zone) = zone.to_str() {
                    if !zone.is_empty() {
                        return zone.to_owned();
                    }
                }
                break;
            }
        }
    }

    "UTC".to_owned()
}

/// Remove whatever is at `path`, file or tree; missing is fine.
fn remove_existing(path: &Path) -> anyhow::Result<()>
{
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == NotFound => return Ok(()),
        Err(err) =>
            return Err(err).with_context(
                || format!("Unable to examine {path:?}")),
    };

    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    result.with_context(|| format!("Unable to remove {path:?}"))
}

/// Resolve `.` and `..` lexically, without touching the filesystem.
fn lexical_normalize(path: &Path) -> PathBuf
{
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::RootDir   => normalized.push("/"),
            Component::CurDir    => { },
            Component::ParentDir => { normalized.pop(); },
            Component::Normal(c) => normalized.push(c),
            Component::Prefix(_) => { },
        }
    }

    normalized
}

fn strip_run_host(path: &Path) -> PathBuf
{
    match path.strip_prefix("/run/host") {
        Ok(rest) => Path::new("/").join(rest),
        Err(_)   => path.to_owned(),
    }
}

fn is_executable(path: &Path) -> bool
{
    fstatat(None, path, 0)
        .map(|statbuf| statbuf.st_mode & S_IFMT == S_IFREG
                       && statbuf.st_mode & 0o111 != 0)
        .unwrap_or(false)
}

fn is_symlink(path: &Path) -> bool
{
    path.symlink_metadata()
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}

fn canonicalize_or_keep(path: &Path) -> PathBuf
{
    // If it doesn't exist, keep the non-canonical path
    // so the later checks can complain about it by name.
    fs::canonicalize(path).unwrap_or_else(|_| path.to_owned())
}

fn find_program_in_path(name: &str) -> Option<PathBuf>
{
    let path = env::var_os("PATH")?;

    env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

#[cfg(test)]
mod tests
{
    use {
        super::*,
        os_ext::mkdtemp,
        serde_json::Value,
        std::{
            fs::remove_dir_all,
            os::unix::fs::PermissionsExt,
        },
    };

    fn scratch() -> PathBuf
    {
        mkdtemp(Path::new("/tmp/caisson-test-XXXXXX")).unwrap()
    }

    fn args_of(plan: &MountPlan) -> Vec<String>
    {
        plan.argv().iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    fn env_value(args: &[String], var: &str) -> Option<String>
    {
        args.windows(3)
            .find(|w| w[0] == "--setenv" && w[1] == var)
            .map(|w| w[2].clone())
    }

    fn is_unset(args: &[String], var: &str) -> bool
    {
        args.windows(2)
            .any(|w| w[0] == "--unsetenv" && w[1] == var)
    }

    /// A sysroot-shaped runtime image with enough plumbing for a
    /// mutable copy to resolve the x86-64 loader.
    fn sysroot_image(dir: &Path) -> PathBuf
    {
        let image = dir.join("image");
        fs::create_dir_all(image.join("usr/bin")).unwrap();
        fs::create_dir_all(image.join("usr/sbin")).unwrap();
        fs::create_dir_all(image.join("usr/lib/x86_64-linux-gnu")).unwrap();
        fs::create_dir_all(image.join("usr/lib64")).unwrap();
        fs::create_dir_all(image.join("etc")).unwrap();
        fs::create_dir_all(image.join("var/lib")).unwrap();
        fs::write(image.join("usr/bin/env"), "#!").unwrap();
        fs::write(image.join("usr/lib/x86_64-linux-gnu/ld-2.31.so"), "")
            .unwrap();
        symlink(Path::new("../lib/x86_64-linux-gnu/ld-2.31.so"),
                &image.join("usr/lib64/ld-linux-x86-64.so.2")).unwrap();
        fs::write(image.join("etc/ld.so.conf"), "").unwrap();
        fs::write(image.join(".ref"), "").unwrap();
        fs::write(image.join("usr/.ref"), "").unwrap();
        symlink(Path::new("usr/bin"), &image.join("bin")).unwrap();
        symlink(Path::new("usr/lib"), &image.join("lib")).unwrap();
        symlink(Path::new("usr/lib64"), &image.join("lib64")).unwrap();
        symlink(Path::new("usr/sbin"), &image.join("sbin")).unwrap();
        image
    }

    /// A capture helper that reports the x86-64 loader and stages
    /// the subject of every `no-dependencies:` expression.
    fn fake_capture_tool(tools_dir: &Path)
    {
        fs::create_dir_all(tools_dir).unwrap();
        let tool = tools_dir.join("x86_64-linux-gnu-capsule-capture-libs");
        fs::write(&tool, concat!(
            "#!/bin/sh\n",
            "if [ \"$1\" = --print-ld.so ]; then\n",
            "    echo /lib64/ld-linux-x86-64.so.2\n",
            "    exit 0\n",
            "fi\n",
            "while [ \"$1\" != --dest ]; do shift; done\n",
            "dest=\"$2\"\n",
            "shift 4\n",
            "for expr; do\n",
            "    case $expr in\n",
            "        no-dependencies:*)\n",
            "            lib=${expr##*:}\n",
            "            ln -sf \"/run/host$lib\" \
                             \"$dest/$(basename \"$lib\")\"\n",
            "            ;;\n",
            "    esac\n",
            "done\n",
        )).unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755))
            .unwrap();
    }

    /// A fake host root carrying one EGL ICD with an absolute
    /// library path.
    fn fake_host_root(dir: &Path) -> PathBuf
    {
        let root = dir.join("host");
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::create_dir_all(root.join("etc")).unwrap();

        let vendor_d = root.join("usr/share/glvnd/egl_vendor.d");
        fs::create_dir_all(&vendor_d).unwrap();
        fs::write(vendor_d.join("10_nvidia.json"), r#"{
            "file_format_version": "1.0.0",
            "ICD": {"library_path": "/usr/lib/libEGL_nvidia.so.0"}
        }"#).unwrap();

        root
    }

    #[test]
    fn bind_usr_merged_image()
    {
        let dir = scratch();
        let image = dir.join("merged");
        fs::create_dir_all(image.join("bin")).unwrap();
        fs::create_dir_all(image.join("lib")).unwrap();
        fs::write(image.join(".ref"), "").unwrap();

        let mut plan = MountPlan::new();
        bind_usr(&mut plan, &image, Path::new("/")).unwrap();

        assert_eq!(args_of(&plan), [
            "--ro-bind".to_owned(), image.display().to_string(),
            "/usr".to_owned(),
            "--symlink".to_owned(), "usr/bin".to_owned(), "/bin".to_owned(),
            "--symlink".to_owned(), "usr/lib".to_owned(), "/lib".to_owned(),
            "--symlink".to_owned(), "usr/.ref".to_owned(),
            "/.ref".to_owned(),
        ]);

        let _ = remove_dir_all(&dir);
    }

    #[test]
    fn bind_usr_sysroot_image()
    {
        let dir = scratch();
        let image = dir.join("sysroot");
        fs::create_dir_all(image.join("usr")).unwrap();
        fs::create_dir_all(image.join("lib64")).unwrap();
        fs::write(image.join(".ref"), "").unwrap();
        symlink(Path::new("usr/bin"), &image.join("bin")).unwrap();

        let mut plan = MountPlan::new();
        bind_usr(&mut plan, &image, Path::new("/")).unwrap();

        assert_eq!(args_of(&plan), [
            "--ro-bind".to_owned(),
            image.join("usr").display().to_string(), "/usr".to_owned(),
            "--symlink".to_owned(), "usr/bin".to_owned(), "/bin".to_owned(),
            "--ro-bind".to_owned(),
            image.join("lib64").display().to_string(), "/lib64".to_owned(),
            "--ro-bind".to_owned(),
            image.join(".ref").display().to_string(), "/.ref".to_owned(),
        ]);

        let _ = remove_dir_all(&dir);
    }

    #[test]
    fn etc_var_plan_honours_blocklist()
    {
        let dir = scratch();
        let runtime = dir.join("runtime");
        fs::create_dir_all(runtime.join("etc")).unwrap();
        fs::create_dir_all(runtime.join("var/lib/dbus")).unwrap();
        fs::create_dir_all(runtime.join("var/lib/misc")).unwrap();
        fs::write(runtime.join("etc/ld.so.conf"), "").unwrap();
        fs::write(runtime.join("etc/passwd"), "").unwrap();
        symlink(Path::new("../usr/lib/os-release"),
                &runtime.join("etc/os-release")).unwrap();

        let mut plan = MountPlan::new();
        bind_etc_var(&mut plan, &runtime);
        let args = args_of(&plan);

        assert_eq!(args, [
            "--ro-bind".to_owned(),
            runtime.join("etc/ld.so.conf").display().to_string(),
            "/etc/ld.so.conf".to_owned(),
            "--symlink".to_owned(),
            "../usr/lib/os-release".to_owned(),
            "/etc/os-release".to_owned(),
            "--ro-bind".to_owned(),
            runtime.join("var/lib/misc").display().to_string(),
            "/var/lib/misc".to_owned(),
        ]);

        let _ = remove_dir_all(&dir);
    }

    #[test]
    fn platform_aliases_for_i386()
    {
        let dir = scratch();
        let overrides = dir.join("overrides");
        fs::create_dir_all(overrides.join("lib/i386-linux-gnu")).unwrap();

        create_platform_aliases(&overrides).unwrap();

        for alias in I386_PLATFORM_ALIASES {
            let link = overrides.join("lib").join(alias);
            assert_eq!(fs::read_link(&link).unwrap(),
                       PathBuf::from("i386-linux-gnu"));
        }

        let _ = remove_dir_all(&dir);
    }

    #[test]
    fn platform_aliases_need_an_i386_dir()
    {
        let dir = scratch();
        let overrides = dir.join("overrides");
        fs::create_dir_all(overrides.join("lib/x86_64-linux-gnu")).unwrap();

        create_platform_aliases(&overrides).unwrap();

        for alias in I386_PLATFORM_ALIASES {
            assert!(overrides.join("lib").join(alias)
                        .symlink_metadata().is_err());
        }

        let _ = remove_dir_all(&dir);
    }

    #[test]
    fn run_host_visibility()
    {
        assert!(path_visible_in_run_host(Path::new("/usr/lib/locale")));
        assert!(path_visible_in_run_host(Path::new("/lib64/ld.so")));
        assert!(path_visible_in_run_host(Path::new("/bin/true")));
        assert!(path_visible_in_run_host(Path::new("/sbin/ldconfig")));
        assert!(!path_visible_in_run_host(Path::new("/etc/passwd")));
        assert!(!path_visible_in_run_host(Path::new("/opt/tool")));
        assert!(!path_visible_in_run_host(Path::new("/home/me/lib.so")));
    }

    #[test]
    fn timezone_from_zoneinfo_link()
    {
        let dir = scratch();
        let root = dir.join("host");
        fs::create_dir_all(root.join("etc")).unwrap();
        symlink(Path::new("../usr/share/zoneinfo/Europe/Amsterdam"),
                &root.join("etc/localtime")).unwrap();

        assert_eq!(timezone_from(&root), "Europe/Amsterdam");

        let missing = dir.join("nothing");
        fs::create_dir_all(&missing).unwrap();
        assert_eq!(timezone_from(&missing), "UTC");

        let _ = remove_dir_all(&dir);
    }

    #[test]
    fn no_viable_architecture_is_fatal()
    {
        let dir = scratch();
        let image = sysroot_image(&dir);
        let parent = dir.join("var");
        let tools = dir.join("tools");
        fs::create_dir_all(&parent).unwrap();
        fs::create_dir_all(&tools).unwrap();

        let mut runtime = Runtime::new(
            &image, Some(&parent), Path::new("/bin/sh"), &tools,
            RuntimeFlags::HOST_GRAPHICS_STACK).unwrap();

        let mut plan = MountPlan::new();
        let err = runtime.bind(&mut plan).unwrap_err();

        assert_eq!(
            format!("{err}"),
            "None of the supported CPU architectures are common to the \
             host system and the container \
             (tried: x86_64-linux-gnu, i386-linux-gnu)",
        );

        let _ = remove_dir_all(&dir);
    }

    #[test]
    fn take_from_host_replaces_with_run_host_symlink()
    {
        let dir = scratch();
        let image = sysroot_image(&dir);
        let parent = dir.join("var");
        fs::create_dir_all(&parent).unwrap();
        let tools = dir.join("tools");
        fs::create_dir_all(&tools).unwrap();

        let runtime = Runtime::new(
            &image, Some(&parent), Path::new("/bin/sh"), &tools,
            RuntimeFlags::empty()).unwrap();

        let mut plan = MountPlan::new();
        runtime.take_from_host(
            &mut plan,
            Path::new("/usr/lib/locale"),
            Path::new("/usr/lib/locale"),
            TakeFlags::empty()).unwrap();

        let copy = runtime.mutable_sysroot.as_ref().unwrap().path();
        assert_eq!(
            fs::read_link(copy.join("usr/lib/locale")).unwrap(),
            PathBuf::from("/run/host/usr/lib/locale"),
        );

        // Editing the sysroot needs no launcher instructions.
        assert!(plan.argv().is_empty());

        let _ = remove_dir_all(&dir);
    }

    #[test]
    fn take_from_host_copies_what_run_host_cannot_see()
    {
        let dir = scratch();
        let image = sysroot_image(&dir);
        let parent = dir.join("var");
        fs::create_dir_all(&parent).unwrap();
        let tools = dir.join("tools");
        fs::create_dir_all(&tools).unwrap();

        let source = dir.join("outside.json");
        fs::write(&source, "{}").unwrap();

        let runtime = Runtime::new(
            &image, Some(&parent), Path::new("/bin/sh"), &tools,
            RuntimeFlags::empty()).unwrap();

        let mut plan = MountPlan::new();
        runtime.take_from_host(
            &mut plan,
            &source,
            Path::new("/usr/share/icd.d/0.json"),
            TakeFlags::COPY_FALLBACK).unwrap();

        let copy = runtime.mutable_sysroot.as_ref().unwrap().path();
        let dest = copy.join("usr/share/icd.d/0.json");
        assert!(dest.is_file());
        assert!(!is_symlink(&dest));

        let _ = remove_dir_all(&dir);
    }

    /// End-to-end composition against a fake host: one viable
    /// architecture, one EGL ICD with an absolute library path.
    #[test]
    fn composes_graphics_stack_with_mutable_sysroot()
    {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = scratch();
        let image = sysroot_image(&dir);
        let parent = dir.join("var");
        fs::create_dir_all(&parent).unwrap();
        let tools = dir.join("tools");
        fake_capture_tool(&tools);
        let host_root = fake_host_root(&dir);

        let mut runtime = Runtime::new(
            &image, Some(&parent), Path::new("/bin/sh"), &tools,
            RuntimeFlags::HOST_GRAPHICS_STACK).unwrap();
        runtime.set_host_root(&host_root);

        let mut plan = MountPlan::new();
        runtime.bind(&mut plan).unwrap();

        let overrides = runtime.overrides().to_owned();
        let copy =
            runtime.mutable_sysroot.as_ref().unwrap().path().to_owned();
        let args = args_of(&plan);

        // The staged EGL driver and its rewritten manifest.
        let staged = overrides.join(
            "lib/x86_64-linux-gnu/glvnd/0/libEGL_nvidia.so.0");
        assert_eq!(fs::read_link(&staged).unwrap(),
                   PathBuf::from("/run/host/usr/lib/libEGL_nvidia.so.0"));

        let json = overrides.join(
            "share/glvnd/egl_vendor.d/0-x86_64-linux-gnu.json");
        let manifest: Value =
            serde_json::from_str(&fs::read_to_string(&json).unwrap())
            .unwrap();
        assert_eq!(
            manifest.pointer("/ICD/library_path").unwrap(),
            "/usr/lib/caisson/overrides/lib/x86_64-linux-gnu/glvnd/0\
             /libEGL_nvidia.so.0",
        );

        assert_eq!(
            env_value(&args, "__EGL_VENDOR_LIBRARY_FILENAMES").unwrap(),
            "/usr/lib/caisson/overrides/share/glvnd/egl_vendor.d\
             /0-x86_64-linux-gnu.json",
        );

        // No Vulkan ICDs on this host.
        assert!(is_unset(&args, "VK_ICD_FILENAMES"));
        assert!(is_unset(&args, "__EGL_VENDOR_LIBRARY_DIRS"));
        assert!(is_unset(&args, "LIBVA_DRIVERS_PATH"));

        // Search paths list every tuple in declared order.
        assert_eq!(
            env_value(&args, "LD_LIBRARY_PATH").unwrap(),
            "/usr/lib/caisson/overrides/lib/x86_64-linux-gnu\
             :/usr/lib/caisson/overrides/lib/i386-linux-gnu",
        );
        assert_eq!(
            env_value(&args, "LIBGL_DRIVERS_PATH").unwrap(),
            "/usr/lib/caisson/overrides/lib/x86_64-linux-gnu/dri",
        );
        assert_eq!(env_value(&args, "PATH").unwrap(), "/usr/bin:/bin");
        assert_eq!(
            env_value(&args, "VDPAU_DRIVER_PATH").unwrap(),
            "/usr/lib/caisson/overrides/lib/${PLATFORM}-linux-gnu/vdpau",
        );

        // i386 never became viable, so no overrides directory and no
        // ${PLATFORM} aliases appear for it.
        assert!(!overrides.join("lib/i386-linux-gnu").exists());
        assert!(overrides.join("lib/i486-linux-gnu")
                    .symlink_metadata().is_err());

        // The /overrides compatibility alias, in the plan and on disk.
        assert!(args.windows(3).any(|w|
            w[0] == "--symlink"
            && w[1] == "usr/lib/caisson/overrides"
            && w[2] == "/overrides"));
        assert_eq!(fs::read_link(copy.join("overrides")).unwrap(),
                   PathBuf::from("usr/lib/caisson/overrides"));

        // The marker directory.
        assert!(args.windows(2).any(|w|
            w[0] == "--dir" && w[1] == "/run/caisson"));

        // Lock handoff: an OFD lock is passed as a descriptor.
        runtime.append_lock_args(&mut plan);
        let args = args_of(&plan);
        let fd_pos = args.iter().position(|a| a == "--fd").unwrap();
        assert!(args[fd_pos + 1].parse::<i32>().is_ok());
        assert_eq!(args.last().unwrap(), "--");

        let _ = remove_dir_all(&dir);
    }
}
