//! Driving the external library capture helper.
//!
//! The per-architecture helper (`<tuple>-capsule-capture-libs`) copies a
//! library and its transitive dependencies into a destination directory
//! as symbolic links pointing under a link-target prefix. It is driven
//! with a small expression language whose tokens are `:`-separated and
//! prefix-composed; [`Expr`] models one expression as a value instead of
//! ad-hoc string pasting.

use {
    crate::bwrap::MountPlan,
    anyhow::{Context, bail},
    log::debug,
    std::{
        ffi::OsString,
        fmt,
        io,
        path::{Path, PathBuf},
        process::Command,
    },
};

/// Prefix under which the helper's output symlinks point at the host.
pub const LINK_TARGET: &str = "/run/host";

/// How an [`Expr`] treats the dependency closure of its subject.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
enum DepMode
{
    /// Capture the subject and its transitive dependencies.
    #[default]
    Full,

    /// Capture only the transitive dependencies, not the subject.
    OnlyDependencies,

    /// Capture only the subject itself.
    NoDependencies,
}

/// One capture expression.
///
/// Build one with the constructors, refine it with the modifier
/// methods, and it renders to the helper's syntax via [`fmt::Display`]:
///
/// ```
/// # use caisson::capture::Expr;
/// let expr = Expr::soname("libvulkan.so.1").if_exists().if_same_abi();
/// assert_eq!(expr.to_string(), "if-exists:if-same-abi:soname:libvulkan.so.1");
/// ```
#[derive(Clone, Debug)]
pub struct Expr
{
    token: &'static str,
    arg: Option<String>,
    deps: DepMode,
    even_if_older: bool,
    if_exists: bool,
    if_same_abi: bool,
}

impl Expr
{
    fn new(token: &'static str, arg: Option<String>) -> Self
    {
        Self{
            token,
            arg,
            deps: DepMode::default(),
            even_if_older: false,
            if_exists: false,
            if_same_abi: false,
        }
    }

    /// Capture the well-known OpenGL/EGL/GLX stack.
    pub fn gl_stack() -> Self
    {
        Self::new("gl", None)
    }

    /// Capture one library by SONAME lookup.
    pub fn soname(name: impl Into<String>) -> Self
    {
        Self::new("soname", Some(name.into()))
    }

    /// Capture every library whose SONAME matches a shell glob.
    pub fn soname_match(glob: impl Into<String>) -> Self
    {
        Self::new("soname-match", Some(glob.into()))
    }

    /// Capture one library by absolute filesystem path.
    pub fn path(path: impl Into<String>) -> Self
    {
        Self::new("path", Some(path.into()))
    }

    /// Capture every library whose path matches a shell glob.
    pub fn path_match(glob: impl Into<String>) -> Self
    {
        Self::new("path-match", Some(glob.into()))
    }

    /// Do not treat a missing subject as an error.
    pub fn if_exists(mut self) -> Self
    {
        self.if_exists = true;
        self
    }

    /// Skip the subject if its ABI differs from the helper's tuple.
    pub fn if_same_abi(mut self) -> Self
    {
        self.if_same_abi = true;
        self
    }

    /// Capture the host copy even when the runtime's copy is newer.
    ///
    /// Needed for vendor stacks whose version numbering is not
    /// comparable with the runtime's Mesa.
    pub fn even_if_older(mut self) -> Self
    {
        self.even_if_older = true;
        self
    }

    /// Capture only the subject's transitive dependencies.
    pub fn only_dependencies(mut self) -> Self
    {
        self.deps = DepMode::OnlyDependencies;
        self
    }

    /// Capture only the subject itself, without dependencies.
    pub fn no_dependencies(mut self) -> Self
    {
        self.deps = DepMode::NoDependencies;
        self
    }
}

impl fmt::Display for Expr
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        match self.deps {
            DepMode::Full             => { },
            DepMode::OnlyDependencies => write!(f, "only-dependencies:")?,
            DepMode::NoDependencies   => write!(f, "no-dependencies:")?,
        }

        if self.even_if_older { write!(f, "even-if-older:")?; }
        if self.if_exists     { write!(f, "if-exists:")?;     }
        if self.if_same_abi   { write!(f, "if-same-abi:")?;   }

        write!(f, "{}:", self.token)?;

        if let Some(arg) = &self.arg {
            write!(f, "{arg}")?;
        }

        Ok(())
    }
}

/// Everything needed to run the capture helper for one architecture.
///
/// The helper runs behind `adverb`, a (possibly empty) bubblewrap
/// prefix that makes the composed sysroot visible at `container`, so
/// that the helper observes exactly the library set that will exist
/// inside the final container.
pub struct CaptureContext<'a>
{
    tool: &'a Path,
    adverb: &'a MountPlan,
    container: &'a Path,
}

impl<'a> CaptureContext<'a>
{
    /// Describe how to run the helper at `tool`.
    pub fn new(tool: &'a Path, adverb: &'a MountPlan, container: &'a Path)
        -> Self
    {
        Self{tool, adverb, container}
    }

    /// Run the helper, capturing `exprs` into `dest`.
    pub fn capture(&self, dest: &Path, exprs: &[Expr]) -> anyhow::Result<()>
    {
        let mut argv: Vec<OsString> = self.adverb.argv().to_vec();
        argv.push(self.tool.into());
        argv.push("--container".into());
        argv.push(self.container.into());
        argv.push("--link-target".into());
        argv.push(LINK_TARGET.into());
        argv.push("--dest".into());
        argv.push(dest.into());
        argv.push("--provider".into());
        argv.push("/".into());

        for expr in exprs {
            argv.push(expr.to_string().into());
        }

        debug!("Running {argv:?}");

        let output = Command::new(&argv[0])
            .args(&argv[1 ..])
            .output()
            .with_context(|| format!("Run {:?}", self.tool))?;

        if !output.status.success() {
            bail!(
                "{:?} failed ({}): {}",
                self.tool,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end(),
            );
        }

        Ok(())
    }
}

/// Ask the capture helper for this tuple's interoperable ld.so path.
///
/// This doubles as the viability probe for the architecture:
/// if the helper cannot run on the host, neither can anything
/// else of its tuple.
pub fn print_ld_so(tool: &Path) -> io::Result<PathBuf>
{
    let output = Command::new(tool).arg("--print-ld.so").output()?;

    if !output.status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{tool:?} --print-ld.so failed ({})", output.status),
        ));
    }

    let mut stdout = output.stdout;

    while stdout.last() == Some(&b'\n') {
        stdout.pop();
    }

    if stdout.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{tool:?} --print-ld.so reported nothing"),
        ));
    }

    use std::os::unix::ffi::OsStringExt;
    Ok(PathBuf::from(OsString::from_vec(stdout)))
}
