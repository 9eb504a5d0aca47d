//! Enumerating graphics drivers on the host system.
//!
//! EGL and Vulkan drivers are announced through JSON manifests (ICDs);
//! VDPAU and VA-API drivers are plain `.so` files in well-known
//! per-architecture directories. Enumeration order is stable: it
//! becomes the sequence number that disambiguates basename collisions
//! when the drivers are staged into the overrides directory.
//!
//! Every function takes the root to enumerate under; production code
//! passes `/`, tests pass a scratch tree.

use {
    log::{debug, warn},
    serde_json::Value,
    std::{
        fs,
        io,
        path::{Path, PathBuf},
    },
};

const EGL_VENDOR_DIRS: &[&str] = &[
    "etc/glvnd/egl_vendor.d",
    "usr/share/glvnd/egl_vendor.d",
];

const VULKAN_ICD_DIRS: &[&str] = &[
    "etc/vulkan/icd.d",
    "usr/share/vulkan/icd.d",
];

/// An EGL or Vulkan driver described by a JSON manifest.
///
/// A manifest that exists but cannot be used still yields a `JsonIcd`,
/// with [`check_error`][`Self::check_error`] reporting what is wrong;
/// the caller logs and skips it without disturbing the sequence
/// numbering of its neighbours.
#[derive(Debug)]
pub struct JsonIcd
{
    json_path: PathBuf,
    library_path: Result<String, String>,
}

impl JsonIcd
{
    fn load(json_path: PathBuf) -> Self
    {
        let library_path = read_library_path(&json_path)
            .map_err(|err| err.to_string());
        Self{json_path, library_path}
    }

    /// Path of the JSON manifest itself.
    pub fn json_path(&self) -> &Path
    {
        &self.json_path
    }

    /// Report why this manifest is unusable, if it is.
    pub fn check_error(&self) -> Result<(), &str>
    {
        match &self.library_path {
            Ok(_)    => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// The `library_path` with relative paths resolved.
    ///
    /// A bare filename stays as it is: it means lookup by SONAME in
    /// the default search path. A path containing `/` is interpreted
    /// relative to the manifest's own directory.
    pub fn resolved_library(&self) -> Option<String>
    {
        let library_path = self.library_path.as_ref().ok()?;

        if library_path.starts_with('/')
            || !library_path.contains('/')
        {
            return Some(library_path.clone());
        }

        let dir = self.json_path.parent().unwrap_or(Path::new("/"));
        Some(dir.join(library_path).to_string_lossy().into_owned())
    }

    /// Write a copy of the manifest with `library_path` replaced.
    ///
    /// Every other field round-trips untouched.
    pub fn write_replace_library_path(&self, library_path: &str, dest: &Path)
        -> io::Result<()>
    {
        let text = fs::read_to_string(&self.json_path)?;
        let mut manifest: Value = serde_json::from_str(&text)
            .map_err(io::Error::other)?;

        let slot = manifest
            .pointer_mut("/ICD/library_path")
            .ok_or_else(|| io::Error::other("manifest has no ICD.library_path"))?;
        *slot = Value::String(library_path.to_owned());

        let mut text = serde_json::to_string_pretty(&manifest)
            .map_err(io::Error::other)?;
        text.push('\n');
        fs::write(dest, text)
    }
}

fn read_library_path(json_path: &Path) -> anyhow::Result<String>
{
    let text = fs::read_to_string(json_path)?;
    let manifest: Value = serde_json::from_str(&text)?;

    let library_path = manifest
        .pointer("/ICD/library_path")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("manifest has no ICD.library_path"))?;

    Ok(library_path.to_owned())
}

/// A VDPAU or VA-API driver found as a plain `.so` file.
#[derive(Debug)]
pub struct DriverSo
{
    library_path: PathBuf,
}

impl DriverSo
{
    /// Absolute path of the driver, with symlinks resolved.
    pub fn library_path(&self) -> &Path
    {
        &self.library_path
    }
}

/// Enumerate EGL ICD manifests under `root`.
pub fn list_egl_icds(root: &Path) -> Vec<JsonIcd>
{
    list_json_icds(root, EGL_VENDOR_DIRS)
}

/// Enumerate Vulkan ICD manifests under `root`.
pub fn list_vulkan_icds(root: &Path) -> Vec<JsonIcd>
{
    list_json_icds(root, VULKAN_ICD_DIRS)
}

fn list_json_icds(root: &Path, dirs: &[&str]) -> Vec<JsonIcd>
{
    let mut icds = Vec::new();

    for dir in dirs {
        for path in sorted_entries(&root.join(dir)) {
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            icds.push(JsonIcd::load(path));
        }
    }

    icds
}

/// Enumerate VDPAU drivers for one multiarch tuple under `root`.
pub fn list_vdpau_drivers(
    root: &Path,
    tuple: &str,
    libqual: Option<&str>,
) -> Vec<DriverSo>
{
    let mut dirs = vec![
        format!("lib/{tuple}/vdpau"),
        format!("usr/lib/{tuple}/vdpau"),
    ];

    if let Some(libqual) = libqual {
        dirs.push(format!("usr/{libqual}/vdpau"));
    }

    list_driver_sos(root, &dirs, |name| {
        name.starts_with("libvdpau_") && name.contains(".so")
    })
}

/// Enumerate VA-API drivers for one multiarch tuple under `root`.
pub fn list_va_api_drivers(
    root: &Path,
    tuple: &str,
    libqual: Option<&str>,
) -> Vec<DriverSo>
{
    let mut dirs = vec![
        format!("lib/{tuple}/dri"),
        format!("usr/lib/{tuple}/dri"),
    ];

    if let Some(libqual) = libqual {
        dirs.push(format!("usr/{libqual}/dri"));
    }

    list_driver_sos(root, &dirs, |name| name.ends_with("_drv_video.so"))
}

fn list_driver_sos(
    root: &Path,
    dirs: &[String],
    relevant: impl Fn(&str) -> bool,
) -> Vec<DriverSo>
{
    let mut drivers = Vec::new();

    for dir in dirs {
        for path in sorted_entries(&root.join(dir)) {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };

            if !relevant(name) {
                continue;
            }

            match fs::canonicalize(&path) {
                Ok(library_path) =>
                    drivers.push(DriverSo{library_path}),
                Err(err) =>
                    warn!("Unable to resolve driver {path:?}: {err}"),
            }
        }
    }

    drivers
}

/// List a directory in name order; a missing directory is empty.
fn sorted_entries(dir: &Path) -> Vec<PathBuf>
{
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!("Not enumerating {dir:?}: {err}");
            return Vec::new();
        },
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    paths.sort();
    paths
}

#[cfg(test)]
mod tests
{
    use {super::*, os_ext::mkdtemp};

    fn scratch() -> PathBuf
    {
        mkdtemp(Path::new("/tmp/caisson-test-XXXXXX")).unwrap()
    }

    #[test]
    fn egl_icds_in_stable_order()
    {
        let root = scratch();
        let vendor_d = root.join("usr/share/glvnd/egl_vendor.d");
        fs::create_dir_all(&vendor_d).unwrap();

        fs::write(vendor_d.join("50_mesa.json"), r#"{
            "file_format_version": "1.0.0",
            "ICD": {"library_path": "libEGL_mesa.so.0"}
        }"#).unwrap();
        fs::write(vendor_d.join("10_nvidia.json"), r#"{
            "file_format_version": "1.0.0",
            "ICD": {"library_path": "/usr/lib/libEGL_nvidia.so.0"}
        }"#).unwrap();
        fs::write(vendor_d.join("99_broken.json"), "not json").unwrap();
        fs::write(vendor_d.join("README"), "not a manifest").unwrap();

        let icds = list_egl_icds(&root);
        assert_eq!(icds.len(), 3);

        assert!(icds[0].check_error().is_ok());
        assert_eq!(icds[0].resolved_library().unwrap(),
                   "/usr/lib/libEGL_nvidia.so.0");

        assert!(icds[1].check_error().is_ok());
        assert_eq!(icds[1].resolved_library().unwrap(), "libEGL_mesa.so.0");

        assert!(icds[2].check_error().is_err());
        assert!(icds[2].resolved_library().is_none());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn relative_library_path_resolves_against_manifest_dir()
    {
        let root = scratch();
        let icd_d = root.join("etc/vulkan/icd.d");
        fs::create_dir_all(&icd_d).unwrap();

        fs::write(icd_d.join("custom.json"), r#"{
            "file_format_version": "1.0.0",
            "ICD": {"library_path": "./libvulkan_custom.so"}
        }"#).unwrap();

        let icds = list_vulkan_icds(&root);
        assert_eq!(icds.len(), 1);
        assert_eq!(
            icds[0].resolved_library().unwrap(),
            icd_d.join("./libvulkan_custom.so").to_string_lossy(),
        );

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn rewrite_preserves_other_fields()
    {
        let root = scratch();
        let icd_d = root.join("usr/share/vulkan/icd.d");
        fs::create_dir_all(&icd_d).unwrap();

        fs::write(icd_d.join("radeon.json"), r#"{
            "file_format_version": "1.0.0",
            "ICD": {
                "library_path": "/usr/lib/libvulkan_radeon.so",
                "api_version": "1.2.145"
            }
        }"#).unwrap();

        let icds = list_vulkan_icds(&root);
        let dest = root.join("0-x86_64-linux-gnu.json");
        icds[0].write_replace_library_path(
            "/overrides/lib/x86_64-linux-gnu/vulkan/0/libvulkan_radeon.so",
            &dest,
        ).unwrap();

        let rewritten: Value =
            serde_json::from_str(&fs::read_to_string(&dest).unwrap()).unwrap();
        assert_eq!(
            rewritten.pointer("/ICD/library_path").unwrap(),
            "/overrides/lib/x86_64-linux-gnu/vulkan/0/libvulkan_radeon.so",
        );
        assert_eq!(
            rewritten.pointer("/ICD/api_version").unwrap(),
            "1.2.145",
        );
        assert_eq!(
            rewritten.pointer("/file_format_version").unwrap(),
            "1.0.0",
        );

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn vdpau_and_va_api_drivers()
    {
        let root = scratch();
        let vdpau = root.join("usr/lib/x86_64-linux-gnu/vdpau");
        let dri = root.join("usr/lib/x86_64-linux-gnu/dri");
        fs::create_dir_all(&vdpau).unwrap();
        fs::create_dir_all(&dri).unwrap();

        fs::write(vdpau.join("libvdpau_radeonsi.so.1.0.0"), "").unwrap();
        fs::write(vdpau.join("unrelated.txt"), "").unwrap();
        fs::write(dri.join("radeonsi_drv_video.so"), "").unwrap();
        fs::write(dri.join("radeonsi_dri.so"), "").unwrap();

        let vdpau_drivers =
            list_vdpau_drivers(&root, "x86_64-linux-gnu", Some("lib64"));
        assert_eq!(vdpau_drivers.len(), 1);
        assert!(vdpau_drivers[0].library_path().is_absolute());

        let va_api_drivers =
            list_va_api_drivers(&root, "x86_64-linux-gnu", Some("lib64"));
        assert_eq!(va_api_drivers.len(), 1);
        assert!(va_api_drivers[0].library_path()
                    .ends_with("radeonsi_drv_video.so"));

        let _ = fs::remove_dir_all(&root);
    }
}
