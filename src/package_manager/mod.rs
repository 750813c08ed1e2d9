//! Package manager abstraction.
//!
//! Every distribution family is installed with one package manager. The
//! [`PackageManager`] trait describes where that manager keeps its state,
//! which mounts it needs inside the sandbox and which helper scripts it
//! provides. Backends are a closed set, see [`PackageManagerKind`].
//!
//! # Cache layout
//!
//! ```text
//! <package_cache_dir>/
//!     cache/<subdir>/   downloaded packages, repository metadata
//!     lib/<subdir>/     package manager state (sync databases etc.)
//! ```
//!
//! Inside the sandbox these appear at `/var/cache/<subdir>` and
//! `/var/lib/<subdir>`.

pub mod apt;
pub mod dnf;
pub mod metadata;
pub mod pacman;
pub mod zypper;

use anyhow::{Context as _, Result};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::build::context::Context;
use crate::config::Config;
use crate::sandbox::{self, finalize_crypto_mounts, Mount, SandboxOptions};

pub use apt::Apt;
pub use dnf::Dnf;
pub use metadata::{clean_package_manager_metadata, copy_repository_metadata, CleanupReport};
pub use pacman::Pacman;
pub use zypper::Zypper;

/// Cache categories mirrored between the cache root and the sandbox.
pub const CACHE_CATEGORIES: [&str; 2] = ["cache", "lib"];

/// Where the local package repository is mounted inside the sandbox.
pub const LOCAL_REPO_MOUNT: &str = "/work/packages";

/// Contract implemented by every package manager backend.
pub trait PackageManager {
    /// Name of the package manager binary.
    fn executable(&self, config: &Config) -> String;

    /// Directory name of this manager under the `cache` and `lib` categories.
    fn subdir(&self, config: &Config) -> PathBuf;

    /// Paths under `cache` that hold downloads worth sharing with the
    /// persistent cache.
    fn cache_subdirs(&self, _cache: &Path) -> Vec<PathBuf> {
        Vec::new()
    }

    /// Helper scripts to expose inside the sandbox, by name.
    fn scripts(&self, _context: &Context) -> BTreeMap<String, Vec<OsString>> {
        BTreeMap::new()
    }

    /// Mounts needed to run the package manager.
    fn mounts(&self, context: &Context) -> Vec<Mount> {
        default_mounts(self, context)
    }

    /// Refresh repository metadata.
    fn sync(&self, _context: &Context) -> Result<()> {
        Ok(())
    }
}

/// Mounts shared by all package managers.
///
/// When the active cache root is not the persistent cache directory (the
/// build works on a snapshot of the repository metadata), the manager's cache
/// subdirectories that exist in the persistent cache are mounted over the
/// snapshot so downloaded packages still land in, and are reused from, the
/// persistent cache.
pub fn default_mounts<M: PackageManager + ?Sized>(manager: &M, context: &Context) -> Vec<Mount> {
    let config = &context.config;
    let mut mounts = finalize_crypto_mounts(&config.tools());
    mounts.push(Mount::bind(context.packages(), LOCAL_REPO_MOUNT));

    if let Some(mirror) = config.local_mirror_path() {
        mounts.push(Mount::ro_bind(&mirror, &mirror));
    }

    let subdir = manager.subdir(config);
    let persistent = config.package_cache_dir_or_default();
    let on_snapshot = context.package_cache_dir() != persistent;

    for category in CACHE_CATEGORIES {
        let src = context.package_cache_dir().join(category).join(&subdir);
        let dest = Path::new("/var").join(category).join(&subdir);
        mounts.push(Mount::bind(&src, &dest));

        if category != "cache" || !on_snapshot {
            continue;
        }

        for path in manager.cache_subdirs(&src) {
            let Ok(rel) = path.strip_prefix(&src) else {
                continue;
            };
            let persistent_path = persistent.join(category).join(&subdir).join(rel);
            if persistent_path.exists() {
                mounts.push(Mount::bind(persistent_path, dest.join(rel)));
            }
        }
    }

    mounts
}

/// Helper scripts mapping the generic package operations onto `cmd`.
pub(crate) fn operation_scripts(
    cmd: &[&str],
    install: &[&str],
    upgrade: &[&str],
    remove: &[&str],
    reinstall: &[&str],
) -> BTreeMap<String, Vec<OsString>> {
    let script = |args: &[&str]| -> Vec<OsString> {
        cmd.iter().chain(args).map(OsString::from).collect()
    };

    BTreeMap::from([
        ("install-packages".to_string(), script(install)),
        ("upgrade-packages".to_string(), script(upgrade)),
        ("remove-packages".to_string(), script(remove)),
        ("reinstall-packages".to_string(), script(reinstall)),
    ])
}

/// Sandbox command line running `cmd` with network access, the image root and
/// the manager's mounts.
pub fn invoke_cmd<M: PackageManager + ?Sized>(
    manager: &M,
    context: &Context,
    cmd: Vec<OsString>,
) -> Result<Vec<OsString>> {
    let root = context.root();
    let options = SandboxOptions::new()
        .network(true)
        .mounts(&[Mount::bind(&root, &root)])
        .mounts(&manager.mounts(context));

    let mut argv = context.sandbox(&options)?;
    argv.extend(cmd);
    Ok(argv)
}

pub(crate) fn invoke<M: PackageManager + ?Sized>(
    manager: &M,
    context: &Context,
    cmd: Vec<OsString>,
) -> Result<()> {
    sandbox::run(&invoke_cmd(manager, context, cmd)?)
}

/// Refresh repository metadata into the persistent package cache.
///
/// The persistent `cache` and `lib` directories of the manager must exist
/// before they can be mounted. The manager's package directories are created
/// afterwards, since some are only known once the metadata is there.
pub fn run_sync<M: PackageManager + ?Sized>(manager: &M, context: &Context) -> Result<()> {
    let config = &context.config;
    let persistent = config.package_cache_dir_or_default();
    let subdir = manager.subdir(config);

    for category in CACHE_CATEGORIES {
        let dir = persistent.join(category).join(&subdir);
        fs::create_dir_all(&dir).with_context(|| format!("creating '{}'", dir.display()))?;
    }

    manager.sync(context)?;

    let cache = persistent.join("cache").join(&subdir);
    for dir in manager.cache_subdirs(&cache) {
        fs::create_dir_all(&dir).with_context(|| format!("creating '{}'", dir.display()))?;
    }

    tracing::info!(cache = %persistent.display(), "synced repository metadata");
    Ok(())
}

/// Backend used when images are assembled without a package manager.
#[derive(Debug, Clone, Copy, Default)]
pub struct Custom;

impl PackageManager for Custom {
    fn executable(&self, _config: &Config) -> String {
        "custom".to_string()
    }

    fn subdir(&self, _config: &Config) -> PathBuf {
        PathBuf::from("custom")
    }
}

/// The supported package managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManagerKind {
    Apt,
    Dnf,
    Pacman,
    Zypper,
    Custom,
}

impl PackageManagerKind {
    fn backend(self) -> &'static dyn PackageManager {
        match self {
            PackageManagerKind::Apt => &Apt,
            PackageManagerKind::Dnf => &Dnf,
            PackageManagerKind::Pacman => &Pacman,
            PackageManagerKind::Zypper => &Zypper,
            PackageManagerKind::Custom => &Custom,
        }
    }
}

impl PackageManager for PackageManagerKind {
    fn executable(&self, config: &Config) -> String {
        self.backend().executable(config)
    }

    fn subdir(&self, config: &Config) -> PathBuf {
        self.backend().subdir(config)
    }

    fn cache_subdirs(&self, cache: &Path) -> Vec<PathBuf> {
        self.backend().cache_subdirs(cache)
    }

    fn scripts(&self, context: &Context) -> BTreeMap<String, Vec<OsString>> {
        self.backend().scripts(context)
    }

    fn mounts(&self, context: &Context) -> Vec<Mount> {
        self.backend().mounts(context)
    }

    fn sync(&self, context: &Context) -> Result<()> {
        self.backend().sync(context)
    }
}
