//! pacman (Arch Linux).

use anyhow::Result;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::{default_mounts, invoke, operation_scripts, PackageManager};
use crate::build::context::Context;
use crate::config::Config;
use crate::sandbox::Mount;

/// Read-only cache directory holding the local repository.
///
/// pacman writes downloads to the first writable cache directory, so the
/// local repository is mounted read-only ahead of the real cache.
pub const LOCAL_CACHE_MOUNT: &str = "/var/cache/pacman/local";

#[derive(Debug, Clone, Copy, Default)]
pub struct Pacman;

impl Pacman {
    /// Base pacman command line operating on the image root.
    pub fn cmd(&self, context: &Context) -> Vec<OsString> {
        let root = context.root();
        vec![
            "pacman".into(),
            "--root".into(),
            root.clone().into_os_string(),
            "--logfile=/dev/null".into(),
            "--dbpath=/var/lib/pacman".into(),
            format!("--cachedir={}", LOCAL_CACHE_MOUNT).into(),
            "--cachedir=/var/cache/pacman/pkg".into(),
            "--hookdir".into(),
            root.join("etc/pacman.d/hooks").into_os_string(),
            "--color".into(),
            "auto".into(),
            "--noconfirm".into(),
        ]
    }
}

impl PackageManager for Pacman {
    fn executable(&self, _config: &Config) -> String {
        "pacman".to_string()
    }

    fn subdir(&self, _config: &Config) -> PathBuf {
        PathBuf::from("pacman")
    }

    fn cache_subdirs(&self, cache: &Path) -> Vec<PathBuf> {
        vec![cache.join("pkg")]
    }

    fn scripts(&self, context: &Context) -> BTreeMap<String, Vec<OsString>> {
        let mut scripts = operation_scripts(
            &["pacman"],
            &["--sync", "--needed"],
            &["--sync", "--sysupgrade", "--needed"],
            &["--remove", "--recursive", "--nosave"],
            &["--sync"],
        );
        scripts.insert("pacman".to_string(), self.cmd(context));
        scripts
    }

    fn mounts(&self, context: &Context) -> Vec<Mount> {
        let mut mounts = default_mounts(self, context);
        mounts.push(Mount::ro_bind(context.packages(), LOCAL_CACHE_MOUNT));

        // The local database belongs to the image, the sync databases to the cache.
        let local_db = context.root().join("var/lib/pacman/local");
        if local_db.exists() {
            mounts.push(Mount::bind(local_db, "/var/lib/pacman/local"));
        }

        let makepkg = context.config.tools().join("etc/makepkg.conf");
        if makepkg.exists() && !context.pkgmngr().join("etc/makepkg.conf").exists() {
            mounts.push(Mount::ro_bind(makepkg, "/etc/makepkg.conf"));
        }

        mounts
    }

    fn sync(&self, context: &Context) -> Result<()> {
        let mut cmd = self.cmd(context);
        cmd.extend(["--sync", "--refresh"].map(OsString::from));
        invoke(self, context, cmd)
    }
}
