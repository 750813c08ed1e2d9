//! dnf and dnf5 (Fedora, CentOS).
//!
//! dnf5 is preferred when the tools tree ships it; its state lives under
//! `libdnf5` instead of `dnf`.

use anyhow::Result;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use super::{invoke, operation_scripts, PackageManager};
use crate::build::context::Context;
use crate::config::Config;
use crate::preflight::find_binary;

/// Repository id of the local package repository.
pub const LOCAL_REPO_ID: &str = "workspace-local";

#[derive(Debug, Clone, Copy, Default)]
pub struct Dnf;

impl Dnf {
    pub fn cmd(&self, context: &Context) -> Vec<OsString> {
        let config = &context.config;
        let subdir = self.subdir(config);
        vec![
            self.executable(config).into(),
            "--assumeyes".into(),
            format!("--installroot={}", context.root().display()).into(),
            "--config=/etc/dnf/dnf.conf".into(),
            "--setopt=keepcache=1".into(),
            format!("--setopt=cachedir=/var/cache/{}", subdir.display()).into(),
            format!("--setopt=persistdir=/var/lib/{}", subdir.display()).into(),
            "--setopt=reposdir=/etc/yum.repos.d".into(),
            "--setopt=install_weak_deps=0".into(),
        ]
    }
}

impl PackageManager for Dnf {
    fn executable(&self, config: &Config) -> String {
        if find_binary("dnf5", &config.tools()).is_some() {
            "dnf5".to_string()
        } else {
            "dnf".to_string()
        }
    }

    fn subdir(&self, config: &Config) -> PathBuf {
        if self.executable(config) == "dnf5" {
            PathBuf::from("libdnf5")
        } else {
            PathBuf::from("dnf")
        }
    }

    /// Each remote repository gets a `<id>-<hash>` directory with the
    /// downloaded packages in `packages/`. The local repository is skipped.
    fn cache_subdirs(&self, cache: &Path) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(cache) else {
            return Vec::new();
        };

        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter(|entry| {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                name.contains('-') && !name.starts_with(LOCAL_REPO_ID)
            })
            .map(|entry| entry.path().join("packages"))
            .collect();
        dirs.sort();
        dirs
    }

    fn scripts(&self, context: &Context) -> BTreeMap<String, Vec<OsString>> {
        let executable = self.executable(&context.config);
        let mut scripts = operation_scripts(
            &[executable.as_str()],
            &["install"],
            &["upgrade"],
            &["remove"],
            &["reinstall"],
        );
        scripts.insert(executable, self.cmd(context));
        scripts
    }

    fn sync(&self, context: &Context) -> Result<()> {
        let mut cmd = self.cmd(context);
        cmd.push("makecache".into());
        invoke(self, context, cmd)
    }
}
