//! apt (Debian, Ubuntu).

use anyhow::Result;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::{invoke, operation_scripts, PackageManager};
use crate::build::context::Context;
use crate::config::Config;

#[derive(Debug, Clone, Copy, Default)]
pub struct Apt;

impl Apt {
    pub fn cmd(&self, context: &Context, command: &str) -> Vec<OsString> {
        let mut cmd: Vec<OsString> = [
            "env",
            "APT_CONFIG=/etc/apt.conf",
            "DEBIAN_FRONTEND=noninteractive",
            "DEBCONF_INTERACTIVE_SEEN=true",
            command,
            "-o",
            "Dir::Cache=/var/cache/apt",
            "-o",
            "Dir::State=/var/lib/apt",
            "-o",
            "Dir::Log=/var/log/apt",
            "-o",
            "Dir::Etc::Parts=/etc/apt/apt.conf.d",
            "-o",
            "APT::Get::Assume-Yes=true",
        ]
        .map(OsString::from)
        .to_vec();
        cmd.push("-o".into());
        cmd.push(format!("DPkg::Options::=--root={}", context.root().display()).into());
        cmd
    }
}

impl PackageManager for Apt {
    fn executable(&self, _config: &Config) -> String {
        "apt".to_string()
    }

    fn subdir(&self, _config: &Config) -> PathBuf {
        PathBuf::from("apt")
    }

    fn cache_subdirs(&self, cache: &Path) -> Vec<PathBuf> {
        vec![cache.join("archives")]
    }

    fn scripts(&self, context: &Context) -> BTreeMap<String, Vec<OsString>> {
        let mut scripts = operation_scripts(
            &["apt-get"],
            &["install"],
            &["upgrade"],
            &["purge"],
            &["install", "--reinstall"],
        );
        for command in ["apt", "apt-cache", "apt-get"] {
            scripts.insert(command.to_string(), self.cmd(context, command));
        }
        scripts
    }

    fn sync(&self, context: &Context) -> Result<()> {
        let mut cmd = self.cmd(context, "apt-get");
        cmd.push("update".into());
        invoke(self, context, cmd)
    }
}
