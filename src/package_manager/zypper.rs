//! zypper (openSUSE).

use anyhow::Result;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::{invoke, operation_scripts, PackageManager};
use crate::build::context::Context;
use crate::config::Config;

#[derive(Debug, Clone, Copy, Default)]
pub struct Zypper;

impl Zypper {
    pub fn cmd(&self, context: &Context) -> Vec<OsString> {
        vec![
            "env".into(),
            "ZYPP_CONF=/etc/zypp/zypp.conf".into(),
            "HOME=/".into(),
            "zypper".into(),
            "--installroot".into(),
            context.root().into_os_string(),
            "--cache-dir".into(),
            "/var/cache/zypp".into(),
            "--gpg-auto-import-keys".into(),
            "--non-interactive".into(),
            "--no-refresh".into(),
        ]
    }
}

impl PackageManager for Zypper {
    fn executable(&self, _config: &Config) -> String {
        "zypper".to_string()
    }

    fn subdir(&self, _config: &Config) -> PathBuf {
        PathBuf::from("zypp")
    }

    fn cache_subdirs(&self, cache: &Path) -> Vec<PathBuf> {
        vec![cache.join("packages")]
    }

    fn scripts(&self, context: &Context) -> BTreeMap<String, Vec<OsString>> {
        let mut scripts = operation_scripts(
            &["zypper"],
            &["install", "--download", "in-advance", "--no-recommends"],
            &["update"],
            &["remove", "--clean-deps"],
            &["install", "--force"],
        );
        scripts.insert("zypper".to_string(), self.cmd(context));
        scripts
    }

    fn sync(&self, context: &Context) -> Result<()> {
        let mut cmd = self.cmd(context);
        cmd.push("refresh".into());
        invoke(self, context, cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Distribution;
    use crate::package_manager::tests::{test_config, test_context};
    use tempfile::TempDir;

    #[test]
    fn test_descriptor() {
        let config = Config::default();
        assert_eq!(Zypper.executable(&config), "zypper");
        assert_eq!(
            Zypper.cache_subdirs(Path::new("/c/cache/zypp")),
            vec![PathBuf::from("/c/cache/zypp/packages")]
        );
    }

    #[test]
    fn test_scripts() {
        let temp = TempDir::new().unwrap();
        let ctx = test_context(&temp, test_config(&temp, Distribution::Opensuse));

        let scripts = Zypper.scripts(&ctx);
        assert!(scripts["zypper"].contains(&ctx.root().into_os_string()));
        assert_eq!(scripts["upgrade-packages"][1], "update");
    }
}
