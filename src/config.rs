//! Build configuration consumed by the workspace and sandbox layers.
//!
//! The configuration is loaded from TOML and is immutable for the duration of
//! a build. Only the handful of settings that influence workspace layout,
//! sandbox composition and package manager state live here.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::package_manager::PackageManagerKind;
use crate::sandbox::{self, SandboxOptions};

const CACHE_SUBDIR: &str = "distro-workspace";
const FALLBACK_CACHE_DIR: &str = "/var/cache/distro-workspace";
const DEFAULT_WORKSPACE_DIR: &str = "/var/tmp";

/// Tri-state toggle: explicitly on, explicitly off, or decided per build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    Enabled,
    Disabled,
    #[default]
    Auto,
}

/// Image output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Directory,
    Tar,
    Cpio,
    #[default]
    Disk,
    Uki,
    Esp,
}

impl OutputFormat {
    /// Formats that are commonly reused as the base tree of derived images.
    pub fn is_base_tree(self) -> bool {
        matches!(self, OutputFormat::Directory | OutputFormat::Tar)
    }
}

/// Distribution families the builder knows how to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    Fedora,
    Centos,
    Debian,
    Ubuntu,
    Arch,
    Opensuse,
    #[default]
    Custom,
}

impl Distribution {
    /// Package manager backend used to install this distribution.
    pub fn package_manager(self) -> PackageManagerKind {
        match self {
            Distribution::Fedora | Distribution::Centos => PackageManagerKind::Dnf,
            Distribution::Debian | Distribution::Ubuntu => PackageManagerKind::Apt,
            Distribution::Arch => PackageManagerKind::Pacman,
            Distribution::Opensuse => PackageManagerKind::Zypper,
            Distribution::Custom => PackageManagerKind::Custom,
        }
    }
}

/// Identity and privileges granted to commands inside the sandbox.
///
/// The sandbox wrapper is the isolation boundary, so the defaults map the
/// caller to root with every capability.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SandboxIdentity {
    pub uid: u32,
    pub gid: u32,
    pub capabilities: Vec<String>,
}

impl Default for SandboxIdentity {
    fn default() -> Self {
        Self {
            uid: 0,
            gid: 0,
            capabilities: vec!["ALL".to_string()],
        }
    }
}

impl SandboxIdentity {
    /// Wrapper flags establishing this identity.
    pub fn options(&self) -> Vec<OsString> {
        let mut options: Vec<OsString> = vec![
            "--uid".into(),
            self.uid.to_string().into(),
            "--gid".into(),
            self.gid.to_string().into(),
        ];
        for cap in &self.capabilities {
            options.push("--cap-add".into());
            options.push(cap.into());
        }
        options
    }
}

/// Run-level options that are not part of the image description.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// Emit debug logging.
    pub debug: bool,
    /// Keep the workspace around after the build for inspection.
    pub debug_workspace: bool,
}

/// Immutable build configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub distribution: Distribution,
    pub output_format: OutputFormat,
    /// Build the image as an overlay on top of its base trees.
    pub overlay: bool,
    pub use_subvolumes: Feature,
    pub clean_package_metadata: Feature,
    /// Mirror to install from. `file://` mirrors are exposed in the sandbox.
    pub local_mirror: Option<String>,
    pub package_cache_dir: Option<PathBuf>,
    /// Tree providing the tools run inside the sandbox. Defaults to the host.
    pub tools_tree: Option<PathBuf>,
    pub workspace_dir: Option<PathBuf>,
    pub sandbox_identity: SandboxIdentity,
    pub environment: BTreeMap<String, String>,
}

impl Config {
    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        Self::from_toml(&contents).with_context(|| format!("parsing config '{}'", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Root of the tree whose binaries are used inside the sandbox.
    pub fn tools(&self) -> PathBuf {
        self.tools_tree
            .clone()
            .unwrap_or_else(|| PathBuf::from("/"))
    }

    /// The persistent package cache shared between builds.
    pub fn package_cache_dir_or_default(&self) -> PathBuf {
        if let Some(dir) = &self.package_cache_dir {
            return dir.clone();
        }
        dirs::cache_dir()
            .map(|dir| dir.join(CACHE_SUBDIR))
            .unwrap_or_else(|| PathBuf::from(FALLBACK_CACHE_DIR))
    }

    pub fn workspace_dir_or_default(&self) -> PathBuf {
        self.workspace_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKSPACE_DIR))
    }

    /// Local filesystem path of the mirror, if it is a `file://` URI.
    pub fn local_mirror_path(&self) -> Option<PathBuf> {
        self.local_mirror
            .as_deref()
            .and_then(|mirror| mirror.strip_prefix("file://"))
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
    }

    /// Base sandbox wrapper invocation.
    pub fn sandbox(&self, options: &SandboxOptions) -> Vec<OsString> {
        sandbox::sandbox_cmd(&self.tools(), options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.distribution, Distribution::Custom);
        assert_eq!(config.output_format, OutputFormat::Disk);
        assert_eq!(config.use_subvolumes, Feature::Auto);
        assert_eq!(config.clean_package_metadata, Feature::Auto);
        assert!(!config.overlay);
        assert_eq!(config.tools(), PathBuf::from("/"));
        assert_eq!(config.sandbox_identity, SandboxIdentity::default());
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_toml(
            r#"
            distribution = "arch"
            output_format = "directory"
            overlay = true
            use_subvolumes = "disabled"
            clean_package_metadata = "enabled"
            local_mirror = "file:///srv/mirror"
            package_cache_dir = "/var/cache/pkgs"
            tools_tree = "/opt/tools"

            [sandbox_identity]
            uid = 1000
            gid = 1000
            capabilities = []
            "#,
        )
        .unwrap();

        assert_eq!(config.distribution, Distribution::Arch);
        assert_eq!(config.output_format, OutputFormat::Directory);
        assert!(config.overlay);
        assert_eq!(config.use_subvolumes, Feature::Disabled);
        assert_eq!(config.clean_package_metadata, Feature::Enabled);
        assert_eq!(config.local_mirror_path(), Some(PathBuf::from("/srv/mirror")));
        assert_eq!(
            config.package_cache_dir_or_default(),
            PathBuf::from("/var/cache/pkgs")
        );
        assert_eq!(config.tools(), PathBuf::from("/opt/tools"));
        assert_eq!(config.sandbox_identity.uid, 1000);
        assert!(config.sandbox_identity.capabilities.is_empty());
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(Config::from_toml("bogus = 1").is_err());
    }

    #[test]
    fn test_remote_mirror_is_not_local() {
        let config = Config {
            local_mirror: Some("https://mirror.example.org/arch".into()),
            ..Config::default()
        };
        assert_eq!(config.local_mirror_path(), None);
    }

    #[test]
    fn test_identity_options() {
        let options = SandboxIdentity::default().options();
        assert_eq!(
            options,
            ["--uid", "0", "--gid", "0", "--cap-add", "ALL"]
                .iter()
                .map(OsString::from)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_package_manager_selection() {
        assert_eq!(
            Distribution::Fedora.package_manager(),
            PackageManagerKind::Dnf
        );
        assert_eq!(
            Distribution::Ubuntu.package_manager(),
            PackageManagerKind::Apt
        );
        assert_eq!(
            Distribution::Arch.package_manager(),
            PackageManagerKind::Pacman
        );
        assert_eq!(
            Distribution::Opensuse.package_manager(),
            PackageManagerKind::Zypper
        );
    }
}
