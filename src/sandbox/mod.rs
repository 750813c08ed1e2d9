//! Sandbox wrapper invocation.
//!
//! Every command that runs during a build is executed through `bwrap`. This
//! module builds the base wrapper command line, models mount directives, and
//! installs helper scripts that are exposed inside the sandbox.
//!
//! Nothing here enforces isolation itself: the functions only compose the
//! argument vector for the wrapper. [`run`] is the single place that spawns it.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Sandbox wrapper binary.
pub const SANDBOX_BINARY: &str = "bwrap";

/// Where helper scripts are mounted inside the sandbox.
pub const SCRIPTS_MOUNT: &str = "/scripts";

const DEFAULT_PATH: &str = "/usr/bin:/usr/sbin";

/// Certificate and crypto policy locations taken from the tools tree.
const CRYPTO_PATHS: &[&str] = &[
    "etc/pki",
    "etc/ssl",
    "etc/ca-certificates",
    "etc/crypto-policies",
    "var/lib/ca-certificates",
];

/// Caller-controlled knobs for a sandbox invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxOptions {
    /// Keep the host network namespace.
    pub network: bool,
    /// Expose the host's `/dev` instead of a minimal one.
    pub devices: bool,
    /// Directory of helper scripts to put on `PATH`.
    pub scripts: Option<PathBuf>,
    /// Extra wrapper options, appended after the generated ones.
    pub options: Vec<OsString>,
}

impl SandboxOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn network(mut self, network: bool) -> Self {
        self.network = network;
        self
    }

    pub fn devices(mut self, devices: bool) -> Self {
        self.devices = devices;
        self
    }

    pub fn scripts(mut self, scripts: impl Into<PathBuf>) -> Self {
        self.scripts = Some(scripts.into());
        self
    }

    pub fn options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.options.extend(options.into_iter().map(Into::into));
        self
    }

    pub fn mounts(self, mounts: &[Mount]) -> Self {
        self.options(mount_args(mounts))
    }
}

/// A host path exposed inside the sandbox.
///
/// Mounts are applied by the wrapper in order; a later mount at the same
/// destination shadows an earlier one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mount {
    Bind { source: PathBuf, dest: PathBuf },
    RoBind { source: PathBuf, dest: PathBuf },
}

impl Mount {
    pub fn bind(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Mount::Bind {
            source: source.into(),
            dest: dest.into(),
        }
    }

    pub fn ro_bind(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Mount::RoBind {
            source: source.into(),
            dest: dest.into(),
        }
    }

    pub fn flag(&self) -> &'static str {
        match self {
            Mount::Bind { .. } => "--bind",
            Mount::RoBind { .. } => "--ro-bind",
        }
    }

    pub fn source(&self) -> &Path {
        match self {
            Mount::Bind { source, .. } | Mount::RoBind { source, .. } => source,
        }
    }

    pub fn dest(&self) -> &Path {
        match self {
            Mount::Bind { dest, .. } | Mount::RoBind { dest, .. } => dest,
        }
    }

    pub fn to_args(&self) -> [OsString; 3] {
        [
            self.flag().into(),
            self.source().as_os_str().to_owned(),
            self.dest().as_os_str().to_owned(),
        ]
    }
}

/// Flatten mount directives into wrapper arguments, preserving order.
pub fn mount_args(mounts: &[Mount]) -> Vec<OsString> {
    mounts.iter().flat_map(Mount::to_args).collect()
}

/// Build the base wrapper command line.
///
/// `/usr` (and the merged-usr symlinks) come from `tools`, so the sandboxed
/// command runs with the tools tree's userspace. `options` are appended last.
pub fn sandbox_cmd(tools: &Path, options: &SandboxOptions) -> Vec<OsString> {
    let mut cmd: Vec<OsString> = vec![
        SANDBOX_BINARY.into(),
        "--die-with-parent".into(),
        "--proc".into(),
        "/proc".into(),
        "--ro-bind".into(),
        tools.join("usr").into_os_string(),
        "/usr".into(),
    ];

    for link in ["bin", "sbin", "lib", "lib32", "lib64"] {
        let path = tools.join(link);
        if !path.is_symlink() {
            continue;
        }
        if let Ok(target) = fs::read_link(&path) {
            cmd.push("--symlink".into());
            cmd.push(target.into_os_string());
            cmd.push(Path::new("/").join(link).into_os_string());
        }
    }

    if !options.network {
        cmd.push("--unshare-net".into());
    }

    if options.devices {
        cmd.extend(["--dev-bind", "/dev", "/dev"].map(OsString::from));
    } else {
        cmd.extend(["--dev", "/dev"].map(OsString::from));
    }

    cmd.extend(["--tmpfs", "/tmp", "--tmpfs", "/var/tmp"].map(OsString::from));
    cmd.extend(
        [
            "--setenv",
            "SYSTEMD_OFFLINE",
            if options.network { "0" } else { "1" },
        ]
        .map(OsString::from),
    );

    let path = match &options.scripts {
        Some(scripts) => {
            cmd.push("--ro-bind".into());
            cmd.push(scripts.clone().into_os_string());
            cmd.push(SCRIPTS_MOUNT.into());
            format!("{}:{}", SCRIPTS_MOUNT, DEFAULT_PATH)
        }
        None => DEFAULT_PATH.to_string(),
    };
    cmd.extend(["--setenv".into(), "PATH".into(), OsString::from(path)]);

    cmd.extend(options.options.iter().cloned());
    cmd
}

/// Read-only mounts exposing certificates and crypto policies of the tools tree.
pub fn finalize_crypto_mounts(tools: &Path) -> Vec<Mount> {
    CRYPTO_PATHS
        .iter()
        .map(|rel| (tools.join(rel), Path::new("/").join(rel)))
        .filter(|(source, _)| source.exists())
        .map(|(source, dest)| Mount::ro_bind(source, dest))
        .collect()
}

/// Quote a single argument for `/bin/sh`.
pub fn shell_quote(arg: &OsStr) -> String {
    let arg = arg.to_string_lossy();
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        return arg.into_owned();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Write each script as an executable wrapper in `dir`.
///
/// The wrapper `exec`s the script's argument vector followed by whatever
/// arguments it was invoked with.
pub fn install_scripts(dir: &Path, scripts: &BTreeMap<String, Vec<OsString>>) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("creating scripts directory '{}'", dir.display()))?;

    for (name, argv) in scripts {
        if argv.is_empty() {
            bail!("script '{}' has an empty command line", name);
        }
        let command = argv
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ");
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\nexec {} \"$@\"\n", command))
            .with_context(|| format!("writing script '{}'", path.display()))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .with_context(|| format!("setting permissions '{}'", path.display()))?;
    }

    Ok(())
}

/// Run a fully composed command line and fail on a non-zero exit status.
pub fn run(argv: &[OsString]) -> Result<()> {
    let Some((program, args)) = argv.split_first() else {
        bail!("cannot run an empty command line");
    };

    tracing::debug!(command = ?argv, "running");

    let status = Command::new(program)
        .args(args)
        .status()
        .with_context(|| format!("spawning '{}'", program.to_string_lossy()))?;

    if !status.success() {
        bail!(
            "'{}' failed with {}",
            program.to_string_lossy(),
            status
        );
    }
    Ok(())
}
