//! Build context: the per-build workspace and sandbox invocation.
//!
//! A [`Context`] owns a freshly created workspace directory and derives every
//! well-known path from it:
//!
//! ```text
//! workspace/
//!     root/       image root (plain directory or subvolume)
//!     staging/    output staging area
//!     pkgmngr/    package manager config, logs and optional usr/ prefix
//!     packages/   local package repository
//!     dest/       install directory of build scripts
//! ```
//!
//! The workspace itself is created and removed by the caller.

use anyhow::{bail, Context as _, Result};
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::build::tree::{copy_tree, make_tree, Umask};
use crate::config::{Args, Config};
use crate::sandbox::{Mount, SandboxOptions};

/// Name of the workspace-level snapshot of the package cache.
pub const PACKAGE_CACHE_SNAPSHOT: &str = "package-cache-dir";

/// State of a single build.
#[derive(Debug)]
pub struct Context {
    pub args: Args,
    pub config: Config,
    pub workspace: PathBuf,
    pub resources: PathBuf,
    package_cache_dir: PathBuf,
    package_cache_rebound: bool,
}

impl Context {
    /// Set up the workspace layout for a build.
    ///
    /// `workspace` must already exist. `root` is created with a `0o755`
    /// umask; `staging`, `pkgmngr` and `packages` must not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the directories cannot be created.
    pub fn new(
        args: Args,
        config: Config,
        workspace: &Path,
        resources: &Path,
        package_cache_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let package_cache_dir = package_cache_dir.unwrap_or_else(|| workspace.join("root/var"));

        let context = Self {
            args,
            config,
            workspace: workspace.to_path_buf(),
            resources: resources.to_path_buf(),
            package_cache_dir,
            package_cache_rebound: false,
        };

        {
            let _umask = Umask::allow(0o755);
            let root = context.root();
            // A btrfs subvolume as overlayfs upperdir fails with EXDEV.
            if context.config.overlay {
                fs::create_dir(&root)
                    .with_context(|| format!("creating '{}'", root.display()))?;
            } else {
                make_tree(&root, context.config.use_subvolumes, &context.config)?;
            }
        }

        for dir in [context.staging(), context.pkgmngr(), context.packages()] {
            fs::create_dir(&dir).with_context(|| format!("creating '{}'", dir.display()))?;
        }

        let install_dir = context.install_dir();
        if !install_dir.is_dir() {
            fs::create_dir(&install_dir)
                .with_context(|| format!("creating '{}'", install_dir.display()))?;
        }

        tracing::debug!(workspace = %context.workspace.display(), "workspace ready");
        Ok(context)
    }

    pub fn root(&self) -> PathBuf {
        self.workspace.join("root")
    }

    pub fn staging(&self) -> PathBuf {
        self.workspace.join("staging")
    }

    pub fn pkgmngr(&self) -> PathBuf {
        self.workspace.join("pkgmngr")
    }

    pub fn packages(&self) -> PathBuf {
        self.workspace.join("packages")
    }

    pub fn install_dir(&self) -> PathBuf {
        self.workspace.join("dest")
    }

    /// The active package cache root.
    pub fn package_cache_dir(&self) -> &Path {
        &self.package_cache_dir
    }

    /// Switch the active package cache root to a workspace-local snapshot.
    ///
    /// This happens at most once per build.
    pub fn rebind_package_cache_dir(&mut self, path: PathBuf) -> Result<()> {
        if self.package_cache_rebound {
            bail!(
                "package cache directory was already rebound to '{}'",
                self.package_cache_dir.display()
            );
        }
        tracing::debug!(
            from = %self.package_cache_dir.display(),
            to = %path.display(),
            "rebinding package cache directory"
        );
        self.package_cache_dir = path;
        self.package_cache_rebound = true;
        Ok(())
    }

    /// Workspace-level snapshot location of the package cache.
    pub fn package_cache_snapshot(&self) -> PathBuf {
        self.workspace.join(PACKAGE_CACHE_SNAPSHOT)
    }

    /// Whether the local package repository has anything in it.
    pub fn want_local_repo(&self) -> Result<bool> {
        let packages = self.packages();
        let mut entries = fs::read_dir(&packages)
            .with_context(|| format!("reading '{}'", packages.display()))?;
        Ok(entries.next().is_some())
    }

    /// Build the sandbox command line for running package manager tooling.
    ///
    /// The configured environment is set inside the sandbox. Every entry of
    /// `pkgmngr/etc` is bound over `/etc/<name>`, followed by the caller's
    /// options and the package manager log directory. If a
    /// package manager was installed into `pkgmngr/usr`, it is overlaid on
    /// `/usr` before the command is executed.
    pub fn sandbox(&self, options: &SandboxOptions) -> Result<Vec<OsString>> {
        let pkgmngr = self.pkgmngr();
        let usr = pkgmngr.join("usr");
        let has_usr = usr.exists();

        let mut composed = self.config.sandbox_identity.options();

        for (key, value) in &self.config.environment {
            composed.extend([OsString::from("--setenv"), key.into(), value.into()]);
        }

        // Writable so the wrapper can create directories and symlinks in them.
        for mount in self.etc_mounts()? {
            composed.extend(mount.to_args());
        }

        composed.extend(options.options.iter().cloned());
        composed.extend(Mount::bind(pkgmngr.join("var/log"), "/var/log").to_args());

        if has_usr {
            composed.extend(Mount::ro_bind(&usr, &usr).to_args());
        }

        let mut cmd = self.config.sandbox(&SandboxOptions {
            network: options.network,
            devices: options.devices,
            scripts: options.scripts.clone(),
            options: composed,
        });

        if has_usr {
            cmd.extend([
                OsString::from("sh"),
                OsString::from("-c"),
                OsString::from(format!(
                    "mount -t overlay -o lowerdir={}:/usr overlayfs /usr && exec $0 \"$@\"",
                    usr.display()
                )),
            ]);
        }

        Ok(cmd)
    }

    fn etc_mounts(&self) -> Result<Vec<Mount>> {
        let etc = self.pkgmngr().join("etc");
        if !etc.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&etc).with_context(|| format!("reading '{}'", etc.display()))? {
            names.push(entry?.file_name());
        }
        names.sort();

        Ok(names
            .into_iter()
            .map(|name| Mount::bind(etc.join(&name), Path::new("/etc").join(&name)))
            .collect())
    }

    /// Populate `pkgmngr` with the files every package manager run needs.
    pub fn install_package_manager_trees(&self) -> Result<()> {
        let pkgmngr = self.pkgmngr();
        let etc = pkgmngr.join("etc");
        fs::create_dir_all(&etc).with_context(|| format!("creating '{}'", etc.display()))?;

        let log = pkgmngr.join("var/log");
        fs::create_dir_all(&log).with_context(|| format!("creating '{}'", log.display()))?;

        let passwd = etc.join("passwd");
        let mut file = fs::File::create(&passwd)
            .with_context(|| format!("creating '{}'", passwd.display()))?;
        file.write_all(b"root:x:0:0:root:/root:/bin/sh\n")?;

        // SAFETY: getuid/getgid never fail.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        if uid != 0 {
            let name = std::env::var("USER").unwrap_or_else(|_| uid.to_string());
            let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));
            writeln!(
                file,
                "{name}:x:{uid}:{gid}:{name}:{}:/bin/sh",
                home.display()
            )?;
        }

        let policies = self.config.tools().join("etc/crypto-policies");
        if policies.is_dir() {
            copy_tree(&policies, &etc.join("crypto-policies"))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Feature;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn config() -> Config {
        Config {
            use_subvolumes: Feature::Disabled,
            tools_tree: Some(PathBuf::from("/nonexistent/tools")),
            ..Config::default()
        }
    }

    fn context(temp: &TempDir) -> Context {
        Context::new(Args::default(), config(), temp.path(), temp.path(), None).unwrap()
    }

    fn has_sequence(cmd: &[OsString], seq: &[&str]) -> bool {
        cmd.windows(seq.len())
            .any(|w| w.iter().zip(seq).all(|(a, b)| a == *b))
    }

    #[test]
    fn test_layout_created() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);

        for dir in [
            ctx.root(),
            ctx.staging(),
            ctx.pkgmngr(),
            ctx.packages(),
            ctx.install_dir(),
        ] {
            assert!(dir.is_dir(), "{} should exist", dir.display());
        }
        assert_eq!(ctx.install_dir(), temp.path().join("dest"));
        assert_eq!(fs::read_dir(ctx.staging()).unwrap().count(), 0);
        assert_eq!(fs::read_dir(ctx.pkgmngr()).unwrap().count(), 0);
        assert_eq!(fs::read_dir(ctx.packages()).unwrap().count(), 0);
    }

    #[test]
    fn test_root_not_group_writable() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);

        let mode = fs::metadata(ctx.root()).unwrap().permissions().mode();
        assert_eq!(mode & 0o022, 0);
    }

    #[test]
    fn test_default_package_cache_dir() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);
        assert_eq!(ctx.package_cache_dir(), ctx.root().join("var"));
    }

    #[test]
    fn test_package_cache_dir_override() {
        let temp = TempDir::new().unwrap();
        let ctx = Context::new(
            Args::default(),
            config(),
            temp.path(),
            temp.path(),
            Some(PathBuf::from("/var/cache/pkgs")),
        )
        .unwrap();
        assert_eq!(ctx.package_cache_dir(), Path::new("/var/cache/pkgs"));
    }

    #[test]
    fn test_existing_staging_is_an_error() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("staging")).unwrap();
        assert!(Context::new(Args::default(), config(), temp.path(), temp.path(), None).is_err());
    }

    #[test]
    fn test_existing_install_dir_is_tolerated() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("dest")).unwrap();
        fs::write(temp.path().join("dest/prestaged"), "x").unwrap();

        let ctx = context(&temp);
        assert!(ctx.install_dir().join("prestaged").exists());
    }

    #[test]
    fn test_overlay_root_is_plain_directory() {
        let temp = TempDir::new().unwrap();
        let config = Config {
            overlay: true,
            use_subvolumes: Feature::Enabled,
            ..Config::default()
        };
        let ctx = Context::new(Args::default(), config, temp.path(), temp.path(), None).unwrap();
        assert!(ctx.root().is_dir());
        assert!(!crate::build::tree::is_subvolume(&ctx.root()));
    }

    #[test]
    fn test_want_local_repo() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);

        assert!(!ctx.want_local_repo().unwrap());
        fs::write(ctx.packages().join("foo.rpm"), "").unwrap();
        assert!(ctx.want_local_repo().unwrap());
    }

    #[test]
    fn test_rebind_only_once() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(&temp);

        let snapshot = ctx.package_cache_snapshot();
        ctx.rebind_package_cache_dir(snapshot.clone()).unwrap();
        assert_eq!(ctx.package_cache_dir(), snapshot);
        assert!(ctx.rebind_package_cache_dir(PathBuf::from("/elsewhere")).is_err());
        assert_eq!(ctx.package_cache_dir(), snapshot);
    }

    #[test]
    fn test_sandbox_identity_and_fixed_mounts() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);
        let cmd = ctx.sandbox(&SandboxOptions::new()).unwrap();

        assert!(has_sequence(
            &cmd,
            &["--uid", "0", "--gid", "0", "--cap-add", "ALL"]
        ));
        let log = ctx.pkgmngr().join("var/log");
        assert!(has_sequence(
            &cmd,
            &["--bind", log.to_str().unwrap(), "/var/log"]
        ));
        assert_eq!(cmd.last().unwrap(), "/var/log");
    }

    #[test]
    fn test_sandbox_binds_etc_entries_sorted() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);
        let etc = ctx.pkgmngr().join("etc");
        fs::create_dir_all(etc.join("pacman.d")).unwrap();
        fs::write(etc.join("pacman.conf"), "").unwrap();
        fs::write(etc.join("apt.conf"), "").unwrap();

        let cmd = ctx.sandbox(&SandboxOptions::new()).unwrap();

        let dests: Vec<_> = cmd
            .iter()
            .filter_map(|arg| arg.to_str())
            .filter(|arg| arg.starts_with("/etc/"))
            .collect();
        assert_eq!(dests, ["/etc/apt.conf", "/etc/pacman.conf", "/etc/pacman.d"]);
    }

    #[test]
    fn test_sandbox_caller_options_between_etc_and_log() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);
        let etc = ctx.pkgmngr().join("etc");
        fs::create_dir_all(&etc).unwrap();
        fs::write(etc.join("resolv.conf"), "").unwrap();

        let cmd = ctx
            .sandbox(&SandboxOptions::new().options(["--chdir", "/work"]))
            .unwrap();

        let etc_pos = cmd.iter().position(|a| a == "/etc/resolv.conf").unwrap();
        let opt_pos = cmd.iter().position(|a| a == "--chdir").unwrap();
        let log_pos = cmd.iter().position(|a| a == "/var/log").unwrap();
        assert!(etc_pos < opt_pos);
        assert!(opt_pos < log_pos);
    }

    #[test]
    fn test_sandbox_without_pkgmngr_usr() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);
        let usr = ctx.pkgmngr().join("usr");

        let cmd = ctx.sandbox(&SandboxOptions::new()).unwrap();

        assert!(!cmd.iter().any(|a| a == "sh"));
        assert!(!cmd.iter().any(|a| a == usr.as_os_str()));
    }

    #[test]
    fn test_sandbox_with_pkgmngr_usr() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);
        let usr = ctx.pkgmngr().join("usr");
        fs::create_dir_all(usr.join("bin")).unwrap();

        let cmd = ctx.sandbox(&SandboxOptions::new()).unwrap();
        let usr_str = usr.to_str().unwrap();

        let ro_binds = cmd
            .windows(3)
            .filter(|w| w[0] == "--ro-bind" && w[1] == usr_str && w[2] == usr_str)
            .count();
        assert_eq!(ro_binds, 1);

        let n = cmd.len();
        assert_eq!(cmd[n - 3], "sh");
        assert_eq!(cmd[n - 2], "-c");
        let script = cmd[n - 1].to_str().unwrap();
        assert!(script.contains(&format!("lowerdir={}:/usr", usr_str)));
        assert!(script.ends_with("exec $0 \"$@\""));
    }

    #[test]
    fn test_sandbox_is_repeatable() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);
        let etc = ctx.pkgmngr().join("etc");
        fs::create_dir_all(&etc).unwrap();
        for name in ["zypp", "dnf", "apt", "pacman.conf"] {
            fs::write(etc.join(name), "").unwrap();
        }

        let options = SandboxOptions::new().network(true).options(["--chdir", "/"]);
        assert_eq!(ctx.sandbox(&options).unwrap(), ctx.sandbox(&options).unwrap());
    }

    #[test]
    fn test_sandbox_sets_configured_environment() {
        let temp = TempDir::new().unwrap();
        let mut config = config();
        config
            .environment
            .insert("SOURCE_DATE_EPOCH".to_string(), "0".to_string());
        config
            .environment
            .insert("http_proxy".to_string(), "http://proxy:3128".to_string());
        let ctx = Context::new(Args::default(), config, temp.path(), temp.path(), None).unwrap();

        let cmd = ctx.sandbox(&SandboxOptions::new()).unwrap();

        assert!(has_sequence(&cmd, &["--setenv", "SOURCE_DATE_EPOCH", "0"]));
        assert!(has_sequence(
            &cmd,
            &["--setenv", "http_proxy", "http://proxy:3128"]
        ));
        let env_pos = cmd.iter().position(|a| a == "SOURCE_DATE_EPOCH").unwrap();
        let log_pos = cmd.iter().position(|a| a == "/var/log").unwrap();
        assert!(env_pos < log_pos);
    }

    #[test]
    fn test_install_package_manager_trees() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp);

        ctx.install_package_manager_trees().unwrap();

        assert!(ctx.pkgmngr().join("var/log").is_dir());
        let passwd = fs::read_to_string(ctx.pkgmngr().join("etc/passwd")).unwrap();
        assert!(passwd.starts_with("root:x:0:0:"));

        let cmd = ctx.sandbox(&SandboxOptions::new()).unwrap();
        assert!(cmd.iter().any(|a| a == "/etc/passwd"));
    }
}
