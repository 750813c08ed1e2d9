//! Tree primitives: creating, copying and removing directory trees.
//!
//! Trees may be btrfs subvolumes. Subvolume creation and deletion go through
//! the sandbox so the tools tree's `btrfs` is used.

use anyhow::{bail, Context, Result};
use std::ffi::{CString, OsString};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::{Config, Feature};
use crate::preflight::find_binary;
use crate::sandbox::{self, Mount, SandboxOptions};

const BTRFS_SUPER_MAGIC: i64 = 0x9123_683e;
const BTRFS_SUBVOLUME_INO: u64 = 256;

/// Scoped process umask, restored on drop.
pub struct Umask {
    previous: libc::mode_t,
}

impl Umask {
    /// Set the umask to `mask`.
    pub fn set(mask: libc::mode_t) -> Self {
        // SAFETY: umask(2) cannot fail and only swaps the process mask.
        let previous = unsafe { libc::umask(mask) };
        Self { previous }
    }

    /// Mask that only allows the permissions in `mode`.
    pub fn allow(mode: libc::mode_t) -> Self {
        Self::set(!mode & 0o777)
    }
}

impl Drop for Umask {
    fn drop(&mut self) {
        // SAFETY: see Umask::set.
        unsafe {
            libc::umask(self.previous);
        }
    }
}

/// Whether `path` lives on a btrfs filesystem.
pub fn is_btrfs(path: &Path) -> bool {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL terminated and stat is a valid out pointer.
    if unsafe { libc::statfs(c_path.as_ptr(), &mut stat) } != 0 {
        return false;
    }
    stat.f_type as i64 == BTRFS_SUPER_MAGIC
}

/// Whether `path` is the root of a btrfs subvolume.
pub fn is_subvolume(path: &Path) -> bool {
    path.is_dir()
        && is_btrfs(path)
        && fs::symlink_metadata(path)
            .map(|m| m.ino() == BTRFS_SUBVOLUME_INO)
            .unwrap_or(false)
}

fn btrfs(config: &Config, mount: &Path, args: &[&Path], subcommand: [&str; 2]) -> Result<()> {
    let mut cmd = config.sandbox(&SandboxOptions::new().mounts(&[Mount::bind(mount, mount)]));
    cmd.push("btrfs".into());
    cmd.extend(subcommand.map(OsString::from));
    cmd.extend(args.iter().map(|p| p.as_os_str().to_owned()));
    sandbox::run(&cmd)
}

/// Create a directory tree at `path`, as a btrfs subvolume if possible.
///
/// With [`Feature::Enabled`] failing to create a subvolume is an error, with
/// [`Feature::Auto`] it falls back to a plain directory.
pub fn make_tree(path: &Path, use_subvolumes: Feature, config: &Config) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("'{}' has no parent directory", path.display()))?;

    let want_subvolume = match use_subvolumes {
        Feature::Disabled => false,
        Feature::Enabled => true,
        Feature::Auto => is_btrfs(parent) && find_binary("btrfs", &config.tools()).is_some(),
    };

    if want_subvolume {
        match btrfs(config, parent, &[path], ["subvolume", "create"]) {
            Ok(()) => {
                tracing::debug!(path = %path.display(), "created subvolume");
                return Ok(());
            }
            Err(e) if use_subvolumes == Feature::Enabled => {
                return Err(e).with_context(|| {
                    format!("creating subvolume '{}'", path.display())
                });
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "subvolume creation failed, using a directory");
            }
        }
    }

    fs::create_dir(path).with_context(|| format!("creating directory '{}'", path.display()))
}

/// Copy the contents of `src` into `dst`, preserving symlinks and modes.
///
/// `dst` is created if it does not exist; existing files are overwritten.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    copy_tree_excluding(src, dst, &[])
}

/// Like [`copy_tree`], but the directories in `exclude` are copied empty.
///
/// Directory modes are applied once the walk is done, so read-only source
/// directories can still be filled.
pub fn copy_tree_excluding(src: &Path, dst: &Path, exclude: &[PathBuf]) -> Result<()> {
    if !src.is_dir() {
        bail!("copy source '{}' is not a directory", src.display());
    }
    fs::create_dir_all(dst).with_context(|| format!("creating '{}'", dst.display()))?;

    let mut dir_modes = Vec::new();
    let walker = WalkDir::new(src)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            !entry
                .path()
                .parent()
                .is_some_and(|parent| exclude.iter().any(|x| parent.starts_with(x)))
        });

    for entry in walker {
        let entry = entry.with_context(|| format!("walking '{}'", src.display()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("'{}' escapes '{}'", entry.path().display(), src.display()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .with_context(|| format!("reading symlink '{}'", entry.path().display()))?;
            if target.symlink_metadata().is_ok() {
                fs::remove_file(&target)
                    .with_context(|| format!("replacing '{}'", target.display()))?;
            }
            std::os::unix::fs::symlink(&link, &target)
                .with_context(|| format!("creating symlink '{}'", target.display()))?;
        } else if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("creating '{}'", target.display()))?;
            dir_modes.push((target, entry.metadata()?.permissions()));
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!(
                    "copying '{}' -> '{}'",
                    entry.path().display(),
                    target.display()
                )
            })?;
        }
    }

    // Deepest first, a parent may lose its write bit.
    for (target, mode) in dir_modes.into_iter().rev() {
        fs::set_permissions(&target, mode)
            .with_context(|| format!("setting permissions '{}'", target.display()))?;
    }

    Ok(())
}

/// Remove every path in `paths`. Missing paths are ignored.
///
/// Subvolumes are deleted with `btrfs subvolume delete` first so their
/// removal does not depend on the host's permissions.
pub fn rmtree(paths: &[PathBuf], config: &Config) -> Result<()> {
    for path in paths {
        let Ok(meta) = fs::symlink_metadata(path) else {
            continue;
        };

        if meta.is_dir() && is_subvolume(path) {
            let parent = path.parent().unwrap_or(path);
            match btrfs(config, parent, &[path], ["subvolume", "delete"]) {
                Ok(()) => continue,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "subvolume delete failed, removing contents");
                }
            }
        }

        let removed = if meta.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        removed.with_context(|| format!("removing '{}'", path.display()))?;
    }

    Ok(())
}
