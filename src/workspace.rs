//! Per-build workspace directory.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::config::{Args, Config};

const WORKSPACE_PREFIX: &str = "distro-workspace";

/// An ephemeral workspace, removed on drop unless kept for debugging.
#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
    keep: bool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scratch directory for temporary files of build tools.
    pub fn tmp(&self) -> PathBuf {
        self.path.join("tmp")
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if !self.keep {
            return;
        }
        if let Some(dir) = self.dir.take() {
            let path = dir.keep();
            let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o755));
            tracing::info!(workspace = %path.display(), "keeping workspace");
        }
    }
}

/// Create a fresh workspace below the configured workspace directory.
pub fn setup_workspace(args: &Args, config: &Config) -> Result<Workspace> {
    let parent = config.workspace_dir_or_default();
    fs::create_dir_all(&parent)
        .with_context(|| format!("creating workspace directory '{}'", parent.display()))?;

    let dir = tempfile::Builder::new()
        .prefix(WORKSPACE_PREFIX)
        .tempdir_in(&parent)
        .with_context(|| format!("creating workspace in '{}'", parent.display()))?;
    let path = dir.path().to_path_buf();

    let tmp = path.join("tmp");
    fs::create_dir(&tmp).with_context(|| format!("creating '{}'", tmp.display()))?;
    fs::set_permissions(&tmp, fs::Permissions::from_mode(0o1777))
        .with_context(|| format!("setting permissions '{}'", tmp.display()))?;

    tracing::debug!(workspace = %path.display(), "created workspace");

    Ok(Workspace {
        dir: Some(dir),
        path,
        keep: args.debug_workspace,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(parent: &Path) -> Config {
        Config {
            workspace_dir: Some(parent.to_path_buf()),
            ..Config::default()
        }
    }

    #[test]
    fn test_workspace_removed_on_drop() {
        let parent = TempDir::new().unwrap();
        let workspace = setup_workspace(&Args::default(), &config(parent.path())).unwrap();
        let path = workspace.path().to_path_buf();

        assert!(path.starts_with(parent.path()));
        let mode = fs::metadata(workspace.tmp()).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o1777);

        drop(workspace);
        assert!(!path.exists());
    }

    #[test]
    fn test_workspace_kept_for_debugging() {
        let parent = TempDir::new().unwrap();
        let args = Args {
            debug_workspace: true,
            ..Args::default()
        };
        let workspace = setup_workspace(&args, &config(parent.path())).unwrap();
        let path = workspace.path().to_path_buf();

        drop(workspace);
        assert!(path.is_dir());
    }
}
