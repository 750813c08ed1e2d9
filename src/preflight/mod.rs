//! Tool lookup for hosts and image trees.
//!
//! The sandbox wrapper must exist on the host before any build starts, and
//! several decisions (which dnf to drive, whether package manager metadata is
//! still useful) depend on which binaries a tree contains.
//!
//! # Example
//!
//! ```rust
//! use distro_workspace::preflight::{command_exists, find_binary};
//! use std::path::Path;
//!
//! if !command_exists("bwrap") {
//!     println!("bubblewrap not installed");
//! }
//!
//! let rpm = find_binary("rpm", Path::new("/mnt/image"));
//! assert!(rpm.is_none());
//! ```

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

/// Directories searched for binaries inside an image tree.
const BINARY_DIRS: &[&str] = &["usr/bin", "usr/sbin", "bin", "sbin"];

/// Host tools required before a build can start.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[("bwrap", "bubblewrap")];

/// Check if a command exists in the host's `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Locate `name` inside the tree at `root`.
///
/// When `root` is `/` the host's `PATH` is searched instead. Returns the path
/// of the binary as seen from outside the tree.
pub fn find_binary(name: &str, root: &Path) -> Option<PathBuf> {
    if root == Path::new("/") {
        return which::which(name).ok();
    }

    BINARY_DIRS
        .iter()
        .map(|dir| root.join(dir).join(name))
        .find(|candidate| candidate.is_file())
}

/// Check that specific tools are available.
///
/// Returns an error listing every missing tool and the package providing it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check all tools in [`REQUIRED_TOOLS`].
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)
}
