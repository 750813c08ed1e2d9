//! Package manager metadata lifecycle.
//!
//! At the end of the package installation phase the repository metadata is
//! preserved for later build steps, and package manager state is stripped
//! from the image when nothing in the image can use it.

use anyhow::{Context as _, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::{PackageManager, CACHE_CATEGORIES};
use crate::build::context::Context;
use crate::build::tree::{copy_tree, copy_tree_excluding, rmtree, Umask};
use crate::config::{Config, Feature};
use crate::preflight::find_binary;

/// Package manager state that is only useful if its tool is in the image.
const STATE_PATHS: &[(&str, &[&str])] = &[
    ("rpm", &["var/lib/rpm", "usr/lib/sysimage/rpm"]),
    ("dnf5", &["usr/lib/sysimage/libdnf5"]),
    ("dpkg", &["var/lib/dpkg"]),
];

/// What [`clean_package_manager_metadata`] did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// Snapshot the active package cache was rebound to.
    pub snapshot: Option<PathBuf>,
    /// Paths removed from the image root.
    pub removed: Vec<PathBuf>,
}

fn has_entries(dir: &Path) -> bool {
    fs::read_dir(dir).is_ok_and(|mut entries| entries.next().is_some())
}

/// Seed the active package cache with repository metadata from the persistent
/// cache.
///
/// Nothing is copied if the active cache already has metadata for this
/// manager. Package directories are copied empty; the manager's mounts bind
/// the persistent ones over them. Returns whether anything was copied.
pub fn copy_repository_metadata(context: &Context) -> Result<bool> {
    let manager = context.config.distribution.package_manager();
    let subdir = manager.subdir(&context.config);
    let active = context.package_cache_dir();

    if CACHE_CATEGORIES
        .iter()
        .any(|category| has_entries(&active.join(category).join(&subdir)))
    {
        tracing::debug!(cache = %active.display(), "repository metadata already present");
        return Ok(false);
    }

    let persistent = context.config.package_cache_dir_or_default();
    let mut copied = false;

    for category in CACHE_CATEGORIES {
        let src = persistent.join(category).join(&subdir);
        if !src.exists() {
            tracing::debug!(src = %src.display(), "no repository metadata to copy");
            continue;
        }

        let exclude = if category == "cache" {
            manager.cache_subdirs(&src)
        } else {
            Vec::new()
        };

        let dst = active.join(category).join(&subdir);
        {
            let _umask = Umask::allow(0o755);
            fs::create_dir_all(&dst).with_context(|| format!("creating '{}'", dst.display()))?;
        }
        copy_tree_excluding(&src, &dst, &exclude)?;
        copied = true;
    }

    Ok(copied)
}

/// Whether package manager metadata may be stripped from the image at all.
///
/// Overlay images never are. Without an explicit setting, directory and tar
/// outputs keep their metadata since they are often used as base trees.
pub fn wants_metadata_cleanup(config: &Config) -> bool {
    if config.overlay {
        return false;
    }
    match config.clean_package_metadata {
        Feature::Disabled => false,
        Feature::Enabled => true,
        Feature::Auto => !config.output_format.is_base_tree(),
    }
}

/// Preserve repository metadata and remove unused package manager state.
///
/// If the active package cache lives inside the image root, its `cache` and
/// `lib` trees are copied to the workspace snapshot and the context is
/// rebound to it, so later steps keep the metadata even if the image copy is
/// removed.
///
/// The state paths of each known tool are then removed from the root when
/// cleanup is explicitly enabled, or when the tool is not in the image.
pub fn clean_package_manager_metadata(context: &mut Context) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();
    let manager = context.config.distribution.package_manager();
    let subdir = manager.subdir(&context.config);

    if context.package_cache_dir().starts_with(context.root()) {
        let snapshot = context.package_cache_snapshot();
        for category in CACHE_CATEGORIES {
            let src = context.package_cache_dir().join(category).join(&subdir);
            if !src.exists() {
                continue;
            }
            let dst = snapshot.join(category).join(&subdir);
            copy_tree(&src, &dst)?;
        }
        context.rebind_package_cache_dir(snapshot.clone())?;
        report.snapshot = Some(snapshot);
    }

    if !wants_metadata_cleanup(&context.config) {
        tracing::debug!("keeping package manager metadata");
        return Ok(report);
    }

    let executable = manager.executable(&context.config);
    let own_paths = [
        format!("var/lib/{}", subdir.display()),
        format!("var/cache/{}", subdir.display()),
    ];
    let checks = STATE_PATHS
        .iter()
        .map(|(tool, paths)| {
            let paths = paths.iter().map(|p| p.to_string()).collect::<Vec<_>>();
            (tool.to_string(), paths)
        })
        .chain(std::iter::once((executable, own_paths.to_vec())));

    let root = context.root();
    let forced = context.config.clean_package_metadata == Feature::Enabled;

    for (tool, paths) in checks {
        if !forced && find_binary(&tool, &root).is_some() {
            continue;
        }

        let present: Vec<PathBuf> = paths
            .iter()
            .map(|p| root.join(p))
            .filter(|p| p.symlink_metadata().is_ok())
            .collect();
        if present.is_empty() {
            continue;
        }

        tracing::info!(tool = %tool, paths = ?present, "removing package manager metadata");
        rmtree(&present, &context.config)?;
        report.removed.extend(present);
    }

    Ok(report)
}
