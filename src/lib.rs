//! Build workspace and sandbox plumbing for distribution image builds.
//!
//! Every build gets an exclusive workspace. All package manager and script
//! invocations run inside a `bwrap` sandbox whose command line is composed
//! here, with package manager configuration, caches and logs mounted in from
//! the workspace.
//!
//! - **Build context** - Workspace layout, root tree creation, sandbox invocation
//! - **Package managers** - Cache locations, mounts and helper scripts per backend
//! - **Metadata lifecycle** - Preserving and stripping package manager state
//! - **Preflight** - Host and image tool lookup
//!
//! # Architecture
//!
//! ```text
//! Config ──────────────┐
//!     │                │
//!     ├── sandbox()    │  base bwrap command line
//!     └── distribution ┴─ PackageManagerKind
//!                             │
//! Context (workspace)         ├── mounts(): crypto, local repo, mirror, caches
//!     ├── root/ staging/ ...  ├── scripts(): install/upgrade/remove helpers
//!     └── sandbox() ◄─────────┘
//!                             │
//! run_sync(): refresh metadata into the persistent cache
//! copy_repository_metadata(): seed the image cache from it
//! clean_package_manager_metadata(): snapshot cache, strip unused state
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use distro_workspace::{Args, Config, Context, PackageManager, SandboxOptions};
//!
//! let config = Config::load(Path::new("image.toml"))?;
//! let workspace = distro_workspace::setup_workspace(&Args::default(), &config)?;
//! let context = Context::new(Args::default(), config, workspace.path(), resources, None)?;
//! context.install_package_manager_trees()?;
//!
//! let manager = context.config.distribution.package_manager();
//! let argv = context.sandbox(&SandboxOptions::new().network(true).mounts(&manager.mounts(&context)))?;
//! ```

pub mod build;
pub mod config;
pub mod package_manager;
pub mod preflight;
pub mod sandbox;
pub mod workspace;

pub use build::context::Context;
pub use config::{Args, Config, Distribution, Feature, OutputFormat, SandboxIdentity};
pub use package_manager::{
    clean_package_manager_metadata, copy_repository_metadata, run_sync, CleanupReport,
    PackageManager, PackageManagerKind,
};
pub use sandbox::{Mount, SandboxOptions};
pub use workspace::{setup_workspace, Workspace};
