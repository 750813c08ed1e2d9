use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use distro_workspace::preflight::check_host_tools;
use distro_workspace::{
    run_sync, setup_workspace, Args, Config, Context, PackageManager, SandboxOptions, Workspace,
};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "DISTRO_WORKSPACE_LOG";

fn usage() -> &'static str {
    "Usage:\n  distro-workspace [--debug] [--debug-workspace] <command> ...\n\nCommands:\n  sandbox <config.toml> [--network] [--devices] -- <command...>\n  run <config.toml> [--network] [--devices] -- <command...>\n  sync <config.toml>\n  mounts <config.toml>\n  scripts <config.toml> <dir>\n\nsandbox, mounts and scripts keep their workspace, since their output refers to it."
}

fn main() -> Result<()> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let (args, rest) = split_flags(&argv);
    init_logging(args.debug);

    match rest {
        [cmd, config, rest @ ..] if cmd == "sandbox" => {
            let (_workspace, argv) = sandbox_argv(Path::new(config), kept(args), rest)?;
            print_argv(&argv)
        }
        [cmd, config, rest @ ..] if cmd == "run" => {
            check_host_tools()?;
            let (_workspace, argv) = sandbox_argv(Path::new(config), args, rest)?;
            distro_workspace::sandbox::run(&argv)
        }
        [cmd, config] if cmd == "sync" => {
            check_host_tools()?;
            let (_workspace, context) = open(Path::new(config), args, true)?;
            run_sync(&context.config.distribution.package_manager(), &context)
        }
        [cmd, config] if cmd == "mounts" => {
            let (_workspace, context) = open(Path::new(config), kept(args), false)?;
            let manager = context.config.distribution.package_manager();
            let argv = distro_workspace::sandbox::mount_args(&manager.mounts(&context));
            print_argv(&argv)
        }
        [cmd, config, dir] if cmd == "scripts" => {
            let (_workspace, context) = open(Path::new(config), kept(args), false)?;
            let manager = context.config.distribution.package_manager();
            distro_workspace::sandbox::install_scripts(Path::new(dir), &manager.scripts(&context))
                .with_context(|| format!("installing scripts into '{}'", dir))
        }
        _ => bail!(usage()),
    }
}

/// Split leading global flags off the command line.
fn split_flags(argv: &[String]) -> (Args, &[String]) {
    let mut args = Args::default();
    let mut rest = argv;
    while let [flag, tail @ ..] = rest {
        match flag.as_str() {
            "--debug" => args.debug = true,
            "--debug-workspace" => args.debug_workspace = true,
            _ => break,
        }
        rest = tail;
    }
    (args, rest)
}

fn kept(args: Args) -> Args {
    Args {
        debug_workspace: true,
        ..args
    }
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Set up a workspace and build context for `config_path`.
///
/// With `persistent_cache` the context works on the persistent package cache
/// instead of the image's own.
fn open(config_path: &Path, args: Args, persistent_cache: bool) -> Result<(Workspace, Context)> {
    let config = Config::load(config_path)?;
    let workspace = setup_workspace(&args, &config)?;

    let resources = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let package_cache_dir = persistent_cache.then(|| config.package_cache_dir_or_default());
    let context = Context::new(args, config, workspace.path(), &resources, package_cache_dir)?;
    context.install_package_manager_trees()?;

    Ok((workspace, context))
}

fn sandbox_argv(
    config_path: &Path,
    args: Args,
    rest: &[String],
) -> Result<(Workspace, Vec<OsString>)> {
    let (flags, command) = match rest.iter().position(|arg| arg == "--") {
        Some(idx) => (&rest[..idx], &rest[idx + 1..]),
        None => bail!(usage()),
    };
    if command.is_empty() {
        bail!("no command given\n{}", usage());
    }

    let mut options = SandboxOptions::new();
    for flag in flags {
        options = match flag.as_str() {
            "--network" => options.network(true),
            "--devices" => options.devices(true),
            other => bail!("unknown flag '{}'\n{}", other, usage()),
        };
    }

    let (workspace, context) = open(config_path, args, false)?;
    let mut argv = context.sandbox(&options)?;
    argv.extend(command.iter().map(OsString::from));
    Ok((workspace, argv))
}

fn print_argv(argv: &[OsString]) -> Result<()> {
    let argv: Vec<String> = argv
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect();
    println!(
        "{}",
        serde_json::to_string_pretty(&argv).context("serializing argument vector")?
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    fn write_config(temp: &TempDir) -> PathBuf {
        let path = temp.path().join("image.toml");
        fs::write(
            &path,
            format!(
                "distribution = \"arch\"\nuse_subvolumes = \"disabled\"\ntools_tree = \"/nonexistent/tools\"\nworkspace_dir = \"{}\"\n",
                temp.path().join("ws").display()
            ),
        )
        .unwrap();
        path
    }

    #[test]
    fn test_split_flags() {
        let argv = strings(&["--debug", "--debug-workspace", "mounts", "image.toml"]);
        let (args, rest) = split_flags(&argv);
        assert!(args.debug);
        assert!(args.debug_workspace);
        assert_eq!(rest, &argv[2..]);

        let argv = strings(&["sandbox", "image.toml", "--debug"]);
        let (args, rest) = split_flags(&argv);
        assert!(!args.debug);
        assert_eq!(rest.len(), 3);
    }

    #[test]
    fn test_sandbox_workspace_outlives_command() {
        let temp = TempDir::new().unwrap();
        let config = write_config(&temp);
        let rest = strings(&["--", "true"]);

        let (workspace, argv) = sandbox_argv(&config, kept(Args::default()), &rest).unwrap();
        let log = workspace.path().join("pkgmngr/var/log");
        assert!(argv.iter().any(|a| a == log.as_os_str()));

        drop(workspace);
        assert!(log.is_dir());
        assert!(temp.path().join("ws").read_dir().unwrap().count() > 0);
    }

    #[test]
    fn test_run_workspace_removed() {
        let temp = TempDir::new().unwrap();
        let config = write_config(&temp);
        let rest = strings(&["--network", "--", "true"]);

        let (workspace, argv) = sandbox_argv(&config, Args::default(), &rest).unwrap();
        let path = workspace.path().to_path_buf();
        assert!(!argv.iter().any(|a| a == "--unshare-net"));

        drop(workspace);
        assert!(!path.exists());
    }

    #[test]
    fn test_sandbox_argv_requires_command() {
        let temp = TempDir::new().unwrap();
        let config = write_config(&temp);
        assert!(sandbox_argv(&config, Args::default(), &strings(&["--"])).is_err());
        assert!(sandbox_argv(&config, Args::default(), &strings(&["true"])).is_err());
    }
}
