//! Command-line entry point (spec.md §6, §13).
//!
//! `kennyfs <mountpoint> [-o kfsconf=<path>]`, defaulting the config path
//! to `~/.kennyfs.ini`. Argument parsing follows the teacher's own example
//! binaries (`examples/hello.rs`, `examples/simple.rs`), both built on
//! `clap::Parser`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::error;

use kennyfs::{default_registry, mount::RootFilesystem};

const DEFAULT_CONFIG: &str = "~/.kennyfs.ini";

#[derive(Parser)]
#[command(version, about = "Composable userspace filesystem bricks over a FUSE mount")]
struct Args {
    /// Directory to mount the filesystem at.
    mountpoint: PathBuf,

    /// Extra mount options, FUSE-style (`-o opt1,opt2=value`). Recognizes
    /// `kfsconf=<path>` for the brick config file; anything else is passed
    /// through to the kernel mount as-is.
    #[arg(short = 'o', long = "option")]
    options: Vec<String>,
}

fn parse_kfsconf(options: &[String]) -> PathBuf {
    for opt in options {
        for token in opt.split(',') {
            if let Some(path) = token.strip_prefix("kfsconf=") {
                return kennyfs::util::expand_tilde(path);
            }
        }
    }
    kennyfs::util::expand_tilde(DEFAULT_CONFIG)
}

fn passthrough_mount_options(options: &[String]) -> Vec<fuser::MountOption> {
    options
        .iter()
        .flat_map(|opt| opt.split(','))
        .filter(|token| !token.starts_with("kfsconf="))
        .map(fuser::MountOption::from)
        .collect()
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let config_path = parse_kfsconf(&args.options);
    let registry = default_registry();
    let root = match kennyfs::config::load_root(&config_path, &registry) {
        Ok(root) => root,
        Err(e) => {
            error!("failed to load '{}': {e}", config_path.display());
            return ExitCode::FAILURE;
        }
    };

    let fs = RootFilesystem::new(root);
    let mount_options = passthrough_mount_options(&args.options);
    match fuser::mount2(fs, &args.mountpoint, &mount_options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("mount failed: {e}");
            ExitCode::FAILURE
        }
    }
}
