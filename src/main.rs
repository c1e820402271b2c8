//! Mount a remote restfs store as a locally cached filesystem.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use secrecy::SecretString;
use tracing::{debug, error};

mod app_config;
mod daemon;
mod fuse_check;
mod term;
mod trc;

use crate::app_config::Config;

#[derive(Parser)]
#[command(
    version,
    about = "Mount a remote HTTP file store as a locally cached filesystem."
)]
struct Args {
    /// Config file to use instead of the default search path.
    #[arg(short, long)]
    config_path: Option<PathBuf>,

    /// Remote `host:port`, overriding the config file.
    #[arg(long, env = "RESTFS_HOST")]
    host: Option<String>,

    /// Remote user, overriding the config file.
    #[arg(long, env = "RESTFS_USER")]
    username: Option<String>,

    /// Where to mount, overriding the config file.
    #[arg(short, long)]
    mount_point: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Mount and serve until interrupted. This is the default.
    Run {
        /// Detach from the terminal and write a PID file.
        #[arg(short, long)]
        daemonize: bool,
    },
}

/// Print to stderr and exit. Only for failures before logging is up.
fn bail(message: impl std::fmt::Display) -> ! {
    eprintln!("restfs: {message}");
    std::process::exit(1);
}

/// Log and exit.
fn die(message: impl std::fmt::Display) -> ! {
    error!("{message}");
    std::process::exit(1);
}

fn configure(args: Args) -> (Config, bool) {
    let mut config = Config::load_or_create(args.config_path.as_deref())
        .unwrap_or_else(|e| bail(format_args!("cannot load configuration: {e}")));

    if let Some(host) = args.host {
        config.remote.host = host;
    }
    if let Some(username) = args.username {
        config.remote.username = SecretString::from(username);
    }
    if let Some(mount_point) = args.mount_point {
        config.mount_point = mount_point;
    }

    if let Err(problems) = config.validate() {
        let listed: Vec<String> = problems.iter().map(|p| format!("  - {p}")).collect();
        bail(format_args!("invalid configuration:\n{}", listed.join("\n")));
    }

    let daemonize = match args.command {
        Some(Command::Run { daemonize }) => daemonize,
        None => false,
    };
    (config, daemonize)
}

/// Fork into the background, then run the daemon in the child.
fn detach(config: Config) {
    if let Some(dir) = config.daemon.pid_file.parent()
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        die(format_args!("cannot create {}: {e}", dir.display()));
    }

    let detached = daemonize::Daemonize::new()
        .pid_file(&config.daemon.pid_file)
        .chown_pid_file(true)
        .user(config.uid)
        .group(config.gid)
        .start();
    if let Err(e) = detached {
        die(format_args!("cannot daemonize: {e}"));
    }
    if let Err(e) = daemon::spawn(config) {
        die(format_args!("daemon exited with an error: {e}"));
    }
}

fn main() {
    let (config, daemonize) = configure(Args::parse());

    if let Err(e) = trc::init(daemonize) {
        bail(format_args!("cannot initialize logging: {e}"));
    }
    if let Err(e) = fuse_check::ensure_fuse() {
        die(e);
    }
    debug!(?config, daemonize, "starting");

    if daemonize {
        detach(config);
    } else if let Err(e) = daemon::spawn(config) {
        die(format_args!("daemon exited with an error: {e}"));
    }
}
