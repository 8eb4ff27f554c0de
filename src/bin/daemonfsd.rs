//! CLI entry point: mounts a daemonfs filesystem at a directory and runs the
//! supervisor loop until the filesystem is unmounted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use fuser::{Config, MountOption, SessionACL};
use log::{error, info};

use daemonfs::{RequestQueue, Supervisor, SupervisorFs};

/// A service supervisor that exposes its control surface as a filesystem.
#[derive(Parser)]
#[command(version, author = "daemonfs contributors")]
struct Args {
    /// Where to mount the daemonfs control filesystem.
    mount_point: PathBuf,

    /// Path to an executable to run as the implicit `bootstrap` daemon
    /// before the mount is published, per the `-b` bootstrap convention.
    #[clap(short, long)]
    bootstrap: Option<String>,

    /// Log every byte of captured daemon stdout/stderr at debug level.
    #[clap(short, long)]
    verbose: bool,

    /// Automatically unmount on process exit.
    #[clap(long)]
    auto_unmount: bool,

    /// Allow root to access the mount even if it isn't the owner.
    #[clap(long)]
    allow_root: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let queue = Arc::new(RequestQueue::new().expect("failed to create wakeup eventfd"));
    let mut supervisor = Supervisor::new(queue.clone(), args.verbose).expect("supervisor setup");
    if let Some(exe) = args.bootstrap {
        supervisor.bootstrap(exe);
    }

    let supervisor_thread = std::thread::Builder::new()
        .name("daemonfs-supervisor".to_string())
        .spawn(move || supervisor.run())
        .expect("failed to spawn supervisor thread");

    let mut cfg = Config::default();
    cfg.mount_options.push(MountOption::FSName("daemonfs".to_string()));
    cfg.mount_options.push(MountOption::DefaultPermissions);
    if args.auto_unmount {
        cfg.mount_options.push(MountOption::AutoUnmount);
    }
    if args.allow_root {
        cfg.acl = SessionACL::RootAndOwner;
    }

    info!("mounting daemonfs at {}", args.mount_point.display());
    let fs = SupervisorFs::new(queue.clone());
    if let Err(e) = fuser::mount2(fs, &args.mount_point, &cfg) {
        error!("mount exited with error: {e}");
    }

    let _ = queue.remote_command(daemonfs::command::Command::Quit);
    let _ = supervisor_thread.join();
}
