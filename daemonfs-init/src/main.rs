//! Process-1 launcher. Runs the three boot stages under `/etc/init`, then
//! reboots or powers off depending on whether a stage asked for a reboot via
//! `SIGUSR2` (or cleared that request via `SIGUSR1`).
//!
//! Architecturally independent of `daemonfsd`: no shared types, no shared
//! process. Boot stage 2 is expected to be the one that execs `daemonfsd`
//! and supervises services through it; this binary only cares that stage 2
//! eventually exits.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, warn};
use nix::sys::reboot::{reboot, set_cad_enabled, RebootMode};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{chdir, dup2_stderr, dup2_stdin, dup2_stdout, execve, fork, getpid, setsid, ForkResult, Pid};

const BOOT_DIR: &str = "/etc/init";

static REBOOT_LATCH: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigusr1(_: libc::c_int) {
    REBOOT_LATCH.store(false, Ordering::SeqCst);
}

extern "C" fn on_sigusr2(_: libc::c_int) {
    REBOOT_LATCH.store(true, Ordering::SeqCst);
}

extern "C" fn ignore(_: libc::c_int) {}

fn install_handlers() -> nix::Result<()> {
    let usr1 = SigAction::new(SigHandler::Handler(on_sigusr1), SaFlags::empty(), SigSet::empty());
    let usr2 = SigAction::new(SigHandler::Handler(on_sigusr2), SaFlags::empty(), SigSet::empty());
    let ign = SigAction::new(SigHandler::Handler(ignore), SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGUSR1, &usr1)?;
        sigaction(Signal::SIGUSR2, &usr2)?;
        sigaction(Signal::SIGINT, &ign)?;
        sigaction(Signal::SIGTERM, &ign)?;
        sigaction(Signal::SIGPIPE, &ign)?;
    }
    Ok(())
}

/// Redirects fd 0/1/2 onto `/dev/console`, if it can be opened. Best-effort:
/// a headless boot with no console still has to reach the boot stages.
fn attach_console() {
    use nix::fcntl::{open, OFlag};
    use nix::sys::stat::Mode;
    use std::os::fd::AsFd;
    match open("/dev/console", OFlag::O_RDWR, Mode::empty()) {
        Ok(console) => {
            let _ = dup2_stdin(console.as_fd());
            let _ = dup2_stdout(console.as_fd());
            let _ = dup2_stderr(console.as_fd());
            // `console` drops (and closes) here unless it landed on fd 0-2,
            // in which case it's now aliased by the dup2 targets above.
        }
        Err(e) => warn!("no /dev/console available: {e}"),
    }
}

/// Builds the current environment as `CString`s, the shape `execve` needs.
fn current_envp() -> Vec<CString> {
    std::env::vars_os()
        .map(|(k, v)| {
            let mut bytes = k.as_bytes().to_vec();
            bytes.push(b'=');
            bytes.extend_from_slice(v.as_bytes());
            CString::new(bytes).expect("env var has no NUL")
        })
        .collect()
}

/// Forks, `setsid`s and `execve`s boot stage `stage` in the child. Never
/// returns in the child.
fn spawn_stage(stage: u32) -> nix::Result<Pid> {
    match unsafe { fork()? } {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            let _ = setsid();
            if chdir(Path::new(BOOT_DIR)).is_err() {
                std::process::exit(127);
            }
            let exe = CString::new(format!("{BOOT_DIR}/{stage}")).expect("stage path has no NUL");
            let argv = [exe.clone()];
            let _ = execve(&exe, &argv, &current_envp());
            std::process::exit(127);
        }
    }
}

/// Waits for `stage_pid` to exit, reaping any other child along the way and
/// continuously observing the reboot latch so a stage can flip it mid-run.
fn wait_for_stage(stage_pid: Pid) {
    loop {
        match waitpid(None, None) {
            Ok(status) => {
                let exited_pid = match status {
                    nix::sys::wait::WaitStatus::Exited(pid, _) => Some(pid),
                    nix::sys::wait::WaitStatus::Signaled(pid, _, _) => Some(pid),
                    _ => None,
                };
                if exited_pid == Some(stage_pid) {
                    return;
                }
            }
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                warn!("waitpid() failed: {e}");
                std::thread::sleep(std::time::Duration::from_secs(5));
            }
        }
    }
}

fn run() -> nix::Result<()> {
    if getpid() != Pid::from_raw(1) {
        error!("daemonfs-init must be run as process 1");
        return Err(nix::errno::Errno::EPERM);
    }
    setsid()?;
    install_handlers()?;
    attach_console();
    set_cad_enabled(false)?;

    for stage in 1..=3u32 {
        let pid = spawn_stage(stage)?;
        wait_for_stage(pid);
    }

    log::info!("sending KILL signal to all processes...");
    let _ = nix::sys::signal::kill(Pid::from_raw(-1), Signal::SIGKILL);
    nix::unistd::sync();

    let mode =
        if REBOOT_LATCH.load(Ordering::SeqCst) { RebootMode::RB_AUTOBOOT } else { RebootMode::RB_POWER_OFF };
    reboot(mode)?;
    unreachable!("reboot() does not return on success")
}

fn main() {
    env_logger::init();
    if run().is_err() {
        error!("init exited unexpectedly");
        error!("falling back to emergency shell");
        let shell = CString::new("/sbin/agetty").unwrap();
        let argv = [
            shell.clone(),
            CString::new("--noclear").unwrap(),
            CString::new("tty1").unwrap(),
            CString::new("linux").unwrap(),
        ];
        let _ = execve(&shell, &argv, &current_envp());
        std::process::exit(1);
    }
}
