//! Exercises the full stack — adapter, command queue, supervisor — against a
//! real FUSE mount, the way `fuser`'s own `tests/unmount.rs` mounts `HelloFS`
//! and drives it through ordinary filesystem calls.

use std::fs;
use std::sync::Arc;

use daemonfs::command::Command;
use daemonfs::{RequestQueue, Supervisor, SupervisorFs};
use fuser::{Config, SessionACL};

#[test]
fn mkdir_write_args_read_state_round_trips_through_a_real_mount() {
    let mountpoint = tempfile::tempdir().unwrap();

    let queue = Arc::new(RequestQueue::new().expect("eventfd"));
    let mut supervisor = Supervisor::new(queue.clone(), false).expect("supervisor");
    let supervisor_thread = std::thread::spawn(move || supervisor.run());

    let mut cfg = Config::default();
    cfg.acl = SessionACL::RootAndOwner;
    cfg.n_threads = Some(1);
    let filesystem = SupervisorFs::new(queue.clone());
    let session = fuser::spawn_mount2(filesystem, &mountpoint, &cfg).expect("mount");

    let svc_dir = mountpoint.path().join("svc");
    fs::create_dir(&svc_dir).expect("mkdir svc");
    fs::write(svc_dir.join("args"), b"/bin/true\n").expect("write args");
    let state = fs::read_to_string(svc_dir.join("state")).expect("read state");
    assert_eq!(state, "down");
    let names: Vec<_> = fs::read_dir(&svc_dir)
        .expect("readdir svc")
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert!(names.contains(&"args".to_string()));
    assert!(names.contains(&"state".to_string()));

    fs::remove_dir(&svc_dir).expect("rmdir svc");
    session.umount_and_join(&[]).expect("unmount");

    let _ = queue.remote_command(Command::Quit);
    supervisor_thread.join().expect("supervisor thread panicked");
}
