//! daemonfs: a small service supervisor whose control surface is a
//! filesystem rather than a socket protocol or a config-reload signal.
//!
//! A mounted daemonfs exposes one directory per supervised daemon, each
//! containing `args`, `state`, `pid`, `stdout` and `stderr` files (see
//! [`daemon`] for the exact semantics). Filesystem calls arrive on `fuser`'s
//! worker threads ([`adapter`]), get turned into [`command::Command`]s and
//! posted to a [`queue::RequestQueue`], and are executed one at a time by a
//! single-threaded [`supervisor::Supervisor`] that also owns every forked
//! child and the epoll loop multiplexing their output.

pub mod adapter;
pub mod command;
pub mod daemon;
pub mod queue;
pub mod ring_buffer;
pub mod supervisor;

pub use adapter::SupervisorFs;
pub use queue::RequestQueue;
pub use supervisor::Supervisor;
