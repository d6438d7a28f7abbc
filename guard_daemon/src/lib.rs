//! Library surface for the daemon binary, split out so `tests/` can wire
//! the orchestrator against the real leaf crates without going through the
//! async control channel or the kernel/poll watcher threads.

pub mod config;
pub mod ipc_handlers;
pub mod logging;
pub mod orchestrator;
pub mod stats;
pub mod system;
