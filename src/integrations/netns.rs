//! Network namespace entry.
//!
//! `setns` only switches the calling thread, so every namespace operation in
//! the process must run on the same OS thread. The first caller of
//! [`lock_os_thread`] (or of [`in_netns`]) becomes that thread.

use anyhow::{Context, Result};
use nix::sched::{setns, CloneFlags};
use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::OnceLock;
use std::thread::{self, ThreadId};
use tracing::trace;

use crate::error::OvsCniError;

static NETNS_THREAD: OnceLock<ThreadId> = OnceLock::new();

/// Pin namespace operations to the calling thread.
///
/// Idempotent on the pinned thread; fails when called from any other one.
pub fn lock_os_thread() -> Result<(), OvsCniError> {
    let current = thread::current().id();
    if *NETNS_THREAD.get_or_init(|| current) == current {
        Ok(())
    } else {
        Err(OvsCniError::ThreadNotPinned)
    }
}

/// True when `path` names an existing namespace file.
pub fn exists(path: &str) -> bool {
    !path.is_empty() && Path::new(path).exists()
}

/// Execute a function inside a network namespace
///
/// The original namespace is restored before returning, whatever `f` returns.
pub fn in_netns<F, R>(netns_path: &str, f: F) -> Result<R>
where
    F: FnOnce() -> Result<R>,
{
    lock_os_thread()?;

    let current = File::open("/proc/thread-self/ns/net")
        .context("Failed to open current network namespace")?;

    let target = match File::open(netns_path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(OvsCniError::NetnsNotFound(netns_path.to_string()).into());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to open netns {:?}", netns_path));
        }
    };

    setns(target.as_raw_fd(), CloneFlags::CLONE_NEWNET)
        .with_context(|| format!("Failed to enter network namespace {}", netns_path))?;
    trace!(netns = %netns_path, "entered network namespace");

    let result = f();

    setns(current.as_raw_fd(), CloneFlags::CLONE_NEWNET)
        .context("Failed to restore original network namespace")?;
    trace!(netns = %netns_path, "restored original network namespace");

    result
}
