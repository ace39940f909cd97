//! OS process table access.
//!
//! Everything the agent needs from the operating system goes through the
//! [`ProcessHost`] trait: enumerating processes, probing a pid, spawning the
//! tunnel client, and sending it a termination signal. [`system::SystemHost`]
//! is the real implementation; tests substitute an in-memory table.

pub mod ps;
pub mod system;

use std::io;

use crate::tunnel::Invocation;

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    /// Executable name as reported by the OS (`ssh`, `plink.exe`).
    pub name: String,
    /// Full argument vector, program first.
    pub args: Vec<String>,
    /// Exited but not yet reaped. Never counts as a running tunnel.
    pub zombie: bool,
}

/// Process facilities used by the locator, launcher and liveness checker.
pub trait ProcessHost {
    /// Every process visible to the current user.
    fn processes(&self) -> io::Result<Vec<ProcessEntry>>;

    /// Processes whose executable name is exactly `name`.
    ///
    /// `None` when the platform offers no lookup by name; callers then scan
    /// the full table.
    fn processes_named(&self, _name: &str) -> Option<io::Result<Vec<ProcessEntry>>> {
        None
    }

    /// A single process, `Ok(None)` if the pid does not exist.
    fn process(&self, pid: u32) -> io::Result<Option<ProcessEntry>> {
        Ok(self.processes()?.into_iter().find(|p| p.pid == pid))
    }

    /// Zero-cost existence check (`kill(pid, 0)`). `None` where unsupported.
    fn probe(&self, pid: u32) -> Option<bool>;

    /// Start `invocation` in the background without waiting for it.
    fn spawn_detached(&self, invocation: &Invocation) -> io::Result<Option<u32>>;

    /// Ask `pid` to exit (SIGTERM).
    fn terminate(&self, pid: u32) -> io::Result<()>;
}
