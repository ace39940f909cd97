//! Real process table backed by `sysinfo`, with `nix` signals on Unix.

use std::ffi::OsStr;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};

use sysinfo::{Pid, Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use tokio::process::Command;
use tracing::debug;

use super::{ps, ProcessEntry, ProcessHost};
use crate::tunnel::Invocation;

/// The host's process table.
pub struct SystemHost {
    system: Mutex<System>,
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemHost {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn refreshed(&self, which: ProcessesToUpdate<'_>) -> MutexGuard<'_, System> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            which,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
        system
    }
}

fn to_entry(process: &Process) -> ProcessEntry {
    ProcessEntry {
        pid: process.pid().as_u32(),
        name: process.name().to_string_lossy().into_owned(),
        args: process
            .cmd()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect(),
        zombie: process.status() == ProcessStatus::Zombie,
    }
}

/// Whether `process` was started from an executable called `name`.
///
/// The kernel name is cut to 15 bytes on Linux, so the file name of argv[0]
/// decides whenever a command line is available.
fn runs_executable(process: &Process, name: &str) -> bool {
    let wanted = OsStr::new(name);
    match process.cmd().first() {
        Some(arg0) => {
            let path = Path::new(arg0);
            path.file_name() == Some(wanted) || path.file_stem() == Some(wanted)
        }
        None => process.name() == wanted,
    }
}

impl ProcessHost for SystemHost {
    fn processes(&self) -> io::Result<Vec<ProcessEntry>> {
        let entries: Vec<ProcessEntry> = {
            let system = self.refreshed(ProcessesToUpdate::All);
            system.processes().values().map(to_entry).collect()
        };
        if entries.is_empty() {
            debug!("native process table empty, falling back to ps");
            return ps::snapshot();
        }
        Ok(entries)
    }

    fn processes_named(&self, name: &str) -> Option<io::Result<Vec<ProcessEntry>>> {
        let system = self.refreshed(ProcessesToUpdate::All);
        if system.processes().is_empty() {
            return None;
        }
        Some(Ok(system
            .processes()
            .values()
            .filter(|p| runs_executable(p, name))
            .map(to_entry)
            .collect()))
    }

    fn process(&self, pid: u32) -> io::Result<Option<ProcessEntry>> {
        let target = Pid::from_u32(pid);
        let system = self.refreshed(ProcessesToUpdate::Some(&[target]));
        Ok(system.process(target).map(to_entry))
    }

    #[cfg(unix)]
    fn probe(&self, pid: u32) -> Option<bool> {
        use nix::errno::Errno;
        use nix::sys::signal::kill;

        let Ok(raw) = i32::try_from(pid) else {
            return Some(false);
        };
        match kill(nix::unistd::Pid::from_raw(raw), None) {
            Ok(()) | Err(Errno::EPERM) => Some(true),
            Err(_) => Some(false),
        }
    }

    #[cfg(not(unix))]
    fn probe(&self, _pid: u32) -> Option<bool> {
        None
    }

    fn spawn_detached(&self, invocation: &Invocation) -> io::Result<Option<u32>> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);
        // The child handle is dropped here; tokio reaps it once it exits.
        let child = cmd.spawn()?;
        Ok(child.id())
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> io::Result<()> {
        use nix::sys::signal::{kill, Signal};

        let raw = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        kill(nix::unistd::Pid::from_raw(raw), Signal::SIGTERM)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn terminate(&self, pid: u32) -> io::Result<()> {
        let target = Pid::from_u32(pid);
        let system = self.refreshed(ProcessesToUpdate::Some(&[target]));
        match system.process(target) {
            Some(process) if process.kill() => Ok(()),
            Some(_) => Err(io::Error::other(format!("failed to kill pid {pid}"))),
            None => Err(io::Error::new(io::ErrorKind::NotFound, format!("no process {pid}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lists_own_process() {
        let host = SystemHost::new();
        let me = std::process::id();
        let entry = host.process(me).unwrap().expect("own process is visible");
        assert_eq!(entry.pid, me);
        assert!(!entry.zombie);
    }

    #[cfg(unix)]
    #[test]
    fn test_named_lookup_sees_long_executable_names() {
        use std::os::unix::process::CommandExt;

        let name = "reach-tunnel-client-long";
        let mut child = std::process::Command::new("sleep")
            .arg0(format!("/opt/reach/bin/{name}"))
            .arg("30")
            .spawn()
            .unwrap();
        let host = SystemHost::new();
        let named = host.processes_named(name).expect("table readable").unwrap();
        let _ = child.kill();
        let _ = child.wait();
        assert!(named.iter().any(|p| p.pid == child.id()), "{named:?}");
        assert!(named.iter().all(|p| p.args[0].ends_with(name)));
    }

    #[cfg(unix)]
    #[test]
    fn test_probe_own_process() {
        let host = SystemHost::new();
        assert_eq!(host.probe(std::process::id()), Some(true));
        assert_eq!(host.probe(u32::MAX), Some(false));
    }
}
