//! In-memory stand-ins for the process table and the control endpoint.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::config::{ClientKind, TunnelConfig};
use crate::control::{ControlError, ControlPlane, PollReply};
use crate::process::{ProcessEntry, ProcessHost};
use crate::tunnel::{Invocation, TunnelSpec, TunnelTarget};

pub fn tunnel_config() -> TunnelConfig {
    TunnelConfig {
        client: ClientKind::OpenSsh,
        executable: "ssh".to_string(),
        username: "agent".to_string(),
        forward_port: 3232,
        address: "localhost".to_string(),
        private_key: PathBuf::from("/keys/id_rsa"),
        strict_host_key_checking: false,
        launch_grace_secs: 0,
    }
}

pub fn spec(iport: u16, server: &str) -> TunnelSpec {
    TunnelSpec::new(
        &TunnelTarget {
            iport,
            forwarding_server: server.to_string(),
        },
        &tunnel_config(),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Spawned(u32),
    Terminated(u32),
}

#[derive(Default)]
struct Table {
    processes: BTreeMap<u32, ProcessEntry>,
    next_pid: u32,
    events: Vec<HostEvent>,
    fail_enumeration: bool,
    fail_spawn: bool,
    fail_terminate: bool,
    spawned_exit: bool,
}

impl Table {
    fn allocate(&mut self) -> u32 {
        self.next_pid = self.next_pid.max(1000) + 1;
        self.next_pid
    }
}

/// Process table held in memory. Spawning adds a row, terminating removes it.
#[derive(Default)]
pub struct FakeHost {
    table: Mutex<Table>,
    name_lookup: bool,
    no_probe: bool,
}

impl FakeHost {
    pub fn with_name_lookup(mut self) -> Self {
        self.name_lookup = true;
        self
    }

    pub fn without_probe(mut self) -> Self {
        self.no_probe = true;
        self
    }

    pub fn insert(&self, name: &str, args: &[&str]) -> u32 {
        let pid = self.table.lock().unwrap().allocate();
        self.insert_with_pid(pid, name, args);
        pid
    }

    pub fn insert_with_pid(&self, pid: u32, name: &str, args: &[&str]) {
        self.table.lock().unwrap().processes.insert(
            pid,
            ProcessEntry {
                pid,
                name: name.to_string(),
                args: args.iter().map(ToString::to_string).collect(),
                zombie: false,
            },
        );
    }

    pub fn insert_invocation(&self, invocation: &Invocation) -> u32 {
        let mut args = vec![invocation.program.as_str()];
        args.extend(invocation.args.iter().map(String::as_str));
        self.insert(&invocation.program, &args)
    }

    pub fn mark_zombie(&self, pid: u32) {
        if let Some(p) = self.table.lock().unwrap().processes.get_mut(&pid) {
            p.zombie = true;
        }
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.table.lock().unwrap().fail_enumeration = fail;
    }

    pub fn fail_spawn(&self, fail: bool) {
        self.table.lock().unwrap().fail_spawn = fail;
    }

    /// Terminating any pid fails and leaves the process running.
    pub fn fail_terminate(&self, fail: bool) {
        self.table.lock().unwrap().fail_terminate = fail;
    }

    /// Spawns succeed but the client dies before anyone can see it.
    pub fn spawned_processes_exit(&self, exit: bool) {
        self.table.lock().unwrap().spawned_exit = exit;
    }

    /// Simulate the tunnel client dying on its own.
    pub fn kill_silently(&self, pid: u32) {
        self.table.lock().unwrap().processes.remove(&pid);
    }

    pub fn is_running(&self, pid: u32) -> bool {
        self.table.lock().unwrap().processes.contains_key(&pid)
    }

    pub fn running_matching(&self, spec: &TunnelSpec) -> usize {
        self.table
            .lock()
            .unwrap()
            .processes
            .values()
            .filter(|p| spec.matches(&p.args))
            .count()
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.table.lock().unwrap().events.clone()
    }
}

impl ProcessHost for FakeHost {
    fn processes(&self) -> io::Result<Vec<ProcessEntry>> {
        let table = self.table.lock().unwrap();
        if table.fail_enumeration {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        }
        Ok(table.processes.values().cloned().collect())
    }

    fn processes_named(&self, name: &str) -> Option<io::Result<Vec<ProcessEntry>>> {
        if !self.name_lookup {
            return None;
        }
        Some(
            self.processes()
                .map(|all| all.into_iter().filter(|p| p.name == name).collect()),
        )
    }

    fn probe(&self, pid: u32) -> Option<bool> {
        if self.no_probe {
            return None;
        }
        Some(pid == std::process::id() || self.is_running(pid))
    }

    fn spawn_detached(&self, invocation: &Invocation) -> io::Result<Option<u32>> {
        let (fail, exits) = {
            let table = self.table.lock().unwrap();
            (table.fail_spawn, table.spawned_exit)
        };
        if fail {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such executable"));
        }
        let pid = self.insert_invocation(invocation);
        let mut table = self.table.lock().unwrap();
        table.events.push(HostEvent::Spawned(pid));
        if exits {
            table.processes.remove(&pid);
        }
        Ok(Some(pid))
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        let mut table = self.table.lock().unwrap();
        if table.fail_terminate {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "operation not permitted"));
        }
        if table.processes.remove(&pid).is_none() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such process"));
        }
        table.events.push(HostEvent::Terminated(pid));
        Ok(())
    }
}

/// Control endpoint that replays scripted replies, one per poll.
#[derive(Default)]
pub struct ScriptedControl {
    replies: Mutex<VecDeque<Result<PollReply, ControlError>>>,
    reports: Mutex<usize>,
}

impl ScriptedControl {
    pub fn push(&self, reply: Result<PollReply, ControlError>) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn push_json(&self, body: serde_json::Value) {
        self.push(PollReply::from_json(&body));
    }

    pub fn error_reports(&self) -> usize {
        *self.reports.lock().unwrap()
    }
}

impl ControlPlane for ScriptedControl {
    async fn poll(&self) -> Result<PollReply, ControlError> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ControlError::Unreachable("script exhausted".to_string())))
    }

    async fn report_error(&self) {
        *self.reports.lock().unwrap() += 1;
    }
}
