//! Decide whether a tracked pid is still our tunnel.

use serde::Deserialize;
use tracing::debug;

use super::TunnelSpec;
use crate::process::ProcessHost;

/// Which liveness strategy to use, as configured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InspectorKind {
    /// Signal probe where the host supports it, table scan otherwise.
    #[default]
    Auto,
    Signal,
    Scan,
}

/// Liveness strategy, chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessInspector {
    /// `kill(pid, 0)` first, then re-check the arguments if the table is readable.
    SignalProbe,
    /// Look the pid up in the process table and re-check its arguments.
    TableScan,
}

impl ProcessInspector {
    /// Pick a strategy for `host`. A requested signal probe on a host without
    /// one degrades to a table scan.
    pub fn select<H: ProcessHost + ?Sized>(kind: InspectorKind, host: &H) -> Self {
        let probe_available = host.probe(std::process::id()).is_some();
        match kind {
            InspectorKind::Scan => Self::TableScan,
            InspectorKind::Auto | InspectorKind::Signal if probe_available => Self::SignalProbe,
            InspectorKind::Auto | InspectorKind::Signal => Self::TableScan,
        }
    }

    /// True if `pid` exists and still carries `spec`'s identity tokens.
    ///
    /// Pids get recycled, so existence alone is never enough when the
    /// arguments can be read.
    pub fn is_alive<H: ProcessHost + ?Sized>(self, host: &H, pid: u32, spec: &TunnelSpec) -> bool {
        match self {
            Self::SignalProbe => {
                if host.probe(pid) == Some(false) {
                    return false;
                }
                match host.process(pid) {
                    Ok(Some(entry)) => !entry.zombie && spec.matches(&entry.args),
                    Ok(None) => false,
                    Err(e) => {
                        debug!(pid, error = %e, "process lookup failed, trusting signal probe");
                        true
                    }
                }
            }
            Self::TableScan => match host.process(pid) {
                Ok(Some(entry)) => !entry.zombie && spec.matches(&entry.args),
                Ok(None) => false,
                Err(e) => {
                    debug!(pid, error = %e, "process lookup failed");
                    false
                }
            },
        }
    }
}
