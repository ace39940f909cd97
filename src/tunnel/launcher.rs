//! Start the tunnel client, at most once per tunnel identity.

use std::time::Duration;

use tracing::{debug, warn};

use super::locator::find_tunnel;
use super::TunnelSpec;
use crate::process::ProcessHost;

/// Spawns tunnel subprocesses and confirms them through the locator.
#[derive(Debug, Clone, Copy)]
pub struct Launcher {
    /// How long a fresh client gets to connect before we look for it.
    grace: Duration,
}

impl Launcher {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    /// Ensure a tunnel matching `spec` is running and return its pid.
    ///
    /// An already running equivalent tunnel is returned as is. Otherwise the
    /// client is spawned, given the grace period, and looked up again; `None`
    /// means it did not show up (spawn error, or it exited before the lookup).
    pub async fn launch<H: ProcessHost + ?Sized>(&self, host: &H, spec: &TunnelSpec) -> Option<u32> {
        if let Some(pid) = find_tunnel(host, spec) {
            debug!(pid, "tunnel already running");
            return Some(pid);
        }

        let invocation = spec.invocation();
        debug!(command = %invocation, "starting tunnel");
        match host.spawn_detached(&invocation) {
            Ok(child) => debug!(?child, "tunnel client spawned"),
            Err(e) => {
                warn!(program = %invocation.program, error = %e, "failed to spawn tunnel client");
                return None;
            }
        }

        tokio::time::sleep(self.grace).await;
        find_tunnel(host, spec)
    }
}
