//! Reconciliation loop.
//!
//! Each iteration polls the control endpoint and moves the host toward the
//! commanded state: one tunnel running (`activate`) or none (`deactivate`).
//! The loop owns all mutable state; nothing here is shared across tasks.
//!
//! Besides the commanded transitions the loop drops the tunnel when
//!
//! - the wall clock jumped by more than the wake threshold between two
//!   iterations (the host was suspended, so the connection is stale), or
//! - the endpoint became unreachable and its last good reply asked for
//!   `disconnect_ssl_when_server_unreachable`.
//!
//! The loop never exits on its own. It returns a [`RestartReason`] when the
//! endpoint has been unreachable [`AgentSettings::unreachable_restart_threshold`]
//! times in a row or silent for longer than [`AgentSettings::max_silence`].
//! [`Agent::run_until_handoff`] passes that request on to the supervisor or a
//! fresh copy of the agent, and keeps looping without self-restart if neither
//! is possible.

use std::fmt;
use std::io;
use std::time::{Duration, SystemTime};

use tracing::{debug, error, info, warn};

use crate::config::{AgentConfig, TunnelConfig};
use crate::control::{CommandSnapshot, ControlError, ControlPlane, Directive, PollReply};
use crate::process::ProcessHost;
use crate::tunnel::launcher::Launcher;
use crate::tunnel::liveness::ProcessInspector;
use crate::tunnel::locator::find_tunnel;
use crate::tunnel::TunnelSpec;

/// Timing and recovery policy for the loop.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub poll_interval: Duration,
    pub wake_threshold: Duration,
    pub retry_budget: u32,
    pub unreachable_restart_threshold: u32,
    pub max_silence: Duration,
    /// Whether a restart can actually be carried out. Without it, restart
    /// conditions are logged and the loop keeps going.
    pub restart_permitted: bool,
}

impl AgentSettings {
    pub fn new(config: &AgentConfig, restart_permitted: bool) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            wake_threshold: config.wake_threshold(),
            retry_budget: config.retry_budget.max(1),
            unreachable_restart_threshold: config.unreachable_restart_threshold.max(1),
            max_silence: config.max_silence(),
            restart_permitted,
        }
    }
}

/// Why the loop asked to be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// This many consecutive polls failed to reach the endpoint.
    Unreachable(u32),
    /// No good poll for this long.
    Silence(Duration),
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::Unreachable(n) => {
                write!(f, "control endpoint unreachable {n} times in a row")
            }
            RestartReason::Silence(d) => {
                write!(f, "no good poll for {}s", d.as_secs())
            }
        }
    }
}

/// Who took over after a restart request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// The supervisor relaunches us once we exit.
    Supervisor,
    /// A new copy of the agent is running with this pid.
    Relaunched(u32),
}

/// The tunnel the loop believes it owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracked {
    pub pid: u32,
    pub spec: TunnelSpec,
}

/// State carried from one iteration to the next.
#[derive(Debug, Clone)]
pub struct LoopState {
    pub tracked: Option<Tracked>,
    /// Failed launches left before the endpoint is told.
    pub retries_left: u32,
    /// Consecutive polls that could not reach the endpoint.
    pub unreachable_streak: u32,
    pub last_good_poll: SystemTime,
    pub last_iteration: Option<SystemTime>,
    /// Captured from the last good reply.
    pub disconnect_when_unreachable: bool,
}

/// The reconciliation loop and everything it drives.
pub struct Agent<C, H> {
    control: C,
    host: H,
    inspector: ProcessInspector,
    launcher: Launcher,
    tunnel: TunnelConfig,
    settings: AgentSettings,
    state: LoopState,
}

impl<C: ControlPlane, H: ProcessHost> Agent<C, H> {
    /// `started` seeds the silence timer, as if a good poll had just happened.
    pub fn new(
        control: C,
        host: H,
        inspector: ProcessInspector,
        tunnel: TunnelConfig,
        settings: AgentSettings,
        started: SystemTime,
    ) -> Self {
        let launcher = Launcher::new(Duration::from_secs(tunnel.launch_grace_secs));
        let state = LoopState {
            tracked: None,
            retries_left: settings.retry_budget,
            unreachable_streak: 0,
            last_good_poll: started,
            last_iteration: None,
            disconnect_when_unreachable: false,
        };
        Self {
            control,
            host,
            inspector,
            launcher,
            tunnel,
            settings,
            state,
        }
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    /// Poll forever; returns only when a restart is due.
    pub async fn run(&mut self) -> RestartReason {
        loop {
            if let Some(reason) = self.iterate(SystemTime::now()).await {
                return reason;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Poll until a restart has been handed off. Under a supervisor that is
    /// as soon as one is due; standalone, `relaunch` must start a copy of the
    /// agent. A failed relaunch turns self-restart off and the loop resumes.
    pub async fn run_until_handoff<F>(&mut self, supervised: bool, mut relaunch: F) -> Handoff
    where
        F: FnMut() -> io::Result<u32>,
    {
        loop {
            let reason = self.run().await;
            error!(%reason, "agent will now restart");
            if supervised {
                return Handoff::Supervisor;
            }
            match relaunch() {
                Ok(pid) => {
                    info!(pid, "relaunched agent");
                    return Handoff::Relaunched(pid);
                }
                Err(e) => {
                    error!(error = %e, "relaunch failed, continuing without self-restart");
                    self.settings.restart_permitted = false;
                }
            }
        }
    }

    /// One pass of the loop at wall-clock time `now`.
    pub async fn iterate(&mut self, now: SystemTime) -> Option<RestartReason> {
        self.detect_wake(now);

        match self.control.poll().await {
            Ok(PollReply::Command(snapshot)) => {
                self.state.last_good_poll = now;
                self.state.unreachable_streak = 0;
                self.state.disconnect_when_unreachable = snapshot.disconnect_when_unreachable;
                self.dispatch(&snapshot).await;
                None
            }
            Ok(PollReply::Rejected(message)) => {
                error!(%message, "control endpoint rejected poll");
                None
            }
            Ok(PollReply::Empty) => {
                error!("bad response from control endpoint");
                None
            }
            Err(e) => self.handle_poll_error(&e, now),
        }
    }

    fn detect_wake(&mut self, now: SystemTime) {
        let Some(previous) = self.state.last_iteration.replace(now) else {
            return;
        };
        // A clock that went backwards is not a suspend.
        let Ok(gap) = now.duration_since(previous) else {
            return;
        };
        if gap <= self.settings.wake_threshold {
            return;
        }
        info!(gap_secs = gap.as_secs(), "wake from suspend detected");
        if self.state.tracked.is_some() {
            info!("tunnel was up across the suspend, closing it");
            self.stop_tracked();
        }
    }

    async fn dispatch(&mut self, snapshot: &CommandSnapshot) {
        match &snapshot.directive {
            Some(Directive::Activate) => self.activate(snapshot).await,
            Some(Directive::Deactivate) => self.deactivate(snapshot),
            Some(Directive::Unknown(other)) => warn!(command = %other, "ignoring unknown command"),
            None => debug!("no command in reply"),
        }
    }

    async fn activate(&mut self, snapshot: &CommandSnapshot) {
        debug!("command: activate");
        let Some(spec) = snapshot.spec(&self.tunnel) else {
            warn!("activate command without a usable iport/forwarding_server");
            return;
        };

        if let Some(tracked) = &self.state.tracked {
            if tracked.spec != spec {
                info!(
                    old = %tracked.spec.forward_token(),
                    new = %spec.forward_token(),
                    "tunnel target changed, replacing tunnel"
                );
                self.stop_tracked();
            } else if self.inspector.is_alive(&self.host, tracked.pid, &tracked.spec) {
                debug!(pid = tracked.pid, "tunnel already active");
                self.state.retries_left = self.settings.retry_budget;
                return;
            } else {
                debug!(pid = tracked.pid, "tracked tunnel is gone");
                self.state.tracked = None;
            }
        }

        debug!("tunnel inactive, starting");
        let mut pid = self.launcher.launch(&self.host, &spec).await;
        if let Some(p) = pid {
            if !self.inspector.is_alive(&self.host, p, &spec) {
                debug!(pid = p, "tunnel vanished right after start, retrying once");
                pid = self.launcher.launch(&self.host, &spec).await;
            }
        }

        match pid.filter(|&p| self.inspector.is_alive(&self.host, p, &spec)) {
            Some(pid) => {
                info!(pid, tunnel = %spec.forward_token(), "tunnel started");
                self.state.tracked = Some(Tracked { pid, spec });
                self.state.retries_left = self.settings.retry_budget;
            }
            None => self.spend_retry().await,
        }
    }

    async fn spend_retry(&mut self) {
        self.state.retries_left = self.state.retries_left.saturating_sub(1);
        if self.state.retries_left > 0 {
            debug!(retries_left = self.state.retries_left, "tunnel not started");
            return;
        }
        warn!(
            attempts = self.settings.retry_budget,
            "cannot start tunnel, reporting to control endpoint"
        );
        self.control.report_error().await;
        self.state.retries_left = self.settings.retry_budget;
    }

    fn deactivate(&mut self, snapshot: &CommandSnapshot) {
        debug!("command: deactivate");
        self.state.retries_left = self.settings.retry_budget;

        if self.state.tracked.is_some() {
            self.stop_tracked();
            return;
        }
        // A tunnel left over from before a restart is not tracked yet.
        let Some(spec) = snapshot.spec(&self.tunnel) else {
            return;
        };
        if let Some(pid) = find_tunnel(&self.host, &spec) {
            debug!(pid, "found untracked tunnel");
            self.terminate(pid);
        }
    }

    fn handle_poll_error(&mut self, err: &ControlError, now: SystemTime) -> Option<RestartReason> {
        error!(error = %err, "control endpoint poll failed");

        if self.state.disconnect_when_unreachable && self.state.tracked.is_some() {
            info!("control endpoint lost, closing tunnel as configured");
            self.stop_tracked();
        }

        if err.is_unreachable() {
            self.state.unreachable_streak += 1;
            let streak = self.state.unreachable_streak;
            if streak >= self.settings.unreachable_restart_threshold {
                self.state.unreachable_streak = 0;
                if self.settings.restart_permitted {
                    error!(streak, "too many unreachable polls, restarting");
                    return Some(RestartReason::Unreachable(streak));
                }
                warn!(streak, "too many unreachable polls, but self-restart is not permitted");
            }
        }

        let silence = now
            .duration_since(self.state.last_good_poll)
            .unwrap_or_default();
        if silence > self.settings.max_silence {
            if self.settings.restart_permitted {
                error!(silence_secs = silence.as_secs(), "no good poll for too long, restarting");
                return Some(RestartReason::Silence(silence));
            }
            debug!(silence_secs = silence.as_secs(), "long silence, self-restart not permitted");
        }
        None
    }

    /// Terminate the tracked tunnel if it is still ours, then forget it.
    fn stop_tracked(&mut self) {
        let Some(tracked) = self.state.tracked.take() else {
            return;
        };
        if self.inspector.is_alive(&self.host, tracked.pid, &tracked.spec) {
            self.terminate(tracked.pid);
        } else {
            debug!(pid = tracked.pid, "tracked tunnel already gone");
        }
    }

    fn terminate(&self, pid: u32) {
        debug!(pid, "terminating tunnel");
        if let Err(e) = self.host.terminate(pid) {
            warn!(pid, error = %e, "failed to terminate tunnel");
        }
    }
}
