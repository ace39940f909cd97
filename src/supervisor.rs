//! Built-in supervisor that keeps the agent running.
//!
//! `reach-agent supervise` runs `reach-agent run` with the same arguments and
//! monitors it. A child that asks for a restart (exit code
//! [`RESTART_EXIT_CODE`]) is relaunched at once; any other abnormal exit is
//! relaunched with exponential backoff. A clean exit (code 0) causes the
//! supervisor to stop. SIGINT/SIGTERM are forwarded to the child.

use std::ffi::OsString;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;

/// Set in the child's environment so it knows a supervisor will relaunch it.
pub const SUPERVISED_ENV: &str = "REACH_AGENT_SUPERVISED";

/// Exit code with which a supervised agent requests a restart (`EX_TEMPFAIL`).
pub const RESTART_EXIT_CODE: u8 = 75;

/// Run the supervisor loop. Returns only when the child exits cleanly or
/// cannot be started at all.
pub async fn run_supervisor(args: &[OsString], sup_config: &SupervisorConfig) -> std::io::Result<()> {
    let mut backoff = 1u64;
    let max_backoff = sup_config.max_backoff.max(1);
    let stable_threshold = Duration::from_secs(sup_config.stable_threshold);

    let exe = std::env::current_exe()?;
    let child_args = child_args(args);

    loop {
        let started = Instant::now();

        let mut child = Command::new(&exe)
            .args(&child_args)
            .env(SUPERVISED_ENV, "1")
            .spawn()?;
        let agent_pid = child.id();
        info!("Supervisor: started agent (pid {agent_pid:?})");

        let signal_task = tokio::spawn(forward_signals(agent_pid));
        let status = child.wait().await;
        signal_task.abort();
        let uptime = started.elapsed();

        match status {
            Ok(s) if s.success() => {
                info!("Agent exited cleanly, supervisor stopping");
                return Ok(());
            }
            Ok(s) if s.code() == Some(i32::from(RESTART_EXIT_CODE)) => {
                info!(
                    "Agent requested restart (uptime {:.1}s), relaunching",
                    uptime.as_secs_f64()
                );
                backoff = 1;
            }
            Ok(s) => {
                warn!(
                    "Agent exited: {s} (uptime {:.1}s), restarting in {backoff}s",
                    uptime.as_secs_f64()
                );
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff = next_backoff(backoff, uptime, stable_threshold, max_backoff);
            }
            Err(e) => {
                error!(
                    "Agent wait error: {e} (uptime {:.1}s), restarting in {backoff}s",
                    uptime.as_secs_f64()
                );
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff = next_backoff(backoff, uptime, stable_threshold, max_backoff);
            }
        }
    }
}

/// Arguments for the child: ours, with the `supervise` subcommand swapped
/// for `run`.
fn child_args(args: &[OsString]) -> Vec<OsString> {
    let mut out: Vec<OsString> = args.to_vec();
    match out.iter().position(|a| a == "supervise") {
        Some(i) => out[i] = OsString::from("run"),
        None => out.insert(0, OsString::from("run")),
    }
    out
}

/// Backoff after a crash: back to 1s after a stable run, doubled otherwise.
fn next_backoff(current: u64, uptime: Duration, stable_threshold: Duration, max_backoff: u64) -> u64 {
    if uptime >= stable_threshold {
        1
    } else {
        (current * 2).min(max_backoff)
    }
}

#[cfg(unix)]
async fn forward_signals(pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut sigint), Ok(mut sigterm)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) else {
        warn!("Supervisor: cannot register signal handlers, signals will not be forwarded");
        return;
    };
    let forwarded = tokio::select! {
        _ = sigint.recv() => Signal::SIGINT,
        _ = sigterm.recv() => Signal::SIGTERM,
    };
    info!("Supervisor: forwarding {forwarded} to agent");
    if let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) {
        if let Err(e) = kill(nix::unistd::Pid::from_raw(raw), forwarded) {
            warn!("Supervisor: failed to forward {forwarded}: {e}");
        }
    }
}

#[cfg(not(unix))]
async fn forward_signals(_pid: Option<u32>) {
    let _ = tokio::signal::ctrl_c().await;
}
