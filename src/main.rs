#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # reach-agent
//!
//! Keeps a reverse SSH tunnel open or closed on command from a control
//! endpoint.
//!
//! The agent polls the endpoint every few seconds. When told to activate it
//! starts `ssh -N -R <iport>:<address>:<forward_port> <user>@<server>` (or
//! `plink`), and when told to deactivate it terminates that process. It
//! recognises its tunnel in the process table, so a restarted agent adopts a
//! tunnel left running by its predecessor instead of opening a second one.
//!
//! ## Subcommands
//!
//! - `reach-agent run` (default) — run the agent
//! - `reach-agent supervise` — run the agent as a child and relaunch it on
//!   crash or restart request
//!
//! Older deployments start the agent with positional words
//! (`reach-agent /root/.ssh/key debug console stricthostkeychecking`); those
//! are still understood.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, startup, restart hand-off
//! agent.rs         — reconciliation loop
//! control.rs       — control endpoint client (reqwest) and reply parsing
//! config.rs        — TOML + env-var + CLI configuration
//! bootstrap.rs     — key permissions, restart permission, relaunch
//! logging.rs       — tracing subscriber, rotating log file
//! supervisor.rs    — built-in supervisor (restart loop)
//! tunnel/
//!   mod.rs         — TunnelSpec, invocation and identity tokens
//!   locator.rs     — find a running tunnel
//!   launcher.rs    — start a tunnel idempotently
//!   liveness.rs    — signal-probe and table-scan liveness checks
//! process/
//!   mod.rs         — ProcessHost trait
//!   system.rs      — sysinfo + nix implementation
//!   ps.rs          — `ps` fallback listing
//! ```

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::SystemTime;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

use reach_agent::config::Overrides;
use reach_agent::supervisor::{self, RESTART_EXIT_CODE, SUPERVISED_ENV};
use reach_agent::tunnel::liveness::ProcessInspector;
use reach_agent::{bootstrap, logging, Agent, AgentSettings, Config, Handoff, HttpControl, SystemHost};

/// Reverse SSH tunnel agent driven by a remote control endpoint.
#[derive(Parser)]
#[command(name = "reach-agent", version, args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent (default when no subcommand given).
    Run(RunArgs),
    /// Run as supervisor: starts the agent and relaunches it when it exits.
    Supervise(RunArgs),
}

#[derive(Args, Clone, Debug, Default)]
struct RunArgs {
    /// Path to TOML config file.
    #[arg(long)]
    config: Option<String>,
    /// Private key used to authenticate the tunnel.
    #[arg(long)]
    private_key: Option<PathBuf>,
    /// Log at debug level.
    #[arg(long)]
    debug: bool,
    /// Echo logs to stderr.
    #[arg(long)]
    console: bool,
    /// Verify the forwarding server's host key.
    #[arg(long)]
    strict_host_key_checking: bool,
    /// Legacy words: `debug`, `console`, `stricthostkeychecking`, or a key path.
    #[arg(value_name = "LEGACY")]
    legacy: Vec<String>,
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            private_key: self.private_key.clone(),
            debug: self.debug,
            console: self.console,
            strict_host_key_checking: self.strict_host_key_checking,
        }
        .with_legacy_words(&self.legacy)
    }

    fn load_config(&self) -> Result<Config, reach_agent::config::ConfigError> {
        Config::load(self.config.as_deref())?.finish(&self.overrides())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Supervise(args)) => run_supervisor_mode(&args).await,
        Some(Commands::Run(args)) => run_agent(&args).await,
        None => run_agent(&cli.run).await,
    }
}

async fn run_supervisor_mode(args: &RunArgs) -> ExitCode {
    let config = match args.load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("reach-agent: {e}");
            return ExitCode::FAILURE;
        }
    };
    let _guard = logging::init(&config.logging);

    info!("reach-agent supervisor starting");
    let own_args: Vec<OsString> = std::env::args_os().skip(1).collect();
    match supervisor::run_supervisor(&own_args, &config.supervisor).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Supervisor: cannot start agent: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_agent(args: &RunArgs) -> ExitCode {
    let config = match args.load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("reach-agent: {e}");
            return ExitCode::FAILURE;
        }
    };
    let _guard = logging::init(&config.logging);

    info!("reach-agent v{} starting", env!("CARGO_PKG_VERSION"));
    info!(os = std::env::consts::OS, "platform");

    if let Err(e) = bootstrap::prepare_private_key(&config.tunnel.private_key) {
        error!("{e}");
        eprintln!("reach-agent: {e}");
        return ExitCode::FAILURE;
    }

    let supervised = std::env::var_os(SUPERVISED_ENV).is_some();
    let restart_permitted = bootstrap::restart_permitted(supervised);
    if !restart_permitted {
        warn!("self-restart not possible, recovery will rely on local retries only");
    }

    let control = match HttpControl::new(&config.control) {
        Ok(c) => c,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let host = SystemHost::new();
    let inspector = ProcessInspector::select(config.agent.inspector, &host);
    info!(?inspector, supervised, "process inspector selected");

    let mut agent = Agent::new(
        control,
        host,
        inspector,
        config.tunnel.clone(),
        AgentSettings::new(&config.agent, restart_permitted),
        SystemTime::now(),
    );
    match agent.run_until_handoff(supervised, bootstrap::relaunch).await {
        Handoff::Supervisor => ExitCode::from(RESTART_EXIT_CODE),
        Handoff::Relaunched(_) => ExitCode::SUCCESS,
    }
}
