#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! reach-agent library — the pieces behind the `reach-agent` binary.
//!
//! - `agent` — reconciliation loop (poll, dispatch, wake and restart policy)
//! - `control` — control endpoint client and reply parsing
//! - `tunnel` — tunnel identity, locator, launcher, liveness checks
//! - `process` — process table access (`sysinfo`, `ps` fallback, signals)
//! - `config` — configuration loading
//! - `bootstrap` — key permissions, restart permission, relaunch
//! - `logging` — tracing subscriber setup
//! - `supervisor` — `reach-agent supervise` restart loop

pub mod agent;
pub mod bootstrap;
pub mod config;
pub mod control;
pub mod logging;
pub mod process;
pub mod supervisor;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testing;

pub use agent::{Agent, AgentSettings, Handoff, RestartReason};
pub use config::Config;
pub use control::HttpControl;
pub use process::system::SystemHost;
