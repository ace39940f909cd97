//! Tunnel identity, the command line that opens it, and the three operations
//! built on top of the process table.
//!
//! - `locator`  — find a running tunnel process by its identity tokens
//! - `launcher` — spawn a tunnel subprocess, idempotently
//! - `liveness` — confirm a tracked pid is still our tunnel
//!
//! The invocation built by [`TunnelSpec::invocation`] and the tokens checked by
//! [`TunnelSpec::matches`] are coupled: the locator recognises a tunnel only by
//! the exact `-R` forwarding argument and the exact `user@server` argument, so
//! neither may change shape without the other.
//!
//! Matching is plain token comparison over the process arguments. Any process
//! on the host carrying both tokens verbatim is taken for our tunnel; this is
//! a known limitation kept for compatibility with the control server.

pub mod launcher;
pub mod liveness;
pub mod locator;

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::{ClientKind, TunnelConfig};

/// Remote side of a tunnel as assigned by the control endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    /// Port opened on the forwarding server.
    pub iport: u16,
    /// Host the tunnel connects to.
    pub forwarding_server: String,
}

/// Full identity of the desired tunnel.
///
/// Equality covers the port/host/address/forward-port/username/key tuple only;
/// the client flavour and host-key policy change how the tunnel is opened, not
/// which tunnel it is.
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub iport: u16,
    pub forwarding_server: String,
    pub address: String,
    pub forward_port: u16,
    pub username: String,
    pub private_key: PathBuf,
    pub strict_host_key_checking: bool,
    pub client: ClientKind,
    pub executable: String,
}

impl PartialEq for TunnelSpec {
    fn eq(&self, other: &Self) -> bool {
        self.iport == other.iport
            && self.forwarding_server == other.forwarding_server
            && self.address == other.address
            && self.forward_port == other.forward_port
            && self.username == other.username
            && self.private_key == other.private_key
    }
}

impl Eq for TunnelSpec {}

impl TunnelSpec {
    /// Combine a target from the control endpoint with the local tunnel settings.
    pub fn new(target: &TunnelTarget, config: &TunnelConfig) -> Self {
        Self {
            iport: target.iport,
            forwarding_server: target.forwarding_server.clone(),
            address: config.address.clone(),
            forward_port: config.forward_port,
            username: config.username.clone(),
            private_key: config.private_key.clone(),
            strict_host_key_checking: config.strict_host_key_checking,
            client: config.client,
            executable: config.executable.clone(),
        }
    }

    /// `<iport>:<address>:<forward_port>`, the `-R` argument.
    pub fn forward_token(&self) -> String {
        format!("{}:{}:{}", self.iport, self.address, self.forward_port)
    }

    /// `<username>@<forwarding_server>`, the destination argument.
    pub fn identity_token(&self) -> String {
        format!("{}@{}", self.username, self.forwarding_server)
    }

    /// True if `args` carries both identity tokens as whole arguments.
    pub fn matches<S: AsRef<str>>(&self, args: &[S]) -> bool {
        let forward = self.forward_token();
        let identity = self.identity_token();
        let mut has_forward = false;
        let mut has_identity = false;
        for arg in args {
            let arg = arg.as_ref();
            has_forward |= arg == forward;
            has_identity |= arg == identity;
        }
        has_forward && has_identity
    }

    /// Process name the OS reports for the tunnel client (`ssh`, `plink.exe`).
    pub fn process_name(&self) -> &str {
        Path::new(&self.executable)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.executable)
    }

    /// Command line that opens this tunnel.
    pub fn invocation(&self) -> Invocation {
        let mut args: Vec<String> = Vec::with_capacity(10);
        if self.client == ClientKind::OpenSsh && !self.strict_host_key_checking {
            args.extend(
                ["-o", "StrictHostKeyChecking=no", "-o", "LogLevel=ERROR"].map(String::from),
            );
        }
        args.push("-N".to_string());
        args.push("-i".to_string());
        args.push(self.private_key.to_string_lossy().into_owned());
        args.push("-R".to_string());
        args.push(self.forward_token());
        args.push(self.identity_token());
        Invocation {
            program: self.executable.clone(),
            args,
        }
    }
}

/// A program and its arguments, ready to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
