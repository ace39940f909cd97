//! Client for the remote control endpoint.
//!
//! The endpoint is polled with `GET <url>/<poll_path>` and answers with a flat
//! JSON object:
//!
//! ```json
//! {
//!   "command": "1",
//!   "iport": "42001",
//!   "forwarding_server": "fw1.example.net",
//!   "disconnect_ssl_when_server_unreachable": "T"
//! }
//! ```
//!
//! `command` is `"1"` to open the tunnel and `"0"` to close it. An `error`
//! field replaces all of the above when the endpoint rejects this host.
//! Repeated launch failures are reported with `GET <url>/<error_path>`, whose
//! answer is ignored.
//!
//! ## Error handling
//!
//! Transport failures and non-2xx statuses are [`ControlError::is_unreachable`]
//! and count toward self-restart. A body that is not a JSON object is a
//! protocol error and does not.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{ControlConfig, TunnelConfig};
use crate::tunnel::{TunnelSpec, TunnelTarget};

/// The two calls the agent makes to the control endpoint.
#[allow(async_fn_in_trait)]
pub trait ControlPlane {
    /// Fetch the current command.
    async fn poll(&self) -> Result<PollReply, ControlError>;

    /// Tell the endpoint the tunnel could not be started. Fire and forget.
    async fn report_error(&self);
}

/// What the endpoint asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `"1"`: the tunnel should be open.
    Activate,
    /// `"0"`: the tunnel should be closed.
    Deactivate,
    /// Any other value; ignored.
    Unknown(String),
}

/// One successful poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSnapshot {
    /// `None` when the reply carried no `command`.
    pub directive: Option<Directive>,
    /// `None` when `iport` or `forwarding_server` is missing or malformed.
    pub target: Option<TunnelTarget>,
    /// Drop the tunnel if a later poll cannot reach the endpoint.
    pub disconnect_when_unreachable: bool,
}

impl CommandSnapshot {
    /// The full tunnel identity for this command, if the reply named a target.
    pub fn spec(&self, tunnel: &TunnelConfig) -> Option<TunnelSpec> {
        self.target.as_ref().map(|t| TunnelSpec::new(t, tunnel))
    }
}

/// Parsed reply to a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollReply {
    Command(CommandSnapshot),
    /// The endpoint answered with an `error` field.
    Rejected(String),
    /// `{}`: nothing to act on.
    Empty,
}

impl PollReply {
    /// Interpret a decoded response body.
    pub fn from_json(body: &Value) -> Result<Self, ControlError> {
        let Some(fields) = body.as_object() else {
            return Err(ControlError::Protocol(format!(
                "expected a JSON object, got {body}"
            )));
        };
        if fields.is_empty() {
            return Ok(Self::Empty);
        }
        if let Some(error) = fields.get("error") {
            let message = error.as_str().map_or_else(|| error.to_string(), String::from);
            return Ok(Self::Rejected(message));
        }

        let directive = text_field(body, "command").map(|c| match c.as_str() {
            "1" => Directive::Activate,
            "0" => Directive::Deactivate,
            _ => Directive::Unknown(c),
        });
        let target = match (
            text_field(body, "iport").and_then(|p| p.trim().parse::<u16>().ok()),
            text_field(body, "forwarding_server").filter(|s| !s.is_empty()),
        ) {
            (Some(iport), Some(forwarding_server)) => Some(TunnelTarget {
                iport,
                forwarding_server,
            }),
            _ => None,
        };
        let disconnect_when_unreachable =
            text_field(body, "disconnect_ssl_when_server_unreachable").as_deref() == Some("T");

        Ok(Self::Command(CommandSnapshot {
            directive,
            target,
            disconnect_when_unreachable,
        }))
    }
}

/// A field as text; the endpoint sends numbers as strings, but not always.
fn text_field(body: &Value, key: &str) -> Option<String> {
    match &body[key] {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// HTTP implementation of [`ControlPlane`].
pub struct HttpControl {
    http: reqwest::Client,
    poll_url: String,
    error_url: String,
    config: ControlConfig,
}

impl HttpControl {
    pub fn new(config: &ControlConfig) -> Result<Self, ControlError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("reach-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ControlError::Protocol(format!("cannot build HTTP client: {e}")))?;
        let base = config.url.trim_end_matches('/');
        Ok(Self {
            http,
            poll_url: format!("{base}/{}", config.poll_path.trim_start_matches('/')),
            error_url: format!("{base}/{}", config.error_path.trim_start_matches('/')),
            config: config.clone(),
        })
    }

    fn identity(&self) -> [(&'static str, &str); 4] {
        [
            ("ports_id", self.config.ports_id.as_str()),
            ("key", self.config.host_uuid.as_str()),
            ("uid", self.config.user_id.as_str()),
            ("dbid", self.config.db_server_key.as_str()),
        ]
    }
}

impl ControlPlane for HttpControl {
    async fn poll(&self) -> Result<PollReply, ControlError> {
        let resp = self
            .http
            .get(&self.poll_url)
            .query(&self.identity())
            .query(&[("ver", self.config.client_version.as_str())])
            .send()
            .await
            .map_err(|e| ControlError::Unreachable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(ControlError::Http {
                status: status.as_u16(),
            });
        }
        let body = resp
            .text()
            .await
            .map_err(|e| ControlError::Unreachable(e.to_string()))?;
        let value: Value = serde_json::from_str(body.trim())
            .map_err(|e| ControlError::Protocol(format!("invalid JSON from control endpoint: {e}")))?;
        PollReply::from_json(&value)
    }

    async fn report_error(&self) {
        match self
            .http
            .get(&self.error_url)
            .query(&self.identity())
            .send()
            .await
        {
            Ok(resp) => debug!(status = resp.status().as_u16(), "launch failure reported"),
            Err(e) => warn!(error = %e, "failed to report launch failure"),
        }
    }
}

/// Errors from [`ControlPlane::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// Connection refused, DNS failure, timeout, or the body could not be read.
    Unreachable(String),
    /// The endpoint answered with a non-2xx status.
    Http { status: u16 },
    /// The body was not the expected JSON object.
    Protocol(String),
}

impl ControlError {
    /// Whether this failure means the endpoint could not be reached.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ControlError::Unreachable(_) | ControlError::Http { .. })
    }
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::Unreachable(e) => write!(f, "control endpoint unreachable: {e}"),
            ControlError::Http { status } => write!(f, "control endpoint returned HTTP {status}"),
            ControlError::Protocol(e) => write!(f, "protocol error: {e}"),
        }
    }
}

impl std::error::Error for ControlError {}
