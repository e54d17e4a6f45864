//! Error types for wgctl

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WgctlError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// External command failed
    #[error("command failed: {cmd}: {output}")]
    CommandFailed {
        cmd: String,
        code: Option<i32>,
        output: String,
    },
    /// REST call returned a non-success status
    #[error("{method} {resource} failed with status {status}: {body}")]
    Http {
        method: String,
        resource: String,
        status: u16,
        body: String,
    },
    /// Transport could not be reached or answered garbage
    #[error("transport error: {0}")]
    Transport(String),
    /// Netlink request failed
    #[error("netlink error: {0}")]
    Netlink(String),
    /// D-Bus call failed
    #[error("D-Bus error: {0}")]
    DBus(String),
    /// Parse error
    #[error("parse error: {0}")]
    Parse(String),
    /// Desired configuration or connection URL rejected before any transport call
    #[error("invalid configuration: {0}")]
    Validation(String),
    /// Configuration file error
    #[error("configuration error: {0}")]
    Config(String),
    /// Interface, peer or resource absent
    #[error("not found: {0}")]
    NotFound(String),
    /// Not supported
    #[error("not supported: {0}")]
    NotSupported(String),
    /// No factory registered for the backend type
    #[error("unknown backend type: {0}")]
    UnknownBackend(String),
    /// Factory exists but cannot run here
    #[error("backend type {0} is not supported on this platform")]
    UnsupportedBackend(String),
    /// Transport handle is no longer usable and must be recreated
    #[error("wireguard backend connection is stale: {0}")]
    Stale(#[source] Box<WgctlError>),
    /// Reconciliation failed after some writes already landed
    #[error("reconciliation stopped after {applied} applied change(s): {source}")]
    PartialConvergence {
        applied: usize,
        #[source]
        source: Box<WgctlError>,
    },
    /// Several independent failures
    #[error("{}", join_messages(.0))]
    Multiple(Vec<WgctlError>),
}

fn join_messages(errors: &[WgctlError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl WgctlError {
    /// Tag this error as a stale transport connection
    pub fn stale(self) -> Self {
        match self {
            WgctlError::Stale(_) => self,
            other => WgctlError::Stale(Box::new(other)),
        }
    }

    /// Whether the retry policy should recreate the connector
    pub fn is_stale(&self) -> bool {
        match self {
            WgctlError::Stale(_) => true,
            WgctlError::Multiple(errors) => errors.iter().any(|e| e.is_stale()),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, WgctlError::NotFound(_))
    }

    /// Collapse a list of failures; `None` when the list is empty
    pub fn join(mut errors: Vec<WgctlError>) -> Option<WgctlError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(WgctlError::Multiple(errors)),
        }
    }
}

impl From<serde_json::Error> for WgctlError {
    fn from(error: serde_json::Error) -> Self {
        WgctlError::Parse(error.to_string())
    }
}

impl From<reqwest::Error> for WgctlError {
    fn from(error: reqwest::Error) -> Self {
        WgctlError::Transport(error.to_string())
    }
}

impl From<zbus::Error> for WgctlError {
    fn from(error: zbus::Error) -> Self {
        WgctlError::DBus(error.to_string())
    }
}

impl From<toml::de::Error> for WgctlError {
    fn from(error: toml::de::Error) -> Self {
        WgctlError::Config(error.to_string())
    }
}

pub type WgctlResult<T> = Result<T, WgctlError>;
