use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while loading, building, starting or stopping tunnels.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("malformed forward '{expr}': {reason}")]
    MalformedForwardSpec { expr: String, reason: String },

    #[error("invalid key path '{path}': {reason}")]
    KeyPath { path: String, reason: String },

    #[error("invalid ssh target '{0}'")]
    InvalidTarget(String),

    #[error("failed to start tunnel via '{target}'")]
    TunnelStart {
        target: String,
        #[source]
        source: SessionError,
    },

    #[error("failed to stop tunnel via '{target}'")]
    Stop {
        target: String,
        #[source]
        source: SessionError,
    },

    #[error("config '{name}' not found (looked in: {})", display_paths(.searched))]
    ConfigNotFound { name: String, searched: Vec<PathBuf> },

    #[error("failed to read {}", .path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {message}", .path.display())]
    ConfigParse { path: PathBuf, message: String },

    #[error("tunnel via '{target}' cannot {action} while {state}")]
    InvalidState {
        target: String,
        action: &'static str,
        state: &'static str,
    },

    #[error("failed to execute `{command}`")]
    Exec {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("local address {bind} is used by both '{first}' and '{second}'")]
    DuplicateLocalBind {
        bind: String,
        first: String,
        second: String,
    },
}

/// Failures reported by a forwarding session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to run ssh")]
    Spawn(#[source] std::io::Error),

    #[error("local address {0} already in use")]
    AddressInUse(String),

    #[error("cannot listen on local address {bind}")]
    LocalBind {
        bind: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ssh exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },

    #[error("listeners not ready after {0:?}")]
    Timeout(Duration),

    #[error("could not signal ssh process")]
    Signal(#[source] std::io::Error),
}

fn display_paths(paths: &[PathBuf]) -> String {
    let parts: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
    parts.join(", ")
}
