// SPDX-License-Identifier: MIT

//! Error categories.
//!
//! Configuration and format errors ([`ManifestError`], [`CommandError`],
//! [`ConfigError`]) are fatal inside the sandbox agent.  Resource errors
//! ([`SpawnError`], [`ContainerError`]) are returned to the caller after any
//! capability references have been released.  Protocol errors ([`RpcError`])
//! surface through call results and the connection's closure.  Teardown
//! errors ([`TeardownError`]) end the owning process.

use thiserror::Error;

use crate::runtime::error::SandboxError;

/// The manifest could not be decoded.
#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("malformed manifest: {0}")]
    Malformed(String),

    #[error("failed reading manifest: {0}")]
    Io(#[from] std::io::Error),
}

impl ManifestError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        ManifestError::Malformed(msg.into())
    }
}

/// The continue command does not have the compatibility-bridge shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("continue command is empty")]
    Empty,

    #[error("only {expected} apps are supported, found {found}")]
    NotBridge { expected: String, found: String },

    #[error("too few arguments: expected <bridge> <port> -- <command...>, found {0} arguments")]
    TooFewArguments(usize),

    #[error("invalid port number {0:?}")]
    InvalidPort(String),

    #[error("second argument should be the '--' separator, found {0:?}")]
    MissingSeparator(String),
}

/// The configuration file could not be loaded.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed reading config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Failures reported by a capability call or by the connection carrying it.
///
/// These values are fanned out to every pending call when a connection
/// closes, so they carry strings rather than the original source errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("connection closed: {0}")]
    Disconnected(String),

    #[error("called a null capability")]
    NullCapability,

    #[error("method {0} not implemented")]
    Unimplemented(u16),

    #[error("remote exception: {0}")]
    Remote(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{0}")]
    Failed(String),
}

/// Recoverable failures while spawning a grain.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("invalid {kind} id {id:?}")]
    InvalidId { kind: &'static str, id: String },

    #[error("failed creating socket pair: {0}")]
    SocketPair(#[source] nix::Error),

    #[error("failed starting sandbox launcher: {0}")]
    Launch(#[source] SandboxError),

    #[error("failed opening grain connection: {0}")]
    Connection(#[source] std::io::Error),
}

/// Failures while shutting down a spawned grain.  There is no recovery path.
#[derive(Error, Debug)]
pub enum TeardownError {
    #[error("failed killing sandbox launcher {pid}: {source}")]
    Kill {
        pid: i32,
        #[source]
        source: SandboxError,
    },

    #[error("failed waiting for sandbox launcher {pid}: {source}")]
    Wait {
        pid: i32,
        #[source]
        source: SandboxError,
    },
}

/// Errors from the database collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("no such grain: {0}")]
    NoSuchGrain(String),

    #[error("transaction already finished")]
    Finished,

    #[error("database error: {0}")]
    Backend(String),
}

/// Failures while starting a container.
#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("start cancelled")]
    Cancelled,

    #[error(transparent)]
    Database(#[from] DbError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

/// Fatal sandbox agent failures.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("failed binding api socket {path}: {source}")]
    ApiSocket {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed starting app: {0}")]
    AppStart(#[source] SandboxError),

    #[error("invalid agent transition from {from} to {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

/// Log `err` and end the process.  For failures with no safe continuation.
pub fn fatal(context: &str, err: &dyn std::error::Error) -> ! {
    tracing::error!(error = %err, "{context}");
    std::process::exit(1)
}
