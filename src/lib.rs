//! # grainbox
//!
//! Starts sandboxed grains and bootstraps a capability connection to each.
//!
//! Inside the sandbox, the [`agent`] reads the package manifest, launches the
//! grain's app, and supervises it.  On the host, the [`host`] spawner starts
//! the sandbox launcher with one end of a socket pair as descriptor 3 and
//! speaks the [`capability`] protocol over the other end.

pub mod agent;
pub mod capability;
pub mod comm;
pub mod config;
pub mod error;
pub mod host;
pub mod logging;
pub mod manifest;
pub mod runtime;

pub use capability::{CapRef, Connection, Payload, Server};
pub use config::Config;
pub use host::{CancelContext, Container, Spawner};
pub use manifest::{Command, Manifest};
pub use runtime::{ChildProcess, LaunchEnv, launch};

#[cfg(test)]
mod integration_tests;
