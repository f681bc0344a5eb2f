// SPDX-License-Identifier: MIT

//! The sandbox agent: the first program run inside a grain's sandbox.
//!
//! The agent reads the package manifest, opens the grain-local API socket,
//! starts the app named by the manifest's continue command, and then waits.
//! When the app exits for any reason, the agent exits non-zero and takes the
//! grain down with it.  Restarting is left to whoever started the grain.
//!
//! Descriptor 3 carries the host connection.  The agent does not use it yet.

pub mod api;
mod launch;
mod supervisor;

pub use api::{ApiListener, ClosingApi, LocalApi};
pub use launch::{BridgeLaunch, resolve_bridge_command};
pub use supervisor::{APP_EXITED_STATUS, Agent, AgentEvent, AgentState};
