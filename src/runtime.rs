// SPDX-License-Identifier: MIT

//! Manages the runtime execution of child processes.
//!
//! The `launch` function is the main entry point to start a child process.
//! It takes a `LaunchEnv` structure that describes the command to run, its
//! arguments, environment variables, and the file descriptors the child
//! inherits.  The returned `ChildProcess` is how the caller kills and reaps
//! the child; nothing reaps it implicitly.

pub mod error;
pub mod spawn;

pub use spawn::{ExitReport, Fd, FdSet, GRAIN_API_FD, LaunchEnv};

mod spawn_linux;

pub use spawn_linux::{ChildProcess, socket_pair};

/// Start the child process described by `env`.
pub fn launch(env: LaunchEnv) -> Result<ChildProcess, error::SandboxError> {
    spawn_linux::launch_child(env)
}
