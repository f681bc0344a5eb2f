// SPDX-License-Identifier: MIT

//! Common error type for launching and reaping child processes.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("executable not found: {0}")]
    NotFound(#[from] which::Error),

    #[error("os error: {0}")]
    Os(#[from] nix::Error),

    #[error("process error: {0}")]
    ProcessError(String),
}
