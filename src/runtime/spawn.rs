// SPDX-License-Identifier: MIT

//! General model for spawning child processes and managing their state.

use std::{
    ffi::OsString,
    fmt::Display,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    path::PathBuf,
};

/// Descriptor index at which a sandboxed process finds its host connection.
pub const GRAIN_API_FD: RawFd = 3;

/// Defines the extra file descriptors handed to the child process.
///
/// STDIN is always `/dev/null`, and STDOUT / STDERR are inherited from the
/// parent.  Every entry here is installed at its index in the child, with
/// close-on-exec cleared.  The parent's copies close once the child starts.
#[derive(Debug, Default)]
pub struct FdSet {
    fds: Vec<Fd>,
}

/// A single inherited file descriptor.
#[derive(Debug)]
pub struct Fd {
    /// The index the child sees.
    pub index: RawFd,
    /// The parent's descriptor to duplicate into that index.
    pub source: OwnedFd,
}

impl FdSet {
    pub fn new() -> Self {
        FdSet { fds: Vec::new() }
    }

    /// Install `source` at `index` in the child.
    pub fn inherit(mut self, index: RawFd, source: OwnedFd) -> Self {
        self.fds.push(Fd { index, source });
        self
    }

    /// The `(source, index)` raw descriptor pairs, for use after the fork.
    pub(crate) fn raw_pairs(&self) -> Vec<(RawFd, RawFd)> {
        self.fds
            .iter()
            .map(|f| (f.source.as_raw_fd(), f.index))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }
}

/// Describes how to launch the child process.
#[derive(Debug)]
pub struct LaunchEnv {
    /// The executable; a bare name is looked up in `PATH`.
    pub cmd: PathBuf,
    /// Arguments after argv[0].  argv[0] is `cmd` as given.
    pub args: Vec<OsString>,
    /// The complete environment, or `None` to inherit the parent's.
    pub env: Option<Vec<(OsString, OsString)>>,
    pub fds: FdSet,
}

impl LaunchEnv {
    pub fn new(cmd: impl Into<PathBuf>) -> Self {
        LaunchEnv {
            cmd: cmd.into(),
            args: Vec::new(),
            env: None,
            fds: FdSet::new(),
        }
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReport {
    Exited(i32),
    Signaled(i32),
}

impl ExitReport {
    pub fn success(&self) -> bool {
        matches!(self, ExitReport::Exited(0))
    }
}

impl Display for ExitReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReport::Exited(code) => write!(f, "exit code {code}"),
            ExitReport::Signaled(sig) => write!(f, "signal {sig}"),
        }
    }
}
