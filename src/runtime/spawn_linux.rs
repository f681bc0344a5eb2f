// SPDX-License-Identifier: MIT

//! Spawns the process with its inherited descriptors wired up.
//! Specific to Linux.

pub(crate) mod fd;
mod launch;

pub use fd::socket_pair;
pub use launch::ChildProcess;
pub(crate) use launch::launch_child;
