// SPDX-License-Identifier: MIT

//! Capability references and the connection that carries them between
//! processes.
//!
//! A [`CapRef`] is an explicitly counted reference to an object, either local
//! (a [`Server`] in this process) or remote (an export on the other side of a
//! [`Connection`]).  Every [`CapRef::acquire`] must be matched by exactly one
//! [`CapRef::release`].  When the last reference goes away, a local server is
//! told to shut down and a remote export is released on the peer.
//!
//! Ownership of a `CapRef` moves with calls: parameters and results handed to
//! [`CapRef::call`] and [`Server::dispatch`] belong to the receiver, which
//! releases them once done, even when the call fails.

mod client;
mod conn;

pub use client::{CapRef, Payload, RefStats, Server};
pub use conn::Connection;

#[cfg(test)]
pub(crate) use client::tests::Echo;

use std::sync::{Mutex, MutexGuard};

/// Lock, recovering the guard if another thread panicked while holding it.
/// The protected tables stay structurally valid between statements.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
