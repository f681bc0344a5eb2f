// SPDX-License-Identifier: MIT

//! Host-side grain management.
//!
//! A [`Container`] is started from a grain id: the package is looked up in
//! the [`Database`], and the [`Spawner`] starts the sandbox launcher and
//! bootstraps a capability connection to it.

mod cancel;
mod container;
mod database;
mod spawner;

pub use cancel::{CancelContext, cancel_handle};
pub use container::Container;
pub use database::{Database, MemoryDatabase, MemoryTransaction, Transaction};
pub use spawner::{
    SPAWN_METHOD, Spawned, Spawner, TeardownObserver, TeardownStage, spawn_params,
};
