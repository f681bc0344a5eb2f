// SPDX-License-Identifier: MIT

//! A running grain, as seen by the host.

use tracing::info;

use super::{
    cancel::CancelContext,
    database::{Database, Transaction},
    spawner::Spawner,
};
use crate::{
    capability::CapRef,
    error::{ContainerError, DbError},
};

/// Owns a grain's bootstrap capability and its teardown handle.
#[derive(Debug)]
pub struct Container {
    bootstrap: CapRef,
    handle: CapRef,
}

impl Container {
    /// Look up the grain's package and spawn it.
    ///
    /// `host_api` becomes the grain's view of the host.  It is released on
    /// every failure path.
    pub fn start<D: Database>(
        ctx: &CancelContext,
        db: &D,
        spawner: &Spawner,
        grain_id: &str,
        host_api: CapRef,
    ) -> Result<Container, ContainerError> {
        if ctx.is_cancelled() {
            host_api.release();
            return Err(ContainerError::Cancelled);
        }
        let package_id = match package_of(db, grain_id) {
            Ok(id) => id,
            Err(e) => {
                host_api.release();
                return Err(e.into());
            }
        };
        if ctx.is_cancelled() {
            host_api.release();
            return Err(ContainerError::Cancelled);
        }
        let spawned = spawner.spawn(&package_id, grain_id, host_api)?;
        info!(grain_id, package_id = %package_id, "grain started");
        Ok(Container {
            bootstrap: spawned.bootstrap,
            handle: spawned.handle,
        })
    }

    /// The grain's bootstrap capability.
    pub fn bootstrap(&self) -> &CapRef {
        &self.bootstrap
    }

    /// Release the bootstrap and the handle.  Once no other reference to the
    /// handle remains, the grain is torn down.
    pub fn release(self) {
        self.bootstrap.release();
        self.handle.release();
    }
}

/// Read-only lookup; an uncommitted transaction rolls back when dropped.
fn package_of<D: Database>(db: &D, grain_id: &str) -> Result<String, DbError> {
    let mut tx = db.begin()?;
    let package_id = tx.grain_package_id(grain_id)?;
    tx.commit()?;
    Ok(package_id)
}
