// SPDX-License-Identifier: MIT

//! The narrow slice of the grain database the host needs.

use std::{
    collections::HashMap,
    sync::{
        Arc, RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use crate::error::DbError;

pub trait Database {
    type Tx: Transaction;

    fn begin(&self) -> Result<Self::Tx, DbError>;
}

/// A transaction.  Dropping one that was not committed rolls it back.
pub trait Transaction {
    /// The package a grain was created from.
    fn grain_package_id(&mut self, grain_id: &str) -> Result<String, DbError>;

    fn commit(self) -> Result<(), DbError>;

    fn rollback(self) -> Result<(), DbError>;
}

/// A grain-to-package table held in memory.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    grains: RwLock<HashMap<String, String>>,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        MemoryDatabase::default()
    }

    pub fn add_grain(&self, grain_id: impl Into<String>, package_id: impl Into<String>) {
        self.inner
            .grains
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(grain_id.into(), package_id.into());
    }

    pub fn commits(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }
}

impl Database for MemoryDatabase {
    type Tx = MemoryTransaction;

    fn begin(&self) -> Result<MemoryTransaction, DbError> {
        Ok(MemoryTransaction {
            db: self.inner.clone(),
            open: true,
        })
    }
}

pub struct MemoryTransaction {
    db: Arc<MemoryInner>,
    open: bool,
}

impl MemoryTransaction {
    fn finish(&mut self, counter: &AtomicUsize) -> Result<(), DbError> {
        if !self.open {
            return Err(DbError::Finished);
        }
        self.open = false;
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Transaction for MemoryTransaction {
    fn grain_package_id(&mut self, grain_id: &str) -> Result<String, DbError> {
        if !self.open {
            return Err(DbError::Finished);
        }
        self.db
            .grains
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(grain_id)
            .cloned()
            .ok_or_else(|| DbError::NoSuchGrain(grain_id.to_string()))
    }

    fn commit(mut self) -> Result<(), DbError> {
        let db = self.db.clone();
        self.finish(&db.commits)
    }

    fn rollback(mut self) -> Result<(), DbError> {
        let db = self.db.clone();
        self.finish(&db.rollbacks)
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if self.open {
            let db = self.db.clone();
            let _ = self.finish(&db.rollbacks);
        }
    }
}
