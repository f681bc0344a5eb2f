// SPDX-License-Identifier: MIT

//! Reference-counted capability handles.

use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use tracing::warn;

use crate::error::RpcError;

/// An object that can be invoked through a capability.
pub trait Server: Send + Sync + 'static {
    /// Handle one call.  `params`, and any capabilities inside it, now belong
    /// to the server.
    fn dispatch(&self, method: u16, params: Payload) -> Result<Payload, RpcError>;

    /// Called once, when the last reference to this server is released.
    fn shutdown(&self) {}
}

/// The mechanism behind a capability: local server, import, or promise.
pub(crate) trait Hook: Send + Sync {
    fn call(&self, method: u16, params: Payload) -> Result<Payload, RpcError>;
    fn refs(&self) -> &RefCount;
    fn last_release(&self);
    fn kind(&self) -> &'static str;
}

/// Acquire/release bookkeeping shared by every reference to one hook.
pub(crate) struct RefCount {
    live: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl RefCount {
    /// Counts start with the reference that creates the hook.
    pub(crate) fn new() -> Self {
        RefCount {
            live: AtomicUsize::new(1),
            acquired: AtomicUsize::new(1),
            released: AtomicUsize::new(0),
        }
    }

    fn acquire(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns true when this was the last live reference.
    fn release(&self) -> bool {
        match self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(prev) => {
                self.released.fetch_add(1, Ordering::Relaxed);
                prev == 1
            }
            Err(_) => {
                debug_assert!(false, "capability released more times than acquired");
                false
            }
        }
    }

    fn stats(&self) -> RefStats {
        RefStats {
            acquired: self.acquired.load(Ordering::Acquire),
            released: self.released.load(Ordering::Acquire),
        }
    }
}

/// Acquire and release totals for one capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefStats {
    pub acquired: usize,
    pub released: usize,
}

/// A counted reference to a capability.  May be null.
///
/// Release explicitly with [`CapRef::release`].  A reference dropped without
/// being released is logged as a leak and then released.
pub struct CapRef {
    hook: Option<Arc<dyn Hook>>,
}

impl CapRef {
    /// The null capability.  Calls on it fail; releasing it does nothing.
    pub fn null() -> Self {
        CapRef { hook: None }
    }

    /// Wrap a local server.  This is the first reference to it.
    pub fn local<S: Server>(server: S) -> Self {
        Self::from_hook(Arc::new(LocalHook {
            server: Box::new(server),
            refs: RefCount::new(),
        }))
    }

    /// Wrap a freshly created hook, whose count already includes this reference.
    pub(crate) fn from_hook(hook: Arc<dyn Hook>) -> Self {
        CapRef { hook: Some(hook) }
    }

    pub fn is_null(&self) -> bool {
        self.hook.is_none()
    }

    /// Take another reference to the same object.
    pub fn acquire(&self) -> CapRef {
        match &self.hook {
            Some(hook) => {
                hook.refs().acquire();
                CapRef {
                    hook: Some(hook.clone()),
                }
            }
            None => CapRef::null(),
        }
    }

    /// Give up this reference.
    pub fn release(mut self) {
        if let Some(hook) = self.hook.take() {
            release_hook(hook);
        }
    }

    /// Invoke `method`.  Blocks until the result arrives.
    pub fn call(&self, method: u16, params: Payload) -> Result<Payload, RpcError> {
        match &self.hook {
            Some(hook) => hook.call(method, params),
            None => {
                params.release();
                Err(RpcError::NullCapability)
            }
        }
    }

    /// Acquire and release totals across every reference to this object.
    pub fn stats(&self) -> Option<RefStats> {
        self.hook.as_ref().map(|h| h.refs().stats())
    }
}

fn release_hook(hook: Arc<dyn Hook>) {
    if hook.refs().release() {
        hook.last_release();
    }
}

impl Drop for CapRef {
    fn drop(&mut self) {
        if let Some(hook) = self.hook.take() {
            warn!(kind = hook.kind(), "capability reference dropped without release");
            release_hook(hook);
        }
    }
}

impl Debug for CapRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.hook {
            Some(hook) => write!(f, "CapRef({})", hook.kind()),
            None => f.write_str("CapRef(null)"),
        }
    }
}

/// Call parameters or results: bytes plus a table of capabilities.
#[derive(Debug, Default)]
pub struct Payload {
    pub content: Vec<u8>,
    pub caps: Vec<CapRef>,
}

impl Payload {
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Payload {
            content: content.into(),
            caps: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Payload::default()
    }

    /// Append a capability to the cap table.
    pub fn with_cap(mut self, cap: CapRef) -> Self {
        self.caps.push(cap);
        self
    }

    /// Move out the capability at `index`, leaving null behind.
    pub fn take_cap(&mut self, index: usize) -> CapRef {
        match self.caps.get_mut(index) {
            Some(slot) => std::mem::replace(slot, CapRef::null()),
            None => CapRef::null(),
        }
    }

    /// Release every capability in the cap table.
    pub fn release(self) {
        for cap in self.caps {
            cap.release();
        }
    }
}

struct LocalHook {
    server: Box<dyn Server>,
    refs: RefCount,
}

impl Hook for LocalHook {
    fn call(&self, method: u16, params: Payload) -> Result<Payload, RpcError> {
        self.server.dispatch(method, params)
    }

    fn refs(&self) -> &RefCount {
        &self.refs
    }

    fn last_release(&self) {
        self.server.shutdown();
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}
