// SPDX-License-Identifier: MIT

//! One-shot cancellation shared between threads.

use std::{
    sync::{Arc, Condvar, Mutex, Weak},
    time::{Duration, Instant},
};

use crate::{
    capability::{CapRef, Payload, Server},
    error::RpcError,
};

/// A cancellation signal.  Clones observe the same signal.
///
/// Cancelling a context cancels every context derived from it, but not the
/// other way around.
#[derive(Clone)]
pub struct CancelContext {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    cancelled: Condvar,
}

struct State {
    cancelled: bool,
    children: Vec<Weak<Inner>>,
}

impl CancelContext {
    /// A root context.  Only an explicit `cancel` ends it.
    pub fn background() -> Self {
        CancelContext {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    cancelled: false,
                    children: Vec::new(),
                }),
                cancelled: Condvar::new(),
            }),
        }
    }

    /// A context cancelled along with this one, or on its own.
    pub fn with_cancel(&self) -> CancelContext {
        let child = CancelContext::background();
        let mut st = self.inner.lock();
        if st.cancelled {
            child.inner.lock().cancelled = true;
        } else {
            st.children.retain(|c| c.strong_count() > 0);
            st.children.push(Arc::downgrade(&child.inner));
        }
        child
    }

    /// Cancel, waking every waiter.  Returns true only for the call that
    /// actually cancelled.
    pub fn cancel(&self) -> bool {
        let children = {
            let mut st = self.inner.lock();
            if st.cancelled {
                return false;
            }
            st.cancelled = true;
            std::mem::take(&mut st.children)
        };
        self.inner.cancelled.notify_all();
        for child in children.iter().filter_map(Weak::upgrade) {
            CancelContext { inner: child }.cancel();
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    /// Block until cancelled.
    pub fn wait(&self) {
        let mut st = self.inner.lock();
        while !st.cancelled {
            st = self
                .inner
                .cancelled
                .wait(st)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Block until cancelled or `timeout` passes.  Returns whether cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.inner.lock();
        while !st.cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            st = self
                .inner
                .cancelled
                .wait_timeout(st, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        true
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        crate::capability::lock(&self.state)
    }
}

/// Capability that cancels a context when its last reference is released.
struct CancelOnRelease {
    ctx: CancelContext,
}

impl Server for CancelOnRelease {
    fn dispatch(&self, method: u16, params: Payload) -> Result<Payload, RpcError> {
        params.release();
        Err(RpcError::Unimplemented(method))
    }

    fn shutdown(&self) {
        self.ctx.cancel();
    }
}

/// A handle capability for `ctx`.  Dropping the last reference cancels it.
pub fn cancel_handle(ctx: &CancelContext) -> CapRef {
    CapRef::local(CancelOnRelease { ctx: ctx.clone() })
}
