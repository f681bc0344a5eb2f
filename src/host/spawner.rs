// SPDX-License-Identifier: MIT

//! Starts sandboxed grains and owns their lifetime.
//!
//! Each spawn runs the sandbox launcher with one end of a fresh socket pair
//! as descriptor 3, and speaks the capability protocol over the other end.
//! Releasing the returned handle tears the grain down: the launcher is
//! killed, then reaped, then the connection is closed, in that order.

use std::{
    ffi::OsString,
    os::{fd::OwnedFd, unix::net::UnixStream},
    sync::Arc,
    thread,
};

use tracing::{debug, info};

use super::cancel::{CancelContext, cancel_handle};
use crate::{
    capability::{CapRef, Connection, Payload, Server},
    comm::rwutil::{Decoder, Encoder},
    config::HostConfig,
    error::{RpcError, SpawnError, TeardownError, fatal},
    runtime::{self, ChildProcess, ExitReport, FdSet, GRAIN_API_FD, LaunchEnv, socket_pair},
};

/// Method number of `spawn` when the spawner is used as a capability.
pub const SPAWN_METHOD: u16 = 0;

/// Teardown progress, reported to an observer in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStage {
    Killed,
    Reaped(ExitReport),
    Closed,
}

pub type TeardownObserver = Arc<dyn Fn(TeardownStage) + Send + Sync>;

type SocketPairFn = fn() -> Result<(OwnedFd, OwnedFd), nix::Error>;

/// What a successful spawn hands back.
#[derive(Debug)]
pub struct Spawned {
    /// The grain's bootstrap capability.  Resolves once the grain answers.
    pub bootstrap: CapRef,
    /// Releasing the last reference tears the grain down.
    pub handle: CapRef,
}

#[derive(Clone)]
pub struct Spawner {
    config: HostConfig,
    parent: CancelContext,
    observer: Option<TeardownObserver>,
    socket_pair: SocketPairFn,
}

impl Spawner {
    pub fn new(config: HostConfig) -> Self {
        Spawner {
            config,
            parent: CancelContext::background(),
            observer: None,
            socket_pair,
        }
    }

    /// Derive every grain's cancellation from `ctx`, so cancelling it tears
    /// down all grains spawned here.
    pub fn with_context(mut self, ctx: CancelContext) -> Self {
        self.parent = ctx;
        self
    }

    pub fn with_observer(mut self, observer: TeardownObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Start the grain `grain_id` of package `package_id`.
    ///
    /// `host_bootstrap` is offered to the grain as this side's bootstrap
    /// capability, unless it is null.  It is consumed either way; on failure
    /// it is released before returning.
    pub fn spawn(
        &self,
        package_id: &str,
        grain_id: &str,
        host_bootstrap: CapRef,
    ) -> Result<Spawned, SpawnError> {
        if let Err(e) = check_id("package", package_id).and_then(|()| check_id("grain", grain_id)) {
            host_bootstrap.release();
            return Err(e);
        }

        let (grain_end, host_end) = match (self.socket_pair)() {
            Ok(pair) => pair,
            Err(e) => {
                host_bootstrap.release();
                return Err(SpawnError::SocketPair(e));
            }
        };

        let mut env = LaunchEnv::new(self.config.launcher_path());
        env.args = vec![OsString::from(package_id), OsString::from(grain_id)];
        // The launch consumes the grain end; the parent's copy is closed
        // whether or not the launcher starts.
        env.fds = FdSet::new().inherit(GRAIN_API_FD, grain_end);
        let child = match runtime::launch(env) {
            Ok(child) => child,
            Err(e) => {
                host_bootstrap.release();
                drop(host_end);
                return Err(SpawnError::Launch(e));
            }
        };
        info!(
            pid = child.pid(),
            package_id, grain_id, "started sandbox launcher"
        );

        let offered = if host_bootstrap.is_null() {
            host_bootstrap.release();
            None
        } else {
            Some(host_bootstrap)
        };
        let conn = match Connection::new(UnixStream::from(host_end), offered) {
            Ok(conn) => conn,
            Err(e) => {
                if let Err(failure) = kill_and_reap(&child, self.observer.as_ref()) {
                    fatal("failed stopping sandbox launcher", &failure);
                }
                return Err(SpawnError::Connection(e));
            }
        };

        let bootstrap = conn.bootstrap();
        let ctx = self.parent.with_cancel();
        let handle = cancel_handle(&ctx);

        let watcher = {
            let (ctx, child, conn) = (ctx.clone(), child.clone(), conn.clone());
            let observer = self.observer.clone();
            thread::Builder::new()
                .name(format!("teardown-{grain_id}"))
                .spawn(move || {
                    ctx.wait();
                    debug!(pid = child.pid(), "grain cancelled");
                    if let Err(e) = tear_down(&child, &conn, observer.as_ref()) {
                        fatal("grain teardown failed", &e);
                    }
                })
        };
        if let Err(e) = watcher {
            bootstrap.release();
            handle.release();
            if let Err(failure) = tear_down(&child, &conn, self.observer.as_ref()) {
                fatal("grain teardown failed", &failure);
            }
            return Err(SpawnError::Connection(e));
        }

        Ok(Spawned { bootstrap, handle })
    }
}

fn check_id(kind: &'static str, id: &str) -> Result<(), SpawnError> {
    if id.is_empty() {
        Err(SpawnError::InvalidId {
            kind,
            id: id.to_string(),
        })
    } else {
        Ok(())
    }
}

fn kill_and_reap(
    child: &ChildProcess,
    observer: Option<&TeardownObserver>,
) -> Result<ExitReport, TeardownError> {
    let pid = child.pid();
    child
        .kill()
        .map_err(|source| TeardownError::Kill { pid, source })?;
    notify(observer, TeardownStage::Killed);
    let report = child
        .wait()
        .map_err(|source| TeardownError::Wait { pid, source })?;
    notify(observer, TeardownStage::Reaped(report));
    Ok(report)
}

fn tear_down(
    child: &ChildProcess,
    conn: &Connection,
    observer: Option<&TeardownObserver>,
) -> Result<(), TeardownError> {
    let report = kill_and_reap(child, observer)?;
    info!(pid = child.pid(), %report, "sandbox launcher stopped");
    conn.shutdown();
    conn.wait_closed();
    notify(observer, TeardownStage::Closed);
    Ok(())
}

fn notify(observer: Option<&TeardownObserver>, stage: TeardownStage) {
    if let Some(observer) = observer {
        observer(stage);
    }
}

/// Parameters for a `spawn` call made through a capability.
pub fn spawn_params(package_id: &str, grain_id: &str, bootstrap: CapRef) -> Payload {
    let mut enc = Encoder::new();
    enc.put_str(package_id).put_str(grain_id);
    Payload::new(enc.finish()).with_cap(bootstrap)
}

impl Spawned {
    /// Take the grain bootstrap and handle out of `spawn` call results.
    pub fn from_results(mut results: Payload) -> Spawned {
        let spawned = Spawned {
            bootstrap: results.take_cap(0),
            handle: results.take_cap(1),
        };
        results.release();
        spawned
    }
}

impl Server for Spawner {
    fn dispatch(&self, method: u16, mut params: Payload) -> Result<Payload, RpcError> {
        if method != SPAWN_METHOD {
            params.release();
            return Err(RpcError::Unimplemented(method));
        }
        let bootstrap = params.take_cap(0);
        let ids = decode_ids(&params.content);
        params.release();
        let (package_id, grain_id) = match ids {
            Ok(ids) => ids,
            Err(e) => {
                bootstrap.release();
                return Err(RpcError::Failed(format!("bad spawn parameters: {e}")));
            }
        };
        let spawned = self
            .spawn(&package_id, &grain_id, bootstrap)
            .map_err(|e| RpcError::Failed(e.to_string()))?;
        Ok(Payload::empty()
            .with_cap(spawned.bootstrap)
            .with_cap(spawned.handle))
    }
}

fn decode_ids(content: &[u8]) -> Result<(String, String), std::io::Error> {
    let mut dec = Decoder::new(content);
    let package_id = dec.get_string()?;
    let grain_id = dec.get_string()?;
    dec.finish()?;
    Ok((package_id, grain_id))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{capability::Echo, integration_tests::util};

    fn spawner_in(dir: &std::path::Path) -> Spawner {
        Spawner::new(HostConfig {
            libexecdir: dir.to_path_buf(),
            launcher: "launcher".to_string(),
        })
    }

    #[test]
    fn empty_ids_release_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = spawner_in(dir.path());
        for (pkg, grain, kind) in [("", "g1", "package"), ("p1", "", "grain")] {
            let (echo, shutdowns) = Echo::new();
            let err = spawner.spawn(pkg, grain, CapRef::local(echo)).unwrap_err();
            assert!(matches!(err, SpawnError::InvalidId { kind: k, .. } if k == kind));
            assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn missing_launcher_releases_bootstrap_once() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = spawner_in(dir.path());
        let (echo, shutdowns) = Echo::new();
        let err = spawner.spawn("p1", "g1", CapRef::local(echo)).unwrap_err();
        assert!(matches!(err, SpawnError::Launch(_)));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn socket_pair_failure_releases_bootstrap_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut spawner = Spawner::new(util::install_launcher(dir.path()));
        spawner.socket_pair = || Err(nix::Error::EMFILE);

        let (echo, shutdowns) = Echo::new();
        let err = spawner.spawn("p1", "g1", CapRef::local(echo)).unwrap_err();
        assert!(matches!(err, SpawnError::SocketPair(nix::Error::EMFILE)));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(!dir.path().join("launcher.args").exists());
    }

    #[test]
    fn null_bootstrap_accepted_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let spawner = spawner_in(dir.path());
        assert!(matches!(
            spawner.spawn("p1", "g1", CapRef::null()),
            Err(SpawnError::Launch(_))
        ));
    }

    #[test]
    fn capability_rejects_unknown_method_and_bad_params() {
        let dir = tempfile::tempdir().unwrap();
        let cap = CapRef::local(spawner_in(dir.path()));

        let (echo, shutdowns) = Echo::new();
        let params = Payload::new(b"junk".to_vec()).with_cap(CapRef::local(echo));
        assert!(matches!(
            cap.call(SPAWN_METHOD, params),
            Err(RpcError::Failed(_))
        ));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

        assert_eq!(
            cap.call(7, Payload::empty()).unwrap_err(),
            RpcError::Unimplemented(7)
        );

        let (echo, shutdowns) = Echo::new();
        let err = cap
            .call(SPAWN_METHOD, spawn_params("p1", "g1", CapRef::local(echo)))
            .unwrap_err();
        assert!(matches!(err, RpcError::Failed(msg) if msg.contains("launcher")));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        cap.release();
    }
}
