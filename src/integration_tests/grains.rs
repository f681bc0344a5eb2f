//! Grains started through the host side.

use std::{
    os::unix::net::UnixStream,
    sync::{Arc, Barrier, atomic::Ordering},
    thread,
};

use crate::{
    capability::{CapRef, Connection, Echo},
    host::{
        CancelContext, Container, MemoryDatabase, SPAWN_METHOD, Spawned, Spawner, TeardownStage,
        spawn_params,
    },
    runtime::ExitReport,
};

use super::util;

const SIGKILL: i32 = 9;

fn expected_teardown() -> Vec<TeardownStage> {
    vec![
        TeardownStage::Killed,
        TeardownStage::Reaped(ExitReport::Signaled(SIGKILL)),
        TeardownStage::Closed,
    ]
}

/// Start grain g1 of package p1, then release it.
#[test]
fn container_start_and_release() {
    let dir = tempfile::tempdir().unwrap();
    let (observer, stages) = util::recorder();
    let spawner = Spawner::new(util::install_launcher(dir.path())).with_observer(observer);
    let db = MemoryDatabase::new();
    db.add_grain("g1", "p1");
    let (api, api_shutdowns) = Echo::new();

    let container = Container::start(
        &CancelContext::background(),
        &db,
        &spawner,
        "g1",
        CapRef::local(api),
    )
    .unwrap();
    assert!(!container.bootstrap().is_null());
    assert_eq!(util::launcher_args(dir.path()), vec!["p1", "g1"]);
    assert!(util::launcher_saw_socket(dir.path()));
    assert_eq!((db.commits(), db.rollbacks()), (1, 0));
    assert!(stages.lock().unwrap().is_empty());

    container.release();
    assert_eq!(util::finished_teardown(&stages), expected_teardown());
    // Closing the connection gives back the host api.
    assert_eq!(api_shutdowns.load(Ordering::SeqCst), 1);
}

/// Every holder of the handle releasing at once still tears down once.
#[test]
fn concurrent_handle_release() {
    let dir = tempfile::tempdir().unwrap();
    let (observer, stages) = util::recorder();
    let spawner = Spawner::new(util::install_launcher(dir.path())).with_observer(observer);

    let spawned = spawner.spawn("p1", "g1", CapRef::null()).unwrap();
    util::launcher_args(dir.path());
    spawned.bootstrap.release();

    let holders = 8;
    let barrier = Arc::new(Barrier::new(holders));
    let handles: Vec<CapRef> = (1..holders).map(|_| spawned.handle.acquire()).collect();
    let threads: Vec<_> = handles
        .into_iter()
        .chain(std::iter::once(spawned.handle))
        .map(|handle| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                handle.release();
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(util::finished_teardown(&stages), expected_teardown());
}

/// Cancelling the spawner's context tears down the grains it started.
#[test]
fn parent_context_cancels_grain() {
    let dir = tempfile::tempdir().unwrap();
    let (observer, stages) = util::recorder();
    let parent = CancelContext::background();
    let spawner = Spawner::new(util::install_launcher(dir.path()))
        .with_context(parent.clone())
        .with_observer(observer);

    let spawned = spawner.spawn("p1", "g1", CapRef::null()).unwrap();
    util::launcher_args(dir.path());
    assert!(parent.cancel());
    assert_eq!(util::finished_teardown(&stages), expected_teardown());

    // The handle is still owned, and releasing it now changes nothing.
    spawned.bootstrap.release();
    spawned.handle.release();
    assert_eq!(util::finished_teardown(&stages), expected_teardown());
}

/// The spawner works the same when called through a connection.
#[test]
fn spawn_through_connection() {
    let dir = tempfile::tempdir().unwrap();
    let (observer, stages) = util::recorder();
    let spawner = Spawner::new(util::install_launcher(dir.path())).with_observer(observer);

    let (server_end, client_end) = UnixStream::pair().unwrap();
    let server = Connection::new(server_end, Some(CapRef::local(spawner))).unwrap();
    let client = Connection::new(client_end, None).unwrap();

    let (api, api_shutdowns) = Echo::new();
    let remote = client.bootstrap();
    let results = remote
        .call(SPAWN_METHOD, spawn_params("p2", "g2", CapRef::local(api)))
        .unwrap();
    let spawned = Spawned::from_results(results);
    assert!(!spawned.bootstrap.is_null());
    assert!(!spawned.handle.is_null());
    assert_eq!(util::launcher_args(dir.path()), vec!["p2", "g2"]);

    spawned.bootstrap.release();
    spawned.handle.release();
    assert_eq!(util::finished_teardown(&stages), expected_teardown());
    // The api went over two connections and comes back across both.
    util::eventually("api release", || api_shutdowns.load(Ordering::SeqCst) == 1);

    remote.release();
    client.shutdown();
    server.wait_closed();
}
