//! Utility helpers for running the tests.

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use crate::{
    config::HostConfig,
    host::{TeardownObserver, TeardownStage},
};

/// File name of the stand-in sandbox launcher.
pub const LAUNCHER: &str = "launcher";

/// A launcher that records its arguments and whether descriptor 3 is a
/// socket, then sleeps until killed.  The arguments file appears last.
const LAUNCHER_SCRIPT: &str = r#"#!/bin/sh
if [ -S /proc/self/fd/3 ]; then echo socket > "$0.fd3"; fi
printf '%s\n' "$@" > "$0.args.tmp" && mv "$0.args.tmp" "$0.args"
exec sleep 600
"#;

/// Write the stand-in launcher into `dir` and point a host config at it.
pub fn install_launcher(dir: &Path) -> HostConfig {
    let path = dir.join(LAUNCHER);
    std::fs::write(&path, LAUNCHER_SCRIPT).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    HostConfig {
        libexecdir: dir.to_path_buf(),
        launcher: LAUNCHER.to_string(),
    }
}

/// Wait for the launcher to start, then return the arguments it was given.
pub fn launcher_args(dir: &Path) -> Vec<String> {
    let path = dir.join(format!("{LAUNCHER}.args"));
    eventually("launcher arguments", || path.exists());
    std::fs::read_to_string(&path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

pub fn launcher_saw_socket(dir: &Path) -> bool {
    let path: PathBuf = dir.join(format!("{LAUNCHER}.fd3"));
    std::fs::read_to_string(path).is_ok_and(|s| s.trim() == "socket")
}

/// An observer that records every teardown stage.
pub fn recorder() -> (TeardownObserver, Arc<Mutex<Vec<TeardownStage>>>) {
    let stages = Arc::new(Mutex::new(Vec::new()));
    let recorded = stages.clone();
    let observer: TeardownObserver =
        Arc::new(move |stage: TeardownStage| recorded.lock().unwrap().push(stage));
    (observer, stages)
}

/// Wait for all three teardown stages, and return them.
pub fn finished_teardown(stages: &Arc<Mutex<Vec<TeardownStage>>>) -> Vec<TeardownStage> {
    eventually("teardown", || stages.lock().unwrap().len() >= 3);
    // Give a duplicate teardown a chance to show up.
    thread::sleep(Duration::from_millis(50));
    stages.lock().unwrap().clone()
}

pub fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}
