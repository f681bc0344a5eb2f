// SPDX-License-Identifier: MIT

//! The sandbox agent's lifecycle.

use std::{
    ffi::OsString,
    fmt::Display,
    sync::{Arc, mpsc},
    thread,
};

use tracing::{error, info};

use super::{
    api::{ApiListener, ClosingApi, LocalApi},
    launch::{BridgeLaunch, resolve_bridge_command},
};
use crate::{
    config::AgentConfig,
    error::AgentError,
    manifest::Manifest,
    runtime::{self, ChildProcess, ExitReport, LaunchEnv},
};

/// The agent's exit status once the app is gone.
pub const APP_EXITED_STATUS: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Init,
    AgentReady,
    AppRunning,
    ShuttingDown,
}

impl AgentState {
    pub fn name(&self) -> &'static str {
        match self {
            AgentState::Init => "Init",
            AgentState::AgentReady => "AgentReady",
            AgentState::AppRunning => "AppRunning",
            AgentState::ShuttingDown => "ShuttingDown",
        }
    }

    fn can_become(&self, next: AgentState) -> bool {
        matches!(
            (self, next),
            (AgentState::Init, AgentState::AgentReady)
                | (AgentState::AgentReady, AgentState::AppRunning)
                | (AgentState::AppRunning, AgentState::ShuttingDown)
        )
    }
}

impl Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Something the supervising thread must react to.
#[derive(Debug)]
pub enum AgentEvent {
    /// The app process is gone.  `Err` when it could not be reaped.
    AppExited(Result<ExitReport, String>),
}

/// Runs one grain's app and stays alive as long as it does.
pub struct Agent {
    config: AgentConfig,
    api: Arc<dyn LocalApi>,
    state: AgentState,
    launch: Option<BridgeLaunch>,
    listener: Option<ApiListener>,
    app: Option<ChildProcess>,
    events_tx: mpsc::Sender<AgentEvent>,
    events: mpsc::Receiver<AgentEvent>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        let (events_tx, events) = mpsc::channel();
        Agent {
            config,
            api: Arc::new(ClosingApi),
            state: AgentState::Init,
            launch: None,
            listener: None,
            app: None,
            events_tx,
            events,
        }
    }

    /// Serve API socket connections with `api` instead of closing them.
    pub fn with_api(mut self, api: Arc<dyn LocalApi>) -> Self {
        self.api = api;
        self
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// A sender for events the supervisor waits on.
    pub fn events(&self) -> mpsc::Sender<AgentEvent> {
        self.events_tx.clone()
    }

    /// The running app, once started.
    pub fn app(&self) -> Option<&ChildProcess> {
        self.app.as_ref()
    }

    fn check(&self, next: AgentState) -> Result<(), AgentError> {
        if self.state.can_become(next) {
            Ok(())
        } else {
            Err(AgentError::InvalidTransition {
                from: self.state.name(),
                to: next.name(),
            })
        }
    }

    /// Read the manifest, resolve the app command, and open the API socket.
    pub fn prepare(&mut self) -> Result<(), AgentError> {
        self.check(AgentState::AgentReady)?;

        let manifest = Manifest::read(&self.config.manifest_path)?;
        info!(title = %manifest.app_title, "App title");
        let cmd = &manifest.continue_command;
        info!(args = ?cmd.args, "Command");
        let launch = resolve_bridge_command(cmd, &self.config.bridge_path)?;

        // The socket is listening before the app can race to connect.
        let listener = ApiListener::start(&self.config.api_socket, self.api.clone()).map_err(
            |source| AgentError::ApiSocket {
                path: self.config.api_socket.display().to_string(),
                source,
            },
        )?;

        self.launch = Some(launch);
        self.listener = Some(listener);
        self.state = AgentState::AgentReady;
        Ok(())
    }

    /// Start the app and a thread that reports its exit.
    pub fn launch_app(&mut self) -> Result<(), AgentError> {
        self.check(AgentState::AppRunning)?;
        let Some(launch) = &self.launch else {
            return Err(AgentError::InvalidTransition {
                from: self.state.name(),
                to: AgentState::AppRunning.name(),
            });
        };

        let cmd = &launch.command;
        let mut env = LaunchEnv::new(&cmd.args[0]);
        env.args = cmd.args[1..].iter().map(OsString::from).collect();
        env.env = Some(
            cmd.env_pairs()
                .into_iter()
                .map(|(k, v)| (OsString::from(k), OsString::from(v)))
                .collect(),
        );
        let app = runtime::launch(env).map_err(AgentError::AppStart)?;

        let watched = app.clone();
        let events = self.events_tx.clone();
        thread::Builder::new()
            .name("app-watch".to_string())
            .spawn(move || {
                let report = watched.wait().map_err(|e| e.to_string());
                let _ = events.send(AgentEvent::AppExited(report));
            })
            .map_err(|e| AgentError::AppStart(e.into()))?;

        info!(port = launch.port, pid = app.pid(), "App started");
        self.app = Some(app);
        self.state = AgentState::AppRunning;
        Ok(())
    }

    /// Block until the app is gone.  Returns the agent's exit status.
    pub fn supervise(&mut self) -> Result<i32, AgentError> {
        self.check(AgentState::ShuttingDown)?;
        match self.events.recv() {
            Ok(AgentEvent::AppExited(Ok(report))) => {
                info!(%report, "App exited; shutting down grain");
            }
            Ok(AgentEvent::AppExited(Err(e))) => {
                error!(error = %e, "Lost track of app; shutting down grain");
            }
            // Unreachable while the agent holds a sender.
            Err(_) => error!("Agent event channel closed; shutting down grain"),
        }
        self.state = AgentState::ShuttingDown;
        Ok(APP_EXITED_STATUS)
    }

    /// Run the whole lifecycle.  Returns the agent's exit status.
    pub fn run(mut self) -> Result<i32, AgentError> {
        self.prepare()?;
        self.launch_app()?;
        self.supervise()
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Read, os::unix::net::UnixStream, path::Path};

    use super::*;
    use crate::{
        error::{CommandError, ManifestError},
        manifest::Command,
    };

    const BRIDGE: &str = "/sandstorm-http-bridge";

    fn write_manifest(dir: &Path, app: &[&str], env: &[&str]) -> AgentConfig {
        let mut args = vec![BRIDGE.to_string(), "8000".to_string(), "--".to_string()];
        args.extend(app.iter().map(|a| a.to_string()));
        let manifest = Manifest {
            app_title: "Test App".to_string(),
            continue_command: Command {
                args,
                env: env.iter().map(|e| e.to_string()).collect(),
            },
        };
        let manifest_path = dir.join("manifest");
        std::fs::write(&manifest_path, manifest.encode().unwrap()).unwrap();
        AgentConfig {
            manifest_path,
            api_socket: dir.join("api"),
            bridge_path: BRIDGE.to_string(),
        }
    }

    #[test]
    fn app_runs_with_manifest_environment() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let script = format!("printf %s \"$GREETING$EMPTY\" > {}", out.display());
        let config = write_manifest(
            dir.path(),
            &["/bin/sh", "-c", &script],
            &["GREETING=hello", "EMPTY="],
        );

        assert_eq!(Agent::new(config).run().unwrap(), APP_EXITED_STATUS);
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "hello");
    }

    #[test]
    fn states_advance_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_manifest(dir.path(), &["/bin/sh", "-c", "exit 3"], &[]);
        let api_socket = config.api_socket.clone();

        let mut agent = Agent::new(config);
        assert_eq!(agent.state(), AgentState::Init);
        agent.prepare().unwrap();
        assert_eq!(agent.state(), AgentState::AgentReady);

        // The socket accepts before the app exists.
        let mut conn = UnixStream::connect(&api_socket).unwrap();
        let mut buf = Vec::new();
        assert_eq!(conn.read_to_end(&mut buf).unwrap(), 0);

        agent.launch_app().unwrap();
        assert_eq!(agent.state(), AgentState::AppRunning);
        assert!(agent.app().is_some());
        assert_eq!(agent.supervise().unwrap(), APP_EXITED_STATUS);
        assert_eq!(agent.state(), AgentState::ShuttingDown);
        assert_eq!(
            agent.app().and_then(|a| a.exit_status()),
            Some(ExitReport::Exited(3))
        );
    }

    #[test]
    fn app_killed_by_signal_ends_agent() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_manifest(dir.path(), &["/bin/sh", "-c", "kill -9 $$"], &[]);

        let mut agent = Agent::new(config);
        agent.prepare().unwrap();
        agent.launch_app().unwrap();
        assert_eq!(agent.supervise().unwrap(), APP_EXITED_STATUS);
        assert_eq!(agent.state(), AgentState::ShuttingDown);
        assert_eq!(
            agent.app().and_then(|a| a.exit_status()),
            Some(ExitReport::Signaled(9))
        );
    }

    #[test]
    fn out_of_order_steps_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_manifest(dir.path(), &["/bin/true"], &[]);
        let mut agent = Agent::new(config);

        let err = agent.launch_app().unwrap_err();
        assert!(matches!(
            err,
            AgentError::InvalidTransition {
                from: "Init",
                to: "AppRunning"
            }
        ));
        assert!(matches!(
            agent.supervise(),
            Err(AgentError::InvalidTransition { .. })
        ));
        agent.prepare().unwrap();
        assert!(matches!(
            agent.prepare(),
            Err(AgentError::InvalidTransition {
                from: "AgentReady",
                to: "AgentReady"
            })
        ));
    }

    #[test]
    fn missing_manifest_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            manifest_path: dir.path().join("absent"),
            api_socket: dir.path().join("api"),
            bridge_path: BRIDGE.to_string(),
        };
        let err = Agent::new(config).run().unwrap_err();
        assert!(matches!(err, AgentError::Manifest(ManifestError::Io(_))));
        // Nothing listens when the manifest is unusable.
        assert!(!dir.path().join("api").exists());
    }

    #[test]
    fn non_bridge_command_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = write_manifest(dir.path(), &["/bin/true"], &[]);
        config.bridge_path = "/other-bridge".to_string();
        let err = Agent::new(config).run().unwrap_err();
        assert!(matches!(
            err,
            AgentError::Command(CommandError::NotBridge { .. })
        ));
    }

    #[test]
    fn unstartable_app_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_manifest(dir.path(), &["/nonexistent/app"], &[]);
        let mut agent = Agent::new(config);
        agent.prepare().unwrap();
        assert!(matches!(agent.launch_app(), Err(AgentError::AppStart(_))));
        assert_eq!(agent.state(), AgentState::AgentReady);
    }

    #[test]
    fn api_socket_in_use_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = write_manifest(dir.path(), &["/bin/true"], &[]);
        std::fs::write(&config.api_socket, b"").unwrap();
        assert!(matches!(
            Agent::new(config).run(),
            Err(AgentError::ApiSocket { .. })
        ));
    }
}
