// SPDX-License-Identifier: MIT

//! The grain-local API socket.

use std::{
    io,
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use tracing::{info, warn};

/// Delay before accepting again after a failed accept.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Serves one connection accepted on the API socket.
pub trait LocalApi: Send + Sync + 'static {
    fn serve(&self, conn: UnixStream) -> io::Result<()>;
}

/// Accepts connections and closes them.
#[derive(Debug, Default)]
pub struct ClosingApi;

impl LocalApi for ClosingApi {
    fn serve(&self, conn: UnixStream) -> io::Result<()> {
        info!("Got a connection to the api socket");
        drop(conn);
        Ok(())
    }
}

/// A bound API socket whose accept loop runs on its own thread.
pub struct ApiListener {
    path: PathBuf,
}

impl ApiListener {
    /// Bind `path` and start accepting.  Fails if the path already exists.
    pub fn start(path: &Path, api: Arc<dyn LocalApi>) -> io::Result<ApiListener> {
        let listener = UnixListener::bind(path)?;
        thread::Builder::new()
            .name("api-accept".to_string())
            .spawn(move || accept_loop(listener, api))?;
        info!(path = %path.display(), "listening on api socket");
        Ok(ApiListener {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn accept_loop(listener: UnixListener, api: Arc<dyn LocalApi>) {
    loop {
        match listener.accept() {
            Ok((conn, _)) => {
                if let Err(e) = api.serve(conn) {
                    warn!(error = %e, "api connection failed");
                }
            }
            Err(e) => {
                warn!(error = %e, "accept on api socket failed");
                thread::sleep(ACCEPT_RETRY_DELAY);
            }
        }
    }
}
