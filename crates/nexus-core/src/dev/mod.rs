//! Dev server.
//!
//! Modules are discovered and transformed on first request. A single
//! coordinator thread owns the graph; HTTP handlers answer warm requests from
//! the published snapshot and queue cold ones. File changes flow from the
//! watcher through the debouncer into invalidation passes, and the results
//! reach browsers over the live-update socket.

pub mod client;
mod coordinator;
mod server;
pub mod session;

pub use coordinator::{DevSnapshot, ServedModule};
pub use session::DevSession;

use crate::builder::{GraphBuilder, InvalidationReport};
use crate::bundle;
use crate::error::Error;
use crate::platform::NexusContext;
use crate::watch::{self, FileWatcher, WatchBackend, WatchFilter};
use coordinator::{Command, Coordinator, SnapshotCell};
use nexus_proto::{DevStatus, ServerEvent};
use server::DevState;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tokio::sync::{broadcast, watch as signal};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Buffered live-update events per subscriber before it counts as lagged.
const EVENT_BUFFER: usize = 64;

/// A running dev server. Dropping the handle stops it.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    state: Arc<DevState>,
    server: Option<JoinHandle<std::io::Result<()>>>,
    coordinator: Option<std::thread::JoinHandle<()>>,
    watcher: Option<FileWatcher>,
}

impl ServerHandle {
    /// Address the server is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Generation of the currently published snapshot.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.snapshot().generation
    }

    #[must_use]
    pub fn watch_backend(&self) -> WatchBackend {
        self.watcher
            .as_ref()
            .map_or(WatchBackend::Disabled, FileWatcher::backend)
    }

    /// Run an invalidation pass for `paths` now, bypassing the watcher.
    pub async fn notify_changed(&self, paths: Vec<PathBuf>) -> Result<InvalidationReport, Error> {
        self.state.files_changed(paths).await
    }

    pub async fn status(&self) -> Result<DevStatus, Error> {
        self.state.status().await
    }

    /// Receive every live-update event the server broadcasts.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.state.events.subscribe()
    }

    /// Stop accepting connections, close sessions and wait for the server
    /// and coordinator to finish.
    pub async fn shutdown(mut self) -> Result<(), Error> {
        self.signal_stop();
        // Closing the watcher closes the debounce loop's channel
        self.watcher.take();

        if let Some(server) = self.server.take() {
            server
                .await
                .map_err(|e| Error::other(format!("dev server task failed: {e}")))??;
        }
        if let Some(coordinator) = self.coordinator.take() {
            tokio::task::spawn_blocking(move || coordinator.join())
                .await
                .map_err(|e| Error::other(format!("coordinator join failed: {e}")))?
                .map_err(|_| Error::other("coordinator thread panicked"))?;
        }
        info!(addr = %self.local_addr, "Dev server stopped");
        Ok(())
    }

    fn signal_stop(&self) {
        let _ = self.state.shutdown.send(true);
        let _ = self.state.commands.send(Command::Shutdown);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if self.server.is_some() {
            self.signal_stop();
        }
    }
}

/// Start serving `root_dir` on `port` (0 picks a free port).
pub(crate) async fn start_server(
    ctx: &NexusContext,
    root_dir: &Path,
    port: u16,
) -> Result<ServerHandle, Error> {
    let root = dunce::canonicalize(root_dir)
        .ok()
        .filter(|p| p.is_dir())
        .ok_or_else(|| Error::RootNotFound(root_dir.to_path_buf()))?;

    let mut config = ctx.config().clone();
    config.root = root.clone();
    config.port = port;

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), port))
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                Error::PortInUse { port, source: e }
            } else {
                Error::Io(e)
            }
        })?;
    let local_addr = listener.local_addr()?;

    let (events, _) = broadcast::channel(EVENT_BUFFER);
    let snapshot = Arc::new(SnapshotCell::default());
    let builder = GraphBuilder::new(&config, Arc::clone(ctx.pool()));
    let coordinator = Coordinator::new(builder, Arc::clone(&snapshot), events.clone());
    let (commands, command_rx) = mpsc::channel();
    let coordinator = std::thread::Builder::new()
        .name("nexus-coordinator".to_string())
        .spawn(move || coordinator.run(command_rx))?;

    let entry_url = match bundle::resolve_entries(&config) {
        Ok(entries) => entries
            .first()
            .map(|p| nexus_util::fs::url_path(&root, p)),
        Err(e) => {
            debug!(error = %e, "No default entry for generated index.html");
            None
        }
    };

    let (shutdown, mut shutdown_rx) = signal::channel(false);
    let state = Arc::new(DevState::new(
        root.clone(),
        snapshot,
        commands,
        events,
        shutdown,
        entry_url,
    ));

    let watcher = if config.watch {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let watcher = FileWatcher::start(
            &root,
            WatchFilter::new(&root, config.out_dir_abs()),
            tx,
        );
        let state = Arc::clone(&state);
        tokio::spawn(watch::run_debounced(
            rx,
            Duration::from_millis(config.debounce_ms),
            move |batch| {
                let state = Arc::clone(&state);
                async move {
                    if let Err(e) = state.files_changed(batch).await {
                        warn!(error = %e, "Invalidation pass failed");
                    }
                }
            },
        ));
        Some(watcher)
    } else {
        None
    };

    let app = server::router(Arc::clone(&state));
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await
    });

    info!(
        addr = %local_addr,
        root = %root.display(),
        watch = watcher.as_ref().map_or("disabled", |w| w.backend().as_str()),
        "Dev server running"
    );

    Ok(ServerHandle {
        local_addr,
        state,
        server: Some(server),
        coordinator: Some(coordinator),
        watcher,
    })
}
