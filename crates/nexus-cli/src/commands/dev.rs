//! `nexus dev` command implementation.

use miette::{IntoDiagnostic, Result};
use nexus_core::NexusContext;
use std::path::PathBuf;
use tracing::{info, info_span};

/// Dev server action.
#[derive(Debug, Clone)]
pub struct DevAction {
    pub cwd: PathBuf,
    /// Config file, relative to `cwd`.
    pub config: PathBuf,
    /// Overrides the configured port.
    pub port: Option<u16>,
    /// Overrides the configured bind address.
    pub host: Option<String>,
}

/// Serve until ctrl-c or SIGTERM, then shut down gracefully.
pub fn run(action: DevAction) -> Result<()> {
    let _span = info_span!("dev", cwd = %action.cwd.display()).entered();

    let mut config = super::load_config(&action.cwd, &action.config).into_diagnostic()?;
    if let Some(port) = action.port {
        config.port = port;
    }
    if let Some(host) = action.host {
        config.host = host;
    }
    let root = config.root.clone();
    let port = config.port;

    let ctx = NexusContext::load(config).into_diagnostic()?;
    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;

    runtime.block_on(async move {
        let server = ctx.start_server(&root, port).await.into_diagnostic()?;
        println!();
        println!("  nexus dev server running at:");
        println!();
        println!("  > Local:   http://{}/", server.local_addr());
        println!("  > Watch:   {:?}", server.watch_backend());
        println!();

        shutdown_signal().await;
        info!("Shutting down dev server");
        server.shutdown().await.into_diagnostic()
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
