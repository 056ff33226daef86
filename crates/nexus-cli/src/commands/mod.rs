//! Subcommand implementations.

pub mod build;
pub mod dev;
pub mod platform;

use nexus_core::{Error, NexusConfig};
use std::path::Path;
use tracing::debug;

/// Load the config for `cwd`. Flags are applied on top by the caller.
fn load_config(cwd: &Path, config: &Path) -> Result<NexusConfig, Error> {
    let root = absolute_root(cwd);
    let (file, config) = nexus_core::load_config(&root, Some(config))?;
    match &file {
        Some(path) => debug!(config = %path.display(), "Loaded config file"),
        None => debug!("No config file, using defaults"),
    }
    Ok(config)
}

/// Absolute form of the working directory. A directory that does not exist
/// is passed through so the core can report it.
fn absolute_root(cwd: &Path) -> std::path::PathBuf {
    dunce::canonicalize(cwd).unwrap_or_else(|_| cwd.to_path_buf())
}
