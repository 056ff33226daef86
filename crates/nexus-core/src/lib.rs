//! Native build core for nexus.
//!
//! [`NexusContext`] is the entry point: it selects the native binding for the
//! host, owns the transform pool and exposes the two operations, a dev server
//! ([`NexusContext::start_server`]) and a production build
//! ([`NexusContext::build`]).

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]

pub mod builder;
pub mod bundle;
pub mod config;
pub mod dev;
pub mod error;
pub mod graph;
pub mod imports;
pub mod platform;
pub mod resolver;
pub mod transform;
pub mod watch;

pub use builder::{GraphBuilder, InvalidationReport};
pub use bundle::{resolve_entries, BuildOutput};
pub use config::{load_config, Mode, NexusConfig, Target};
pub use dev::{DevSession, ServerHandle};
pub use error::{Error, ModuleError};
pub use graph::{ModuleGraph, ModuleId};
pub use imports::{scan_imports, ImportKind, ImportRecord};
pub use platform::{load_binding, select_binding, supported_pairs, HostInfo, NexusContext};
pub use resolver::{RequestKind, ResolutionError, Resolver};
pub use watch::WatchBackend;

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
