//! Production bundler.
//!
//! The graph built from the entries is split into chunks, each module is
//! lowered from ES module syntax to a factory registered with a small
//! runtime, and the chunks, stylesheet, assets, `index.html` and
//! `manifest.json` are written to the output directory.

mod chunks;
mod emit;
mod html;
mod js;
mod lower;
mod runtime;
mod shake;

pub use chunks::{split_chunks, Chunk, ChunkIndex, ChunkPlan, SplitConfig};
pub use html::production_html;
pub use lower::{failing_module, lower_module, ImportBinding, LoweredModule};
pub use runtime::runtime_source;
pub use shake::{dead_exports, UsedExports};

use crate::builder::GraphBuilder;
use crate::config::{Mode, NexusConfig};
use crate::error::{Error, ModuleError};
use crate::graph::ModuleId;
use crate::platform::NexusContext;
use nexus_proto::{codes, BuildManifest, BuildSummary, ErrorPayload, BUILD_SUMMARY_SCHEMA_VERSION};
use rustc_hash::FxHashMap as HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Entry candidates tried, in order, when none are configured.
pub const DEFAULT_ENTRIES: &[&str] = &[
    "src/main.tsx",
    "src/index.tsx",
    "src/main.ts",
    "src/index.ts",
    "src/main.jsx",
    "src/index.jsx",
    "src/main.js",
    "src/index.js",
];

/// Result of a successful production build.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub out_dir: PathBuf,
    pub manifest: BuildManifest,
    /// Entry names, as keyed in the manifest.
    pub entries: Vec<String>,
    /// Modules bundled.
    pub modules: usize,
    pub warnings: Vec<String>,
    /// Every file written, including copies of `public/`.
    pub files: Vec<PathBuf>,
    pub duration: Duration,
}

impl BuildOutput {
    #[must_use]
    pub fn summary(&self) -> BuildSummary {
        BuildSummary {
            schema_version: BUILD_SUMMARY_SCHEMA_VERSION,
            ok: true,
            out_dir: self.out_dir.to_string_lossy().into_owned(),
            entries: self.entries.clone(),
            chunks: self.manifest.chunks.len(),
            modules: self.modules,
            warnings: self.warnings.clone(),
            error: None,
            duration_ms: u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Summary for a build that failed with `err`.
#[must_use]
pub fn failure_summary(err: &Error, out_dir: &Path, duration: Duration) -> BuildSummary {
    let code = match err {
        Error::ConfigRead { .. } | Error::ConfigParse { .. } => codes::CONFIG_INVALID,
        Error::Build(errors) if errors.len() == 1 => errors[0].code(),
        _ => codes::BUILD_FAILED,
    };
    BuildSummary {
        schema_version: BUILD_SUMMARY_SCHEMA_VERSION,
        ok: false,
        out_dir: out_dir.to_string_lossy().into_owned(),
        entries: Vec::new(),
        chunks: 0,
        modules: 0,
        warnings: Vec::new(),
        error: Some(ErrorPayload::new(code, err.to_string(), 0)),
        duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
    }
}

/// Entry files for `config`: the configured ones relative to the root, or
/// the first of [`DEFAULT_ENTRIES`] that exists.
pub fn resolve_entries(config: &NexusConfig) -> Result<Vec<PathBuf>, Error> {
    if !config.entries.is_empty() {
        return Ok(config
            .entries
            .iter()
            .map(|entry| {
                let path = config.root.join(entry);
                dunce::canonicalize(&path).unwrap_or(path)
            })
            .collect());
    }

    DEFAULT_ENTRIES
        .iter()
        .map(|candidate| config.root.join(candidate))
        .find(|path| path.is_file())
        .map(|path| vec![dunce::canonicalize(&path).unwrap_or(path)])
        .ok_or_else(|| Error::NoEntry {
            root: config.root.clone(),
            tried: DEFAULT_ENTRIES.iter().map(ToString::to_string).collect(),
        })
}

/// Run a production build for the context's configuration.
///
/// Errors in modules reachable through static imports fail the build.
/// Modules only reachable through `import()` are emitted as factories that
/// throw and reported as warnings.
pub fn build(ctx: &NexusContext) -> Result<BuildOutput, Error> {
    let started = Instant::now();
    let mut config = ctx.config().clone();
    let root = dunce::canonicalize(&config.root)
        .ok()
        .filter(|p| p.is_dir())
        .ok_or_else(|| Error::RootNotFound(config.root.clone()))?;
    config.root = root.clone();
    config.mode = Mode::Production;

    let entries = resolve_entries(&config)?;
    info!(root = %root.display(), entries = entries.len(), "Starting production build");

    let mut builder = GraphBuilder::new(&config, Arc::clone(ctx.pool()));
    let ids = builder.build_entries(&entries);

    let Diagnostics {
        errors,
        mut warnings,
        failed,
    } = collect_diagnostics(&builder, &ids);
    if !errors.is_empty() {
        warn!(errors = errors.len(), "Build failed");
        return Err(Error::Build(errors));
    }

    let plan = split_chunks(
        builder.graph(),
        &SplitConfig {
            inline_threshold: config.inline_threshold,
            config_hash: builder.config_hash(),
        },
    );
    warnings.extend(plan.cycles.iter().map(|c| c.describe(builder.graph(), &root)));
    for warning in &warnings {
        warn!(warning = %warning, "Build warning");
    }
    debug!(
        chunks = plan.chunks.len(),
        modules = plan.order.len(),
        "Chunks planned"
    );

    let out_dir = config.out_dir_abs();
    let modules = plan.order.len();
    let emitted = emit::emit(&mut builder, &plan, failed, &out_dir)?;

    let duration = started.elapsed();
    info!(
        out_dir = %out_dir.display(),
        chunks = emitted.manifest.chunks.len(),
        modules,
        files = emitted.files.len(),
        duration_ms = duration.as_millis(),
        "Build complete"
    );

    Ok(BuildOutput {
        out_dir,
        entries: emitted.manifest.entries.keys().cloned().collect(),
        manifest: emitted.manifest,
        modules,
        warnings,
        files: emitted.files,
        duration,
    })
}

struct Diagnostics {
    errors: Vec<ModuleError>,
    warnings: Vec<String>,
    failed: HashMap<ModuleId, ModuleError>,
}

/// Split module errors into fatal ones (statically reachable from an entry)
/// and warnings (reachable only through `import()`).
fn collect_diagnostics(builder: &GraphBuilder, entries: &[ModuleId]) -> Diagnostics {
    let graph = builder.graph();
    let fatal = graph.reachable(entries, false);
    let mut all: Vec<ModuleId> = graph.reachable(entries, true).into_iter().collect();
    all.sort_by(|a, b| graph.key(*a).path.cmp(&graph.key(*b).path));

    let mut diagnostics = Diagnostics {
        errors: Vec::new(),
        warnings: Vec::new(),
        failed: HashMap::default(),
    };
    // An entry that failed to load may have no node.
    for &entry in entries {
        if !graph.contains(entry) {
            diagnostics.errors.push(ModuleError::Read {
                path: graph.key(entry).path.clone(),
                message: "entry module could not be loaded".to_string(),
            });
        }
    }
    for id in all {
        let Some(node) = graph.get(id) else {
            continue;
        };
        let errors: Vec<ModuleError> = node
            .error
            .iter()
            .cloned()
            .chain(
                node.resolution_errors()
                    .map(|(_, e)| ModuleError::Resolution(e.clone())),
            )
            .collect();
        if fatal.contains(&id) {
            diagnostics.errors.extend(errors);
        } else {
            diagnostics
                .warnings
                .extend(errors.iter().map(|e| format!("{e} (dynamic import)")));
            if let Some(err) = &node.error {
                diagnostics.failed.insert(id, err.clone());
            }
        }
    }
    diagnostics
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_entries_prefers_configured() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.js"), "").unwrap();
        std::fs::write(dir.path().join("src/app.js"), "").unwrap();

        let config = NexusConfig::new(dir.path()).with_entries(["src/app.js"]);
        let entries = resolve_entries(&config).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].ends_with("src/app.js"));
    }

    #[test]
    fn test_resolve_entries_default_order() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/index.js"), "").unwrap();
        std::fs::write(dir.path().join("src/main.ts"), "").unwrap();

        let entries = resolve_entries(&NexusConfig::new(dir.path())).unwrap();
        assert!(entries[0].ends_with("src/main.ts"));
    }

    #[test]
    fn test_resolve_entries_none_found() {
        let dir = tempdir().unwrap();
        let err = resolve_entries(&NexusConfig::new(dir.path())).unwrap_err();
        match err {
            Error::NoEntry { tried, .. } => assert_eq!(tried.len(), DEFAULT_ENTRIES.len()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_failure_summary_codes() {
        let summary = failure_summary(
            &Error::other("boom"),
            Path::new("dist"),
            Duration::from_millis(5),
        );
        assert!(!summary.ok);
        assert_eq!(summary.duration_ms, 5);
        assert_eq!(summary.error.unwrap().code, codes::BUILD_FAILED);
    }
}
