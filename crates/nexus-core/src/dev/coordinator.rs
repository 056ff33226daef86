//! The coordinator thread.
//!
//! Sole owner of the [`GraphBuilder`]. HTTP handlers and the watcher talk to
//! it through [`Command`]s; it answers on oneshot channels. After every
//! mutation it publishes a fresh [`DevSnapshot`] and only then broadcasts the
//! matching [`ServerEvent`], so a client reacting to an event always finds
//! the new state.

use crate::builder::{GraphBuilder, InvalidationReport};
use crate::error::ModuleError;
use crate::graph::{ModuleId, ModuleKind};
use crate::imports::{rewrite_specifiers, scan_imports};
use crate::transform::mime_for;
use nexus_proto::{CacheStats, DevStatus, ErrorPayload, ServerEvent};
use nexus_util::fs::url_path;
use rustc_hash::FxHashMap as HashMap;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, PoisonError, RwLock};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

use super::client::module_preamble;

/// A module rendered for the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedModule {
    pub url: String,
    pub body: Arc<str>,
    pub content_type: &'static str,
    pub generation: u64,
}

/// Immutable view of everything the server can answer without the
/// coordinator.
#[derive(Debug, Clone, Default)]
pub struct DevSnapshot {
    pub generation: u64,
    modules: HashMap<PathBuf, Arc<ServedModule>>,
    pub module_count: usize,
    pub entries: Vec<String>,
    pub cache: CacheStats,
}

impl DevSnapshot {
    /// Rendered module for a canonical path.
    #[must_use]
    pub fn module(&self, path: &Path) -> Option<&Arc<ServedModule>> {
        self.modules.get(path)
    }

    /// Number of rendered modules.
    #[must_use]
    pub fn served(&self) -> usize {
        self.modules.len()
    }
}

/// Published snapshot, swapped wholesale on every mutation.
#[derive(Debug, Default)]
pub struct SnapshotCell(RwLock<Arc<DevSnapshot>>);

impl SnapshotCell {
    #[must_use]
    pub fn load(&self) -> Arc<DevSnapshot> {
        Arc::clone(&self.0.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn store(&self, snapshot: DevSnapshot) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
    }
}

/// Answer to a fetch.
#[derive(Debug, Clone)]
pub enum FetchReply {
    Module(Arc<ServedModule>),
    Failed {
        url: String,
        error: ModuleError,
        generation: u64,
    },
}

/// Work for the coordinator.
#[derive(Debug)]
pub enum Command {
    Fetch {
        path: PathBuf,
        /// Generation of the snapshot the requester missed in.
        known_generation: u64,
        reply: oneshot::Sender<FetchReply>,
    },
    FilesChanged {
        paths: Vec<PathBuf>,
        reply: oneshot::Sender<InvalidationReport>,
    },
    Status {
        reply: oneshot::Sender<DevStatus>,
    },
    Shutdown,
}

pub(crate) struct Coordinator {
    builder: GraphBuilder,
    snapshot: Arc<SnapshotCell>,
    events: broadcast::Sender<ServerEvent>,
}

impl Coordinator {
    pub(crate) fn new(
        builder: GraphBuilder,
        snapshot: Arc<SnapshotCell>,
        events: broadcast::Sender<ServerEvent>,
    ) -> Self {
        let coordinator = Self {
            builder,
            snapshot,
            events,
        };
        coordinator.publish(HashMap::default());
        coordinator
    }

    /// Serve commands until `Shutdown` or every sender is gone.
    pub(crate) fn run(mut self, rx: mpsc::Receiver<Command>) {
        while let Ok(command) = rx.recv() {
            match command {
                Command::Fetch {
                    path,
                    known_generation,
                    reply,
                } => {
                    let answer = self.fetch(&path, known_generation);
                    // The requester may have gone away
                    let _ = reply.send(answer);
                }
                Command::FilesChanged { paths, reply } => {
                    let report = self.files_changed(&paths);
                    let _ = reply.send(report);
                }
                Command::Status { reply } => {
                    let _ = reply.send(self.status());
                }
                Command::Shutdown => break,
            }
        }
        debug!("Coordinator stopped");
    }

    fn fetch(&mut self, path: &Path, known_generation: u64) -> FetchReply {
        let current = self.snapshot.load();
        if let Some(served) = current.module(path) {
            // Rendered by an earlier request that raced this one
            return FetchReply::Module(Arc::clone(served));
        }
        debug!(
            path = %path.display(),
            known_generation,
            generation = current.generation,
            "Cold module request"
        );

        let root = self.builder.root().to_path_buf();
        let url = url_path(&root, path);
        let generation = self.builder.generation();
        let failed = |error: ModuleError| FetchReply::Failed {
            url: url.clone(),
            error,
            generation,
        };

        if !path.starts_with(&root) && self.builder.graph().ids_for_path(path).is_empty() {
            return failed(ModuleError::OutsideRoot { path: url.clone() });
        }

        let key = self.builder.key_for(path);
        let loaded = self.builder.ensure_module(key.clone()).map(|node| node.id);

        // A module no entry reaches becomes a root of its own
        if let Some(id) = self.builder.graph().id_of(&key) {
            let graph = self.builder.graph();
            if graph.contains(id) && path.is_file() && graph.affected_roots(id).is_empty() {
                debug!(module = %url, "Promoting lazily requested module to entry");
                self.builder.mark_entry(id);
            }
        }

        let id = match loaded {
            Ok(id) => id,
            Err(error) => return failed(error),
        };
        match self.render(id) {
            Ok(served) => {
                let served = Arc::new(served);
                let mut modules = current.modules.clone();
                modules.insert(path.to_path_buf(), Arc::clone(&served));
                self.publish(modules);
                FetchReply::Module(served)
            }
            Err(error) => failed(error),
        }
    }

    /// Transformed code with import specifiers pointing at served URLs.
    fn render(&mut self, id: ModuleId) -> Result<ServedModule, ModuleError> {
        let output = self.builder.output(id)?;
        let root = self.builder.root();
        let graph = self.builder.graph();
        let url = url_path(root, &graph.key(id).path);
        let edges = graph.get(id).map(|n| n.edges.as_slice()).unwrap_or_default();

        let records = scan_imports(&output.code);
        let mut code = rewrite_specifiers(&output.code, &records, |record| {
            let target = edges
                .iter()
                .find(|e| e.specifier == record.specifier && e.kind == record.kind)?
                .resolved()?;
            let path = &graph.key(target).path;
            let target_url = url_path(root, path);
            Some(match ModuleKind::from_path(path) {
                ModuleKind::Script => target_url,
                _ => format!("{target_url}?import"),
            })
        });
        if code.contains("import.meta.hot") {
            code.insert_str(0, &module_preamble(&url));
        }

        Ok(ServedModule {
            url,
            body: Arc::from(code),
            content_type: mime_for(Path::new("module.js")),
            generation: self.builder.generation(),
        })
    }

    fn files_changed(&mut self, paths: &[PathBuf]) -> InvalidationReport {
        let before = self.builder.generation();
        let report = self.builder.invalidate(paths);
        if report.generation == before {
            return report;
        }

        let mut modules = if report.full_reload.is_some() {
            HashMap::default()
        } else {
            self.snapshot.load().modules.clone()
        };
        for id in report.changed.iter().chain(&report.removed) {
            modules.remove(&self.builder.graph().key(*id).path);
        }
        self.publish(modules);

        let generation = report.generation;
        if let Some(reason) = &report.full_reload {
            info!(generation, reason = %reason, "Full reload");
            self.broadcast(ServerEvent::FullReload {
                generation,
                reason: Some(reason.clone()),
            });
        } else if !report.changed_ids.is_empty() {
            info!(generation, modules = report.changed_ids.len(), "Update");
            self.broadcast(ServerEvent::Update {
                changed_ids: report.changed_ids.clone(),
                generation,
            });
        }
        for (url, error) in &report.errors {
            warn!(module = %url, code = error.code(), error = %error, "Module failed to rebuild");
            self.broadcast(ServerEvent::Error {
                generation,
                error: ErrorPayload::new(error.code(), error.to_string(), generation)
                    .with_module(url.clone()),
            });
        }
        report
    }

    fn status(&self) -> DevStatus {
        let snapshot = self.snapshot.load();
        DevStatus {
            generation: snapshot.generation,
            modules: snapshot.module_count,
            entries: snapshot.entries.clone(),
            sessions: 0,
            cache: snapshot.cache,
        }
    }

    fn publish(&self, modules: HashMap<PathBuf, Arc<ServedModule>>) {
        let graph = self.builder.graph();
        self.snapshot.store(DevSnapshot {
            generation: self.builder.generation(),
            modules,
            module_count: graph.len(),
            entries: graph
                .entries()
                .into_iter()
                .map(|id| self.builder.url_of(id))
                .collect(),
            cache: self.builder.cache().stats(),
        });
    }

    fn broadcast(&self, event: ServerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NexusConfig;
    use std::fs;
    use tempfile::tempdir;

    fn coordinator(root: &Path) -> (Coordinator, Arc<SnapshotCell>, broadcast::Receiver<ServerEvent>) {
        let pool = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap());
        let builder = GraphBuilder::new(&NexusConfig::new(root), pool);
        let snapshot = Arc::new(SnapshotCell::default());
        let (tx, rx) = broadcast::channel(16);
        (Coordinator::new(builder, Arc::clone(&snapshot), tx), snapshot, rx)
    }

    fn project(files: &[(&str, &str)]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        for (name, body) in files {
            let path = root.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }
        (dir, root)
    }

    fn served(reply: FetchReply) -> Arc<ServedModule> {
        match reply {
            FetchReply::Module(m) => m,
            FetchReply::Failed { error, .. } => panic!("fetch failed: {error}"),
        }
    }

    #[test]
    fn test_fetch_rewrites_specifiers_and_publishes() {
        let (_dir, root) = project(&[
            ("src/main.js", "import { x } from './x';\nimport './style.css';\nimport 'node:fs';\n"),
            ("src/x.js", "export const x = 1;\n"),
            ("src/style.css", ".a {}\n"),
        ]);
        let (mut c, snapshot, _rx) = coordinator(&root);
        let main = root.join("src/main.js");

        let module = served(c.fetch(&main, 0));
        assert!(module.body.contains("from '/src/x.js'"));
        assert!(module.body.contains("import '/src/style.css?import'"));
        assert!(module.body.contains("import 'node:fs'"));
        assert_eq!(module.url, "/src/main.js");

        let snap = snapshot.load();
        assert!(snap.module(&main).is_some());
        assert_eq!(snap.entries, vec!["/src/main.js"]);
        assert_eq!(snap.module_count, 3);
    }

    #[test]
    fn test_dependency_fetch_is_not_promoted() {
        let (_dir, root) = project(&[
            ("main.js", "import './dep.js';\n"),
            ("dep.js", "export {};\n"),
        ]);
        let (mut c, snapshot, _rx) = coordinator(&root);
        served(c.fetch(&root.join("main.js"), 0));
        served(c.fetch(&root.join("dep.js"), 0));
        assert_eq!(snapshot.load().entries, vec!["/main.js"]);
    }

    #[test]
    fn test_hot_modules_get_preamble() {
        let (_dir, root) = project(&[
            ("main.js", "import './app.css';\n"),
            ("app.css", "body { color: red; }\n"),
        ]);
        let (mut c, _snapshot, _rx) = coordinator(&root);
        served(c.fetch(&root.join("main.js"), 0));
        let css = served(c.fetch(&root.join("app.css"), 0));
        assert!(css.body.starts_with("import { createHotContext as __nexus_hot__ }"));
        assert!(css.body.contains("__nexus_hot__(\"/app.css\")"));
    }

    #[test]
    fn test_missing_module_fails_without_promotion() {
        let (_dir, root) = project(&[]);
        let (mut c, snapshot, _rx) = coordinator(&root);
        match c.fetch(&root.join("nope.js"), 0) {
            FetchReply::Failed { error, url, .. } => {
                assert!(error.is_not_found());
                assert_eq!(url, "/nope.js");
            }
            FetchReply::Module(_) => panic!("expected failure"),
        }
        assert!(snapshot.load().entries.is_empty());
    }

    #[test]
    fn test_outside_root_is_refused() {
        let (_dir, root) = project(&[]);
        let other = tempdir().unwrap();
        let file = dunce::canonicalize(other.path()).unwrap().join("secret.js");
        fs::write(&file, "export {};\n").unwrap();
        let (mut c, _snapshot, _rx) = coordinator(&root);
        assert!(matches!(
            c.fetch(&file, 0),
            FetchReply::Failed {
                error: ModuleError::OutsideRoot { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_change_publishes_before_broadcast() {
        let (_dir, root) = project(&[
            ("main.js", "import { b } from './b.js';\n"),
            ("b.js", "export const b = 1;\n"),
        ]);
        let (mut c, snapshot, mut rx) = coordinator(&root);
        served(c.fetch(&root.join("main.js"), 0));
        served(c.fetch(&root.join("b.js"), 0));
        fs::write(root.join("b.js"), "export const b = 2;\n").unwrap();

        let report = c.files_changed(&[root.join("b.js")]);
        assert_eq!(report.generation, 1);
        let snap = snapshot.load();
        assert_eq!(snap.generation, 1);
        assert!(snap.module(&root.join("b.js")).is_none());
        assert!(snap.module(&root.join("main.js")).is_none());

        let event = rx.try_recv().unwrap();
        assert_eq!(
            event,
            ServerEvent::Update {
                changed_ids: vec!["/b.js".into(), "/main.js".into()],
                generation: 1
            }
        );

        let again = served(c.fetch(&root.join("b.js"), 1));
        assert!(again.body.contains("= 2"));
        assert_eq!(again.generation, 1);
    }

    #[test]
    fn test_noop_change_broadcasts_nothing() {
        let (_dir, root) = project(&[("main.js", "export {};\n")]);
        let (mut c, _snapshot, mut rx) = coordinator(&root);
        served(c.fetch(&root.join("main.js"), 0));
        let report = c.files_changed(&[root.join("main.js")]);
        assert!(report.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_broken_edit_broadcasts_error() {
        let (_dir, root) = project(&[
            ("main.js", "import data from './data.json';\n"),
            ("data.json", "{\"ok\": true}"),
        ]);
        let (mut c, _snapshot, mut rx) = coordinator(&root);
        served(c.fetch(&root.join("main.js"), 0));
        fs::write(root.join("data.json"), "{ broken").unwrap();

        c.files_changed(&[root.join("data.json")]);
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::Update { .. }));
        match rx.try_recv().unwrap() {
            ServerEvent::Error { error, generation } => {
                assert_eq!(generation, 1);
                assert_eq!(error.code, "TRANSFORM_FAILED");
                assert_eq!(error.module.as_deref(), Some("/data.json"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
