//! Incremental module graph builder.
//!
//! The builder owns the resolver, graph and transform cache. Modules are
//! loaded in breadth-first waves: each wave's read/hash/transform jobs run on
//! the transform pool and report back through a result channel; the calling
//! thread applies results in job order, resolves imports and queues the next
//! wave. Only the calling thread ever mutates the graph.

mod invalidate;

pub use invalidate::InvalidationReport;

use crate::config::NexusConfig;
use crate::error::ModuleError;
use crate::graph::{
    CycleWarning, EdgeTarget, ImportEdge, ModuleGraph, ModuleId, ModuleKey, ModuleKind,
    ModuleNode,
};
use crate::imports::scan_imports;
use crate::resolver::{RequestKind, Resolver};
use crate::transform::{
    NexusTransformer, TransformCache, TransformConfig, TransformError, TransformInput,
    TransformOutput, Transformer,
};
use rustc_hash::FxHashSet as HashSet;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

struct Job {
    index: usize,
    id: ModuleId,
    path: PathBuf,
    kind: ModuleKind,
    /// Content hash of a still-valid cache entry.
    cached_hash: Option<String>,
}

enum Outcome {
    /// Source unchanged from the cached entry; transform skipped.
    Cached { source: Arc<[u8]>, hash: String },
    Transformed {
        source: Arc<[u8]>,
        hash: String,
        output: Result<TransformOutput, TransformError>,
        cost: Duration,
    },
    ReadFailed(std::io::Error),
}

struct JobResult {
    index: usize,
    generation: u64,
    id: ModuleId,
    outcome: Outcome,
}

/// Owns the graph and everything that mutates it.
#[derive(Debug)]
pub struct GraphBuilder {
    root: PathBuf,
    config: TransformConfig,
    config_hash: String,
    resolver: Resolver,
    graph: ModuleGraph,
    cache: TransformCache,
    transformer: Arc<dyn Transformer>,
    pool: Arc<rayon::ThreadPool>,
}

impl GraphBuilder {
    #[must_use]
    pub fn new(config: &NexusConfig, pool: Arc<rayon::ThreadPool>) -> Self {
        Self::with_transformer(config, pool, Arc::new(NexusTransformer))
    }

    #[must_use]
    pub fn with_transformer(
        config: &NexusConfig,
        pool: Arc<rayon::ThreadPool>,
        transformer: Arc<dyn Transformer>,
    ) -> Self {
        let transform_config = TransformConfig::from_config(config);
        Self {
            root: config.root.clone(),
            config_hash: transform_config.hash(),
            config: transform_config,
            resolver: Resolver::from_config(config),
            graph: ModuleGraph::new(),
            cache: TransformCache::new(config.cache_max_entries),
            transformer,
            pool,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn graph(&self) -> &ModuleGraph {
        &self.graph
    }

    #[must_use]
    pub fn cache(&self) -> &TransformCache {
        &self.cache
    }

    #[must_use]
    pub fn transform_config(&self) -> &TransformConfig {
        &self.config
    }

    #[must_use]
    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.graph.generation()
    }

    /// Key for a file addressed directly rather than through an import.
    #[must_use]
    pub fn key_for(&self, path: &Path) -> ModuleKey {
        self.resolver.key_for(path, RequestKind::Import)
    }

    /// Root-relative URL of a module.
    #[must_use]
    pub fn url_of(&self, id: ModuleId) -> String {
        nexus_util::fs::url_path(&self.root, &self.graph.key(id).path)
    }

    /// Load `key` and everything it reaches. Existing nodes are returned
    /// as is.
    pub fn ensure_module(&mut self, key: ModuleKey) -> Result<&ModuleNode, ModuleError> {
        let id = self.graph.intern(key);
        if !self.graph.contains(id) {
            self.load(vec![id]);
        }
        let node = self
            .graph
            .get(id)
            .ok_or_else(|| ModuleError::Read {
                path: self.graph.key(id).path.clone(),
                message: "module was not loaded".to_string(),
            })?;
        if let Some(err) = &node.error {
            return Err(err.clone());
        }
        Ok(node)
    }

    /// Mark `path` as a root and load its subgraph.
    pub fn add_entry(&mut self, path: &Path) -> ModuleId {
        let id = self.graph.intern(self.key_for(path));
        self.graph.add_entry(id);
        if !self.graph.contains(id) {
            self.load(vec![id]);
        }
        id
    }

    /// Mark an already interned module as a root.
    pub fn mark_entry(&mut self, id: ModuleId) {
        self.graph.add_entry(id);
    }

    /// Eagerly load every entry in `paths`.
    pub fn build_entries(&mut self, paths: &[PathBuf]) -> Vec<ModuleId> {
        let ids: Vec<ModuleId> = paths
            .iter()
            .map(|p| {
                let id = self.graph.intern(self.key_for(p));
                self.graph.add_entry(id);
                id
            })
            .collect();
        let pending: Vec<ModuleId> = ids
            .iter()
            .copied()
            .filter(|&id| !self.graph.contains(id))
            .collect();
        self.load(pending);
        ids
    }

    /// Transformed output for a loaded module without errors, transforming
    /// again if the entry was evicted.
    pub fn output(&mut self, id: ModuleId) -> Result<Arc<TransformOutput>, ModuleError> {
        let node = self.graph.get(id).ok_or_else(|| ModuleError::Read {
            path: self.graph.key(id).path.clone(),
            message: "module is not loaded".to_string(),
        })?;
        if let Some(err) = &node.error {
            return Err(err.clone());
        }
        let (path, kind, source, hash) = (
            node.key.path.clone(),
            node.kind,
            Arc::clone(&node.source),
            node.hash.clone(),
        );
        let transformer = Arc::clone(&self.transformer);
        let config = &self.config;
        let graph = &mut self.graph;
        let resolver = &self.resolver;
        let output = self
            .cache
            .get_or_transform(id, &hash, &self.config_hash, || {
                let output = transformer.transform(
                    &TransformInput {
                        path: &path,
                        kind,
                        source: &source,
                    },
                    config,
                )?;
                let deps = intern_extra_deps(graph, resolver, &output);
                Ok((output, deps))
            })?;
        Ok(output)
    }

    /// Cycles on static edges reachable from the entries.
    #[must_use]
    pub fn cycles(&self) -> Vec<CycleWarning> {
        self.graph.linearize().1
    }

    /// Load `start` and every module newly discovered from it, one wave at
    /// a time. Returns every id loaded.
    fn load(&mut self, start: Vec<ModuleId>) -> Vec<ModuleId> {
        let mut queued: HashSet<ModuleId> = start.iter().copied().collect();
        let mut wave = start;
        let mut loaded = Vec::new();
        let mut waves = 0usize;

        while !wave.is_empty() {
            waves += 1;
            let jobs = self.jobs_for(&wave);
            loaded.extend(wave.iter().copied());
            let mut next = Vec::new();
            for result in self.run_wave(jobs) {
                for discovered in self.apply(result) {
                    if queued.insert(discovered) {
                        next.push(discovered);
                    }
                }
            }
            wave = next;
        }
        debug!(modules = loaded.len(), waves, "Loaded modules");
        loaded
    }

    fn jobs_for(&self, ids: &[ModuleId]) -> Vec<Job> {
        ids.iter()
            .enumerate()
            .map(|(index, &id)| {
                let path = self.graph.key(id).path.clone();
                Job {
                    index,
                    id,
                    kind: ModuleKind::from_path(&path),
                    path,
                    cached_hash: self
                        .cache
                        .probe(id, &self.config_hash)
                        .map(str::to_string),
                }
            })
            .collect()
    }

    /// Run jobs on the pool. Results come back in job order, tagged with the
    /// generation they started under.
    fn run_wave(&self, jobs: Vec<Job>) -> Vec<JobResult> {
        let generation = self.graph.generation();
        let (tx, rx) = mpsc::channel();
        let transformer = &self.transformer;
        let config = &self.config;

        self.pool.scope(|s| {
            for job in jobs {
                let tx = tx.clone();
                s.spawn(move |_| {
                    let outcome = run_job(&job, transformer.as_ref(), config);
                    // The receiver outlives the scope
                    let _ = tx.send(JobResult {
                        index: job.index,
                        generation,
                        id: job.id,
                        outcome,
                    });
                });
            }
        });
        drop(tx);

        let mut results: Vec<JobResult> = rx.into_iter().collect();
        results.sort_by_key(|r| r.index);
        results
    }

    /// Fold one job result into the graph. Returns resolved targets that are
    /// not loaded yet.
    fn apply(&mut self, result: JobResult) -> Vec<ModuleId> {
        let generation = self.graph.generation();
        if result.generation != generation {
            debug!(
                module = %result.id,
                started = result.generation,
                current = generation,
                "Discarding stale transform result"
            );
            return Vec::new();
        }

        let id = result.id;
        let key = self.graph.key(id).clone();
        let previous_edges = self.graph.get(id).map(|n| n.edges.clone());
        let kind = ModuleKind::from_path(&key.path);

        let (source, hash, output) = match result.outcome {
            Outcome::ReadFailed(err) => {
                let node = ModuleNode {
                    id,
                    key: key.clone(),
                    source: Arc::from(Vec::new()),
                    hash: String::new(),
                    kind,
                    edges: Vec::new(),
                    is_entry: false,
                    generation,
                    error: Some(ModuleError::read(&key.path, &err)),
                };
                self.cache.evict(id);
                self.graph.insert(node);
                return Vec::new();
            }
            Outcome::Cached { source, hash } => {
                let output = match self.cache.get(id, &hash, &self.config_hash) {
                    Some(output) => Ok(output),
                    None => self.transform_now(id, &key.path, kind, &source, &hash),
                };
                (source, hash, output)
            }
            Outcome::Transformed {
                source,
                hash,
                output,
                cost,
            } => {
                let output = output.map(|output| {
                    let deps = intern_extra_deps(&mut self.graph, &self.resolver, &output);
                    let output = Arc::new(output);
                    self.cache
                        .insert(id, &hash, &self.config_hash, Arc::clone(&output), deps, cost);
                    output
                });
                (source, hash, output)
            }
        };

        let (edges, error) = match output {
            Ok(output) => (self.resolve_edges(&key.path, &output.code), None),
            // Keep the last good edges so a broken edit does not drop the subgraph
            Err(err) => (previous_edges.unwrap_or_default(), Some(ModuleError::Transform(err))),
        };

        let discovered: Vec<ModuleId> = edges
            .iter()
            .filter_map(ImportEdge::resolved)
            .filter(|&target| !self.graph.contains(target))
            .collect();

        self.graph.insert(ModuleNode {
            id,
            key,
            source,
            hash,
            kind,
            edges,
            is_entry: false,
            generation,
            error,
        });
        discovered
    }

    fn transform_now(
        &mut self,
        id: ModuleId,
        path: &Path,
        kind: ModuleKind,
        source: &Arc<[u8]>,
        hash: &str,
    ) -> Result<Arc<TransformOutput>, TransformError> {
        let transformer = Arc::clone(&self.transformer);
        let config = &self.config;
        let graph = &mut self.graph;
        let resolver = &self.resolver;
        self.cache.get_or_transform(id, hash, &self.config_hash, || {
            let output = transformer.transform(
                &TransformInput {
                    path,
                    kind,
                    source,
                },
                config,
            )?;
            let deps = intern_extra_deps(graph, resolver, &output);
            Ok((output, deps))
        })
    }

    /// Scan transformed code and resolve each distinct import.
    fn resolve_edges(&mut self, path: &Path, code: &str) -> Vec<ImportEdge> {
        let mut seen: HashSet<(String, crate::imports::ImportKind)> = HashSet::default();
        let mut edges = Vec::new();
        for record in scan_imports(code) {
            if !seen.insert((record.specifier.clone(), record.kind)) {
                continue;
            }
            let target = match self
                .resolver
                .resolve(&record.specifier, path, record.kind.request_kind())
            {
                Ok(key) => EdgeTarget::Resolved(self.graph.intern(key)),
                Err(err) => {
                    trace!(specifier = %record.specifier, error = %err, "Unresolved import");
                    EdgeTarget::Unresolved(err)
                }
            };
            edges.push(ImportEdge {
                specifier: record.specifier,
                kind: record.kind,
                target,
            });
        }
        edges
    }

    /// Re-resolve every edge of `id` against the current filesystem.
    /// Returns whether any target changed.
    fn relink(&mut self, id: ModuleId) -> bool {
        let Some(node) = self.graph.get(id) else {
            return false;
        };
        let path = node.key.path.clone();
        let old = node.edges.clone();
        let mut new = Vec::with_capacity(old.len());
        for edge in &old {
            let target = match self.resolver.resolve(&edge.specifier, &path, edge.kind.request_kind()) {
                Ok(key) => EdgeTarget::Resolved(self.graph.intern(key)),
                Err(err) => EdgeTarget::Unresolved(err),
            };
            new.push(ImportEdge {
                specifier: edge.specifier.clone(),
                kind: edge.kind,
                target,
            });
        }
        if new == old {
            return false;
        }
        self.graph.set_edges(id, new);
        true
    }
}

/// Intern the extra files a transform read so changes to them can be traced
/// back to the owning module.
fn intern_extra_deps(
    graph: &mut ModuleGraph,
    resolver: &Resolver,
    output: &TransformOutput,
) -> Vec<ModuleId> {
    output
        .extra_deps
        .iter()
        .map(|p| graph.intern(resolver.key_for(p, RequestKind::Import)))
        .collect()
}

fn run_job(job: &Job, transformer: &dyn Transformer, config: &TransformConfig) -> Outcome {
    let source: Arc<[u8]> = match std::fs::read(&job.path) {
        Ok(bytes) => Arc::from(bytes),
        Err(err) => return Outcome::ReadFailed(err),
    };
    let hash = nexus_util::hash::blake3_bytes(&source);
    if job.cached_hash.as_deref() == Some(hash.as_str()) {
        return Outcome::Cached { source, hash };
    }
    let start = Instant::now();
    let output = transformer.transform(
        &TransformInput {
            path: &job.path,
            kind: job.kind,
            source: &source,
        },
        config,
    );
    Outcome::Transformed {
        source,
        hash,
        output,
        cost: start.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn pool() -> Arc<rayon::ThreadPool> {
        Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap())
    }

    fn builder(root: &Path) -> GraphBuilder {
        GraphBuilder::new(&NexusConfig::new(root), pool())
    }

    fn project() -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        fs::write(root.join("a.js"), "import { b } from './b';\nconsole.log(b);\n").unwrap();
        fs::write(root.join("b.js"), "import { c } from './c';\nexport const b = c + 1;\n").unwrap();
        fs::write(root.join("c.js"), "export const c = 1;\n").unwrap();
        (dir, root)
    }

    #[test]
    fn test_entry_loads_reachable_subgraph() {
        let (_dir, root) = project();
        let mut builder = builder(&root);
        let a = builder.add_entry(&root.join("a.js"));

        assert_eq!(builder.graph().len(), 3);
        let node = builder.graph().get(a).unwrap();
        assert!(node.is_entry);
        assert_eq!(node.edges.len(), 1);
        assert_eq!(builder.url_of(a), "/a.js");
        assert_eq!(builder.cache().stats().misses, 3);
    }

    #[test]
    fn test_ensure_module_is_idempotent() {
        let (_dir, root) = project();
        let mut builder = builder(&root);
        let key = builder.key_for(&root.join("b.js"));
        let first = builder.ensure_module(key.clone()).unwrap().hash.clone();
        let misses = builder.cache().stats().misses;
        let second = builder.ensure_module(key).unwrap().hash.clone();
        assert_eq!(first, second);
        assert_eq!(builder.cache().stats().misses, misses);
        assert_eq!(builder.graph().len(), 2);
    }

    #[test]
    fn test_unresolved_import_is_recorded_on_edge() {
        let dir = tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        fs::write(root.join("main.js"), "import './missing';\nimport 'node:fs';\n").unwrap();
        let mut builder = builder(&root);
        let id = builder.add_entry(&root.join("main.js"));

        let node = builder.graph().get(id).unwrap();
        assert!(node.error.is_none());
        assert_eq!(node.edges.len(), 2);
        assert_eq!(node.resolution_errors().count(), 1);
        assert!(matches!(node.edges[1].target, EdgeTarget::Unresolved(ref e) if e.is_external()));
    }

    #[test]
    fn test_transform_error_is_attached_to_module() {
        let dir = tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        fs::write(root.join("main.js"), "import data from './data.json';\n").unwrap();
        fs::write(root.join("data.json"), "{ broken").unwrap();
        let mut builder = builder(&root);
        builder.add_entry(&root.join("main.js"));

        let key = builder.key_for(&root.join("data.json"));
        let err = builder.ensure_module(key).unwrap_err();
        assert!(matches!(err, ModuleError::Transform(_)));
        // The importer is unaffected
        let main = builder.key_for(&root.join("main.js"));
        assert!(builder.ensure_module(main).is_ok());
    }

    #[test]
    fn test_missing_module_is_a_read_error() {
        let dir = tempdir().unwrap();
        let mut builder = builder(dir.path());
        let key = builder.key_for(&dir.path().join("nope.js"));
        let err = builder.ensure_module(key).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_custom_transformer_runs_once_per_module() {
        #[derive(Debug, Default)]
        struct Counting(AtomicUsize);
        impl Transformer for Counting {
            fn transform(
                &self,
                input: &TransformInput<'_>,
                config: &TransformConfig,
            ) -> Result<TransformOutput, TransformError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                NexusTransformer.transform(input, config)
            }
        }

        let (_dir, root) = project();
        let counting = Arc::new(Counting::default());
        let mut builder = GraphBuilder::with_transformer(
            &NexusConfig::new(&root),
            pool(),
            Arc::clone(&counting) as Arc<dyn Transformer>,
        );
        builder.build_entries(&[root.join("a.js"), root.join("b.js")]);
        assert_eq!(counting.0.load(Ordering::SeqCst), 3);
        assert_eq!(builder.graph().entries().len(), 2);
    }

    #[test]
    fn test_css_extra_deps_are_interned() {
        let dir = tempdir().unwrap();
        let root = dunce::canonicalize(dir.path()).unwrap();
        fs::write(root.join("main.js"), "import './app.css';\n").unwrap();
        fs::write(root.join("app.css"), "@import './theme.css';\n").unwrap();
        fs::write(root.join("theme.css"), ":root { --c: red; }\n").unwrap();
        let mut builder = builder(&root);
        builder.add_entry(&root.join("main.js"));

        let app = builder.graph().id_of(&builder.key_for(&root.join("app.css"))).unwrap();
        let theme = builder.graph().id_of(&builder.key_for(&root.join("theme.css"))).unwrap();
        assert_eq!(builder.cache().owners_of(theme), vec![app]);
        assert!(!builder.graph().contains(theme));
    }
}
