//! Chunk splitting.
//!
//! Roots are the entries, then every dynamic-import target, each sorted by
//! key. A root's static reach stops at other dynamic roots. Modules reached
//! from one root join its chunk; modules reached from several are duplicated
//! into each when small, otherwise hoisted into one shared chunk per owner
//! set. Entry modules imported by another root are always duplicated, so no
//! chunk ever loads an entry chunk statically.

use crate::graph::{CycleWarning, ModuleGraph, ModuleId, Traversal};
use nexus_proto::ChunkKind;
use nexus_util::hash::{blake3_parts, short};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Index into [`ChunkPlan::chunks`].
pub type ChunkIndex = usize;

/// Inputs to [`split_chunks`].
#[derive(Debug, Clone, Copy)]
pub struct SplitConfig<'a> {
    /// Modules reached from several roots and smaller than this many bytes
    /// are duplicated instead of hoisted.
    pub inline_threshold: usize,
    /// Transform configuration digest, part of every chunk id.
    pub config_hash: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Content digest.
    pub id: String,
    pub name: String,
    pub kind: ChunkKind,
    /// Module the chunk starts from. `None` for shared chunks.
    pub root: Option<ModuleId>,
    /// Modules in evaluation order.
    pub modules: Vec<ModuleId>,
    /// Chunks that must be loaded before this one.
    pub imports: Vec<ChunkIndex>,
    /// Chunks this one loads through `import()`.
    pub dynamic_imports: Vec<ChunkIndex>,
}

impl Chunk {
    /// Output path relative to the output directory.
    #[must_use]
    pub fn file(&self) -> String {
        format!("assets/{}-{}.js", self.name, short(&self.id))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChunkPlan {
    pub chunks: Vec<Chunk>,
    /// Global post-order over everything reachable from the entries.
    pub order: Vec<ModuleId>,
    pub cycles: Vec<CycleWarning>,
}

impl ChunkPlan {
    /// Chunk started by `root`.
    #[must_use]
    pub fn chunk_of_root(&self, root: ModuleId) -> Option<ChunkIndex> {
        self.chunks.iter().position(|c| c.root == Some(root))
    }

    /// Entry chunks, in entry order.
    pub fn entry_chunks(&self) -> impl Iterator<Item = (ChunkIndex, &Chunk)> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.kind == ChunkKind::Entry)
    }

    /// `index` preceded by everything it statically imports, dependencies
    /// first.
    #[must_use]
    pub fn load_order(&self, index: ChunkIndex) -> Vec<ChunkIndex> {
        fn visit(plan: &ChunkPlan, index: ChunkIndex, seen: &mut HashSet<ChunkIndex>, out: &mut Vec<ChunkIndex>) {
            if !seen.insert(index) {
                return;
            }
            for &dep in &plan.chunks[index].imports {
                visit(plan, dep, seen, out);
            }
            out.push(index);
        }
        let mut seen = HashSet::default();
        let mut out = Vec::new();
        visit(self, index, &mut seen, &mut out);
        out
    }
}

/// Split everything reachable from the graph's entries into chunks.
#[must_use]
pub fn split_chunks(graph: &ModuleGraph, config: &SplitConfig<'_>) -> ChunkPlan {
    let entries = graph.entries();
    let entry_set: HashSet<ModuleId> = entries.iter().copied().collect();

    let mut dynamic: Vec<ModuleId> = graph
        .reachable(&entries, true)
        .into_iter()
        .filter_map(|id| graph.get(id))
        .flat_map(|node| node.dynamic_deps().collect::<Vec<_>>())
        .filter(|id| !entry_set.contains(id) && graph.contains(*id))
        .collect();
    dynamic.sort_by(|a, b| graph.key(*a).cmp(graph.key(*b)));
    dynamic.dedup();
    let dynamic_set: HashSet<ModuleId> = dynamic.iter().copied().collect();

    let roots: Vec<ModuleId> = entries.iter().chain(dynamic.iter()).copied().collect();

    let mut traversal = Traversal::new(graph).follow_dynamic(true);
    for &root in &roots {
        traversal.visit(root, |_| false);
    }
    let (order, cycles) = traversal.finish();
    let position: HashMap<ModuleId, usize> = order.iter().enumerate().map(|(i, &id)| (id, i)).collect();

    // Owner sets, by root index
    let mut members: Vec<BTreeSet<ModuleId>> = roots.iter().map(|&r| BTreeSet::from([r])).collect();
    let mut owners: BTreeMap<ModuleId, BTreeSet<usize>> = BTreeMap::new();
    for (ri, &root) in roots.iter().enumerate() {
        for id in static_reach(graph, root, &dynamic_set) {
            if id == root {
                continue;
            }
            if entry_set.contains(&id) {
                members[ri].insert(id);
            } else {
                owners.entry(id).or_default().insert(ri);
            }
        }
    }

    let mut shared: BTreeMap<BTreeSet<usize>, BTreeSet<ModuleId>> = BTreeMap::new();
    for (id, owner_set) in owners {
        let size = graph.get(id).map_or(0, |n| n.size());
        if owner_set.len() == 1 || size < config.inline_threshold {
            for &ri in &owner_set {
                members[ri].insert(id);
            }
        } else {
            shared.entry(owner_set).or_default().insert(id);
        }
    }

    let in_order = |set: BTreeSet<ModuleId>| -> Vec<ModuleId> {
        let mut modules: Vec<ModuleId> = set.into_iter().collect();
        modules.sort_by(|a, b| {
            let pa = position.get(a).copied().unwrap_or(usize::MAX);
            let pb = position.get(b).copied().unwrap_or(usize::MAX);
            pa.cmp(&pb).then_with(|| graph.key(*a).cmp(graph.key(*b)))
        });
        modules
    };

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut used_names: HashSet<String> = HashSet::default();
    for (ri, set) in members.into_iter().enumerate() {
        let root = roots[ri];
        let kind = if ri < entries.len() {
            ChunkKind::Entry
        } else {
            ChunkKind::Dynamic
        };
        let name = unique_name(&mut used_names, stem(&graph.key(root).path));
        chunks.push(Chunk {
            id: String::new(),
            name,
            kind,
            root: Some(root),
            modules: in_order(set),
            imports: Vec::new(),
            dynamic_imports: Vec::new(),
        });
    }
    for set in shared.into_values() {
        chunks.push(Chunk {
            id: String::new(),
            name: "shared".to_string(),
            kind: ChunkKind::Shared,
            root: None,
            modules: in_order(set),
            imports: Vec::new(),
            dynamic_imports: Vec::new(),
        });
    }

    link_chunks(graph, &mut chunks);
    for chunk in &mut chunks {
        let hashes = chunk
            .modules
            .iter()
            .map(|&id| graph.get(id).map_or("", |n| n.hash.as_str()));
        chunk.id = blake3_parts(std::iter::once(config.config_hash).chain(hashes));
    }

    ChunkPlan {
        chunks,
        order,
        cycles,
    }
}

/// Modules reachable from `root` over static edges, not entering other
/// dynamic roots.
fn static_reach(graph: &ModuleGraph, root: ModuleId, dynamic: &HashSet<ModuleId>) -> Vec<ModuleId> {
    let mut seen: HashSet<ModuleId> = HashSet::default();
    let mut stack = vec![root];
    let mut out = Vec::new();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        out.push(id);
        if let Some(node) = graph.get(id) {
            stack.extend(
                node.static_deps()
                    .filter(|dep| graph.contains(*dep) && (*dep == root || !dynamic.contains(dep))),
            );
        }
    }
    out
}

/// Fill in chunk imports. A static dependency outside the chunk is provided
/// by a shared chunk or by the dependency's own dynamic chunk.
fn link_chunks(graph: &ModuleGraph, chunks: &mut [Chunk]) {
    let mut providers: HashMap<ModuleId, ChunkIndex> = HashMap::default();
    let mut root_chunks: HashMap<ModuleId, ChunkIndex> = HashMap::default();
    for (index, chunk) in chunks.iter().enumerate() {
        match (chunk.kind, chunk.root) {
            (ChunkKind::Shared, _) => {
                for &id in &chunk.modules {
                    providers.insert(id, index);
                }
            }
            (ChunkKind::Dynamic, Some(root)) => {
                providers.insert(root, index);
                root_chunks.insert(root, index);
            }
            (_, Some(root)) => {
                root_chunks.insert(root, index);
            }
            (_, None) => {}
        }
    }

    for index in 0..chunks.len() {
        let members: HashSet<ModuleId> = chunks[index].modules.iter().copied().collect();
        let mut imports = BTreeSet::new();
        let mut dynamic_imports = BTreeSet::new();
        for id in &chunks[index].modules {
            let Some(node) = graph.get(*id) else {
                continue;
            };
            for dep in node.static_deps() {
                if members.contains(&dep) {
                    continue;
                }
                if let Some(&provider) = providers.get(&dep) {
                    if provider != index {
                        imports.insert(provider);
                    }
                }
            }
            for dep in node.dynamic_deps() {
                if let Some(&target) = root_chunks.get(&dep) {
                    if target != index {
                        dynamic_imports.insert(target);
                    }
                }
            }
        }
        chunks[index].imports = imports.into_iter().collect();
        chunks[index].dynamic_imports = dynamic_imports.into_iter().collect();
    }
}

fn stem(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("chunk");
    let clean: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if clean.is_empty() {
        "chunk".to_string()
    } else {
        clean
    }
}

fn unique_name(used: &mut HashSet<String>, base: String) -> String {
    if used.insert(base.clone()) {
        return base;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{base}-{n}");
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Target;
    use crate::graph::{Conditions, EdgeTarget, ImportEdge, ModuleKey, ModuleKind, ModuleNode};
    use crate::imports::ImportKind;
    use crate::resolver::RequestKind;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn key(name: &str) -> ModuleKey {
        ModuleKey::new(
            PathBuf::from(format!("/p/{name}.js")),
            Conditions::new(Target::Browser, RequestKind::Import),
        )
    }

    struct Fixture {
        graph: ModuleGraph,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                graph: ModuleGraph::new(),
            }
        }

        fn id(&mut self, name: &str) -> ModuleId {
            self.graph.intern(key(name))
        }

        /// `edges` are `(target, dynamic)`.
        fn module(&mut self, name: &str, size: usize, edges: &[(&str, bool)]) -> ModuleId {
            let id = self.id(name);
            let edges = edges
                .iter()
                .map(|&(target, dynamic)| ImportEdge {
                    specifier: format!("./{target}.js"),
                    kind: if dynamic {
                        ImportKind::Dynamic
                    } else {
                        ImportKind::Static
                    },
                    target: EdgeTarget::Resolved(self.id(target)),
                })
                .collect();
            self.graph.insert(ModuleNode {
                id,
                key: key(name),
                source: Arc::from(vec![b'x'; size]),
                hash: format!("hash-{name}"),
                kind: ModuleKind::Script,
                edges,
                is_entry: false,
                generation: 0,
                error: None,
            });
            id
        }

        fn entry(&mut self, name: &str) {
            let id = self.id(name);
            self.graph.add_entry(id);
        }

        fn split(&self, threshold: usize) -> ChunkPlan {
            split_chunks(
                &self.graph,
                &SplitConfig {
                    inline_threshold: threshold,
                    config_hash: "cfg",
                },
            )
        }
    }

    fn names(fx: &Fixture, modules: &[ModuleId]) -> Vec<String> {
        modules
            .iter()
            .map(|&id| {
                fx.graph
                    .key(id)
                    .path
                    .file_stem()
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect()
    }

    /// main -> util, main ~> lazy -> util, lazy -> heavy
    fn dynamic_fixture(util_size: usize) -> Fixture {
        let mut fx = Fixture::new();
        fx.module("main", 10, &[("util", false), ("lazy", true)]);
        fx.module("lazy", 10, &[("util", false), ("heavy", false)]);
        fx.module("util", util_size, &[]);
        fx.module("heavy", 5000, &[]);
        fx.entry("main");
        fx
    }

    #[test]
    fn test_dynamic_import_gets_its_own_chunk() {
        let fx = dynamic_fixture(10);
        let plan = fx.split(1024);
        assert_eq!(plan.chunks.len(), 2);

        let main = &plan.chunks[0];
        assert_eq!(main.kind, ChunkKind::Entry);
        assert_eq!(names(&fx, &main.modules), vec!["util", "main"]);
        assert_eq!(main.dynamic_imports, vec![1]);
        assert!(main.imports.is_empty());

        let lazy = &plan.chunks[1];
        assert_eq!(lazy.kind, ChunkKind::Dynamic);
        // util is small, so it is duplicated; heavy is only reached from lazy
        assert_eq!(names(&fx, &lazy.modules), vec!["heavy", "util", "lazy"]);
    }

    #[test]
    fn test_large_shared_module_is_hoisted() {
        let fx = dynamic_fixture(4096);
        let plan = fx.split(1024);
        assert_eq!(plan.chunks.len(), 3);
        let shared = &plan.chunks[2];
        assert_eq!(shared.kind, ChunkKind::Shared);
        assert_eq!(names(&fx, &shared.modules), vec!["util"]);
        assert_eq!(plan.chunks[0].imports, vec![2]);
        assert_eq!(plan.chunks[1].imports, vec![2]);
        assert_eq!(plan.load_order(1), vec![2, 1]);
    }

    #[test]
    fn test_static_reach_stops_at_dynamic_roots() {
        let mut fx = Fixture::new();
        fx.module("main", 10, &[("page", false), ("other", true)]);
        fx.module("other", 10, &[("page", true)]);
        fx.module("page", 10, &[]);
        fx.entry("main");
        let plan = fx.split(1024);

        // page is a dynamic target, so main loads its chunk statically
        let page = plan.chunk_of_root(fx.graph.id_of(&key("page")).unwrap()).unwrap();
        assert_eq!(plan.chunks[page].kind, ChunkKind::Dynamic);
        assert_eq!(plan.chunks[0].imports, vec![page]);
        assert!(!plan.chunks[0].modules.contains(&fx.graph.id_of(&key("page")).unwrap()));
    }

    #[test]
    fn test_entry_imported_by_entry_is_duplicated() {
        let mut fx = Fixture::new();
        fx.module("a", 10, &[("b", false)]);
        fx.module("b", 10, &[]);
        fx.entry("a");
        fx.entry("b");
        let plan = fx.split(1024);
        assert_eq!(plan.chunks.len(), 2);
        assert_eq!(names(&fx, &plan.chunks[0].modules), vec!["b", "a"]);
        assert_eq!(names(&fx, &plan.chunks[1].modules), vec!["b"]);
        assert!(plan.chunks.iter().all(|c| c.imports.is_empty()));
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let first = dynamic_fixture(4096).split(1024);
        let second = dynamic_fixture(4096).split(1024);
        let ids = |plan: &ChunkPlan| plan.chunks.iter().map(|c| (c.id.clone(), c.file())).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
        assert!(first.chunks[0].file().starts_with("assets/main-"));
    }

    #[test]
    fn test_chunk_id_tracks_content() {
        let a = dynamic_fixture(10).split(1024);
        let b = dynamic_fixture(11).split(1024);
        // util's hash is the same, only its size changed
        assert_eq!(a.chunks[0].id, b.chunks[0].id);

        let mut fx = dynamic_fixture(10);
        let id = fx.id("util");
        fx.graph.get_mut(id).unwrap().hash = "changed".to_string();
        let c = fx.split(1024);
        assert_ne!(a.chunks[0].id, c.chunks[0].id);
    }

    #[test]
    fn test_cycles_are_reported() {
        let mut fx = Fixture::new();
        fx.module("a", 10, &[("b", false)]);
        fx.module("b", 10, &[("a", false)]);
        fx.entry("a");
        let plan = fx.split(1024);
        assert_eq!(plan.cycles.len(), 1);
        assert_eq!(plan.chunks.len(), 1);
        assert_eq!(names(&fx, &plan.chunks[0].modules), vec!["b", "a"]);
    }
}
