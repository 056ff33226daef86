//! Arena-backed module graph.
//!
//! Nodes live in a `Vec<Option<ModuleNode>>` indexed by [`ModuleId`]. Ids are
//! interned from [`ModuleKey`]s and never reused, so a key removed by garbage
//! collection gets its old id back if it is loaded again. Cycles are legal;
//! every whole-graph walk goes through [`Traversal`].

use crate::config::Target;
use crate::error::ModuleError;
use crate::imports::ImportKind;
use crate::resolver::{RequestKind, ResolutionError};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Interned module identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

impl ModuleId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Environment a module was resolved under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Conditions {
    pub target: Target,
    pub kind: RequestKind,
}

impl Conditions {
    #[must_use]
    pub fn new(target: Target, kind: RequestKind) -> Self {
        Self { target, kind }
    }
}

/// Canonical path plus resolution conditions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleKey {
    pub path: PathBuf,
    pub conditions: Conditions,
}

impl ModuleKey {
    #[must_use]
    pub fn new(path: PathBuf, conditions: Conditions) -> Self {
        Self { path, conditions }
    }
}

/// How a module's source is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    Script,
    Json,
    Css,
    Asset,
}

impl ModuleKind {
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs") => Self::Script,
            Some("json") => Self::Json,
            Some("css") => Self::Css,
            _ => Self::Asset,
        }
    }
}

/// Where an edge points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeTarget {
    Resolved(ModuleId),
    Unresolved(ResolutionError),
}

/// One outgoing import, in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEdge {
    pub specifier: String,
    pub kind: ImportKind,
    pub target: EdgeTarget,
}

impl ImportEdge {
    #[must_use]
    pub fn resolved(&self) -> Option<ModuleId> {
        match self.target {
            EdgeTarget::Resolved(id) => Some(id),
            EdgeTarget::Unresolved(_) => None,
        }
    }
}

/// A loaded module.
#[derive(Debug, Clone)]
pub struct ModuleNode {
    pub id: ModuleId,
    pub key: ModuleKey,
    pub source: Arc<[u8]>,
    /// blake3 hex digest of `source`.
    pub hash: String,
    pub kind: ModuleKind,
    pub edges: Vec<ImportEdge>,
    pub is_entry: bool,
    /// Generation of the last (re)build.
    pub generation: u64,
    pub error: Option<ModuleError>,
}

impl ModuleNode {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.key.path
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.source.len()
    }

    /// Resolved targets with whether the edge is dynamic.
    pub fn successors(&self) -> impl Iterator<Item = (ModuleId, bool)> + '_ {
        self.edges
            .iter()
            .filter_map(|e| e.resolved().map(|id| (id, e.kind.is_dynamic())))
    }

    /// Resolved targets of non-dynamic edges.
    pub fn static_deps(&self) -> impl Iterator<Item = ModuleId> + '_ {
        self.successors()
            .filter_map(|(id, dynamic)| (!dynamic).then_some(id))
    }

    /// Resolved targets of dynamic edges.
    pub fn dynamic_deps(&self) -> impl Iterator<Item = ModuleId> + '_ {
        self.successors()
            .filter_map(|(id, dynamic)| dynamic.then_some(id))
    }

    /// Resolution failures that are not externals.
    pub fn resolution_errors(&self) -> impl Iterator<Item = (&ImportEdge, &ResolutionError)> {
        self.edges.iter().filter_map(|e| match &e.target {
            EdgeTarget::Unresolved(err) if !err.is_external() => Some((e, err)),
            _ => None,
        })
    }
}

/// A cycle on static edges, listed from the first module re-entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleWarning {
    pub modules: Vec<ModuleId>,
}

impl CycleWarning {
    /// `a.js -> b.js -> a.js`, with paths relative to `root`.
    #[must_use]
    pub fn describe(&self, graph: &ModuleGraph, root: &Path) -> String {
        let mut names: Vec<String> = self
            .modules
            .iter()
            .map(|&id| {
                let path = &graph.key(id).path;
                path.strip_prefix(root)
                    .unwrap_or(path)
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();
        if let Some(first) = names.first().cloned() {
            names.push(first);
        }
        format!("Circular dependency: {}", names.join(" -> "))
    }
}

/// The module graph.
#[derive(Debug, Default)]
pub struct ModuleGraph {
    nodes: Vec<Option<ModuleNode>>,
    keys: Vec<ModuleKey>,
    ids: HashMap<ModuleKey, ModuleId>,
    paths: HashMap<PathBuf, Vec<ModuleId>>,
    importers: Vec<BTreeSet<ModuleId>>,
    entries: BTreeSet<ModuleId>,
    generation: u64,
}

impl ModuleGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for `key`, allocating an empty slot on first sight.
    pub fn intern(&mut self, key: ModuleKey) -> ModuleId {
        if let Some(&id) = self.ids.get(&key) {
            return id;
        }
        let id = ModuleId(self.keys.len() as u32);
        self.paths.entry(key.path.clone()).or_default().push(id);
        self.ids.insert(key.clone(), id);
        self.keys.push(key);
        self.nodes.push(None);
        self.importers.push(BTreeSet::new());
        id
    }

    #[must_use]
    pub fn id_of(&self, key: &ModuleKey) -> Option<ModuleId> {
        self.ids.get(key).copied()
    }

    /// Key interned for `id`. Panics on ids from another graph.
    #[must_use]
    pub fn key(&self, id: ModuleId) -> &ModuleKey {
        &self.keys[id.index()]
    }

    /// Interned ids for a path (one per condition set), loaded or not.
    #[must_use]
    pub fn ids_for_path(&self, path: &Path) -> &[ModuleId] {
        self.paths.get(path).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn get(&self, id: ModuleId) -> Option<&ModuleNode> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: ModuleId) -> Option<&mut ModuleNode> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    #[must_use]
    pub fn contains(&self, id: ModuleId) -> bool {
        self.get(id).is_some()
    }

    /// Loaded nodes, in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ModuleNode> {
        self.nodes.iter().filter_map(Option::as_ref)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace a node, keeping reverse edges in sync.
    pub fn insert(&mut self, mut node: ModuleNode) {
        let id = node.id;
        node.is_entry = self.entries.contains(&id);
        if let Some(old) = self.nodes[id.index()].take() {
            self.unlink(id, &old.edges);
        }
        self.link(id, &node.edges);
        self.nodes[id.index()] = Some(node);
    }

    /// Replace a node's edges.
    pub fn set_edges(&mut self, id: ModuleId, edges: Vec<ImportEdge>) {
        let Some(node) = self.nodes[id.index()].as_mut() else {
            return;
        };
        let old = std::mem::replace(&mut node.edges, edges);
        self.unlink(id, &old);
        let new = self.nodes[id.index()]
            .as_ref()
            .map(|n| n.edges.clone())
            .unwrap_or_default();
        self.link(id, &new);
    }

    fn link(&mut self, from: ModuleId, edges: &[ImportEdge]) {
        for target in edges.iter().filter_map(ImportEdge::resolved) {
            self.importers[target.index()].insert(from);
        }
    }

    fn unlink(&mut self, from: ModuleId, edges: &[ImportEdge]) {
        for target in edges.iter().filter_map(ImportEdge::resolved) {
            self.importers[target.index()].remove(&from);
        }
    }

    /// Drop a node. Its id stays interned.
    pub fn remove(&mut self, id: ModuleId) -> Option<ModuleNode> {
        let node = self.nodes.get_mut(id.index())?.take()?;
        self.unlink(id, &node.edges);
        self.entries.remove(&id);
        Some(node)
    }

    /// Loaded modules that import `id`, in id order.
    pub fn importers(&self, id: ModuleId) -> impl Iterator<Item = ModuleId> + '_ {
        self.importers[id.index()]
            .iter()
            .copied()
            .filter(|&i| self.contains(i))
    }

    pub fn add_entry(&mut self, id: ModuleId) {
        self.entries.insert(id);
        if let Some(node) = self.get_mut(id) {
            node.is_entry = true;
        }
    }

    pub fn remove_entry(&mut self, id: ModuleId) {
        self.entries.remove(&id);
        if let Some(node) = self.get_mut(id) {
            node.is_entry = false;
        }
    }

    #[must_use]
    pub fn is_entry(&self, id: ModuleId) -> bool {
        self.entries.contains(&id)
    }

    /// Entry ids sorted by key.
    #[must_use]
    pub fn entries(&self) -> Vec<ModuleId> {
        let mut entries: Vec<ModuleId> = self.entries.iter().copied().collect();
        entries.sort_by(|a, b| self.key(*a).cmp(self.key(*b)));
        entries
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Advance the generation and return the new value.
    pub fn bump_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Modules reachable from `roots`, optionally through dynamic edges.
    #[must_use]
    pub fn reachable(&self, roots: &[ModuleId], follow_dynamic: bool) -> HashSet<ModuleId> {
        let mut seen = HashSet::default();
        let mut stack: Vec<ModuleId> = roots.iter().copied().filter(|&r| self.contains(r)).collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.get(id) {
                stack.extend(
                    node.successors()
                        .filter(|&(s, dynamic)| (follow_dynamic || !dynamic) && self.contains(s))
                        .map(|(s, _)| s),
                );
            }
        }
        seen
    }

    /// `changed` followed by every transitive importer, breadth-first over
    /// reverse edges. Each module appears once.
    #[must_use]
    pub fn transitive_importers(&self, changed: &[ModuleId]) -> Vec<ModuleId> {
        let mut seen: HashSet<ModuleId> = HashSet::default();
        let mut order = Vec::new();
        let mut queue: VecDeque<ModuleId> = VecDeque::new();
        for &id in changed {
            if seen.insert(id) {
                queue.push_back(id);
            }
        }
        while let Some(id) = queue.pop_front() {
            order.push(id);
            if !self.contains(id) {
                continue;
            }
            for importer in self.importers(id) {
                if seen.insert(importer) {
                    queue.push_back(importer);
                }
            }
        }
        order
    }

    /// Entries whose subgraph contains `id`, sorted by key.
    #[must_use]
    pub fn affected_roots(&self, id: ModuleId) -> Vec<ModuleId> {
        let mut roots: Vec<ModuleId> = self
            .transitive_importers(&[id])
            .into_iter()
            .filter(|m| self.is_entry(*m))
            .collect();
        roots.sort_by(|a, b| self.key(*a).cmp(self.key(*b)));
        roots
    }

    /// Post-order over everything reachable from the entries, with cycles
    /// on static edges reported.
    #[must_use]
    pub fn linearize(&self) -> (Vec<ModuleId>, Vec<CycleWarning>) {
        let mut traversal = Traversal::new(self).follow_dynamic(true);
        for root in self.entries() {
            traversal.visit(root, |_| false);
        }
        traversal.finish()
    }

    /// Remove every node no entry reaches. Returns the removed nodes.
    pub fn collect_garbage(&mut self) -> Vec<ModuleNode> {
        let live = self.reachable(&self.entries(), true);
        let dead: Vec<ModuleId> = self
            .iter()
            .map(|n| n.id)
            .filter(|id| !live.contains(id))
            .collect();
        dead.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Gray,
    Black,
}

struct Frame {
    id: ModuleId,
    successors: Vec<(ModuleId, bool)>,
    next: usize,
}

/// Depth-first walk with white/gray/black marking. Repeated [`visit`] calls
/// share one color map, producing a single global post-order.
///
/// [`visit`]: Traversal::visit
pub struct Traversal<'g> {
    graph: &'g ModuleGraph,
    follow_dynamic: bool,
    colors: HashMap<ModuleId, Color>,
    order: Vec<ModuleId>,
    cycles: Vec<CycleWarning>,
}

impl<'g> Traversal<'g> {
    #[must_use]
    pub fn new(graph: &'g ModuleGraph) -> Self {
        Self {
            graph,
            follow_dynamic: false,
            colors: HashMap::default(),
            order: Vec::new(),
            cycles: Vec::new(),
        }
    }

    #[must_use]
    pub fn follow_dynamic(mut self, yes: bool) -> Self {
        self.follow_dynamic = yes;
        self
    }

    /// Successors are visited in key order, deduplicated.
    fn successors(&self, id: ModuleId) -> Vec<(ModuleId, bool)> {
        let Some(node) = self.graph.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<(ModuleId, bool)> = Vec::new();
        for (s, dynamic) in node.successors() {
            if (!dynamic || self.follow_dynamic) && self.graph.contains(s) {
                match out.iter_mut().find(|(o, _)| *o == s) {
                    // A static edge wins over a dynamic one to the same module
                    Some(existing) => existing.1 &= dynamic,
                    None => out.push((s, dynamic)),
                }
            }
        }
        out.sort_by(|a, b| self.graph.key(a.0).cmp(self.graph.key(b.0)));
        out
    }

    /// Walk from `root`, not entering successors for which `skip` is true.
    pub fn visit(&mut self, root: ModuleId, skip: impl Fn(ModuleId) -> bool) {
        if self.colors.contains_key(&root) || !self.graph.contains(root) {
            return;
        }
        self.colors.insert(root, Color::Gray);
        let mut stack = vec![Frame {
            id: root,
            successors: self.successors(root),
            next: 0,
        }];

        while let Some(frame) = stack.last_mut() {
            if frame.next == frame.successors.len() {
                let id = frame.id;
                stack.pop();
                self.colors.insert(id, Color::Black);
                self.order.push(id);
                continue;
            }
            let (succ, dynamic) = frame.successors[frame.next];
            frame.next += 1;
            if skip(succ) {
                continue;
            }
            match self.colors.get(&succ).copied() {
                None => {
                    self.colors.insert(succ, Color::Gray);
                    let successors = self.successors(succ);
                    stack.push(Frame {
                        id: succ,
                        successors,
                        next: 0,
                    });
                }
                Some(Color::Gray) if !dynamic => {
                    let start = stack.iter().position(|f| f.id == succ).unwrap_or(0);
                    self.cycles.push(CycleWarning {
                        modules: stack[start..].iter().map(|f| f.id).collect(),
                    });
                }
                Some(_) => {}
            }
        }
    }

    /// Post-order so far.
    #[must_use]
    pub fn order(&self) -> &[ModuleId] {
        &self.order
    }

    #[must_use]
    pub fn finish(self) -> (Vec<ModuleId>, Vec<CycleWarning>) {
        (self.order, self.cycles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ModuleKey {
        ModuleKey::new(
            PathBuf::from(format!("/p/{name}.js")),
            Conditions::new(Target::Browser, RequestKind::Import),
        )
    }

    fn edge(specifier: &str, target: ModuleId, kind: ImportKind) -> ImportEdge {
        ImportEdge {
            specifier: specifier.to_string(),
            kind,
            target: EdgeTarget::Resolved(target),
        }
    }

    fn node(graph: &mut ModuleGraph, name: &str, edges: Vec<ImportEdge>) -> ModuleId {
        let id = graph.intern(key(name));
        graph.insert(ModuleNode {
            id,
            key: key(name),
            source: Arc::from(name.as_bytes()),
            hash: name.to_string(),
            kind: ModuleKind::Script,
            edges,
            is_entry: false,
            generation: 0,
            error: None,
        });
        id
    }

    /// a -> b -> c, all static.
    fn chain() -> (ModuleGraph, [ModuleId; 3]) {
        let mut g = ModuleGraph::new();
        let a = g.intern(key("a"));
        let b = g.intern(key("b"));
        let c = node(&mut g, "c", vec![]);
        node(&mut g, "b", vec![edge("./c", c, ImportKind::Static)]);
        node(&mut g, "a", vec![edge("./b", b, ImportKind::Static)]);
        g.add_entry(a);
        (g, [a, b, c])
    }

    #[test]
    fn test_intern_is_stable() {
        let mut g = ModuleGraph::new();
        let a = g.intern(key("a"));
        assert_eq!(g.intern(key("a")), a);
        assert_ne!(g.intern(key("b")), a);
        assert_eq!(g.id_of(&key("a")), Some(a));
        assert_eq!(g.ids_for_path(Path::new("/p/a.js")), &[a]);
    }

    #[test]
    fn test_transitive_importers_bfs_order() {
        let (g, [a, b, c]) = chain();
        assert_eq!(g.transitive_importers(&[c]), vec![c, b, a]);
        assert_eq!(g.transitive_importers(&[a]), vec![a]);
    }

    #[test]
    fn test_linearize_post_order() {
        let (g, [a, b, c]) = chain();
        let (order, cycles) = g.linearize();
        assert_eq!(order, vec![c, b, a]);
        assert!(cycles.is_empty());
    }

    #[test]
    fn test_cycle_is_a_warning_and_terminates() {
        let mut g = ModuleGraph::new();
        let a = g.intern(key("a"));
        let b = g.intern(key("b"));
        node(&mut g, "a", vec![edge("./b", b, ImportKind::Static)]);
        node(&mut g, "b", vec![edge("./a", a, ImportKind::Static)]);
        g.add_entry(a);

        let (order, cycles) = g.linearize();
        assert_eq!(order, vec![b, a]);
        assert_eq!(cycles, vec![CycleWarning { modules: vec![a, b] }]);
        assert_eq!(
            cycles[0].describe(&g, Path::new("/p")),
            "Circular dependency: a.js -> b.js -> a.js"
        );
        assert_eq!(g.transitive_importers(&[a]), vec![a, b]);
    }

    #[test]
    fn test_dynamic_cycle_is_not_reported() {
        let mut g = ModuleGraph::new();
        let a = g.intern(key("a"));
        let b = g.intern(key("b"));
        node(&mut g, "a", vec![edge("./b", b, ImportKind::Dynamic)]);
        node(&mut g, "b", vec![edge("./a", a, ImportKind::Static)]);
        g.add_entry(a);
        let (_, cycles) = g.linearize();
        assert!(cycles.is_empty());
    }

    #[test]
    fn test_reachable_static_only() {
        let mut g = ModuleGraph::new();
        let lazy = node(&mut g, "lazy", vec![]);
        let main = node(&mut g, "main", vec![edge("./lazy", lazy, ImportKind::Dynamic)]);
        assert!(!g.reachable(&[main], false).contains(&lazy));
        assert!(g.reachable(&[main], true).contains(&lazy));
    }

    #[test]
    fn test_set_edges_updates_importers() {
        let (mut g, [a, b, c]) = chain();
        g.set_edges(b, vec![]);
        assert_eq!(g.importers(c).count(), 0);
        assert_eq!(g.importers(b).collect::<Vec<_>>(), vec![a]);
    }

    #[test]
    fn test_collect_garbage_removes_unreachable() {
        let (mut g, [a, b, c]) = chain();
        g.set_edges(b, vec![]);
        let removed: Vec<ModuleId> = g.collect_garbage().into_iter().map(|n| n.id).collect();
        assert_eq!(removed, vec![c]);
        assert!(g.contains(a) && g.contains(b));
        // Ids are not reused
        assert_eq!(g.intern(key("c")), c);
        assert!(!g.contains(c));
    }

    #[test]
    fn test_affected_roots() {
        let (mut g, [a, _b, c]) = chain();
        let other = node(&mut g, "other", vec![edge("./c", c, ImportKind::Static)]);
        g.add_entry(other);
        let roots = g.affected_roots(c);
        assert_eq!(roots, vec![a, other]);
    }

    #[test]
    fn test_module_kind_from_path() {
        assert_eq!(ModuleKind::from_path(Path::new("a.TSX")), ModuleKind::Script);
        assert_eq!(ModuleKind::from_path(Path::new("a.json")), ModuleKind::Json);
        assert_eq!(ModuleKind::from_path(Path::new("a.css")), ModuleKind::Css);
        assert_eq!(ModuleKind::from_path(Path::new("logo.svg")), ModuleKind::Asset);
    }
}
