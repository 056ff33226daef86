//! Invalidation pass: apply a batch of changed paths to the graph.

use super::GraphBuilder;
use crate::error::ModuleError;
use crate::graph::{EdgeTarget, ModuleId};
use crate::resolver::ResolutionError;
use nexus_util::hash::blake3_file;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Outcome of one invalidation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Generation after the pass. Unchanged when the pass was a no-op.
    pub generation: u64,
    /// Changed modules followed by their transitive importers, breadth-first.
    pub changed: Vec<ModuleId>,
    /// Root-relative URLs of `changed`, deduplicated.
    pub changed_ids: Vec<String>,
    /// Set when clients must reload the page.
    pub full_reload: Option<String>,
    /// Modules garbage-collected because no entry reaches them.
    pub removed: Vec<ModuleId>,
    /// Failures on changed modules, by URL.
    pub errors: Vec<(String, ModuleError)>,
}

impl InvalidationReport {
    /// Whether the pass changed nothing clients care about.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.full_reload.is_none()
    }
}

impl GraphBuilder {
    /// Apply a batch of changed paths. Content hashes are compared first, so
    /// saving a file without edits does not cascade.
    pub fn invalidate(&mut self, paths: &[PathBuf]) -> InvalidationReport {
        let mut full_reload: Option<String> = None;
        let mut content_changed: Vec<ModuleId> = Vec::new();
        let mut importers_of_deleted: Vec<ModuleId> = Vec::new();
        let mut created = false;
        let mut manifests_changed = false;

        for raw in paths {
            let path = normalize(raw);
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();

            if name == "package.json" {
                manifests_changed = true;
                full_reload.get_or_insert_with(|| "package.json changed".to_string());
            }
            if path.parent() == Some(self.root.as_path())
                && (name == "index.html" || name.starts_with("nexus.config."))
            {
                full_reload.get_or_insert_with(|| format!("{name} changed"));
            }

            let exists = path.is_file();
            let mut known = false;
            for id in self.graph.ids_for_path(&path).to_vec() {
                for owner in self.cache.owners_of(id) {
                    push_unique(&mut content_changed, owner);
                }
                let Some(node) = self.graph.get(id) else {
                    continue;
                };
                known = true;

                if !exists {
                    if node.is_entry {
                        full_reload
                            .get_or_insert_with(|| format!("entry {} was deleted", self.url_of(id)));
                        push_unique(&mut content_changed, id);
                    }
                    importers_of_deleted.extend(self.graph.importers(id));
                    continue;
                }

                match blake3_file(&path) {
                    Ok(hash) if hash == node.hash => {
                        debug!(path = %path.display(), "Content unchanged");
                    }
                    _ => push_unique(&mut content_changed, id),
                }
            }
            if exists && !known {
                created = true;
            }
        }

        if content_changed.is_empty()
            && importers_of_deleted.is_empty()
            && !created
            && !manifests_changed
            && full_reload.is_none()
        {
            return InvalidationReport {
                generation: self.graph.generation(),
                ..InvalidationReport::default()
            };
        }

        let generation = self.graph.bump_generation();
        self.resolver.begin_generation(generation);
        if manifests_changed {
            self.resolver.invalidate_manifests();
        }

        // A failed transform keeps no cache entry, so nothing records the
        // files it tried to read. Retry those modules after any creation.
        if created {
            let failed: Vec<ModuleId> = self
                .graph
                .iter()
                .filter(|n| matches!(n.error, Some(ModuleError::Transform(_))))
                .map(|n| n.id)
                .collect();
            for id in failed {
                push_unique(&mut content_changed, id);
            }
        }

        for &id in &content_changed {
            if self.graph.is_entry(id) {
                full_reload.get_or_insert_with(|| format!("entry {} changed", self.url_of(id)));
            }
            self.cache.evict(id);
        }

        // Re-transform changed modules in one wave, then load anything new
        let mut discovered = Vec::new();
        let jobs = self.jobs_for(&content_changed);
        for result in self.run_wave(jobs) {
            discovered.extend(self.apply(result));
        }

        // Re-resolve importers of deleted files and, after creations, every
        // module with a missing import
        let mut relink: Vec<ModuleId> = importers_of_deleted;
        if created || manifests_changed {
            relink.extend(
                self.graph
                    .iter()
                    .filter(|n| manifests_changed || has_missing_import(n.edges.iter().map(|e| &e.target)))
                    .map(|n| n.id),
            );
        }
        let mut relinked = Vec::new();
        for id in relink {
            if !content_changed.contains(&id) && !relinked.contains(&id) && self.relink(id) {
                relinked.push(id);
                if let Some(node) = self.graph.get(id) {
                    discovered.extend(
                        node.successors()
                            .map(|(s, _)| s)
                            .filter(|&s| !self.graph.contains(s)),
                    );
                }
            }
        }
        discovered.retain(|&id| !self.graph.contains(id));
        discovered.sort_unstable();
        discovered.dedup();
        if !discovered.is_empty() {
            self.load(discovered);
        }

        let mut roots = content_changed;
        for id in relinked {
            push_unique(&mut roots, id);
        }

        let removed: Vec<ModuleId> = self
            .graph
            .collect_garbage()
            .into_iter()
            .map(|node| {
                self.cache.evict(node.id);
                node.id
            })
            .collect();

        let changed: Vec<ModuleId> = self
            .graph
            .transitive_importers(&roots)
            .into_iter()
            .filter(|&id| self.graph.contains(id))
            .collect();

        let mut changed_ids: Vec<String> = Vec::with_capacity(changed.len());
        let mut errors = Vec::new();
        for &id in &changed {
            let url = self.url_of(id);
            if let Some(node) = self.graph.get_mut(id) {
                node.generation = generation;
                let error = node.error.clone().or_else(|| {
                    node.resolution_errors()
                        .next()
                        .map(|(_, e)| ModuleError::Resolution(e.clone()))
                });
                if let Some(err) = error {
                    errors.push((url.clone(), err));
                }
            }
            if !changed_ids.contains(&url) {
                changed_ids.push(url);
            }
        }

        info!(
            generation,
            changed = changed.len(),
            removed = removed.len(),
            full_reload = full_reload.is_some(),
            "Invalidation pass complete"
        );

        InvalidationReport {
            generation,
            changed,
            changed_ids,
            full_reload,
            removed,
            errors,
        }
    }
}

fn has_missing_import<'a>(mut targets: impl Iterator<Item = &'a EdgeTarget>) -> bool {
    targets.any(|t| matches!(t, EdgeTarget::Unresolved(ResolutionError::NotFound { .. })))
}

fn push_unique(ids: &mut Vec<ModuleId>, id: ModuleId) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

/// Canonical form of a changed path. Deleted files are canonicalized through
/// their parent directory.
fn normalize(path: &Path) -> PathBuf {
    if let Ok(p) = dunce::canonicalize(path) {
        return p;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            dunce::canonicalize(parent).map_or_else(|_| path.to_path_buf(), |p| p.join(name))
        }
        _ => path.to_path_buf(),
    }
}
