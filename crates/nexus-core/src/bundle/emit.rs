//! Chunk code generation and output writing.

use super::chunks::{ChunkIndex, ChunkPlan};
use super::html::production_html;
use super::lower::{failing_module, lower_module, ImportBinding};
use super::runtime::runtime_source;
use super::shake::{dead_exports, UsedExports};
use crate::builder::GraphBuilder;
use crate::dev::client::generate_index_html;
use crate::error::{Error, ModuleError};
use crate::graph::{ModuleGraph, ModuleId};
use crate::imports::ImportRecord;
use crate::transform::TransformOutput;
use nexus_proto::{BuildManifest, ChunkKind, ChunkRecord};
use nexus_util::fs::atomic_write;
use nexus_util::hash::{blake3_bytes, short};
use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// Everything written by one build.
#[derive(Debug)]
pub(crate) struct Emitted {
    pub manifest: BuildManifest,
    pub files: Vec<PathBuf>,
}

/// Files to write, relative to the output directory.
#[derive(Default)]
struct OutputFiles {
    files: BTreeMap<String, Vec<u8>>,
}

impl OutputFiles {
    fn add(&mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.files.insert(name.into(), bytes.into());
    }

    fn write(self, out_dir: &Path) -> Result<Vec<PathBuf>, Error> {
        let mut written = Vec::with_capacity(self.files.len());
        for (name, bytes) in self.files {
            let path = out_dir.join(&name);
            atomic_write(&path, &bytes)?;
            trace!(file = %name, bytes = bytes.len(), "Wrote output file");
            written.push(path);
        }
        Ok(written)
    }
}

/// Lower every module, assemble the chunks and write the output directory.
///
/// `failed` holds modules that could not be built but are only reached
/// through dynamic imports; they are emitted as factories that throw.
pub(crate) fn emit(
    builder: &mut GraphBuilder,
    plan: &ChunkPlan,
    mut failed: HashMap<ModuleId, ModuleError>,
    out_dir: &Path,
) -> Result<Emitted, Error> {
    let mut outputs: HashMap<ModuleId, Arc<TransformOutput>> = HashMap::default();
    for &id in &plan.order {
        if failed.contains_key(&id) {
            continue;
        }
        match builder.output(id) {
            Ok(output) => {
                outputs.insert(id, output);
            }
            Err(err) => {
                failed.insert(id, err);
            }
        }
    }

    let graph = builder.graph();
    let root = builder.root().to_path_buf();
    let registry_id = |id: ModuleId| nexus_util::fs::url_path(&root, &graph.key(id).path);

    let mut used = UsedExports::new();
    for entry in graph.entries() {
        used.mark_all(entry);
    }
    for &id in &plan.order {
        if let Some(output) = outputs.get(&id) {
            used.record_imports(&output.code, |record| edge_target(graph, id, record));
        }
    }

    let mut cycles = CycleCheck::new(graph);
    let mut lowered: HashMap<ModuleId, String> = HashMap::default();
    for &id in &plan.order {
        let code = match (outputs.get(&id), failed.get(&id)) {
            (_, Some(err)) => failing_module(&registry_id(id), &err.to_string()),
            (Some(output), None) => {
                let lazy: HashSet<ModuleId> = graph
                    .get(id)
                    .map(|node| node.static_deps().filter(|&t| cycles.reaches(t, id)).collect())
                    .unwrap_or_default();
                let dead = dead_exports(&output.code, id, &used);
                if !dead.is_empty() {
                    debug!(module = %registry_id(id), dropped = dead.len(), "Dropping unused exports");
                }
                lower_module(
                    &registry_id(id),
                    &output.code,
                    |record| {
                        let target = edge_target(graph, id, record)?;
                        Some(ImportBinding {
                            id: registry_id(target),
                            lazy: !record.kind.is_dynamic() && lazy.contains(&target),
                        })
                    },
                    &dead,
                )
                .code
            }
            (None, None) => continue,
        };
        lowered.insert(id, code);
    }

    let mut files = OutputFiles::default();
    let mut manifest_chunks = BTreeMap::new();
    for chunk in &plan.chunks {
        let mut code = format!("// {} ({})\n", chunk.name, kind_name(chunk.kind));
        for id in &chunk.modules {
            if let Some(module) = lowered.get(id) {
                code.push_str(module);
            }
        }
        if let (ChunkKind::Entry, Some(root_id)) = (chunk.kind, chunk.root) {
            code.push_str(&format!(
                "__nexus_require__({});\n",
                serde_json::to_string(&registry_id(root_id)).unwrap_or_default()
            ));
        }
        files.add(chunk.file(), code);

        let ids = |indexes: &[ChunkIndex]| -> Vec<String> {
            indexes.iter().map(|&i| plan.chunks[i].id.clone()).collect()
        };
        manifest_chunks.insert(
            chunk.id.clone(),
            ChunkRecord {
                file: chunk.file(),
                kind: chunk.kind,
                modules: chunk.modules.iter().map(|&m| registry_id(m)).collect(),
                imports: ids(&chunk.imports),
                dynamic_imports: ids(&chunk.dynamic_imports),
            },
        );
    }

    let mut css = String::new();
    let mut assets: BTreeSet<String> = BTreeSet::new();
    for &id in &plan.order {
        let Some(output) = outputs.get(&id) else {
            continue;
        };
        if let Some(sheet) = output.css.as_deref().filter(|s| !s.trim().is_empty()) {
            css.push_str(sheet.trim_end());
            css.push('\n');
        }
        if let Some(asset) = &output.asset {
            if assets.insert(asset.file_name.clone()) {
                files.add(asset.file_name.clone(), asset.bytes.to_vec());
            }
        }
    }
    let stylesheets: Vec<String> = if css.is_empty() {
        Vec::new()
    } else {
        let name = format!("assets/style-{}.css", short(&blake3_bytes(css.as_bytes())));
        files.add(name.clone(), css);
        vec![name]
    };

    let public = |file: &str| format!("/{file}");
    let mut chunk_map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for chunk in &plan.chunks {
        for &target in &chunk.dynamic_imports {
            let Some(target_root) = plan.chunks[target].root else {
                continue;
            };
            chunk_map.entry(registry_id(target_root)).or_insert_with(|| {
                plan.load_order(target)
                    .into_iter()
                    .map(|i| public(&plan.chunks[i].file()))
                    .collect()
            });
        }
    }
    let runtime = runtime_source(&chunk_map);
    let runtime_file = format!("assets/nexus-runtime-{}.js", short(&blake3_bytes(runtime.as_bytes())));
    files.add(runtime_file.clone(), runtime);

    let mut manifest = BuildManifest::new(runtime_file.clone());
    manifest.chunks = manifest_chunks;
    manifest.css = stylesheets.clone();
    manifest.assets = assets.into_iter().collect();

    let mut scripts = vec![public(&runtime_file)];
    let mut seen: HashSet<ChunkIndex> = HashSet::default();
    let mut entry_urls = Vec::new();
    for (index, chunk) in plan.entry_chunks() {
        manifest.entries.insert(chunk.name.clone(), chunk.id.clone());
        if let Some(root_id) = chunk.root {
            entry_urls.push(registry_id(root_id));
        }
        for dep in plan.load_order(index) {
            if seen.insert(dep) {
                scripts.push(public(&plan.chunks[dep].file()));
            }
        }
    }

    let template = std::fs::read_to_string(root.join("index.html"))
        .unwrap_or_else(|_| generate_index_html(None));
    let styles: Vec<String> = stylesheets.iter().map(|s| format!("/{s}")).collect();
    files.add("index.html", production_html(&template, &entry_urls, &styles, &scripts));

    let manifest_json = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| Error::other(format!("failed to serialize manifest: {e}")))?;

    prepare_out_dir(out_dir, &root)?;
    let mut written = nexus_util::fs::copy_tree(&root.join("public"), out_dir)?;
    written.extend(files.write(out_dir)?);
    let manifest_path = out_dir.join("manifest.json");
    atomic_write(&manifest_path, &manifest_json)?;
    written.push(manifest_path);

    Ok(Emitted {
        manifest,
        files: written,
    })
}

/// Resolved target of the edge `record` describes.
fn edge_target(graph: &ModuleGraph, from: ModuleId, record: &ImportRecord) -> Option<ModuleId> {
    graph
        .get(from)?
        .edges
        .iter()
        .find(|e| e.specifier == record.specifier && e.kind == record.kind)
        .and_then(|e| e.resolved())
}

fn kind_name(kind: ChunkKind) -> &'static str {
    match kind {
        ChunkKind::Entry => "entry",
        ChunkKind::Dynamic => "dynamic",
        ChunkKind::Shared => "shared",
    }
}

/// Empty the output directory. Refuses directories that contain the root.
fn prepare_out_dir(out_dir: &Path, root: &Path) -> Result<(), Error> {
    if root.starts_with(out_dir) {
        return Err(Error::other(format!(
            "output directory {} contains the project root",
            out_dir.display()
        )));
    }
    if out_dir.is_dir() {
        std::fs::remove_dir_all(out_dir)?;
    }
    std::fs::create_dir_all(out_dir)?;
    Ok(())
}

/// Memoized "does `from` reach `to` over static edges".
struct CycleCheck<'g> {
    graph: &'g ModuleGraph,
    reach: HashMap<ModuleId, HashSet<ModuleId>>,
}

impl<'g> CycleCheck<'g> {
    fn new(graph: &'g ModuleGraph) -> Self {
        Self {
            graph,
            reach: HashMap::default(),
        }
    }

    fn reaches(&mut self, from: ModuleId, to: ModuleId) -> bool {
        let graph = self.graph;
        self.reach
            .entry(from)
            .or_insert_with(|| graph.reachable(&[from], false))
            .contains(&to)
    }
}
