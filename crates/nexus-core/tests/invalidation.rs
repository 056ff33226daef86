//! Integration tests for incremental invalidation through the public API.

use nexus_core::{GraphBuilder, NexusConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn project(files: &[(&str, &str)]) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = dunce::canonicalize(dir.path()).unwrap();
    for (name, body) in files {
        let path = root.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }
    (dir, root)
}

fn builder(root: &Path) -> GraphBuilder {
    let pool = Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap());
    GraphBuilder::new(&NexusConfig::new(root), pool)
}

const CHAIN: &[(&str, &str)] = &[
    ("a.js", "import { b } from './b.js';\nconsole.log(b);\n"),
    ("b.js", "import { c } from './c.js';\nexport const b = c + 1;\n"),
    ("c.js", "export const c = 1;\n"),
    ("other.js", "export const other = true;\n"),
];

#[test]
fn test_leaf_change_invalidates_importer_chain() {
    let (_dir, root) = project(CHAIN);
    let mut builder = builder(&root);
    builder.build_entries(&[root.join("a.js"), root.join("other.js")]);
    let before = builder.generation();

    fs::write(root.join("c.js"), "export const c = 2;\n").unwrap();
    let report = builder.invalidate(&[root.join("c.js")]);

    assert_eq!(report.generation, before + 1);
    assert_eq!(report.changed_ids, vec!["/c.js", "/b.js", "/a.js"]);
    assert!(report.full_reload.is_none());
    assert!(report.errors.is_empty());
    assert!(!report.changed_ids.contains(&"/other.js".to_string()));
}

#[test]
fn test_unchanged_content_is_a_noop() {
    let (_dir, root) = project(CHAIN);
    let mut builder = builder(&root);
    builder.build_entries(&[root.join("a.js")]);
    let before = builder.generation();

    fs::write(root.join("c.js"), "export const c = 1;\n").unwrap();
    let report = builder.invalidate(&[root.join("c.js")]);

    assert!(report.is_empty());
    assert_eq!(builder.generation(), before);
}

#[test]
fn test_rebuild_after_change_serves_new_output() {
    let (_dir, root) = project(CHAIN);
    let mut builder = builder(&root);
    builder.build_entries(&[root.join("a.js")]);

    fs::write(root.join("c.js"), "export const c = 42;\n").unwrap();
    builder.invalidate(&[root.join("c.js")]);

    let key = builder.key_for(&root.join("c.js"));
    let id = builder.graph().id_of(&key).unwrap();
    let output = builder.output(id).unwrap();
    assert!(output.code.contains("42"));

    // A second pass over the same content changes nothing
    let again = builder.invalidate(&[root.join("c.js")]);
    assert!(again.is_empty());
}

#[test]
fn test_broken_change_reports_error_and_keeps_graph() {
    let (_dir, root) = project(&[
        ("main.js", "import data from './data.json';\nconsole.log(data);\n"),
        ("data.json", "{\"ok\": true}"),
    ]);
    let mut builder = builder(&root);
    builder.build_entries(&[root.join("main.js")]);
    let modules = builder.graph().len();

    fs::write(root.join("data.json"), "{ broken").unwrap();
    let report = builder.invalidate(&[root.join("data.json")]);

    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].0, "/data.json");
    assert_eq!(builder.graph().len(), modules);
}
