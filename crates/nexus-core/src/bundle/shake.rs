//! Dead export elimination.
//!
//! Collects which export names each module's importers use, then marks
//! `export function` and `export const|let|var` declarations that no importer
//! uses and nothing in their own module references. Entries, namespace
//! imports, `export *`, `require` and dynamic imports keep every export of
//! their target.

use super::js::{self, TokenKind};
use super::lower::{parse_import_clause, scan_exports, DeclKind, ExportForm};
use crate::graph::ModuleId;
use crate::imports::{scan_imports, ImportKind, ImportRecord};
use rustc_hash::FxHashMap as HashMap;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Usage {
    All,
    Names(BTreeSet<String>),
}

/// Export names used across the bundle, per module.
#[derive(Debug, Default)]
pub struct UsedExports {
    used: HashMap<ModuleId, Usage>,
}

impl UsedExports {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every export of `id` is used.
    pub fn mark_all(&mut self, id: ModuleId) {
        self.used.insert(id, Usage::All);
    }

    pub fn mark(&mut self, id: ModuleId, name: &str) {
        match self
            .used
            .entry(id)
            .or_insert_with(|| Usage::Names(BTreeSet::new()))
        {
            Usage::All => {}
            Usage::Names(names) => {
                names.insert(name.to_string());
            }
        }
    }

    #[must_use]
    pub fn is_used(&self, id: ModuleId, name: &str) -> bool {
        match self.used.get(&id) {
            Some(Usage::All) => true,
            Some(Usage::Names(names)) => names.contains(name),
            None => false,
        }
    }

    /// Record what `code` uses from each module it imports. `resolve` maps a
    /// record to its target in the graph.
    pub fn record_imports(
        &mut self,
        code: &str,
        resolve: impl Fn(&ImportRecord) -> Option<ModuleId>,
    ) {
        for record in scan_imports(code) {
            let Some(target) = resolve(&record) else {
                continue;
            };
            match record.kind {
                ImportKind::Static => {
                    let clause = parse_import_clause(&code[record.statement_span.clone()]);
                    if clause.namespace.is_some() {
                        self.mark_all(target);
                        continue;
                    }
                    if clause.default.is_some() {
                        self.mark(target, "default");
                    }
                    for (imported, _) in &clause.named {
                        self.mark(target, imported.trim_matches(|c| c == '"' || c == '\''));
                    }
                }
                ImportKind::ReExport | ImportKind::Dynamic | ImportKind::Require => {
                    self.mark_all(target);
                }
            }
        }
    }
}

/// Exported function and variable names in `code` that can be dropped.
#[must_use]
pub fn dead_exports(code: &str, id: ModuleId, used: &UsedExports) -> BTreeSet<String> {
    let tokens = js::tokenize(code);
    let mut dead = BTreeSet::new();
    for export in scan_exports(code, &tokens) {
        let ExportForm::Declaration {
            kind, names, span, ..
        } = export.form
        else {
            continue;
        };
        if kind == DeclKind::Class {
            continue;
        }
        for name in names {
            if used.is_used(id, &name) {
                continue;
            }
            let referenced = tokens.iter().enumerate().any(|(i, t)| {
                t.kind == TokenKind::Ident
                    && !span.contains(&t.span.start)
                    && t.text(code) == name
                    && js::is_reference(&tokens, i)
            });
            if !referenced {
                dead.insert(name);
            }
        }
    }
    dead
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ModuleId = ModuleId(0);
    const B: ModuleId = ModuleId(1);

    fn resolve_to(target: ModuleId) -> impl Fn(&ImportRecord) -> Option<ModuleId> {
        move |_| Some(target)
    }

    #[test]
    fn test_named_imports_are_recorded() {
        let mut used = UsedExports::new();
        used.record_imports("import d, { a, b as c } from './b.js';", resolve_to(B));
        assert!(used.is_used(B, "default"));
        assert!(used.is_used(B, "a"));
        assert!(used.is_used(B, "b"));
        assert!(!used.is_used(B, "c"));
        assert!(!used.is_used(A, "a"));
    }

    #[test]
    fn test_namespace_and_dynamic_use_everything() {
        let mut used = UsedExports::new();
        used.record_imports("import * as ns from './b.js';", resolve_to(B));
        assert!(used.is_used(B, "anything"));

        let mut used = UsedExports::new();
        used.record_imports("const m = import('./b.js');", resolve_to(B));
        assert!(used.is_used(B, "anything"));
    }

    #[test]
    fn test_mark_all_wins_over_names() {
        let mut used = UsedExports::new();
        used.mark_all(A);
        used.mark(A, "x");
        assert!(used.is_used(A, "y"));
    }

    #[test]
    fn test_unused_exports_are_dead() {
        let mut used = UsedExports::new();
        used.mark(B, "used");
        let code = "export function used() {}\nexport function unused() { return unused(); }\nexport const helper = 1;\nexport const local = 2;\nconsole.log(local);\nexport class Kept {}\n";
        let dead = dead_exports(code, B, &used);
        assert_eq!(
            dead.into_iter().collect::<Vec<_>>(),
            vec!["helper".to_string(), "unused".to_string()]
        );
    }

    #[test]
    fn test_entry_keeps_everything() {
        let mut used = UsedExports::new();
        used.mark_all(A);
        assert!(dead_exports("export const a = 1;", A, &used).is_empty());
    }
}
