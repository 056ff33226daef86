//! ES module to registry factory lowering.
//!
//! Each module becomes
//!
//! ```text
//! __nexus_register__("/src/a.js", function (require, module, exports) {
//! __nexus_export__(exports, { "x": () => x });
//! const { y } = require("/src/b.js");
//! ...
//! });
//! ```
//!
//! Import statements turn into destructured `require` calls, or into member
//! access on the required namespace when the edge is part of a cycle, so the
//! binding is read when used rather than when the factory runs. Exports are
//! getters installed before the body runs.

use super::js::{self, Token, TokenKind};
use crate::imports::{scan_imports, ImportKind, ImportRecord};
use rustc_hash::FxHashMap as HashMap;
use std::collections::BTreeSet;
use std::ops::Range;

/// Where an import points in the bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportBinding {
    /// Registry id of the target.
    pub id: String,
    /// The target can reach the importer: bindings must be read lazily.
    pub lazy: bool,
}

/// A module lowered to its factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoweredModule {
    pub code: String,
    /// Export names, sorted.
    pub exports: Vec<String>,
}

/// Name bound to an anonymous default export.
const DEFAULT_LOCAL: &str = "__nexus_default__";

/// Lower `code` into a factory registered as `id`.
///
/// `resolve` maps an import record to its bundle target; `None` leaves the
/// specifier as is. Declarations whose every exported name is in `dead` are
/// removed.
pub fn lower_module(
    id: &str,
    code: &str,
    resolve: impl Fn(&ImportRecord) -> Option<ImportBinding>,
    dead: &BTreeSet<String>,
) -> LoweredModule {
    let tokens = js::tokenize(code);
    let mut edits: Vec<(Range<usize>, String)> = Vec::new();
    let mut getters: Vec<(String, String)> = Vec::new();
    let mut lazy: HashMap<String, String> = HashMap::default();
    let mut counter = 0usize;

    for record in scan_imports(code) {
        let binding = resolve(&record);
        let target = js_string(binding.as_ref().map_or(record.specifier.as_str(), |b| b.id.as_str()));
        let statement = &code[record.statement_span.clone()];
        match record.kind {
            ImportKind::Static => {
                let clause = parse_import_clause(statement);
                let is_lazy = binding.as_ref().is_some_and(|b| b.lazy);
                let text = lower_import(&clause, &target, is_lazy, &mut counter, &mut lazy);
                edits.push((record.statement_span, text));
            }
            ImportKind::ReExport => {
                let text = match parse_reexport(statement) {
                    ReExport::Star => format!("__nexus_export_star__(exports, require({target}));"),
                    ReExport::Namespace(name) => {
                        let var = next_var("re", &mut counter);
                        getters.push((name, var.clone()));
                        format!("const {var} = require({target});")
                    }
                    ReExport::Named(pairs) => {
                        let var = next_var("re", &mut counter);
                        for (imported, exported) in pairs {
                            getters.push((unquote(&exported), member(&var, &imported)));
                        }
                        format!("const {var} = require({target});")
                    }
                };
                edits.push((record.statement_span, text));
            }
            ImportKind::Dynamic if binding.is_some() => {
                edits.push((record.statement_span, format!("__nexus_import__({target})")));
            }
            ImportKind::Require if binding.is_some() => {
                edits.push((record.statement_span, format!("require({target})")));
            }
            ImportKind::Dynamic | ImportKind::Require => {}
        }
    }

    for export in scan_exports(code, &tokens) {
        match export.form {
            ExportForm::Declaration { names, strip, span, .. } => {
                if !names.is_empty() && names.iter().all(|n| dead.contains(n)) {
                    edits.push((span, String::new()));
                    continue;
                }
                edits.push((strip, String::new()));
                getters.extend(names.into_iter().map(|n| (n.clone(), n)));
            }
            ExportForm::Default { prefix, name: Some(name) } => {
                edits.push((prefix, String::new()));
                getters.push(("default".to_string(), name));
            }
            ExportForm::Default { prefix, name: None } => {
                edits.push((prefix, format!("const {DEFAULT_LOCAL} = ")));
                getters.push(("default".to_string(), DEFAULT_LOCAL.to_string()));
            }
            ExportForm::List { span, pairs } => {
                edits.push((span, String::new()));
                for (local, exported) in pairs {
                    let value = lazy.get(&local).cloned().unwrap_or(local);
                    getters.push((unquote(&exported), value));
                }
            }
        }
    }

    for (i, token) in tokens.iter().enumerate() {
        if token.kind != TokenKind::Ident {
            continue;
        }
        let word = token.text(code);
        if word == "import" && is_meta(&tokens, code, i) {
            let hot = tokens.get(i + 3).is_some_and(|t| t.is_punct(b'.'))
                && tokens.get(i + 4).is_some_and(|t| t.is_word(code, "hot"));
            let (end, text) = if hot {
                (tokens[i + 4].span.end, "module.hot")
            } else {
                (tokens[i + 2].span.end, "module.meta")
            };
            edits.push((token.span.start..end, text.to_string()));
        } else if let Some(value) = lazy.get(word) {
            if js::is_reference(&tokens, i) && !declares(&tokens, code, i) {
                let text = if js::is_shorthand(&tokens, i) {
                    format!("{word}: {value}")
                } else {
                    value.clone()
                };
                edits.push((token.span.clone(), text));
            }
        }
    }

    getters.sort();
    getters.dedup_by(|a, b| a.0 == b.0);
    let exports = getters.iter().map(|(name, _)| name.clone()).collect();

    let mut out = String::with_capacity(code.len() + 128);
    out.push_str(&format!(
        "__nexus_register__({}, function (require, module, exports) {{\n",
        js_string(id)
    ));
    if !getters.is_empty() {
        let fields: Vec<String> = getters
            .iter()
            .map(|(name, value)| format!("{}: () => {value}", js_string(name)))
            .collect();
        out.push_str(&format!("__nexus_export__(exports, {{ {} }});\n", fields.join(", ")));
    }
    let body = apply_edits(code, edits);
    out.push_str(body.trim_end());
    out.push_str("\n});\n");

    LoweredModule { code: out, exports }
}

/// Factory for a module that failed to build; requiring it throws.
#[must_use]
pub fn failing_module(id: &str, message: &str) -> String {
    format!(
        "__nexus_register__({}, function () {{\nthrow new Error({});\n}});\n",
        js_string(id),
        js_string(message)
    )
}

fn apply_edits(code: &str, mut edits: Vec<(Range<usize>, String)>) -> String {
    // Outer edits first so nested ones are dropped
    edits.sort_by(|a, b| a.0.start.cmp(&b.0.start).then(b.0.end.cmp(&a.0.end)));
    let mut out = String::with_capacity(code.len());
    let mut cursor = 0;
    for (range, text) in edits {
        if range.start < cursor {
            continue;
        }
        out.push_str(&code[cursor..range.start]);
        out.push_str(&text);
        cursor = range.end;
    }
    out.push_str(&code[cursor..]);
    out
}

fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{s}\""))
}

fn next_var(prefix: &str, counter: &mut usize) -> String {
    let var = format!("__nexus_{prefix}{counter}__");
    *counter += 1;
    var
}

fn unquote(name: &str) -> String {
    name.trim_matches(|c| c == '"' || c == '\'').to_string()
}

fn is_identifier(name: &str) -> bool {
    let bytes = name.as_bytes();
    !bytes.is_empty() && js::is_ident_start(bytes[0]) && bytes.iter().all(|&b| js::is_ident_continue(b))
}

/// `ns.name`, or `ns["name"]` for names that are not identifiers.
fn member(ns: &str, name: &str) -> String {
    let name = unquote(name);
    if is_identifier(&name) {
        format!("{ns}.{name}")
    } else {
        format!("{ns}[{}]", js_string(&name))
    }
}

fn is_meta(tokens: &[Token], code: &str, i: usize) -> bool {
    tokens.get(i + 1).is_some_and(|t| t.is_punct(b'.'))
        && tokens.get(i + 2).is_some_and(|t| t.is_word(code, "meta"))
        && !(i > 0 && tokens[i - 1].is_punct(b'.'))
}

/// Identifier at `i` is being declared, e.g. a parameter or local that
/// shadows an import.
fn declares(tokens: &[Token], code: &str, i: usize) -> bool {
    i > 0
        && ["const", "let", "var", "function", "class"]
            .iter()
            .any(|kw| tokens[i - 1].is_word(code, kw))
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ImportClause {
    pub default: Option<String>,
    pub namespace: Option<String>,
    /// `(imported, local)`; `imported` keeps quotes for string names.
    pub named: Vec<(String, String)>,
}

impl ImportClause {
    fn is_empty(&self) -> bool {
        self.default.is_none() && self.namespace.is_none() && self.named.is_empty()
    }
}

/// Parse the bindings of an `import ... from "x"` statement.
pub(crate) fn parse_import_clause(statement: &str) -> ImportClause {
    let tokens = js::tokenize(statement);
    let mut clause = ImportClause::default();
    let mut i = 1;
    while i < tokens.len() {
        let t = &tokens[i];
        if t.depth == 0 && (t.is_word(statement, "from") || t.kind == TokenKind::Literal) {
            break;
        }
        if t.is_punct(b'*') {
            if let Some(name) = tokens.get(i + 2).filter(|n| n.kind == TokenKind::Ident) {
                clause.namespace = Some(name.text(statement).to_string());
            }
            i += 3;
            continue;
        }
        if t.is_punct(b'{') {
            let close = js::matching_close(&tokens, i);
            clause.named = parse_specifiers(&tokens[i + 1..close], statement);
            i = close + 1;
            continue;
        }
        if t.kind == TokenKind::Ident {
            clause.default = Some(t.text(statement).to_string());
        }
        i += 1;
    }
    clause
}

/// `a`, `a as b`, `"a-b" as c`, `type T`. Returns `(name, alias)` pairs;
/// type-only specifiers are dropped.
fn parse_specifiers(tokens: &[Token], src: &str) -> Vec<(String, String)> {
    tokens
        .split(|t| t.is_punct(b','))
        .filter_map(|item| {
            let words: Vec<&str> = item.iter().map(|t| t.text(src)).collect();
            match words.as_slice() {
                ["type", _] | ["type", _, "as", _] => None,
                [name] => Some((name.to_string(), name.to_string())),
                [name, "as", alias] => Some((name.to_string(), alias.to_string())),
                _ => None,
            }
        })
        .collect()
}

fn lower_import(
    clause: &ImportClause,
    target: &str,
    lazy_edge: bool,
    counter: &mut usize,
    lazy: &mut HashMap<String, String>,
) -> String {
    if clause.is_empty() {
        return format!("require({target});");
    }

    if lazy_edge {
        let ns = clause
            .namespace
            .clone()
            .unwrap_or_else(|| next_var("m", counter));
        if let Some(local) = &clause.default {
            lazy.insert(local.clone(), member(&ns, "default"));
        }
        for (imported, local) in &clause.named {
            lazy.insert(local.clone(), member(&ns, imported));
        }
        return format!("const {ns} = require({target});");
    }

    let mut fields: Vec<String> = Vec::new();
    if let Some(local) = &clause.default {
        fields.push(format!("default: {local}"));
    }
    for (imported, local) in &clause.named {
        if imported == local {
            fields.push(local.clone());
        } else {
            fields.push(format!("{imported}: {local}"));
        }
    }
    match (&clause.namespace, fields.is_empty()) {
        (Some(ns), true) => format!("const {ns} = require({target});"),
        (Some(ns), false) => format!(
            "const {ns} = require({target});\nconst {{ {} }} = {ns};",
            fields.join(", ")
        ),
        (None, _) => format!("const {{ {} }} = require({target});", fields.join(", ")),
    }
}

enum ReExport {
    Star,
    Namespace(String),
    /// `(imported, exported)`.
    Named(Vec<(String, String)>),
}

fn parse_reexport(statement: &str) -> ReExport {
    let tokens = js::tokenize(statement);
    match tokens.get(1) {
        Some(t) if t.is_punct(b'*') => match tokens.get(3) {
            Some(name) if tokens[2].is_word(statement, "as") => {
                ReExport::Namespace(unquote(name.text(statement)))
            }
            _ => ReExport::Star,
        },
        Some(t) if t.is_punct(b'{') => {
            let close = js::matching_close(&tokens, 1);
            ReExport::Named(parse_specifiers(&tokens[2..close], statement))
        }
        _ => ReExport::Star,
    }
}

/// A top-level `export` statement with a local binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExportStatement {
    pub form: ExportForm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeclKind {
    Function,
    Class,
    Variable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExportForm {
    /// `export function f`, `export class C`, `export const a = 1, b = 2`.
    Declaration {
        kind: DeclKind,
        names: Vec<String>,
        /// The `export ` keyword to strip.
        strip: Range<usize>,
        /// The whole statement.
        span: Range<usize>,
    },
    /// `export default ...`. Named functions and classes keep their
    /// declaration; anything else is bound to a local.
    Default {
        prefix: Range<usize>,
        name: Option<String>,
    },
    /// `export { a, b as c }` without a source. `(local, exported)` pairs.
    List {
        span: Range<usize>,
        pairs: Vec<(String, String)>,
    },
}

/// Find local `export` statements. Re-exports with a `from` clause are left
/// to the import scanner.
pub(crate) fn scan_exports(code: &str, tokens: &[Token]) -> Vec<ExportStatement> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let t = &tokens[i];
        let top_level_export = t.depth == 0
            && t.is_word(code, "export")
            && !(i > 0 && tokens[i - 1].is_punct(b'.'));
        if !top_level_export {
            i += 1;
            continue;
        }
        match scan_export_at(code, tokens, i) {
            Some((form, next)) => {
                out.push(ExportStatement { form });
                i = next.max(i + 1);
            }
            None => i += 1,
        }
    }
    out
}

fn scan_export_at(code: &str, tokens: &[Token], at: usize) -> Option<(ExportForm, usize)> {
    let start = tokens[at].span.start;
    let next = tokens.get(at + 1)?;
    let word = next.text(code);
    match word {
        "default" => {
            let body = tokens.get(at + 2)?;
            let mut k = at + 2;
            if body.is_word(code, "async") {
                k += 1;
            }
            let is_decl = tokens
                .get(k)
                .is_some_and(|t| t.is_word(code, "function") || t.is_word(code, "class"));
            let name = if is_decl {
                let mut n = k + 1;
                if tokens.get(n).is_some_and(|t| t.is_punct(b'*')) {
                    n += 1;
                }
                tokens
                    .get(n)
                    .filter(|t| t.kind == TokenKind::Ident && !t.is_word(code, "extends"))
                    .map(|t| t.text(code).to_string())
            } else {
                None
            };
            Some((
                ExportForm::Default {
                    prefix: start..body.span.start,
                    name,
                },
                at + 2,
            ))
        }
        "function" | "async" | "class" => {
            let kind = if word == "class" {
                DeclKind::Class
            } else {
                DeclKind::Function
            };
            let keyword = if word == "async" { at + 2 } else { at + 1 };
            let mut n = keyword + 1;
            if tokens.get(n).is_some_and(|t| t.is_punct(b'*')) {
                n += 1;
            }
            let name = tokens.get(n).filter(|t| t.kind == TokenKind::Ident)?;
            let close = declaration_body_end(tokens, n, kind)?;
            Some((
                ExportForm::Declaration {
                    kind,
                    names: vec![name.text(code).to_string()],
                    strip: start..next.span.start,
                    span: start..tokens[close].span.end,
                },
                close + 1,
            ))
        }
        "const" | "let" | "var" => {
            let end = js::statement_end(tokens, code, at);
            let names = declared_names(&tokens[at + 2..end], code);
            let last = tokens.get(end.checked_sub(1)?)?;
            Some((
                ExportForm::Declaration {
                    kind: DeclKind::Variable,
                    names,
                    strip: start..next.span.start,
                    span: start..last.span.end,
                },
                end,
            ))
        }
        "{" => {
            let close = js::matching_close(tokens, at + 1);
            if tokens
                .get(close + 1)
                .is_some_and(|t| t.is_word(code, "from"))
            {
                return None;
            }
            let mut end = tokens[close].span.end;
            let mut after = close + 1;
            if let Some(semi) = tokens.get(after).filter(|t| t.is_punct(b';')) {
                end = semi.span.end;
                after += 1;
            }
            Some((
                ExportForm::List {
                    span: start..end,
                    pairs: parse_specifiers(&tokens[at + 2..close], code),
                },
                after,
            ))
        }
        _ => None,
    }
}

/// Token index of the `}` closing a function or class body whose name is at
/// `name`.
fn declaration_body_end(tokens: &[Token], name: usize, kind: DeclKind) -> Option<usize> {
    let depth = tokens[name].depth;
    let mut i = name + 1;
    if kind == DeclKind::Function {
        let params = (i..tokens.len()).find(|&k| tokens[k].is_punct(b'('))?;
        i = js::matching_close(tokens, params) + 1;
    }
    let open = (i..tokens.len()).find(|&k| tokens[k].depth == depth && tokens[k].is_punct(b'{'))?;
    Some(js::matching_close(tokens, open))
}

/// Names bound by the declarators in `tokens` (everything after the
/// `const`/`let`/`var` keyword).
fn declared_names(tokens: &[Token], code: &str) -> Vec<String> {
    let Some(first) = tokens.first() else {
        return Vec::new();
    };
    let depth = first.depth;
    let mut names = Vec::new();
    let mut expect_binding = true;
    let mut i = 0;
    while i < tokens.len() {
        let t = &tokens[i];
        if expect_binding && t.depth == depth {
            match t.kind {
                TokenKind::Ident => names.push(t.text(code).to_string()),
                TokenKind::Punct(b'{' | b'[') => {
                    let close = js::matching_close(tokens, i);
                    names.extend(pattern_names(&tokens[i..=close], code));
                    i = close;
                }
                _ => {}
            }
            expect_binding = false;
        } else if t.depth == depth && t.is_punct(b',') {
            expect_binding = true;
        }
        i += 1;
    }
    names
}

/// Bindings inside a destructuring pattern, e.g. `{ a, b: c, d = 1, ...e }`.
fn pattern_names(tokens: &[Token], code: &str) -> Vec<String> {
    let mut names = Vec::new();
    for (i, t) in tokens.iter().enumerate() {
        if t.kind != TokenKind::Ident || i == 0 {
            continue;
        }
        let prev = &tokens[i - 1];
        let next = tokens.get(i + 1);
        let is_key = next.is_some_and(|n| n.is_punct(b':'));
        let binding_position = matches!(prev.kind, TokenKind::Punct(b'{' | b'[' | b',' | b':' | b'.'));
        if binding_position && !is_key {
            names.push(t.text(code).to_string());
        }
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_all(record: &ImportRecord) -> Option<ImportBinding> {
        Some(ImportBinding {
            id: format!("/{}", record.specifier.trim_start_matches("./")),
            lazy: false,
        })
    }

    fn lower(code: &str) -> LoweredModule {
        lower_module("/m.js", code, resolve_all, &BTreeSet::new())
    }

    #[test]
    fn test_parse_import_clause_forms() {
        let clause = parse_import_clause("import d, { a, b as c, \"x-y\" as z } from './m';");
        assert_eq!(clause.default.as_deref(), Some("d"));
        assert_eq!(
            clause.named,
            vec![
                ("a".to_string(), "a".to_string()),
                ("b".to_string(), "c".to_string()),
                ("\"x-y\"".to_string(), "z".to_string()),
            ]
        );

        let clause = parse_import_clause("import * as ns from \"./m\"");
        assert_eq!(clause.namespace.as_deref(), Some("ns"));
        assert!(parse_import_clause("import './side-effect';").is_empty());
    }

    #[test]
    fn test_imports_are_destructured() {
        let out = lower("import d, { a, b as c } from './dep.js';\nconsole.log(d, a, c);\n");
        assert!(out
            .code
            .contains("const { default: d, a, b: c } = require(\"/dep.js\");"));
        assert!(out.code.contains("console.log(d, a, c);"));
        assert!(out.code.starts_with("__nexus_register__(\"/m.js\", function (require, module, exports) {"));
    }

    #[test]
    fn test_cyclic_imports_use_member_access() {
        let code = "import { a } from './a.js';\nexport function b() { return a + 1; }\nconst o = { a };\n";
        let out = lower_module(
            "/b.js",
            code,
            |r| {
                Some(ImportBinding {
                    id: format!("/{}", r.specifier.trim_start_matches("./")),
                    lazy: true,
                })
            },
            &BTreeSet::new(),
        );
        assert!(out.code.contains("const __nexus_m0__ = require(\"/a.js\");"));
        assert!(out.code.contains("return __nexus_m0__.a + 1;"));
        assert!(out.code.contains("const o = { a: __nexus_m0__.a };"));
    }

    #[test]
    fn test_exports_become_getters() {
        let code = "export const x = 1, y = 2;\nexport function f() {}\nexport class C {}\nconst z = 3;\nexport { z as w };\n";
        let out = lower(code);
        assert_eq!(out.exports, vec!["C", "f", "w", "x", "y"]);
        let getters = out.code.lines().nth(1).unwrap();
        assert!(getters.starts_with("__nexus_export__(exports, {"));
        assert!(getters.contains("\"w\": () => z"));
        assert!(out.code.contains("const x = 1, y = 2;"));
        assert!(out.code.contains("\nfunction f() {}"));
        assert!(!out.code.contains("export "));
    }

    #[test]
    fn test_default_exports() {
        let out = lower("export default function main() {}\n");
        assert!(out.code.contains("\"default\": () => main"));
        assert!(out.code.contains("\nfunction main() {}"));

        let out = lower("export default { a: 1 };\n");
        assert!(out.code.contains("const __nexus_default__ = { a: 1 };"));
        assert!(out.code.contains("\"default\": () => __nexus_default__"));
    }

    #[test]
    fn test_reexports() {
        let out = lower("export * from './a.js';\nexport { b as c } from './b.js';\nexport * as ns from './n.js';\n");
        assert!(out.code.contains("__nexus_export_star__(exports, require(\"/a.js\"));"));
        assert!(out.code.contains("\"c\": () => __nexus_re0__.b"));
        assert!(out.code.contains("\"ns\": () => __nexus_re1__"));
    }

    #[test]
    fn test_dynamic_import_and_meta() {
        let out = lower("const m = import('./lazy.js');\nif (import.meta.hot) { import.meta.hot.accept(); }\nconst u = import.meta.url;\n");
        assert!(out.code.contains("__nexus_import__(\"/lazy.js\")"));
        assert!(out.code.contains("if (module.hot) { module.hot.accept(); }"));
        assert!(out.code.contains("const u = module.meta.url;"));
    }

    #[test]
    fn test_unresolved_imports_are_kept_by_specifier() {
        let out = lower_module("/m.js", "import fs from 'node:fs';\n", |_| None, &BTreeSet::new());
        assert!(out.code.contains("const { default: fs } = require(\"node:fs\");"));
    }

    #[test]
    fn test_dead_declarations_are_removed() {
        let dead: BTreeSet<String> = ["unused".to_string(), "gone".to_string()].into();
        let code = "export function unused() { return 1; }\nexport const gone = 2;\nexport const kept = 3;\n";
        let out = lower_module("/m.js", code, resolve_all, &dead);
        assert_eq!(out.exports, vec!["kept"]);
        assert!(!out.code.contains("unused"));
        assert!(!out.code.contains("gone"));
        assert!(out.code.contains("const kept = 3;"));
    }

    #[test]
    fn test_declared_names_with_patterns() {
        let code = "export const { a, b: c, d = 1, ...e } = obj, [f, g] = arr;";
        let tokens = js::tokenize(code);
        let exports = scan_exports(code, &tokens);
        let ExportForm::Declaration { names, .. } = &exports[0].form else {
            panic!("expected declaration");
        };
        assert_eq!(names, &vec!["a", "c", "d", "e", "f", "g"]);
    }
}
