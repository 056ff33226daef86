//! Module resolver for JavaScript/TypeScript.
//!
//! Relative and absolute specifiers probe the filesystem (literal path,
//! extensions, directory index). Bare specifiers walk up `node_modules`
//! and honor `exports`, falling back to the `browser`/`module`/`main`
//! fields. Results are memoized per build generation.

mod exports;

pub use exports::resolve_exports;

use crate::config::{NexusConfig, Target};
use crate::graph::{Conditions, ModuleKey};
use nexus_proto::codes;
use rustc_hash::FxHashMap as HashMap;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

/// Extensions probed after the literal path, in order.
pub const EXTENSIONS: &[&str] = &[".ts", ".tsx", ".js", ".jsx", ".mjs", ".cjs", ".json"];

/// Whether a module was requested through `import` or `require`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum RequestKind {
    #[default]
    Import,
    Require,
}

impl RequestKind {
    /// Condition name used in `exports` maps.
    #[must_use]
    pub fn condition(self) -> &'static str {
        match self {
            Self::Import => "import",
            Self::Require => "require",
        }
    }
}

/// Resolution failure recorded on a graph edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// Nothing on disk matched the specifier.
    NotFound { specifier: String, from: PathBuf },
    /// A `package.json` on the lookup path could not be used.
    InvalidManifest { path: PathBuf, message: String },
    /// Builtins and URLs are left to the runtime.
    External { specifier: String },
}

impl ResolutionError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => codes::RESOLVE_NOT_FOUND,
            Self::InvalidManifest { .. } => codes::RESOLVE_INVALID_MANIFEST,
            Self::External { .. } => codes::RESOLVE_EXTERNAL,
        }
    }

    /// Externals are expected and never reported as failures.
    #[must_use]
    pub fn is_external(&self) -> bool {
        matches!(self, Self::External { .. })
    }
}

impl fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { specifier, from } => {
                write!(f, "Cannot resolve '{specifier}' from {}", from.display())
            }
            Self::InvalidManifest { path, message } => {
                write!(f, "Invalid package manifest {}: {message}", path.display())
            }
            Self::External { specifier } => write!(f, "'{specifier}' is external"),
        }
    }
}

impl std::error::Error for ResolutionError {}

type MemoKey = (PathBuf, String, RequestKind);
type Manifest = Result<Arc<Value>, ResolutionError>;

/// Specifier resolver with a per-generation memo and a manifest cache.
#[derive(Debug)]
pub struct Resolver {
    target: Target,
    extra_conditions: Vec<String>,
    generation: u64,
    memo: HashMap<MemoKey, Result<ModuleKey, ResolutionError>>,
    manifests: HashMap<PathBuf, Option<Manifest>>,
}

impl Resolver {
    #[must_use]
    pub fn new(target: Target, extra_conditions: Vec<String>) -> Self {
        Self {
            target,
            extra_conditions,
            generation: 0,
            memo: HashMap::default(),
            manifests: HashMap::default(),
        }
    }

    #[must_use]
    pub fn from_config(config: &NexusConfig) -> Self {
        Self::new(config.target, config.conditions.clone())
    }

    #[must_use]
    pub fn target(&self) -> Target {
        self.target
    }

    /// Drop memoized resolutions when the generation moves.
    pub fn begin_generation(&mut self, generation: u64) {
        if generation != self.generation {
            self.generation = generation;
            self.memo.clear();
        }
    }

    /// Forget every parsed `package.json`.
    pub fn invalidate_manifests(&mut self) {
        self.manifests.clear();
        self.memo.clear();
    }

    /// Key for a file addressed directly (entries, served paths).
    #[must_use]
    pub fn key_for(&self, path: &Path, kind: RequestKind) -> ModuleKey {
        ModuleKey::new(canonical(path), Conditions::new(self.target, kind))
    }

    /// Resolve `specifier` imported from the file `from`.
    pub fn resolve(
        &mut self,
        specifier: &str,
        from: &Path,
        kind: RequestKind,
    ) -> Result<ModuleKey, ResolutionError> {
        let dir = from.parent().unwrap_or(from).to_path_buf();
        let memo_key = (dir, specifier.to_string(), kind);
        if let Some(hit) = self.memo.get(&memo_key) {
            return hit.clone();
        }

        let result = self.resolve_uncached(specifier, &memo_key.0, from, kind);
        trace!(specifier, from = %from.display(), ok = result.is_ok(), "resolve");
        self.memo.insert(memo_key, result.clone());
        result
    }

    fn resolve_uncached(
        &mut self,
        specifier: &str,
        dir: &Path,
        from: &Path,
        kind: RequestKind,
    ) -> Result<ModuleKey, ResolutionError> {
        let not_found = || ResolutionError::NotFound {
            specifier: specifier.to_string(),
            from: from.to_path_buf(),
        };

        if specifier.is_empty() {
            return Err(not_found());
        }
        if is_external(specifier) {
            return Err(ResolutionError::External {
                specifier: specifier.to_string(),
            });
        }

        let path = if specifier.starts_with("./") || specifier.starts_with("../") {
            resolve_file_or_directory(&dir.join(specifier), self.target)
        } else if Path::new(specifier).is_absolute() {
            resolve_file_or_directory(Path::new(specifier), self.target)
        } else {
            self.resolve_bare(specifier, dir, kind)?
        };

        path.map(|p| self.key_for(&p, kind)).ok_or_else(not_found)
    }

    fn resolve_bare(
        &mut self,
        specifier: &str,
        dir: &Path,
        kind: RequestKind,
    ) -> Result<Option<PathBuf>, ResolutionError> {
        let (pkg_name, subpath) = parse_bare_specifier(specifier);
        let mut current = Some(dir);

        while let Some(d) = current {
            let pkg_dir = d.join("node_modules").join(pkg_name);
            if pkg_dir.is_dir() {
                if let Some(found) = self.resolve_in_package(&pkg_dir, subpath, kind)? {
                    return Ok(Some(found));
                }
            }
            current = d.parent();
        }
        Ok(None)
    }

    /// Resolve inside one package directory. A package with `exports` is
    /// authoritative: a miss there does not fall back to the filesystem.
    fn resolve_in_package(
        &mut self,
        pkg_dir: &Path,
        subpath: Option<&str>,
        kind: RequestKind,
    ) -> Result<Option<PathBuf>, ResolutionError> {
        let manifest_path = pkg_dir.join("package.json");
        let manifest = self.manifest(&manifest_path)?;

        if let Some(exports) = manifest.as_deref().and_then(|m| m.get("exports")) {
            let key = subpath.map_or_else(|| ".".to_string(), |s| format!("./{s}"));
            let conditions = self.active_conditions(kind);
            let target = resolve_exports(exports, &key, &conditions).map_err(|message| {
                ResolutionError::InvalidManifest {
                    path: manifest_path.clone(),
                    message,
                }
            })?;
            return Ok(target.and_then(|t| resolve_file(&pkg_dir.join(t.trim_start_matches("./")))));
        }

        if let Some(sub) = subpath {
            return Ok(resolve_file_or_directory(&pkg_dir.join(sub), self.target));
        }

        if let Some(manifest) = manifest.as_deref() {
            for field in main_fields(self.target) {
                if let Some(main) = manifest.get(*field).and_then(Value::as_str) {
                    let found = resolve_file_or_directory(&pkg_dir.join(main), self.target);
                    if found.is_some() {
                        return Ok(found);
                    }
                }
            }
        }

        Ok(resolve_index(pkg_dir))
    }

    /// Active condition set, in priority order.
    fn active_conditions(&self, kind: RequestKind) -> Vec<&str> {
        let mut conditions = vec![self.target.condition(), kind.condition()];
        conditions.extend(self.extra_conditions.iter().map(String::as_str));
        conditions.push("default");
        conditions
    }

    fn manifest(&mut self, path: &Path) -> Result<Option<Arc<Value>>, ResolutionError> {
        if let Some(cached) = self.manifests.get(path) {
            return cached.clone().transpose();
        }
        let loaded = read_manifest(path);
        self.manifests.insert(path.to_path_buf(), loaded.clone());
        loaded.transpose()
    }
}

fn read_manifest(path: &Path) -> Option<Manifest> {
    let text = std::fs::read_to_string(path).ok()?;
    Some(
        serde_json::from_str::<Value>(&text)
            .map(Arc::new)
            .map_err(|e| ResolutionError::InvalidManifest {
                path: path.to_path_buf(),
                message: e.to_string(),
            }),
    )
}

fn main_fields(target: Target) -> &'static [&'static str] {
    match target {
        Target::Browser => &["browser", "module", "main"],
        Target::Node => &["module", "main"],
    }
}

/// `node:` builtins and URLs stay external.
fn is_external(specifier: &str) -> bool {
    specifier.starts_with("node:")
        || specifier.starts_with("data:")
        || specifier.starts_with("http:")
        || specifier.starts_with("https:")
        || specifier.contains("://")
}

/// Literal file, then each extension appended.
fn resolve_file(base: &Path) -> Option<PathBuf> {
    if base.is_file() {
        return Some(base.to_path_buf());
    }
    let name = base.file_name()?.to_string_lossy().into_owned();
    EXTENSIONS
        .iter()
        .map(|ext| base.with_file_name(format!("{name}{ext}")))
        .find(|candidate| candidate.is_file())
}

fn resolve_index(dir: &Path) -> Option<PathBuf> {
    EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("index{ext}")))
        .find(|candidate| candidate.is_file())
}

/// File probing, then a directory's own `package.json` main fields, then
/// its index file.
fn resolve_file_or_directory(base: &Path, target: Target) -> Option<PathBuf> {
    if let Some(file) = resolve_file(base) {
        return Some(file);
    }
    if !base.is_dir() {
        return None;
    }
    let manifest = std::fs::read_to_string(base.join("package.json"))
        .ok()
        .and_then(|text| serde_json::from_str::<Value>(&text).ok());
    if let Some(manifest) = manifest {
        for field in main_fields(target) {
            if let Some(main) = manifest.get(*field).and_then(Value::as_str) {
                let main_path = base.join(main);
                if let Some(found) = resolve_file(&main_path).or_else(|| resolve_index(&main_path))
                {
                    return Some(found);
                }
            }
        }
    }
    resolve_index(base)
}

/// Split `pkg/sub` and `@scope/pkg/sub` into package name and subpath.
fn parse_bare_specifier(spec: &str) -> (&str, Option<&str>) {
    let name_end = if spec.starts_with('@') {
        spec.match_indices('/').nth(1).map(|(i, _)| i)
    } else {
        spec.find('/')
    };
    match name_end {
        Some(i) => (&spec[..i], Some(&spec[i + 1..]).filter(|s| !s.is_empty())),
        None => (spec, None),
    }
}

fn canonical(path: &Path) -> PathBuf {
    dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, contents: &str) -> PathBuf {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        path
    }

    fn browser() -> Resolver {
        Resolver::new(Target::Browser, Vec::new())
    }

    #[test]
    fn test_relative_extension_probing() {
        let dir = tempdir().unwrap();
        let main = write(dir.path(), "src/main.js", "");
        let util = write(dir.path(), "src/util.ts", "");

        let key = browser().resolve("./util", &main, RequestKind::Import).unwrap();
        assert_eq!(key.path, canonical(&util));
        assert_eq!(key.conditions.kind, RequestKind::Import);
    }

    #[test]
    fn test_literal_path_wins_over_extension() {
        let dir = tempdir().unwrap();
        let main = write(dir.path(), "main.js", "");
        let literal = write(dir.path(), "data.json", "{}");
        write(dir.path(), "data.json.js", "");

        let key = browser().resolve("./data.json", &main, RequestKind::Import).unwrap();
        assert_eq!(key.path, canonical(&literal));
    }

    #[test]
    fn test_directory_index() {
        let dir = tempdir().unwrap();
        let main = write(dir.path(), "main.js", "");
        let index = write(dir.path(), "components/index.tsx", "");

        let key = browser().resolve("./components", &main, RequestKind::Import).unwrap();
        assert_eq!(key.path, canonical(&index));
    }

    #[test]
    fn test_not_found_names_specifier_and_importer() {
        let dir = tempdir().unwrap();
        let main = write(dir.path(), "main.js", "");

        let err = browser().resolve("./nope", &main, RequestKind::Import).unwrap_err();
        assert_eq!(err.code(), codes::RESOLVE_NOT_FOUND);
        assert!(err.to_string().contains("'./nope'"));
    }

    #[test]
    fn test_builtins_and_urls_are_external() {
        let dir = tempdir().unwrap();
        let main = write(dir.path(), "main.js", "");
        let mut resolver = browser();
        for spec in ["node:fs", "https://cdn.example.com/x.js", "data:text/javascript,1"] {
            let err = resolver.resolve(spec, &main, RequestKind::Import).unwrap_err();
            assert!(err.is_external(), "{spec}");
        }
    }

    #[test]
    fn test_bare_walks_up_node_modules() {
        let dir = tempdir().unwrap();
        let main = write(dir.path(), "src/deep/main.js", "");
        write(
            dir.path(),
            "node_modules/lib/package.json",
            r#"{"name":"lib","main":"./lib/index.js"}"#,
        );
        let entry = write(dir.path(), "node_modules/lib/lib/index.js", "");

        let key = browser().resolve("lib", &main, RequestKind::Import).unwrap();
        assert_eq!(key.path, canonical(&entry));
    }

    #[test]
    fn test_browser_field_only_for_browser_target() {
        let dir = tempdir().unwrap();
        let main = write(dir.path(), "main.js", "");
        write(
            dir.path(),
            "node_modules/pkg/package.json",
            r#"{"browser":"./browser.js","module":"./esm.js","main":"./cjs.js"}"#,
        );
        let b = write(dir.path(), "node_modules/pkg/browser.js", "");
        let m = write(dir.path(), "node_modules/pkg/esm.js", "");
        write(dir.path(), "node_modules/pkg/cjs.js", "");

        let key = browser().resolve("pkg", &main, RequestKind::Import).unwrap();
        assert_eq!(key.path, canonical(&b));

        let mut node = Resolver::new(Target::Node, Vec::new());
        let key = node.resolve("pkg", &main, RequestKind::Import).unwrap();
        assert_eq!(key.path, canonical(&m));
    }

    #[test]
    fn test_exports_conditions_and_subpaths() {
        let dir = tempdir().unwrap();
        let main = write(dir.path(), "main.js", "");
        write(
            dir.path(),
            "node_modules/@scope/ui/package.json",
            r#"{
                "exports": {
                    ".": { "import": "./esm/index.js", "require": "./cjs/index.cjs" },
                    "./button": "./esm/button.js",
                    "./icons/*": "./esm/icons/*.js"
                },
                "main": "./ignored.js"
            }"#,
        );
        let esm = write(dir.path(), "node_modules/@scope/ui/esm/index.js", "");
        let cjs = write(dir.path(), "node_modules/@scope/ui/cjs/index.cjs", "");
        let button = write(dir.path(), "node_modules/@scope/ui/esm/button.js", "");
        let icon = write(dir.path(), "node_modules/@scope/ui/esm/icons/star.js", "");
        write(dir.path(), "node_modules/@scope/ui/ignored.js", "");

        let mut resolver = browser();
        let import = resolver.resolve("@scope/ui", &main, RequestKind::Import).unwrap();
        assert_eq!(import.path, canonical(&esm));
        let require = resolver.resolve("@scope/ui", &main, RequestKind::Require).unwrap();
        assert_eq!(require.path, canonical(&cjs));
        assert_ne!(import, require);

        let key = resolver
            .resolve("@scope/ui/button", &main, RequestKind::Import)
            .unwrap();
        assert_eq!(key.path, canonical(&button));
        let key = resolver
            .resolve("@scope/ui/icons/star", &main, RequestKind::Import)
            .unwrap();
        assert_eq!(key.path, canonical(&icon));

        // Unexported subpaths are not reachable even if the file exists
        let err = resolver
            .resolve("@scope/ui/ignored.js", &main, RequestKind::Import)
            .unwrap_err();
        assert!(matches!(err, ResolutionError::NotFound { .. }));
    }

    #[test]
    fn test_extra_conditions() {
        let dir = tempdir().unwrap();
        let main = write(dir.path(), "main.js", "");
        write(
            dir.path(),
            "node_modules/pkg/package.json",
            r#"{"exports":{"development":"./dev.js","default":"./prod.js"}}"#,
        );
        let dev = write(dir.path(), "node_modules/pkg/dev.js", "");
        let prod = write(dir.path(), "node_modules/pkg/prod.js", "");

        let key = browser().resolve("pkg", &main, RequestKind::Import).unwrap();
        assert_eq!(key.path, canonical(&prod));

        let mut resolver = Resolver::new(Target::Browser, vec!["development".into()]);
        let key = resolver.resolve("pkg", &main, RequestKind::Import).unwrap();
        assert_eq!(key.path, canonical(&dev));
    }

    #[test]
    fn test_invalid_manifest() {
        let dir = tempdir().unwrap();
        let main = write(dir.path(), "main.js", "");
        write(dir.path(), "node_modules/broken/package.json", "{ not json");

        let err = browser().resolve("broken", &main, RequestKind::Import).unwrap_err();
        assert_eq!(err.code(), codes::RESOLVE_INVALID_MANIFEST);
    }

    #[test]
    fn test_memo_is_dropped_on_new_generation() {
        let dir = tempdir().unwrap();
        let main = write(dir.path(), "main.js", "");
        let mut resolver = browser();

        assert!(resolver.resolve("./later", &main, RequestKind::Import).is_err());
        let later = write(dir.path(), "later.js", "");
        // Same generation: memoized failure
        assert!(resolver.resolve("./later", &main, RequestKind::Import).is_err());

        resolver.begin_generation(1);
        let key = resolver.resolve("./later", &main, RequestKind::Import).unwrap();
        assert_eq!(key.path, canonical(&later));
    }

    #[test]
    fn test_invalidate_manifests_rereads_package_json() {
        let dir = tempdir().unwrap();
        let main = write(dir.path(), "main.js", "");
        write(dir.path(), "node_modules/pkg/package.json", r#"{"main":"./a.js"}"#);
        let a = write(dir.path(), "node_modules/pkg/a.js", "");
        let b = write(dir.path(), "node_modules/pkg/b.js", "");

        let mut resolver = browser();
        assert_eq!(
            resolver.resolve("pkg", &main, RequestKind::Import).unwrap().path,
            canonical(&a)
        );
        write(dir.path(), "node_modules/pkg/package.json", r#"{"main":"./b.js"}"#);
        resolver.invalidate_manifests();
        assert_eq!(
            resolver.resolve("pkg", &main, RequestKind::Import).unwrap().path,
            canonical(&b)
        );
    }

    #[test]
    fn test_parse_bare_specifier() {
        assert_eq!(parse_bare_specifier("lodash"), ("lodash", None));
        assert_eq!(parse_bare_specifier("lodash/fp"), ("lodash", Some("fp")));
        assert_eq!(parse_bare_specifier("@s/pkg"), ("@s/pkg", None));
        assert_eq!(parse_bare_specifier("@s/pkg/a/b"), ("@s/pkg", Some("a/b")));
    }
}
