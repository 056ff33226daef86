//! CSS modules: `@import` inlining, dev style injection, production
//! extraction.

use super::{TransformConfig, TransformError, TransformOutput};
use lightningcss::bundler::{Bundler, FileProvider, ResolveResult, SourceProvider};
use lightningcss::printer::PrinterOptions;
use lightningcss::stylesheet::ParserOptions;
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};

pub(super) fn transform_css(
    path: &Path,
    source: &str,
    config: &TransformConfig,
) -> Result<TransformOutput, TransformError> {
    let (css, deps) = bundle(path, source)?;

    if config.mode.is_production() {
        return Ok(TransformOutput {
            code: String::new(),
            css: Some(css),
            asset: None,
            extra_deps: deps,
        });
    }

    let id = nexus_util::fs::url_path(&config.root, path);
    Ok(TransformOutput {
        code: style_injector(&id, &css),
        css: None,
        asset: None,
        extra_deps: deps,
    })
}

/// Parse `source` and inline its relative `@import` rules. Returns the
/// printed stylesheet and every imported file, sorted.
fn bundle(path: &Path, source: &str) -> Result<(String, Vec<PathBuf>), TransformError> {
    let sources = ImportSources::new(path, source);
    let printed = {
        let mut bundler = Bundler::new(&sources, None, ParserOptions::default());
        bundler
            .bundle(path)
            .map_err(|e| e.to_string())
            .and_then(|sheet| {
                sheet
                    .to_css(PrinterOptions {
                        minify: false,
                        ..PrinterOptions::default()
                    })
                    .map(|out| out.code)
                    .map_err(|e| e.to_string())
            })
    };

    match printed {
        Ok(css) => Ok((css, sources.into_deps())),
        Err(message) => Err(TransformError::new(
            path,
            sources.unreadable().unwrap_or(message),
        )),
    }
}

/// Serves the module's own text from memory and everything it imports from
/// disk, remembering which files were read.
struct ImportSources<'s> {
    entry: &'s Path,
    source: &'s str,
    files: FileProvider,
    // Resolved path to the specifier that named it
    resolved: Mutex<BTreeMap<PathBuf, String>>,
    unreadable: Mutex<Option<(PathBuf, io::ErrorKind)>>,
}

impl<'s> ImportSources<'s> {
    fn new(entry: &'s Path, source: &'s str) -> Self {
        Self {
            entry,
            source,
            files: FileProvider::new(),
            resolved: Mutex::new(BTreeMap::new()),
            unreadable: Mutex::new(None),
        }
    }

    fn into_deps(self) -> Vec<PathBuf> {
        let entry = self.entry;
        self.resolved
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_keys()
            .filter(|p| p != entry)
            .collect()
    }

    /// Message naming the first import that could not be read.
    fn unreadable(&self) -> Option<String> {
        let (file, kind) = self
            .unreadable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        let resolved = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
        let specifier = resolved
            .get(&file)
            .cloned()
            .unwrap_or_else(|| file.display().to_string());
        Some(format!(
            "Cannot read @import \"{specifier}\": {}",
            io::Error::from(kind)
        ))
    }
}

impl SourceProvider for ImportSources<'_> {
    type Error = io::Error;

    fn read<'a>(&'a self, file: &Path) -> Result<&'a str, Self::Error> {
        if file == self.entry {
            return Ok(self.source);
        }
        self.files.read(file).map_err(|e| {
            self.unreadable
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get_or_insert_with(|| (file.to_path_buf(), e.kind()));
            e
        })
    }

    /// Relative specifiers become files. Remote and bare imports stay in the
    /// output as written.
    fn resolve(&self, specifier: &str, originating_file: &Path) -> Result<ResolveResult, Self::Error> {
        if !(specifier.starts_with("./") || specifier.starts_with("../")) {
            return Ok(ResolveResult::External(specifier.to_string()));
        }
        let dir = originating_file.parent().unwrap_or(originating_file);
        let joined = join_lexically(dir, specifier);
        let file = dunce::canonicalize(&joined).unwrap_or(joined);
        self.resolved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(file.clone())
            .or_insert_with(|| specifier.to_string());
        Ok(ResolveResult::File(file))
    }
}

/// `dir` joined with `relative`, with `.` and `..` folded without touching
/// the filesystem. Missing files keep a stable path this way.
fn join_lexically(dir: &Path, relative: &str) -> PathBuf {
    let mut out = dir.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Dev module that injects the stylesheet and swaps it on hot update.
fn style_injector(id: &str, css: &str) -> String {
    let id_literal = serde_json::to_string(id).unwrap_or_else(|_| "\"\"".to_string());
    let css_literal = serde_json::to_string(css).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        r#"const id = {id_literal};
const css = {css_literal};
let style = document.querySelector(`style[data-nexus-id="${{id}}"]`);
if (!style) {{
  style = document.createElement('style');
  style.setAttribute('data-nexus-id', id);
  document.head.appendChild(style);
}}
style.textContent = css;

if (import.meta.hot) {{
  import.meta.hot.accept();
  import.meta.hot.dispose(() => {{
    style.remove();
  }});
}}

export default css;
"#
    )
}
