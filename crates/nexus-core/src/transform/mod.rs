//! Module transforms.
//!
//! A [`Transformer`] turns raw module bytes into servable JavaScript. The
//! default [`NexusTransformer`] handles scripts (define replacement), JSON,
//! CSS and static assets. TypeScript and JSX sources pass through untouched.

mod asset;
pub mod cache;
mod css;

pub use asset::mime_for;
pub use cache::TransformCache;

use crate::config::{Mode, NexusConfig, Target};
use crate::graph::ModuleKind;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A module failed to transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformError {
    pub path: PathBuf,
    pub message: String,
}

impl TransformError {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.path.display())
    }
}

impl std::error::Error for TransformError {}

/// Inputs that change transform output. Hashed into every cache key.
#[derive(Debug, Clone)]
pub struct TransformConfig {
    pub root: PathBuf,
    pub mode: Mode,
    pub target: Target,
    pub define: BTreeMap<String, String>,
    pub asset_inline_limit: usize,
}

impl TransformConfig {
    #[must_use]
    pub fn from_config(config: &NexusConfig) -> Self {
        Self {
            root: config.root.clone(),
            mode: config.mode,
            target: config.target,
            define: config.define.clone(),
            asset_inline_limit: config.asset_inline_limit,
        }
    }

    /// Stable digest of every field.
    #[must_use]
    pub fn hash(&self) -> String {
        let limit = self.asset_inline_limit.to_string();
        let root = self.root.to_string_lossy();
        let mut parts: Vec<&str> = vec![
            root.as_ref(),
            self.mode.as_str(),
            self.target.condition(),
            &limit,
        ];
        for (k, v) in &self.define {
            parts.push(k);
            parts.push(v);
        }
        nexus_util::hash::blake3_parts(parts)
    }

    /// Built-in replacements for the mode, overridden by user `define`s.
    #[must_use]
    pub fn defines(&self) -> Vec<(String, String)> {
        let prod = self.mode.is_production();
        let mode = format!("\"{}\"", self.mode.as_str());
        let mut defines: BTreeMap<String, String> = BTreeMap::new();
        defines.insert("process.env.NODE_ENV".into(), mode.clone());
        defines.insert("import.meta.env.MODE".into(), mode);
        defines.insert("import.meta.env.DEV".into(), (!prod).to_string());
        defines.insert("import.meta.env.PROD".into(), prod.to_string());
        for (k, v) in &self.define {
            defines.insert(k.clone(), v.clone());
        }
        let mut defines: Vec<(String, String)> = defines.into_iter().collect();
        // Longest key first so `a.b.c` wins over `a.b`
        defines.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        defines
    }
}

/// A file emitted alongside the chunks in production.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedAsset {
    /// Path relative to the output directory, e.g. `assets/logo-1a2b3c4d.png`.
    pub file_name: String,
    pub bytes: Arc<[u8]>,
}

/// Result of transforming one module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformOutput {
    /// ES module code.
    pub code: String,
    /// Stylesheet extracted in production.
    pub css: Option<String>,
    pub asset: Option<EmittedAsset>,
    /// Other files read while transforming.
    pub extra_deps: Vec<PathBuf>,
}

impl TransformOutput {
    fn code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }
}

/// One module to transform.
#[derive(Debug, Clone, Copy)]
pub struct TransformInput<'a> {
    pub path: &'a Path,
    pub kind: ModuleKind,
    pub source: &'a [u8],
}

/// Turns module source into servable JavaScript.
pub trait Transformer: Send + Sync + fmt::Debug {
    fn transform(
        &self,
        input: &TransformInput<'_>,
        config: &TransformConfig,
    ) -> Result<TransformOutput, TransformError>;
}

/// Built-in transformer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NexusTransformer;

impl Transformer for NexusTransformer {
    fn transform(
        &self,
        input: &TransformInput<'_>,
        config: &TransformConfig,
    ) -> Result<TransformOutput, TransformError> {
        match input.kind {
            ModuleKind::Script => {
                let text = decode(input)?;
                Ok(TransformOutput::code(replace_defines(
                    text,
                    &config.defines(),
                )))
            }
            ModuleKind::Json => {
                let text = decode(input)?;
                serde_json::from_str::<serde_json::Value>(text)
                    .map_err(|e| TransformError::new(input.path, format!("Invalid JSON: {e}")))?;
                Ok(TransformOutput::code(format!(
                    "export default {};\n",
                    text.trim()
                )))
            }
            ModuleKind::Css => {
                let text = decode(input)?;
                css::transform_css(input.path, text, config)
            }
            ModuleKind::Asset => Ok(asset::transform_asset(input.path, input.source, config)),
        }
    }
}

fn decode<'a>(input: &TransformInput<'a>) -> Result<&'a str, TransformError> {
    std::str::from_utf8(input.source)
        .map_err(|e| TransformError::new(input.path, format!("Source is not valid UTF-8: {e}")))
}

/// Replace `define` keys at identifier boundaries, outside strings and
/// comments. `defines` must be sorted longest key first.
#[must_use]
pub fn replace_defines(source: &str, defines: &[(String, String)]) -> String {
    if defines.is_empty() {
        return source.to_string();
    }
    let bytes = source.as_bytes();
    let mut out = String::with_capacity(source.len());
    let mut last = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                i = source[i..].find('\n').map_or(bytes.len(), |n| i + n);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = source[i + 2..].find("*/").map_or(bytes.len(), |n| i + n + 4);
            }
            q @ (b'"' | b'\'' | b'`') => {
                i += 1;
                while i < bytes.len() && bytes[i] != q {
                    i += if bytes[i] == b'\\' { 2 } else { 1 };
                }
                i += 1;
            }
            b if is_ident_byte(b) => {
                let boundary_before = i == 0 || {
                    let prev = bytes[i - 1];
                    !is_ident_byte(prev) && prev != b'.'
                };
                let hit = boundary_before
                    .then(|| {
                        defines.iter().find(|(key, _)| {
                            source[i..].starts_with(key.as_str())
                                && !bytes
                                    .get(i + key.len())
                                    .is_some_and(|&n| is_ident_byte(n))
                        })
                    })
                    .flatten();
                if let Some((key, value)) = hit {
                    out.push_str(&source[last..i]);
                    out.push_str(value);
                    i += key.len();
                    last = i;
                } else {
                    while i < bytes.len() && is_ident_byte(bytes[i]) {
                        i += 1;
                    }
                }
            }
            _ => i += 1,
        }
    }
    out.push_str(&source[last..]);
    out
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: Mode) -> TransformConfig {
        TransformConfig::from_config(&NexusConfig::new("/p").with_mode(mode))
    }

    fn run(path: &str, source: &str, config: &TransformConfig) -> TransformOutput {
        let path = Path::new(path);
        NexusTransformer
            .transform(
                &TransformInput {
                    path,
                    kind: ModuleKind::from_path(path),
                    source: source.as_bytes(),
                },
                config,
            )
            .unwrap()
    }

    #[test]
    fn test_mode_defines() {
        let out = run(
            "/p/a.js",
            "if (process.env.NODE_ENV !== 'production') log(import.meta.env.DEV);",
            &config(Mode::Production),
        );
        assert_eq!(out.code, "if (\"production\" !== 'production') log(false);");
    }

    #[test]
    fn test_define_respects_boundaries_and_strings() {
        let defines = vec![("__VERSION__".to_string(), "\"1.0\"".to_string())];
        let out = replace_defines(
            "a(__VERSION__); b(x.__VERSION__); c('__VERSION__'); d(__VERSION__X); // __VERSION__",
            &defines,
        );
        assert_eq!(
            out,
            "a(\"1.0\"); b(x.__VERSION__); c('__VERSION__'); d(__VERSION__X); // __VERSION__"
        );
    }

    #[test]
    fn test_user_define_overrides_builtin() {
        let config = TransformConfig::from_config(
            &NexusConfig::new("/p").with_define("import.meta.env.MODE", "\"staging\""),
        );
        let out = run("/p/a.ts", "const m = import.meta.env.MODE;", &config);
        assert_eq!(out.code, "const m = \"staging\";");
    }

    #[test]
    fn test_json_module() {
        let out = run("/p/data.json", "{\"a\": 1}\n", &config(Mode::Development));
        assert_eq!(out.code, "export default {\"a\": 1};\n");
    }

    #[test]
    fn test_invalid_json_is_a_transform_error() {
        let path = Path::new("/p/bad.json");
        let err = NexusTransformer
            .transform(
                &TransformInput {
                    path,
                    kind: ModuleKind::Json,
                    source: b"{ nope",
                },
                &config(Mode::Development),
            )
            .unwrap_err();
        assert_eq!(err.path, path);
        assert!(err.message.starts_with("Invalid JSON"));
    }

    #[test]
    fn test_config_hash_changes_with_mode_and_define() {
        let dev = config(Mode::Development);
        let prod = config(Mode::Production);
        assert_ne!(dev.hash(), prod.hash());
        assert_eq!(dev.hash(), config(Mode::Development).hash());

        let mut defined = dev.clone();
        defined.define.insert("X".into(), "1".into());
        assert_ne!(dev.hash(), defined.hash());
    }
}
