//! Project configuration.
//!
//! Loaded from `nexus.config.ts`, `nexus.config.js` or `nexus.config.json`.
//! JS and TS files are not executed: the object literal after
//! `export default` (optionally wrapped in `defineConfig(...)`) is parsed as a
//! JSON5-like value.
//!
//! ```js
//! export default defineConfig({
//!   entries: ['./src/main.tsx'],
//!   outDir: 'dist',
//!   define: { 'process.env.API': '"https://example.com"' },
//!   inlineThreshold: 2048,
//! });
//! ```

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default config file name.
pub const DEFAULT_CONFIG_FILE: &str = "nexus.config.ts";

/// Config file names tried in order when none is given explicitly.
const CONFIG_FILES: &[&str] = &[DEFAULT_CONFIG_FILE, "nexus.config.js", "nexus.config.json"];

/// Build mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Development,
    Production,
}

impl Mode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }

    #[must_use]
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Environment modules are resolved and transformed for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    #[default]
    Browser,
    Node,
}

impl Target {
    /// Condition name used in `exports` maps.
    #[must_use]
    pub fn condition(&self) -> &'static str {
        match self {
            Self::Browser => "browser",
            Self::Node => "node",
        }
    }
}

/// Resolved configuration for one nexus process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NexusConfig {
    /// Project root. Relative values are resolved against the working directory.
    pub root: PathBuf,
    /// Entry modules, relative to `root`. Empty means "use the default candidates".
    pub entries: Vec<String>,
    /// Production output directory, relative to `root`.
    pub out_dir: PathBuf,
    /// Dev server port.
    pub port: u16,
    /// Dev server bind address.
    pub host: String,
    pub target: Target,
    /// Extra `exports` conditions, tried after the target and import kind.
    pub conditions: Vec<String>,
    /// Identifier replacements applied to scripts.
    pub define: BTreeMap<String, String>,
    pub mode: Mode,
    /// Shared modules smaller than this many bytes are duplicated instead of hoisted.
    pub inline_threshold: usize,
    /// Assets smaller than this many bytes become `data:` URLs.
    pub asset_inline_limit: usize,
    /// Watcher debounce window in milliseconds.
    pub debounce_ms: u64,
    /// Transform worker count. `None` uses available parallelism.
    pub workers: Option<usize>,
    /// Upper bound on transform cache entries. `None` means unbounded.
    pub cache_max_entries: Option<usize>,
    /// Whether the dev server watches the filesystem.
    pub watch: bool,
}

impl Default for NexusConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            entries: Vec::new(),
            out_dir: PathBuf::from("dist"),
            port: 3000,
            host: "127.0.0.1".to_string(),
            target: Target::default(),
            conditions: Vec::new(),
            define: BTreeMap::new(),
            mode: Mode::default(),
            inline_threshold: 1024,
            asset_inline_limit: 8 * 1024,
            debounce_ms: 50,
            workers: None,
            cache_max_entries: None,
            watch: true,
        }
    }
}

impl NexusConfig {
    /// Create a config rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    #[must_use]
    pub fn with_entries<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entries = entries.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_out_dir(mut self, out_dir: impl Into<PathBuf>) -> Self {
        self.out_dir = out_dir.into();
        self
    }

    #[must_use]
    pub fn with_inline_threshold(mut self, bytes: usize) -> Self {
        self.inline_threshold = bytes;
        self
    }

    #[must_use]
    pub fn with_define(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.define.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    #[must_use]
    pub fn with_cache_max_entries(mut self, max: usize) -> Self {
        self.cache_max_entries = Some(max);
        self
    }

    #[must_use]
    pub fn with_watch(mut self, watch: bool) -> Self {
        self.watch = watch;
        self
    }

    /// Absolute output directory.
    #[must_use]
    pub fn out_dir_abs(&self) -> PathBuf {
        if self.out_dir.is_absolute() {
            self.out_dir.clone()
        } else {
            self.root.join(&self.out_dir)
        }
    }
}

/// Find a config file in `root`.
#[must_use]
pub fn find_config_file(root: &Path) -> Option<PathBuf> {
    CONFIG_FILES
        .iter()
        .map(|name| root.join(name))
        .find(|p| p.is_file())
}

/// Load configuration for `root`.
///
/// With `explicit = Some(path)` the file must exist, except when it names the
/// default file, which may be absent. Returns the file used, if any. `root` in
/// the result is always the given root.
pub fn load_config(
    root: &Path,
    explicit: Option<&Path>,
) -> Result<(Option<PathBuf>, NexusConfig), Error> {
    let path = match explicit {
        Some(p) => {
            let abs = if p.is_absolute() {
                p.to_path_buf()
            } else {
                root.join(p)
            };
            if abs.is_file() {
                Some(abs)
            } else if p == Path::new(DEFAULT_CONFIG_FILE) {
                find_config_file(root)
            } else {
                return Err(Error::ConfigRead {
                    path: abs,
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "config file not found",
                    ),
                });
            }
        }
        None => find_config_file(root),
    };

    let Some(path) = path else {
        return Ok((None, NexusConfig::new(root)));
    };

    let source = std::fs::read_to_string(&path).map_err(|source| Error::ConfigRead {
        path: path.clone(),
        source,
    })?;

    let mut config = parse_config(&source, &path)?;
    config.root = root.to_path_buf();
    Ok((Some(path), config))
}

/// Parse config source. JSON files are read directly; anything else goes
/// through the object-literal extractor.
fn parse_config(source: &str, path: &Path) -> Result<NexusConfig, Error> {
    let parse_err = |message: String| Error::ConfigParse {
        path: path.to_path_buf(),
        message,
    };

    let value = if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str(source).map_err(|e| parse_err(e.to_string()))?
    } else {
        let object = extract_default_export_object(source)
            .ok_or_else(|| parse_err("no `export default { ... }` found".to_string()))?;
        parse_js_object(&object).map_err(parse_err)?
    };

    let mut value = value;
    normalize_define(&mut value);
    serde_json::from_value(value).map_err(|e| parse_err(e.to_string()))
}

/// `define` values may be written as strings, numbers or booleans; store them
/// as the source text they replace with.
fn normalize_define(value: &mut serde_json::Value) {
    let Some(define) = value.get_mut("define").and_then(|d| d.as_object_mut()) else {
        return;
    };
    for v in define.values_mut() {
        if !v.is_string() {
            *v = serde_json::Value::String(v.to_string());
        }
    }
}

/// Extract the object literal from `export default { ... }` or
/// `export default defineConfig({ ... })`, including the outer braces.
fn extract_default_export_object(source: &str) -> Option<String> {
    let stripped = strip_comments(source);

    let marker = "export default";
    let idx = stripped.find(marker)?;
    let mut after = stripped[idx + marker.len()..].trim_start();
    if let Some(rest) = after.strip_prefix("defineConfig") {
        after = rest.trim_start().strip_prefix('(')?.trim_start();
    }

    if !after.starts_with('{') {
        return None;
    }

    let mut depth = 0usize;
    let mut in_string: Option<char> = None;
    let mut prev = '\0';

    for (i, ch) in after.char_indices() {
        if let Some(quote) = in_string {
            if ch == quote && prev != '\\' {
                in_string = None;
            }
        } else {
            match ch {
                '"' | '\'' | '`' => in_string = Some(ch),
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(after[..=i].to_string());
                    }
                }
                _ => {}
            }
        }
        prev = ch;
    }

    None
}

/// Strip `//` and `/* */` comments, keeping string contents intact.
fn strip_comments(source: &str) -> String {
    let mut result = String::with_capacity(source.len());
    let chars: Vec<char> = source.chars().collect();
    let len = chars.len();
    let mut i = 0;
    let mut in_string: Option<char> = None;

    while i < len {
        if let Some(quote) = in_string {
            result.push(chars[i]);
            if chars[i] == quote && (i == 0 || chars[i - 1] != '\\') {
                in_string = None;
            }
            i += 1;
        } else if i + 1 < len && chars[i] == '/' && chars[i + 1] == '/' {
            while i < len && chars[i] != '\n' {
                i += 1;
            }
        } else if i + 1 < len && chars[i] == '/' && chars[i + 1] == '*' {
            i += 2;
            while i + 1 < len && !(chars[i] == '*' && chars[i + 1] == '/') {
                if chars[i] == '\n' {
                    result.push('\n');
                }
                i += 1;
            }
            i += 2;
        } else {
            if matches!(chars[i], '"' | '\'' | '`') {
                in_string = Some(chars[i]);
            }
            result.push(chars[i]);
            i += 1;
        }
    }

    result
}

/// Parse a JS object literal (unquoted keys, single quotes, trailing commas).
fn parse_js_object(input: &str) -> Result<serde_json::Value, String> {
    let mut parser = ObjectLiteralParser {
        chars: input.chars().collect(),
        pos: 0,
    };
    parser.parse_value()
}

struct ObjectLiteralParser {
    chars: Vec<char>,
    pos: usize,
}

impl ObjectLiteralParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek();
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn starts_with(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(k, c)| self.chars.get(self.pos + k) == Some(&c))
    }

    fn parse_value(&mut self) -> Result<serde_json::Value, String> {
        self.skip_whitespace();
        match self.peek() {
            Some('{') => self.parse_object(),
            Some('[') => self.parse_array(),
            Some('"' | '\'' | '`') => self.parse_string().map(serde_json::Value::String),
            Some(ch) if ch == '-' || ch.is_ascii_digit() => self.parse_number(),
            Some(_) if self.starts_with("true") => {
                self.pos += 4;
                Ok(serde_json::Value::Bool(true))
            }
            Some(_) if self.starts_with("false") => {
                self.pos += 5;
                Ok(serde_json::Value::Bool(false))
            }
            Some(_) if self.starts_with("null") => {
                self.pos += 4;
                Ok(serde_json::Value::Null)
            }
            Some(ch) => Err(format!("unexpected character '{ch}' at position {}", self.pos)),
            None => Err("unexpected end of input".to_string()),
        }
    }

    fn parse_object(&mut self) -> Result<serde_json::Value, String> {
        self.advance();
        let mut map = serde_json::Map::new();

        loop {
            self.skip_whitespace();
            match self.peek() {
                Some('}') => {
                    self.advance();
                    return Ok(serde_json::Value::Object(map));
                }
                None => return Err("unterminated object".to_string()),
                _ => {}
            }

            let key = self.parse_key()?;
            self.skip_whitespace();
            match self.advance() {
                Some(':') => {}
                other => return Err(format!("expected ':' after key, got {other:?}")),
            }
            let value = self.parse_value()?;
            map.insert(key, value);

            self.skip_whitespace();
            match self.peek() {
                Some(',') => {
                    self.advance();
                }
                Some('}') => {}
                None => return Err("unterminated object".to_string()),
                Some(ch) => return Err(format!("expected ',' or '}}' in object, got '{ch}'")),
            }
        }
    }

    fn parse_array(&mut self) -> Result<serde_json::Value, String> {
        self.advance();
        let mut items = Vec::new();

        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(']') => {
                    self.advance();
                    return Ok(serde_json::Value::Array(items));
                }
                None => return Err("unterminated array".to_string()),
                _ => {}
            }

            items.push(self.parse_value()?);

            self.skip_whitespace();
            match self.peek() {
                Some(',') => {
                    self.advance();
                }
                Some(']') => {}
                None => return Err("unterminated array".to_string()),
                Some(ch) => return Err(format!("expected ',' or ']' in array, got '{ch}'")),
            }
        }
    }

    fn parse_key(&mut self) -> Result<String, String> {
        self.skip_whitespace();
        match self.peek() {
            Some('"' | '\'') => self.parse_string(),
            Some(ch) if ch.is_alphabetic() || ch == '_' || ch == '$' => {
                let mut key = String::new();
                // Dotted bare keys appear in `define` (process.env.X)
                while let Some(ch) = self.peek() {
                    if ch.is_alphanumeric() || matches!(ch, '_' | '$' | '.') {
                        key.push(ch);
                        self.advance();
                    } else {
                        break;
                    }
                }
                Ok(key)
            }
            other => Err(format!("expected object key, got {other:?}")),
        }
    }

    fn parse_string(&mut self) -> Result<String, String> {
        let Some(quote) = self.advance() else {
            return Err("expected string".to_string());
        };
        let mut s = String::new();

        loop {
            match self.advance() {
                Some(ch) if ch == quote => return Ok(s),
                Some('\\') => match self.advance() {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some('r') => s.push('\r'),
                    Some(ch) => s.push(ch),
                    None => return Err("unterminated string escape".to_string()),
                },
                Some(ch) => s.push(ch),
                None => return Err("unterminated string".to_string()),
            }
        }
    }

    fn parse_number(&mut self) -> Result<serde_json::Value, String> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || c == '.' || c == '_')
        {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos]
            .iter()
            .filter(|&&c| c != '_')
            .collect();

        if let Ok(n) = text.parse::<i64>() {
            return Ok(serde_json::Value::Number(n.into()));
        }
        text.parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(serde_json::Value::Number)
            .ok_or_else(|| format!("invalid number '{text}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = NexusConfig::default();
        assert_eq!(config.port, 3000);
        assert_eq!(config.out_dir, PathBuf::from("dist"));
        assert_eq!(config.debounce_ms, 50);
        assert_eq!(config.asset_inline_limit, 8192);
        assert_eq!(config.mode, Mode::Development);
    }

    #[test]
    fn test_parse_ts_config_with_define_config() {
        let source = r#"
            import { defineConfig } from '@apexjs/nexus';
            // comment with a } brace
            export default defineConfig({
              entries: ['./src/main.tsx', "./src/admin.tsx",],
              outDir: 'build',
              port: 4000,
              inlineThreshold: 2_048,
              define: { 'process.env.API': '"x"', DEBUG: false },
            });
        "#;
        let config = parse_config(source, Path::new("nexus.config.ts")).unwrap();
        assert_eq!(config.entries, vec!["./src/main.tsx", "./src/admin.tsx"]);
        assert_eq!(config.out_dir, PathBuf::from("build"));
        assert_eq!(config.port, 4000);
        assert_eq!(config.inline_threshold, 2048);
        assert_eq!(config.define["process.env.API"], "\"x\"");
        assert_eq!(config.define["DEBUG"], "false");
        // Untouched fields keep their defaults
        assert_eq!(config.debounce_ms, 50);
    }

    #[test]
    fn test_parse_json_config() {
        let config = parse_config(
            r#"{"mode": "production", "target": "node", "cacheMaxEntries": 10}"#,
            Path::new("nexus.config.json"),
        )
        .unwrap();
        assert_eq!(config.mode, Mode::Production);
        assert_eq!(config.target, Target::Node);
        assert_eq!(config.cache_max_entries, Some(10));
    }

    #[test]
    fn test_no_default_export() {
        let err = parse_config("const x = 1;", Path::new("nexus.config.js")).unwrap_err();
        assert!(matches!(err, Error::ConfigParse { .. }));
    }

    #[test]
    fn test_load_missing_default_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let (path, config) =
            load_config(dir.path(), Some(Path::new(DEFAULT_CONFIG_FILE))).unwrap();
        assert!(path.is_none());
        assert_eq!(config.root, dir.path());
    }

    #[test]
    fn test_load_missing_explicit_file_errors() {
        let dir = tempdir().unwrap();
        let err = load_config(dir.path(), Some(Path::new("custom.config.ts"))).unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }

    #[test]
    fn test_load_discovers_js_config() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("nexus.config.js"),
            "export default { debounceMs: 10 };",
        )
        .unwrap();
        let (path, config) = load_config(dir.path(), None).unwrap();
        assert!(path.unwrap().ends_with("nexus.config.js"));
        assert_eq!(config.debounce_ms, 10);
    }

    #[test]
    fn test_out_dir_abs() {
        let config = NexusConfig::new("/p").with_out_dir("out");
        assert_eq!(config.out_dir_abs(), PathBuf::from("/p/out"));
    }
}
