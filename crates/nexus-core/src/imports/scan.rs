//! Import specifier scanner.
//!
//! Finds import/export/require specifiers in JavaScript or TypeScript source
//! without a full parse, reporting byte spans so callers can rewrite them.

use std::ops::Range;

/// How a module is referenced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ImportKind {
    /// `import x from "s"`, `import "s"`
    Static,
    /// `export { x } from "s"`, `export * from "s"`
    ReExport,
    /// `import("s")`
    Dynamic,
    /// `require("s")`
    Require,
}

impl ImportKind {
    /// Whether the edge is a deferred load.
    #[must_use]
    pub fn is_dynamic(self) -> bool {
        matches!(self, Self::Dynamic)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::ReExport => "re-export",
            Self::Dynamic => "dynamic",
            Self::Require => "require",
        }
    }
}

/// One import occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRecord {
    /// Specifier text between the quotes.
    pub specifier: String,
    pub kind: ImportKind,
    /// Byte range of the specifier text, excluding quotes.
    pub specifier_span: Range<usize>,
    /// Byte range of the whole statement or call expression, including a
    /// trailing `;` for statements.
    pub statement_span: Range<usize>,
    /// 1-indexed line of the statement start.
    pub line: u32,
}

/// Scan source for import specifiers, in source order. Every occurrence is
/// reported; callers deduplicate as needed.
#[must_use]
pub fn scan_imports(source: &str) -> Vec<ImportRecord> {
    Scanner::new(source).run()
}

struct Scanner<'a> {
    src: &'a [u8],
    text: &'a str,
    pos: usize,
    line: u32,
    line_pos: usize,
    out: Vec<ImportRecord>,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            src: text.as_bytes(),
            text,
            pos: 0,
            line: 1,
            line_pos: 0,
            out: Vec::new(),
        }
    }

    fn run(mut self) -> Vec<ImportRecord> {
        let len = self.src.len();
        while self.pos < len {
            let b = self.src[self.pos];
            match b {
                b'/' if self.peek(1) == Some(b'/') => self.skip_line_comment(),
                b'/' if self.peek(1) == Some(b'*') => self.skip_block_comment(),
                b'"' | b'\'' | b'`' => {
                    self.skip_string(b);
                }
                _ if is_ident_start(b) => {
                    let start = self.pos;
                    let end = self.ident_end(start);
                    let word = &self.src[start..end];
                    let after_dot = self.prev_significant(start) == Some(b'.');
                    self.pos = end;
                    if after_dot {
                        continue;
                    }
                    match word {
                        b"import" => self.scan_import(start),
                        b"export" => self.scan_export(start),
                        b"require" => self.scan_require(start),
                        _ => {}
                    }
                }
                _ => self.pos += 1,
            }
        }
        self.out
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn line_at(&mut self, at: usize) -> u32 {
        if at >= self.line_pos {
            self.line += count_newlines(&self.src[self.line_pos..at]);
        } else {
            self.line = 1 + count_newlines(&self.src[..at]);
        }
        self.line_pos = at;
        self.line
    }

    fn prev_significant(&self, at: usize) -> Option<u8> {
        self.src[..at]
            .iter()
            .rev()
            .find(|b| !b.is_ascii_whitespace())
            .copied()
    }

    fn ident_end(&self, start: usize) -> usize {
        let mut i = start;
        while i < self.src.len() && is_ident_continue(self.src[i]) {
            i += 1;
        }
        i
    }

    fn skip_ws(&mut self) {
        while self.pos < self.src.len() {
            match self.src[self.pos] {
                b if b.is_ascii_whitespace() => self.pos += 1,
                b'/' if self.peek(1) == Some(b'/') => self.skip_line_comment(),
                b'/' if self.peek(1) == Some(b'*') => self.skip_block_comment(),
                _ => break,
            }
        }
    }

    fn skip_line_comment(&mut self) {
        while self.pos < self.src.len() && self.src[self.pos] != b'\n' {
            self.pos += 1;
        }
    }

    fn skip_block_comment(&mut self) {
        self.pos += 2;
        while self.pos + 1 < self.src.len()
            && !(self.src[self.pos] == b'*' && self.src[self.pos + 1] == b'/')
        {
            self.pos += 1;
        }
        self.pos = (self.pos + 2).min(self.src.len());
    }

    /// Skip a string literal starting at the opening quote. Returns the
    /// content range when the literal is closed and, for templates, has no
    /// substitutions.
    fn skip_string(&mut self, quote: u8) -> Option<Range<usize>> {
        let content_start = self.pos + 1;
        let mut i = content_start;
        let mut plain = true;
        while i < self.src.len() {
            match self.src[i] {
                b'\\' => i += 2,
                b'\n' if quote != b'`' => {
                    self.pos = i;
                    return None;
                }
                b'$' if quote == b'`' && self.src.get(i + 1) == Some(&b'{') => {
                    plain = false;
                    i += 1;
                }
                b if b == quote => {
                    self.pos = i + 1;
                    return plain.then_some(content_start..i);
                }
                _ => i += 1,
            }
        }
        self.pos = self.src.len();
        None
    }

    /// Read a quoted specifier at the current position.
    fn read_specifier(&mut self) -> Option<Range<usize>> {
        match self.src.get(self.pos) {
            Some(&q @ (b'"' | b'\'' | b'`')) => self.skip_string(q),
            _ => None,
        }
    }

    /// Position after optional spaces and a `;` on the same line.
    fn statement_end(&self, mut i: usize) -> usize {
        while i < self.src.len() && matches!(self.src[i], b' ' | b'\t') {
            i += 1;
        }
        if self.src.get(i) == Some(&b';') {
            i + 1
        } else {
            i
        }
    }

    fn keyword_at(&self, i: usize, kw: &[u8]) -> bool {
        self.src[i..].starts_with(kw)
            && !self
                .src
                .get(i + kw.len())
                .is_some_and(|&b| is_ident_continue(b))
            && (i == 0 || !is_ident_continue(self.src[i - 1]))
    }

    fn push(&mut self, kind: ImportKind, spec: Range<usize>, statement: Range<usize>) {
        let line = self.line_at(statement.start);
        self.out.push(ImportRecord {
            specifier: self.text[spec.clone()].to_string(),
            kind,
            specifier_span: spec,
            statement_span: statement,
            line,
        });
    }

    fn scan_import(&mut self, start: usize) {
        self.skip_ws();
        match self.src.get(self.pos) {
            Some(b'(') => {
                self.pos += 1;
                self.skip_ws();
                let Some(spec) = self.read_specifier() else {
                    return;
                };
                self.skip_ws();
                if matches!(self.src.get(self.pos), Some(b')' | b',')) {
                    let end = self.matching_paren_end();
                    self.push(ImportKind::Dynamic, spec, start..end);
                    self.pos = end;
                }
            }
            // import.meta
            Some(b'.') => {}
            Some(b'"' | b'\'') => {
                if let Some(spec) = self.read_specifier() {
                    let end = self.statement_end(self.pos);
                    self.push(ImportKind::Static, spec, start..end);
                    self.pos = end;
                }
            }
            Some(_) => {
                let type_only = self.keyword_at(self.pos, b"type") && {
                    let after = self.pos + 4;
                    let next = self.src[after..]
                        .iter()
                        .find(|b| !b.is_ascii_whitespace())
                        .copied();
                    // `import type from "x"` imports a binding named `type`
                    next != Some(b',') && !self.keyword_at_skip_ws(after, b"from")
                };
                if let Some(spec) = self.scan_clause_from() {
                    let end = self.statement_end(self.pos);
                    if !type_only {
                        self.push(ImportKind::Static, spec, start..end);
                    }
                    self.pos = end;
                }
            }
            None => {}
        }
    }

    fn keyword_at_skip_ws(&self, mut i: usize, kw: &[u8]) -> bool {
        while i < self.src.len() && self.src[i].is_ascii_whitespace() {
            i += 1;
        }
        self.keyword_at(i, kw)
    }

    fn scan_export(&mut self, start: usize) {
        self.skip_ws();
        let is_from_form = match self.src.get(self.pos) {
            Some(b'*' | b'{') => true,
            _ => self.keyword_at(self.pos, b"type") && {
                let mut i = self.pos + 4;
                while i < self.src.len() && self.src[i].is_ascii_whitespace() {
                    i += 1;
                }
                matches!(self.src.get(i), Some(b'*' | b'{'))
            },
        };
        if !is_from_form {
            return;
        }
        let type_only = self.src[self.pos] == b't';
        let save = self.pos;
        if let Some(spec) = self.scan_clause_from() {
            let end = self.statement_end(self.pos);
            if !type_only {
                self.push(ImportKind::ReExport, spec, start..end);
            }
            self.pos = end;
        } else {
            // `export { a, b };` has no source
            self.pos = save;
        }
    }

    /// Walk an import/export clause up to `from "spec"`. Stops at `;` or at
    /// the end of a braced clause not followed by `from`.
    fn scan_clause_from(&mut self) -> Option<Range<usize>> {
        let mut depth = 0usize;
        while self.pos < self.src.len() {
            let b = self.src[self.pos];
            match b {
                b'{' => {
                    depth += 1;
                    self.pos += 1;
                }
                b'}' => {
                    depth = depth.saturating_sub(1);
                    self.pos += 1;
                    if depth == 0 {
                        self.skip_ws();
                        if !self.keyword_at(self.pos, b"from") {
                            return None;
                        }
                    }
                }
                b';' if depth == 0 => return None,
                b'/' if self.peek(1) == Some(b'/') => self.skip_line_comment(),
                b'/' if self.peek(1) == Some(b'*') => self.skip_block_comment(),
                b'"' | b'\'' | b'`' if depth == 0 => return None,
                b'"' | b'\'' | b'`' => {
                    self.skip_string(b);
                }
                _ if depth == 0 && self.keyword_at(self.pos, b"from") => {
                    self.pos += 4;
                    self.skip_ws();
                    return self.read_specifier();
                }
                _ => self.pos += 1,
            }
        }
        None
    }

    fn scan_require(&mut self, start: usize) {
        self.skip_ws();
        if self.src.get(self.pos) != Some(&b'(') {
            return;
        }
        self.pos += 1;
        self.skip_ws();
        let Some(spec) = self.read_specifier() else {
            return;
        };
        self.skip_ws();
        if self.src.get(self.pos) == Some(&b')') {
            self.pos += 1;
            self.push(ImportKind::Require, spec, start..self.pos);
        }
    }

    /// From inside a call's argument list, position after its closing paren.
    fn matching_paren_end(&mut self) -> usize {
        let mut depth = 1usize;
        while self.pos < self.src.len() {
            let b = self.src[self.pos];
            match b {
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        return self.pos + 1;
                    }
                }
                b'"' | b'\'' | b'`' => {
                    self.skip_string(b);
                    continue;
                }
                _ => {}
            }
            self.pos += 1;
        }
        self.src.len()
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b'$' || b >= 0x80
}

fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

fn count_newlines(bytes: &[u8]) -> u32 {
    bytes.iter().filter(|&&b| b == b'\n').count() as u32
}
