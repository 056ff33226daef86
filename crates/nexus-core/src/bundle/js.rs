//! Minimal JavaScript tokenizer for the production passes.
//!
//! Produces identifiers and punctuation with their bracket depth. Strings,
//! comments, regex literals and template text are skipped, but code inside
//! template substitutions is tokenized.

use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Ident,
    Number,
    /// String, template or regex literal.
    Literal,
    Punct(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub span: Range<usize>,
    /// Open brackets enclosing the token.
    pub depth: usize,
    /// Innermost enclosing bracket, `0` at top level.
    pub open: u8,
    /// A line break separates this token from the previous one.
    pub newline_before: bool,
}

impl Token {
    pub fn text<'a>(&self, src: &'a str) -> &'a str {
        &src[self.span.clone()]
    }

    pub fn is_punct(&self, c: u8) -> bool {
        self.kind == TokenKind::Punct(c)
    }

    pub fn is_word(&self, src: &str, word: &str) -> bool {
        self.kind == TokenKind::Ident && self.text(src) == word
    }

    /// Whether an expression can end at this token.
    fn ends_expression(&self, src: &str) -> bool {
        match self.kind {
            TokenKind::Ident => !matches!(
                self.text(src),
                "return" | "typeof" | "instanceof" | "in" | "of" | "new" | "delete" | "void"
                    | "throw" | "case" | "do" | "else" | "yield" | "await"
            ),
            TokenKind::Number | TokenKind::Literal => true,
            TokenKind::Punct(c) => matches!(c, b')' | b']' | b'}'),
        }
    }
}

const TEMPLATE: u8 = b'`';

pub(crate) fn tokenize(src: &str) -> Vec<Token> {
    let bytes = src.as_bytes();
    let mut tokens: Vec<Token> = Vec::new();
    // `TEMPLATE` marks a `${` substitution
    let mut stack: Vec<u8> = Vec::new();
    let mut newline = false;
    let mut i = 0;

    let push = |tokens: &mut Vec<Token>, kind, span, stack: &[u8], newline: &mut bool| {
        tokens.push(Token {
            kind,
            span,
            depth: stack.len(),
            open: stack.last().copied().unwrap_or(0),
            newline_before: *newline,
        });
        *newline = false;
    };

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'\n' => {
                newline = true;
                i += 1;
            }
            _ if b.is_ascii_whitespace() => i += 1,
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = src[i + 2..].find("*/").map_or(bytes.len(), |n| i + 2 + n + 2);
                if src[i..end].contains('\n') {
                    newline = true;
                }
                i = end;
            }
            b'/' if !tokens.last().is_some_and(|t| t.ends_expression(src)) => {
                let end = skip_regex(bytes, i);
                push(&mut tokens, TokenKind::Literal, i..end, &stack, &mut newline);
                i = end;
            }
            b'"' | b'\'' => {
                let end = skip_quoted(bytes, i);
                push(&mut tokens, TokenKind::Literal, i..end, &stack, &mut newline);
                i = end;
            }
            b'`' => {
                let (end, substitution) = skip_template(bytes, i + 1);
                push(&mut tokens, TokenKind::Literal, i..end, &stack, &mut newline);
                if substitution {
                    stack.push(TEMPLATE);
                }
                i = end;
            }
            b'}' if stack.last() == Some(&TEMPLATE) => {
                stack.pop();
                let (end, substitution) = skip_template(bytes, i + 1);
                if substitution {
                    stack.push(TEMPLATE);
                }
                i = end;
            }
            _ if is_ident_start(b) => {
                let start = i;
                while i < bytes.len() && is_ident_continue(bytes[i]) {
                    i += 1;
                }
                push(&mut tokens, TokenKind::Ident, start..i, &stack, &mut newline);
            }
            _ if b.is_ascii_digit() => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.' || bytes[i] == b'_') {
                    i += 1;
                }
                push(&mut tokens, TokenKind::Number, start..i, &stack, &mut newline);
            }
            b'(' | b'[' | b'{' => {
                push(&mut tokens, TokenKind::Punct(b), i..i + 1, &stack, &mut newline);
                stack.push(b);
                i += 1;
            }
            b')' | b']' | b'}' => {
                stack.pop();
                push(&mut tokens, TokenKind::Punct(b), i..i + 1, &stack, &mut newline);
                i += 1;
            }
            _ => {
                push(&mut tokens, TokenKind::Punct(b), i..i + 1, &stack, &mut newline);
                i += 1;
            }
        }
    }
    tokens
}

fn skip_quoted(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' => return i,
            b if b == quote => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Scan template text from `i`. Returns the position after the closing
/// backtick or after a `${`, and whether a substitution was opened.
fn skip_template(bytes: &[u8], mut i: usize) -> (usize, bool) {
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'`' => return (i + 1, false),
            b'$' if bytes.get(i + 1) == Some(&b'{') => return (i + 2, true),
            _ => i += 1,
        }
    }
    (bytes.len(), false)
}

fn skip_regex(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    let mut class = false;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'\n' => return i,
            b'[' => {
                class = true;
                i += 1;
            }
            b']' => {
                class = false;
                i += 1;
            }
            b'/' if !class => {
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
                    i += 1;
                }
                return i;
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

pub(crate) fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b'$' || b >= 0x80
}

pub(crate) fn is_ident_continue(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

/// Index of the token after the statement starting at `start`: past a `;`
/// at the statement's depth, or before a token on a new line that cannot
/// continue the expression.
pub(crate) fn statement_end(tokens: &[Token], src: &str, start: usize) -> usize {
    let Some(first) = tokens.get(start) else {
        return tokens.len();
    };
    let depth = first.depth;
    let mut i = start + 1;
    while i < tokens.len() {
        let t = &tokens[i];
        if t.depth < depth {
            return i;
        }
        if t.depth == depth {
            if t.is_punct(b';') {
                return i + 1;
            }
            let prev = &tokens[i - 1];
            if t.newline_before && prev.ends_expression(src) && starts_statement(t) {
                return i;
            }
        }
        i += 1;
    }
    tokens.len()
}

fn starts_statement(t: &Token) -> bool {
    matches!(
        t.kind,
        TokenKind::Ident | TokenKind::Number | TokenKind::Literal | TokenKind::Punct(b'{' | b'!' | b'~' | b'@' | b'#')
    )
}

/// Index of the token closing the bracket opened at `open`.
pub(crate) fn matching_close(tokens: &[Token], open: usize) -> usize {
    let depth = tokens[open].depth;
    tokens[open + 1..]
        .iter()
        .position(|t| t.depth == depth && matches!(t.kind, TokenKind::Punct(b')' | b']' | b'}')))
        .map_or(tokens.len().saturating_sub(1), |n| open + 1 + n)
}

/// Whether the identifier at `i` is a value reference rather than a property
/// name, member access or object key.
pub(crate) fn is_reference(tokens: &[Token], i: usize) -> bool {
    let t = &tokens[i];
    if t.kind != TokenKind::Ident {
        return false;
    }
    if i >= 1 && tokens[i - 1].is_punct(b'.') {
        // `...spread` is still a reference
        let spread = i >= 3 && tokens[i - 2].is_punct(b'.') && tokens[i - 3].is_punct(b'.');
        if !spread {
            return false;
        }
    }
    !is_object_key(tokens, i)
}

/// Whether the identifier at `i` is a `key:` in an object literal.
fn is_object_key(tokens: &[Token], i: usize) -> bool {
    let (Some(prev), Some(next)) = (i.checked_sub(1).map(|p| &tokens[p]), tokens.get(i + 1)) else {
        return false;
    };
    tokens[i].open == b'{' && next.is_punct(b':') && (prev.is_punct(b'{') || prev.is_punct(b','))
}

/// Whether the identifier at `i` is a `{ name }` shorthand property.
pub(crate) fn is_shorthand(tokens: &[Token], i: usize) -> bool {
    let t = &tokens[i];
    let (Some(prev), Some(next)) = (i.checked_sub(1).map(|p| &tokens[p]), tokens.get(i + 1)) else {
        return false;
    };
    t.open == b'{'
        && (prev.is_punct(b'{') || prev.is_punct(b','))
        && (next.is_punct(b'}') || next.is_punct(b','))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idents(src: &str) -> Vec<&str> {
        tokenize(src)
            .iter()
            .filter(|t| t.kind == TokenKind::Ident)
            .map(|t| t.text(src))
            .collect()
    }

    #[test]
    fn test_skips_strings_and_comments() {
        let src = "const a = 'b c'; // d\n/* e */ f(\"g\")";
        assert_eq!(idents(src), vec!["const", "a", "f"]);
    }

    #[test]
    fn test_template_substitutions_are_code() {
        let src = "const s = `x ${name + `y ${inner}`} z`; after";
        assert_eq!(idents(src), vec!["const", "s", "name", "inner", "after"]);
    }

    #[test]
    fn test_regex_versus_division() {
        let src = "let r = /ab+c/g; let d = a / b / c;";
        assert_eq!(idents(src), vec!["let", "r", "let", "d", "a", "b", "c"]);
    }

    #[test]
    fn test_depth_tracking() {
        let src = "f({ a: [b] })";
        let tokens = tokenize(src);
        let b = tokens.iter().find(|t| t.text(src) == "b").unwrap();
        assert_eq!(b.depth, 3);
        assert_eq!(b.open, b'[');
    }

    #[test]
    fn test_statement_end_semicolon_and_newline() {
        let src = "const a = 1, b = f(2);\nconst c = 3\nnext()";
        let tokens = tokenize(src);
        let end = statement_end(&tokens, src, 0);
        assert!(tokens[end].is_word(src, "const"));
        let second = statement_end(&tokens, src, end);
        assert!(tokens[second].is_word(src, "next"));
    }

    #[test]
    fn test_statement_continues_across_operator_lines() {
        let src = "const a = b\n  + c\nd";
        let tokens = tokenize(src);
        let end = statement_end(&tokens, src, 0);
        assert!(tokens[end].is_word(src, "d"));
    }

    #[test]
    fn test_references_exclude_members_and_keys() {
        let src = "x.a; ({ a: 1, a }); [...a]";
        let tokens = tokenize(src);
        let refs: Vec<usize> = (0..tokens.len())
            .filter(|&i| tokens[i].text(src) == "a" && is_reference(&tokens, i))
            .collect();
        assert_eq!(refs.len(), 2);
        assert!(is_shorthand(&tokens, refs[0]));
    }
}
