//! Import discovery and specifier rewriting.

mod scan;

pub use scan::{scan_imports, ImportKind, ImportRecord};

use crate::resolver::RequestKind;

impl ImportKind {
    /// Resolver request kind for this import form.
    #[must_use]
    pub fn request_kind(self) -> RequestKind {
        match self {
            Self::Require => RequestKind::Require,
            _ => RequestKind::Import,
        }
    }
}

/// Replace each record's specifier text with `f(record)`, leaving the source
/// untouched where `f` returns `None`. Records must come from scanning
/// `source` and be in source order.
#[must_use]
pub fn rewrite_specifiers<F>(source: &str, records: &[ImportRecord], mut f: F) -> String
where
    F: FnMut(&ImportRecord) -> Option<String>,
{
    let mut out = String::with_capacity(source.len() + records.len() * 8);
    let mut last = 0;
    for record in records {
        let Some(replacement) = f(record) else {
            continue;
        };
        out.push_str(&source[last..record.specifier_span.start]);
        out.push_str(&replacement);
        last = record.specifier_span.end;
    }
    out.push_str(&source[last..]);
    out
}
