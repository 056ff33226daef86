//! Static asset modules.

use super::{EmittedAsset, TransformConfig, TransformOutput};
use base64::Engine as _;
use nexus_util::hash::{blake3_bytes, short};
use std::path::Path;
use std::sync::Arc;

/// Content type for a file, by extension.
#[must_use]
pub fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("js" | "mjs" | "cjs" | "jsx" | "ts" | "tsx") => "application/javascript",
        Some("json") => "application/json",
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("webp") => "image/webp",
        Some("avif") => "image/avif",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("otf") => "font/otf",
        Some("wasm") => "application/wasm",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Small files become `data:` URLs. Larger ones are referenced by URL: the
/// source file in dev, a content-hashed copy under `assets/` in production.
pub(super) fn transform_asset(
    path: &Path,
    bytes: &[u8],
    config: &TransformConfig,
) -> TransformOutput {
    if bytes.len() < config.asset_inline_limit {
        let mime = mime_for(path)
            .split(';')
            .next()
            .unwrap_or("application/octet-stream");
        let data = base64::engine::general_purpose::STANDARD.encode(bytes);
        return url_module(&format!("data:{mime};base64,{data}"));
    }

    if !config.mode.is_production() {
        return url_module(&nexus_util::fs::url_path(&config.root, path));
    }

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("asset");
    let hash = blake3_bytes(bytes);
    let file_name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("assets/{stem}-{}.{ext}", short(&hash)),
        None => format!("assets/{stem}-{}", short(&hash)),
    };
    let mut output = url_module(&format!("/{file_name}"));
    output.asset = Some(EmittedAsset {
        file_name,
        bytes: Arc::from(bytes),
    });
    output
}

fn url_module(url: &str) -> TransformOutput {
    let literal = serde_json::to_string(url).unwrap_or_else(|_| "\"\"".to_string());
    TransformOutput {
        code: format!("export default {literal};\n"),
        ..TransformOutput::default()
    }
}
