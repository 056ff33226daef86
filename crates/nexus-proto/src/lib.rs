#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Wire types shared by the nexus dev server, its client runtime, the CLI and
//! the production manifest.
//!
//! ## Live-update channel
//! JSON text frames over a WebSocket. Server frames are [`ServerEvent`],
//! client frames are [`ClientMessage`]. Every server frame carries the build
//! generation it describes.
//!
//! ## Module fetch
//! Responses carry the generation in the [`GENERATION_HEADER`] header.
//! Failures are returned as an [`ErrorPayload`] body.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Live-update schema version. Bump when changing event shapes.
pub const UPDATE_SCHEMA_VERSION: u32 = 1;

/// Manifest schema version. Bump when changing `manifest.json`.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Build summary schema version (`nexus build --json`).
pub const BUILD_SUMMARY_SCHEMA_VERSION: u32 = 1;

/// Response header carrying the generation a module was produced under.
pub const GENERATION_HEADER: &str = "content-generation";

/// Response header carrying the served module id.
pub const MODULE_ID_HEADER: &str = "x-nexus-module";

/// Error codes for per-module and build failures.
pub mod codes {
    pub const RESOLVE_NOT_FOUND: &str = "RESOLVE_NOT_FOUND";
    pub const RESOLVE_INVALID_MANIFEST: &str = "RESOLVE_INVALID_MANIFEST";
    pub const RESOLVE_EXTERNAL: &str = "RESOLVE_EXTERNAL";
    pub const MODULE_READ_FAILED: &str = "MODULE_READ_FAILED";
    pub const MODULE_OUTSIDE_ROOT: &str = "MODULE_OUTSIDE_ROOT";
    pub const TRANSFORM_FAILED: &str = "TRANSFORM_FAILED";
    pub const BUILD_FAILED: &str = "BUILD_FAILED";
    pub const CONFIG_INVALID: &str = "CONFIG_INVALID";
}

/// Event pushed from the dev server to a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Sent once when a session opens.
    Connected { generation: u64 },

    /// The client must reload the page.
    FullReload {
        generation: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Modules changed; the client runtime decides how to apply them.
    Update {
        #[serde(rename = "changedIds")]
        changed_ids: Vec<String>,
        generation: u64,
    },

    /// A module failed to rebuild. The previous output stays served.
    Error {
        generation: u64,
        error: ErrorPayload,
    },
}

impl ServerEvent {
    /// Generation this event describes.
    #[must_use]
    pub fn generation(&self) -> u64 {
        match self {
            Self::Connected { generation }
            | Self::FullReload { generation, .. }
            | Self::Update { generation, .. }
            | Self::Error { generation, .. } => *generation,
        }
    }

    /// Serialize to a JSON text frame.
    #[must_use]
    pub fn to_json(&self) -> String {
        // Plain data with string keys cannot fail to serialize
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

/// Message sent from a client to the dev server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// The client applied everything up to `generation`.
    Ack { generation: u64 },
    /// Keep-alive.
    Ping,
}

/// Overlay-able error description for a single module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Stable error code (see [`codes`]).
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Module URL the error belongs to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    /// Generation the error was observed in.
    pub generation: u64,
}

impl ErrorPayload {
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>, generation: u64) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            module: None,
            generation,
        }
    }

    #[must_use]
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }
}

/// Kind of an emitted chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    /// Starting point of one declared entry.
    Entry,
    /// Boundary created by a dynamic `import()`.
    Dynamic,
    /// Modules hoisted because several chunks need them.
    Shared,
}

/// One chunk in the production manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    /// Output file, relative to the output directory.
    pub file: String,
    pub kind: ChunkKind,
    /// Module ids in evaluation order.
    pub modules: Vec<String>,
    /// Chunk ids that must load before this one.
    #[serde(default)]
    pub imports: Vec<String>,
    /// Chunk ids loaded lazily from this one.
    #[serde(default)]
    pub dynamic_imports: Vec<String>,
}

/// `manifest.json` written next to the emitted chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildManifest {
    pub schema_version: u32,
    /// Entry name to entry chunk id.
    pub entries: BTreeMap<String, String>,
    /// Chunk id to chunk record.
    pub chunks: BTreeMap<String, ChunkRecord>,
    /// Emitted runtime file.
    pub runtime: String,
    /// Extracted stylesheets.
    #[serde(default)]
    pub css: Vec<String>,
    /// Emitted static assets.
    #[serde(default)]
    pub assets: Vec<String>,
}

impl BuildManifest {
    #[must_use]
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            schema_version: MANIFEST_SCHEMA_VERSION,
            entries: BTreeMap::new(),
            chunks: BTreeMap::new(),
            runtime: runtime.into(),
            css: Vec::new(),
            assets: Vec::new(),
        }
    }

    /// Output file of the chunk an entry starts in.
    #[must_use]
    pub fn entry_file(&self, entry: &str) -> Option<&str> {
        let id = self.entries.get(entry)?;
        self.chunks.get(id).map(|c| c.file.as_str())
    }
}

/// Machine-readable result of `nexus build --json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSummary {
    pub schema_version: u32,
    pub ok: bool,
    pub out_dir: String,
    #[serde(default)]
    pub entries: Vec<String>,
    pub chunks: usize,
    pub modules: usize,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    pub duration_ms: u64,
}

/// Transform cache counters reported by the dev server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub transform_ms: u64,
}

/// Body of `GET /__nexus/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevStatus {
    pub generation: u64,
    pub modules: usize,
    pub entries: Vec<String>,
    pub sessions: usize,
    pub cache: CacheStats,
}
