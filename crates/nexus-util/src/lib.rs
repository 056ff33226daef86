#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Shared utilities for nexus.
//!
//! Pure helpers with no logging dependencies. Logging is configured by the CLI
//! and emitted by `nexus-core`.

pub mod fs;
pub mod hash;
