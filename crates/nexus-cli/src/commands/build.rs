//! `nexus build` command implementation.

use miette::{IntoDiagnostic, Result};
use nexus_core::bundle::failure_summary;
use nexus_core::{BuildOutput, Error, NexusContext};
use std::path::PathBuf;
use std::time::Instant;
use tracing::info_span;

/// Build command action.
#[derive(Debug, Clone)]
pub struct BuildAction {
    pub cwd: PathBuf,
    /// Config file, relative to `cwd`.
    pub config: PathBuf,
    /// Overrides the configured output directory.
    pub out_dir: Option<PathBuf>,
}

/// Run a production build. With `json`, a `BuildSummary` is printed to
/// stdout and a failed build exits with status 1.
pub fn run(action: BuildAction, json: bool) -> Result<()> {
    let _span = info_span!("build", cwd = %action.cwd.display()).entered();
    let started = Instant::now();

    match (build(&action), json) {
        (Ok(output), true) => {
            let summary = output.summary();
            println!("{}", serde_json::to_string_pretty(&summary).into_diagnostic()?);
            Ok(())
        }
        (Ok(output), false) => {
            print_report(&output);
            Ok(())
        }
        (Err(err), true) => {
            let out_dir = action
                .cwd
                .join(action.out_dir.clone().unwrap_or_else(|| PathBuf::from("dist")));
            let summary = failure_summary(&err, &out_dir, started.elapsed());
            println!("{}", serde_json::to_string_pretty(&summary).into_diagnostic()?);
            std::process::exit(1);
        }
        (Err(err), false) => Err(err).into_diagnostic(),
    }
}

fn build(action: &BuildAction) -> std::result::Result<BuildOutput, Error> {
    let mut config = super::load_config(&action.cwd, &action.config)?;
    if let Some(out_dir) = &action.out_dir {
        config.out_dir.clone_from(out_dir);
    }
    NexusContext::load(config)?.build()
}

fn print_report(output: &BuildOutput) {
    for warning in &output.warnings {
        eprintln!("warning: {warning}");
    }

    let manifest = &output.manifest;
    let mut files: Vec<&str> = manifest.chunks.values().map(|c| c.file.as_str()).collect();
    files.push(manifest.runtime.as_str());
    files.extend(manifest.css.iter().map(String::as_str));
    files.extend(manifest.assets.iter().map(String::as_str));
    files.sort_unstable();

    println!();
    for file in files {
        let size = std::fs::metadata(output.out_dir.join(file)).map_or(0, |m| m.len());
        println!("  {file:<48} {:>8.2} kB", size as f64 / 1024.0);
    }
    println!();
    println!(
        "  built {} module(s) into {} chunk(s) in {}ms",
        output.modules,
        manifest.chunks.len(),
        output.duration.as_millis()
    );
}
