//! `nexus platform` command implementation.

use miette::{IntoDiagnostic, Result};
use nexus_core::{select_binding, supported_pairs, HostInfo};

/// Print the host pair and the artifact selected for it.
pub fn run(json: bool) -> Result<()> {
    let host = HostInfo::current();
    let binding = select_binding(&host);

    if json {
        let value = serde_json::json!({
            "host": host.pair(),
            "supported": binding.is_ok(),
            "artifact": binding.as_ref().ok().map(|b| b.artifact),
            "pairs": supported_pairs(),
        });
        println!("{}", serde_json::to_string_pretty(&value).into_diagnostic()?);
        if binding.is_err() {
            std::process::exit(1);
        }
        return Ok(());
    }

    let binding = binding.into_diagnostic()?;
    println!("host:     {}", host.pair());
    println!("artifact: {}", binding.artifact);
    Ok(())
}
