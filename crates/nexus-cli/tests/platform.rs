//! Integration tests for `nexus platform`.

use std::process::Command;

fn cargo_bin() -> Command {
    let mut cmd = Command::new(env!("CARGO"));
    cmd.args(["run", "-q", "-p", "nexus-cli", "--bin", "nexus", "--"]);
    cmd
}

#[test]
fn test_platform_json_lists_supported_pairs() {
    let output = cargo_bin()
        .args(["platform", "--json"])
        .output()
        .expect("Failed to run platform command");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let json: serde_json::Value =
        serde_json::from_str(&stdout).expect("stdout should be valid JSON");

    let pairs: Vec<&str> = json["pairs"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p.as_str().unwrap())
        .collect();
    assert_eq!(pairs, vec!["win32-x64", "darwin-x64", "darwin-arm64", "linux-x64"]);

    let host = json["host"].as_str().unwrap();
    assert_eq!(json["supported"], pairs.contains(&host));
    assert_eq!(output.status.success(), pairs.contains(&host));
}
