//! Embeds the git revision as `GIT_HASH` for the startup log line

use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

fn main() {
    // Short hash, suffixed with -dirty for uncommitted changes
    let revision =
        git(&["describe", "--always", "--dirty", "--abbrev=8"]).unwrap_or_else(|| "unknown".into());
    println!("cargo:rustc-env=GIT_HASH={revision}");

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
}
