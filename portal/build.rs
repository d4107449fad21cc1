//! Build script for deploy-portal
//! Stamps the git revision and build time reported by `--version` and `/version`

use chrono::Utc;
use std::process::Command;

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn main() {
    // Release pipelines may pin the revision explicitly
    let git_hash = std::env::var("DEPLOY_PORTAL_GIT_HASH")
        .ok()
        .or_else(|| git(&["describe", "--always", "--dirty", "--abbrev=8"]))
        .unwrap_or_else(|| "unknown".to_string());

    let build_time = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();

    println!("cargo:rustc-env=GIT_HASH={}", git_hash);
    println!("cargo:rustc-env=BUILD_TIME={}", build_time);

    println!("cargo:rerun-if-env-changed=DEPLOY_PORTAL_GIT_HASH");
    println!("cargo:rerun-if-changed=../.git/HEAD");
}
