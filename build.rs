//! Build script to inject version and git SHA at compile time.
//!
//! Environment variables (set by CI or fall back to defaults):
//! - AUDIO_HUB_VERSION: Version string (defaults to CARGO_PKG_VERSION)
//! - AUDIO_HUB_GIT_SHA: Git commit SHA (defaults to git rev-parse or "unknown")

use std::process::Command;

fn main() {
    let version = std::env::var("AUDIO_HUB_VERSION").unwrap_or_else(|_| {
        std::env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "unknown".into())
    });
    println!("cargo:rustc-env=AUDIO_HUB_VERSION={}", version);

    let git_sha = std::env::var("AUDIO_HUB_GIT_SHA").unwrap_or_else(|_| get_git_sha());
    println!("cargo:rustc-env=AUDIO_HUB_GIT_SHA={}", git_sha);

    println!("cargo:rerun-if-env-changed=AUDIO_HUB_VERSION");
    println!("cargo:rerun-if-env-changed=AUDIO_HUB_GIT_SHA");
}

fn get_git_sha() -> String {
    Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .and_then(|o| {
            if o.status.success() {
                String::from_utf8(o.stdout)
                    .ok()
                    .map(|s| s.trim().to_string())
            } else {
                None
            }
        })
        .unwrap_or_else(|| "unknown".into())
}
