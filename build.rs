//! Stamps the binary with the source revision it was built from.
//!
//! `XFER_BUILD_REV` wins when set (release pipelines building from a tarball
//! have no `.git`); otherwise `git describe` is asked, and `unknown` is used
//! when neither is available.

use std::env;
use std::process::Command;

const OVERRIDE: &str = "XFER_BUILD_REV";

fn describe() -> Option<String> {
    let out = Command::new("git")
        .args(["describe", "--always", "--dirty=+", "--abbrev=10"])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let rev = String::from_utf8(out.stdout).ok()?;
    let rev = rev.trim();
    (!rev.is_empty()).then(|| rev.to_string())
}

fn main() {
    let rev = env::var(OVERRIDE)
        .ok()
        .filter(|v| !v.is_empty())
        .or_else(describe)
        .unwrap_or_else(|| "unknown".into());

    println!("cargo:rustc-env=BUILD_REV={rev}");
    println!("cargo:rerun-if-env-changed={OVERRIDE}");
    for path in [".git/HEAD", ".git/index"] {
        println!("cargo:rerun-if-changed={path}");
    }
}
