use std::{env, fs, io, path::PathBuf, process::Command};

fn main() {
    if let Err(err) = write_version() {
        panic!("failed to write version.rs: {err}");
    }

    println!("cargo:rerun-if-env-changed=GIT_SHA");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=../../.git/HEAD");
}

fn write_version() -> io::Result<()> {
    let pkg_version = env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".to_string());
    let git_sha = env::var("GIT_SHA")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(git_short_sha)
        .unwrap_or_else(|| "unknown".to_string());
    let build_timestamp =
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

    let out_dir = PathBuf::from(env::var("OUT_DIR").map_err(io::Error::other)?);
    let contents = format!(
        "pub const VERSION: &str = \"{pkg_version}\";\n\
         pub const GIT_SHA: &str = \"{git_sha}\";\n\
         pub const BUILD_TIMESTAMP: &str = \"{build_timestamp}\";\n"
    );
    fs::write(out_dir.join("version.rs"), contents)
}

fn git_short_sha() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}
