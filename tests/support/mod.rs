#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use apiflow::context::Context;
use apiflow::testkit::CallCounter;
use tempfile::TempDir;

/// Write `contents` to a config file inside a fresh temp directory.
///
/// The directory is removed when the returned guard drops.
pub fn write_temp_config(contents: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("apiflow.toml");
    std::fs::write(&path, contents).expect("write temp config");
    (dir, path)
}

/// Work that records a hit for `key`, then sleeps for `delay`.
pub async fn counted_sleep(
    ctx: Context,
    counter: CallCounter,
    key: String,
    delay: Duration,
) -> anyhow::Result<String> {
    counter.hit(key.clone());
    ctx.sleep(delay).await?;
    Ok(format!("value:{key}"))
}
