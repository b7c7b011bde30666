// tests/cache_roundtrip.rs

//! Cache protocol: round-trips, artifact restoration, policy gating, and
//! the remote read-through path.

mod common;

use std::error::Error;
use std::fs;

use common::{expand, project};
use qik::cache::{
    should_store, CacheBackend, DirTransport, LocalCache, RemoteCache, RepoCache, RunOutput,
};
use qik::cmd::Runnable;
use qik::config::model::CachePolicy;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn Error>>;

fn runnable_with_artifacts(root: &std::path::Path) -> Runnable {
    let config = r#"
[commands.build]
exec = "printf ok > out.txt"
deps = ["in.txt"]
artifacts = ["out.txt"]
cache = "local"
"#;
    let proj = project(root, config);
    let table = expand(&proj);
    table.get("build").expect("runnable exists").clone()
}

fn ok_output(text: &str) -> RunOutput {
    RunOutput {
        code: 0,
        out: text.to_string(),
        signaled: false,
    }
}

#[test]
fn local_round_trip_restores_artifacts_byte_identically() -> TestResult {
    let tmp = TempDir::new()?;
    let root = tmp.path();
    fs::write(root.join("out.txt"), b"artifact bytes\x00\x01")?;

    let proj = project(root, "");
    let runnable = runnable_with_artifacts(root);
    let cache = LocalCache::new(&proj);

    cache.put(&runnable, "fp1", &ok_output("line one\nline two\n"))?;

    // Clobber the artifact, then restore from cache.
    fs::write(root.join("out.txt"), b"garbage")?;

    let entry = cache.get(&runnable, "fp1", true)?.expect("cache hit");
    assert_eq!(entry.code(), 0);
    assert_eq!(entry.out.as_deref(), Some("line one\nline two\n"));
    assert_eq!(fs::read(root.join("out.txt"))?, b"artifact bytes\x00\x01");
    Ok(())
}

#[test]
fn a_different_fingerprint_misses() -> TestResult {
    let tmp = TempDir::new()?;
    let root = tmp.path();
    fs::write(root.join("out.txt"), "x")?;

    let proj = project(root, "");
    let runnable = runnable_with_artifacts(root);
    let cache = LocalCache::new(&proj);

    cache.put(&runnable, "fp1", &ok_output("hi\n"))?;
    assert!(cache.get(&runnable, "fp2", true)?.is_none());
    Ok(())
}

#[test]
fn probing_without_restore_does_not_touch_artifacts() -> TestResult {
    let tmp = TempDir::new()?;
    let root = tmp.path();
    fs::write(root.join("out.txt"), "original")?;

    let proj = project(root, "");
    let runnable = runnable_with_artifacts(root);
    let cache = LocalCache::new(&proj);

    cache.put(&runnable, "fp1", &ok_output(""))?;
    fs::write(root.join("out.txt"), "changed")?;

    let entry = cache.get(&runnable, "fp1", false)?;
    assert!(entry.is_some());
    assert_eq!(fs::read_to_string(root.join("out.txt"))?, "changed");
    Ok(())
}

#[test]
fn policy_gating_matrix() -> TestResult {
    let success = ok_output("");
    let failed = RunOutput {
        code: 2,
        out: String::new(),
        signaled: false,
    };
    let killed = RunOutput {
        code: -1,
        out: String::new(),
        signaled: true,
    };

    assert!(should_store(CachePolicy::Success, &success));
    assert!(!should_store(CachePolicy::Success, &failed));
    assert!(!should_store(CachePolicy::Success, &killed));

    assert!(should_store(CachePolicy::Finished, &success));
    assert!(should_store(CachePolicy::Finished, &failed));
    assert!(!should_store(CachePolicy::Finished, &killed));

    assert!(should_store(CachePolicy::Always, &killed));

    assert!(!should_store(CachePolicy::Never, &success));
    assert!(!should_store(CachePolicy::Never, &failed));
    Ok(())
}

#[test]
fn repo_cache_stores_manifest_without_artifact_bytes() -> TestResult {
    let tmp = TempDir::new()?;
    let root = tmp.path();
    fs::write(root.join("out.txt"), "x")?;

    let proj = project(root, "");
    let runnable = runnable_with_artifacts(root);
    let cache = RepoCache::new(&proj);

    cache.put(&runnable, "fp1", &ok_output("captured\n"))?;

    let entry_dir = root.join(".qik/cache/build/fp1");
    assert!(entry_dir.join("manifest").is_file());
    assert!(entry_dir.join("exit").is_file());
    assert!(!entry_dir.join("artifacts").exists());

    let entry = cache.get(&runnable, "fp1", true)?.expect("cache hit");
    assert_eq!(entry.code(), 0);
    assert_eq!(entry.out.as_deref(), Some("captured\n"));

    // The merge-driver attribute rule is installed alongside the entry.
    let attrs = fs::read_to_string(root.join(".gitattributes"))?;
    assert!(attrs.contains("merge=qik-cache"));
    Ok(())
}

#[test]
fn remote_cache_downloads_on_local_miss() -> TestResult {
    let tmp = TempDir::new()?;
    let root = tmp.path();
    let remote_dir = TempDir::new()?;
    fs::write(root.join("out.txt"), "payload")?;

    let proj = project(root, "");
    let runnable = runnable_with_artifacts(root);
    let cache = RemoteCache::new(
        LocalCache::new(&proj),
        Box::new(DirTransport::new(remote_dir.path())),
    );

    cache.put(&runnable, "fp1", &ok_output("remote\n"))?;

    // Wipe the local side; the entry must come back over the transport.
    fs::remove_dir_all(root.join("._qik"))?;
    fs::write(root.join("out.txt"), "garbage")?;

    let entry = cache.get(&runnable, "fp1", true)?.expect("remote hit");
    assert_eq!(entry.out.as_deref(), Some("remote\n"));
    assert_eq!(fs::read_to_string(root.join("out.txt"))?, "payload");
    Ok(())
}

#[test]
fn unreachable_remote_degrades_to_local_only() -> TestResult {
    let tmp = TempDir::new()?;
    let root = tmp.path();
    fs::write(root.join("out.txt"), "x")?;

    let proj = project(root, "");
    let runnable = runnable_with_artifacts(root);
    let cache = RemoteCache::new(
        LocalCache::new(&proj),
        Box::new(DirTransport::new("/nonexistent/remote")),
    );

    // The upload fails with a warning; the local entry still lands.
    cache.put(&runnable, "fp1", &ok_output("kept\n"))?;
    let entry = cache.get(&runnable, "fp1", false)?.expect("local hit");
    assert_eq!(entry.out.as_deref(), Some("kept\n"));
    Ok(())
}

#[test]
fn private_work_dir_is_gitignored() -> TestResult {
    let tmp = TempDir::new()?;
    let root = tmp.path();
    fs::write(root.join("out.txt"), "x")?;

    let proj = project(root, "");
    let runnable = runnable_with_artifacts(root);
    LocalCache::new(&proj).put(&runnable, "fp1", &ok_output(""))?;

    assert_eq!(fs::read_to_string(root.join("._qik/.gitignore"))?, "*\n");
    Ok(())
}
