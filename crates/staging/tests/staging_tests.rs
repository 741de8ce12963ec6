//! End-to-end staging behavior over real temp directories

use berth_fingerprint::{FilterSet, FingerprintOptions, fingerprint};
use berth_staging::{
    Error, FixedOutputDirectory, HashStrategy, Result, Stager, StagingMemo, StagingRequest,
    TransformConfig, TransformInvocation,
};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;

fn write_source_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    fs::create_dir_all(dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

fn plain_fingerprint(path: &Path) -> String {
    fingerprint(path, &FingerprintOptions::default()).unwrap()
}

/// Executor that writes one deterministic output file and counts calls.
fn counting_executor(calls: Arc<AtomicUsize>) -> Arc<dyn berth_staging::TransformExecutor> {
    Arc::new(move |inv: &TransformInvocation<'_>| -> Result<()> {
        calls.fetch_add(1, Ordering::SeqCst);
        fs::write(inv.bundle_dir.join("bundle.out"), b"bundled-bytes")
            .map_err(|e| Error::io(e, inv.bundle_dir, "write"))
    })
}

#[test]
fn stages_a_single_file_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("out");
    let source = write_source_file(&tmp.path().join("src"), "data.bin", b"0123456789");

    let stager = Stager::new(
        Arc::new(StagingMemo::new()),
        FixedOutputDirectory(out.clone()),
    );
    let staged = stager
        .stage(&StagingRequest::new("app-data", &source))
        .unwrap();

    let expected = plain_fingerprint(&source);
    assert_eq!(staged.asset_hash, expected);
    assert_eq!(staged.staged_path, out.join(format!("asset.{expected}.bin")));
    assert_eq!(fs::read(&staged.staged_path).unwrap(), b"0123456789");
}

#[test]
fn skip_reports_source_path_and_source_hash_regardless_of_hints() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("out");
    let source = write_source_file(&tmp.path().join("src"), "data.bin", b"payload");

    let stager = Stager::new(
        Arc::new(StagingMemo::new()),
        FixedOutputDirectory(out.clone()),
    );
    let mut request = StagingRequest::new("app-data", &source);
    request.custom_seed = Some("pinned-seed".to_string());
    request.skip = true;

    let staged = stager.stage(&request).unwrap();
    assert_eq!(staged.staged_path, fs::canonicalize(&source).unwrap());
    // The custom seed hint is ignored while staging is disabled
    assert_eq!(staged.asset_hash, plain_fingerprint(&source));
    assert!(!out.exists());
}

#[test]
fn skip_with_transform_runs_nothing() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("out");
    let source_dir = tmp.path().join("src");
    write_source_file(&source_dir, "input.txt", b"raw");

    let calls = Arc::new(AtomicUsize::new(0));
    let stager = Stager::new(
        Arc::new(StagingMemo::new()),
        FixedOutputDirectory(out.clone()),
    )
    .with_executor(counting_executor(Arc::clone(&calls)));

    let mut request = StagingRequest::new("web-bundle", &source_dir);
    request.transform = Some(TransformConfig::new("builder:latest", ["npm", "run", "build"]));
    request.skip = true;

    let staged = stager.stage(&request).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(staged.staged_path, fs::canonicalize(&source_dir).unwrap());
    assert_eq!(staged.asset_hash, plain_fingerprint(&source_dir));
    assert!(!out.exists());
}

#[test]
fn identical_requests_transform_exactly_once() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("out");
    let source_dir = tmp.path().join("src");
    write_source_file(&source_dir, "input.txt", b"raw");

    let calls = Arc::new(AtomicUsize::new(0));
    let stager = Stager::new(
        Arc::new(StagingMemo::new()),
        FixedOutputDirectory(out.clone()),
    )
    .with_executor(counting_executor(Arc::clone(&calls)));

    let mut request = StagingRequest::new("web-bundle", &source_dir);
    request.transform = Some(TransformConfig::new("builder:latest", ["make"]));

    let first = stager.stage(&request).unwrap();
    let second = stager.stage(&request).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first, second);
    assert!(first.staged_path.exists());
}

#[test]
fn distinct_requests_transform_independently() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("out");
    let source_dir = tmp.path().join("src");
    write_source_file(&source_dir, "input.txt", b"raw");

    let calls = Arc::new(AtomicUsize::new(0));
    let stager = Stager::new(
        Arc::new(StagingMemo::new()),
        FixedOutputDirectory(out.clone()),
    )
    .with_executor(counting_executor(Arc::clone(&calls)));

    let mut request = StagingRequest::new("web-bundle", &source_dir);
    request.transform = Some(TransformConfig::new("builder:latest", ["make"]));
    stager.stage(&request).unwrap();

    // A different salt is a different observable configuration
    request.extra_hash = Some("v2".to_string());
    stager.stage(&request).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn redundant_bundle_output_is_discarded_when_target_exists() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("out");
    let source_dir = tmp.path().join("src");
    write_source_file(&source_dir, "input.txt", b"raw");

    let calls = Arc::new(AtomicUsize::new(0));
    let memo = Arc::new(StagingMemo::new());
    let stager = Stager::new(Arc::clone(&memo), FixedOutputDirectory(out.clone()))
        .with_executor(counting_executor(Arc::clone(&calls)));

    // Output hashing: the bundle directory is cache-key-named, so a second
    // run (memo cleared) rebuilds into a temp directory and then discards
    // it against the already-staged target
    let mut request = StagingRequest::new("web-bundle", &source_dir);
    request.strategy = Some(HashStrategy::Output);
    request.transform = Some(TransformConfig::new("builder:latest", ["make"]));

    let first = stager.stage(&request).unwrap();
    memo.clear();
    let second = stager.stage(&request).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(first, second);
    // No temp bundle directories survive
    let leftovers: Vec<String> = fs::read_dir(&out)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("bundling-temp-"))
        .collect();
    assert!(leftovers.is_empty(), "leftover temp dirs: {leftovers:?}");
}

#[test]
fn output_strategy_hashes_the_transformation_output() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("out");
    let source_dir = tmp.path().join("src");
    write_source_file(&source_dir, "input.txt", b"raw");

    let calls = Arc::new(AtomicUsize::new(0));
    let stager = Stager::new(
        Arc::new(StagingMemo::new()),
        FixedOutputDirectory(out.clone()),
    )
    .with_executor(counting_executor(calls));

    let mut request = StagingRequest::new("web-bundle", &source_dir);
    request.strategy = Some(HashStrategy::Output);
    request.transform = Some(TransformConfig::new("builder:latest", ["make"]));

    let staged = stager.stage(&request).unwrap();
    assert_eq!(staged.asset_hash, plain_fingerprint(&staged.staged_path));
    assert_eq!(
        staged.staged_path,
        out.join(format!("asset.{}", staged.asset_hash))
    );
    assert_eq!(
        fs::read(staged.staged_path.join("bundle.out")).unwrap(),
        b"bundled-bytes"
    );
}

#[test]
fn bundle_strategy_without_transform_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let source = write_source_file(&tmp.path().join("src"), "data.bin", b"x");
    let stager = Stager::new(
        Arc::new(StagingMemo::new()),
        FixedOutputDirectory(tmp.path().join("out")),
    );

    let mut request = StagingRequest::new("app-data", &source);
    request.strategy = Some(HashStrategy::Bundle);
    let err = stager.stage(&request).unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
}

#[test]
fn missing_source_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let stager = Stager::new(
        Arc::new(StagingMemo::new()),
        FixedOutputDirectory(tmp.path().join("out")),
    );
    let request = StagingRequest::new("ghost", tmp.path().join("does-not-exist"));
    let err = stager.stage(&request).unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
}

#[test]
fn transform_without_executor_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let source_dir = tmp.path().join("src");
    write_source_file(&source_dir, "input.txt", b"raw");
    let stager = Stager::new(
        Arc::new(StagingMemo::new()),
        FixedOutputDirectory(tmp.path().join("out")),
    );

    let mut request = StagingRequest::new("web-bundle", &source_dir);
    request.transform = Some(TransformConfig::new("builder:latest", ["make"]));
    let err = stager.stage(&request).unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
}

#[test]
fn failed_transform_preserves_artifact_and_allows_retry() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("out");
    let source_dir = tmp.path().join("src");
    write_source_file(&source_dir, "input.txt", b"raw");

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_executor = Arc::clone(&calls);
    let executor = Arc::new(move |inv: &TransformInvocation<'_>| -> Result<()> {
        let attempt = calls_in_executor.fetch_add(1, Ordering::SeqCst);
        fs::write(inv.bundle_dir.join("partial.txt"), b"half")
            .map_err(|e| Error::io(e, inv.bundle_dir, "write"))?;
        if attempt == 0 {
            return Err(Error::configuration("compiler crashed"));
        }
        Ok(())
    });

    let memo = Arc::new(StagingMemo::new());
    let stager =
        Stager::new(Arc::clone(&memo), FixedOutputDirectory(out.clone())).with_executor(executor);

    let mut request = StagingRequest::new("web-bundle", &source_dir);
    request.transform = Some(TransformConfig::new("builder:latest", ["make"]));

    let err = stager.stage(&request).unwrap_err();
    let Error::Transformation {
        asset, error_dir, ..
    } = err
    else {
        panic!("expected a transformation error");
    };
    assert_eq!(asset, "web-bundle");
    assert!(error_dir.join("partial.txt").exists());
    assert!(memo.is_empty());

    // The failure was not memoized and the error artifact does not block a
    // retry
    let staged = stager.stage(&request).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(staged.staged_path.exists());
    assert_eq!(memo.len(), 1);
}

#[test]
fn empty_transform_output_is_fatal() {
    let tmp = TempDir::new().unwrap();
    let source_dir = tmp.path().join("src");
    write_source_file(&source_dir, "input.txt", b"raw");

    let executor = Arc::new(|_inv: &TransformInvocation<'_>| -> Result<()> { Ok(()) });
    let stager = Stager::new(
        Arc::new(StagingMemo::new()),
        FixedOutputDirectory(tmp.path().join("out")),
    )
    .with_executor(executor);

    let mut request = StagingRequest::new("web-bundle", &source_dir);
    request.transform = Some(TransformConfig::new("builder:latest", ["true"]));

    let err = stager.stage(&request).unwrap_err();
    assert!(matches!(err, Error::Transformation { .. }));
    assert!(err.to_string().contains("produced no output"));
}

#[test]
fn existing_target_content_is_authoritative() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("out");
    let source = write_source_file(&tmp.path().join("src"), "data.bin", b"fresh-bytes");

    let expected = plain_fingerprint(&source);
    let target = out.join(format!("asset.{expected}.bin"));
    fs::create_dir_all(&out).unwrap();
    fs::write(&target, b"sentinel").unwrap();

    let stager = Stager::new(Arc::new(StagingMemo::new()), FixedOutputDirectory(out));
    let staged = stager
        .stage(&StagingRequest::new("app-data", &source))
        .unwrap();

    assert_eq!(staged.staged_path, target);
    // Zero bytes were re-copied over the existing target
    assert_eq!(fs::read(&target).unwrap(), b"sentinel");
}

#[test]
fn directory_staging_honors_filters() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("out");
    let source_dir = tmp.path().join("src");
    write_source_file(&source_dir, "keep.txt", b"k");
    write_source_file(&source_dir, "noise.log", b"n");

    let stager = Stager::new(
        Arc::new(StagingMemo::new()),
        FixedOutputDirectory(out.clone()),
    );
    let mut request = StagingRequest::new("site", &source_dir);
    request.filters = FilterSet::excluding(["*.log"]);

    let staged = stager.stage(&request).unwrap();
    assert_eq!(
        staged.staged_path,
        out.join(format!("asset.{}", staged.asset_hash))
    );
    assert!(staged.staged_path.join("keep.txt").exists());
    assert!(!staged.staged_path.join("noise.log").exists());
}

#[test]
fn custom_seed_hash_is_the_digest_of_the_seed() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("out");
    let source = write_source_file(&tmp.path().join("src"), "data.bin", b"irrelevant");

    let stager = Stager::new(Arc::new(StagingMemo::new()), FixedOutputDirectory(out));
    let mut request = StagingRequest::new("pinned", &source);
    request.custom_seed = Some("my-seed".to_string());

    let staged = stager.stage(&request).unwrap();
    assert_eq!(staged.asset_hash, hex::encode(Sha256::digest(b"my-seed")));
}

#[test]
fn attached_transform_changes_source_strategy_hashes() {
    let tmp = TempDir::new().unwrap();
    let source_dir = tmp.path().join("src");
    write_source_file(&source_dir, "input.txt", b"raw");

    let plain_stager = Stager::new(
        Arc::new(StagingMemo::new()),
        FixedOutputDirectory(tmp.path().join("out-plain")),
    );
    let plain = plain_stager
        .stage(&StagingRequest::new("site", &source_dir))
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let bundling_stager = Stager::new(
        Arc::new(StagingMemo::new()),
        FixedOutputDirectory(tmp.path().join("out-bundled")),
    )
    .with_executor(counting_executor(calls));
    let mut request = StagingRequest::new("site", &source_dir);
    request.transform = Some(TransformConfig::new("builder:latest", ["make"]));
    let bundled = bundling_stager.stage(&request).unwrap();

    // Transformation identity folds into source-strategy hashes
    assert_ne!(plain.asset_hash, bundled.asset_hash);
}

#[test]
fn local_transform_is_preferred_over_the_executor() {
    let tmp = TempDir::new().unwrap();
    let source_dir = tmp.path().join("src");
    write_source_file(&source_dir, "input.txt", b"raw");

    let executor_calls = Arc::new(AtomicUsize::new(0));
    let local = Arc::new(|inv: &TransformInvocation<'_>| -> Result<bool> {
        fs::write(inv.bundle_dir.join("local.out"), b"in-process")
            .map_err(|e| Error::io(e, inv.bundle_dir, "write"))?;
        Ok(true)
    });

    let stager = Stager::new(
        Arc::new(StagingMemo::new()),
        FixedOutputDirectory(tmp.path().join("out")),
    )
    .with_executor(counting_executor(Arc::clone(&executor_calls)))
    .with_local_transform(local);

    let mut request = StagingRequest::new("web-bundle", &source_dir);
    request.transform = Some(TransformConfig::new("builder:latest", ["make"]));

    let staged = stager.stage(&request).unwrap();
    assert_eq!(executor_calls.load(Ordering::SeqCst), 0);
    assert!(staged.staged_path.join("local.out").exists());
}

#[test]
fn relative_staged_path_only_inside_the_output_tree() {
    let tmp = TempDir::new().unwrap();
    let out = tmp.path().join("out");
    let source = write_source_file(&tmp.path().join("src"), "data.bin", b"abc");

    let stager = Stager::new(
        Arc::new(StagingMemo::new()),
        FixedOutputDirectory(out.clone()),
    );

    let staged = stager
        .stage(&StagingRequest::new("app-data", &source))
        .unwrap();
    let relative = stager.relative_staged_path(&staged, tmp.path()).unwrap();
    assert!(relative.is_relative());
    assert_eq!(tmp.path().join(&relative), staged.staged_path);

    // Skipped staging leaves the asset outside the output tree; the
    // absolute path comes back unchanged
    let mut skipped_request = StagingRequest::new("app-data", &source);
    skipped_request.skip = true;
    let skipped = stager.stage(&skipped_request).unwrap();
    let reported = stager.relative_staged_path(&skipped, tmp.path()).unwrap();
    assert_eq!(reported, skipped.staged_path);
    assert!(reported.is_absolute());
}
