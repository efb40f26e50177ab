// Copyright (c) The Taipan Project Developers.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The fetch / validate / extract / record pipeline against real cache
//! directories, with a scripted extractor standing in for the archive
//! decoder.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use taipan::cache::MultiPackageCache;
use taipan::error::Error;
use taipan::extract::{ExtractOptions, ExtractSemaphore, Extractor};
use taipan::fetcher::PackageFetcher;
use taipan::package::PackageInfo;
use taipan::CancelToken;
use tempfile::TempDir;

/// Stands in for the archive decoder: "extracts" by materializing the
/// configured `info/index.json` (and an untouched `paths.json`).
#[derive(Debug)]
struct ScriptedExtractor {
    index: Value,
}

impl Extractor for ScriptedExtractor {
    fn extract(&self, _tarball: &Path, dest: &Path, cancel: &CancelToken) -> taipan::error::Result<()> {
        cancel.check()?;
        let info = dest.join("info");
        std::fs::create_dir_all(&info).unwrap();
        std::fs::write(
            info.join("index.json"),
            serde_json::to_string_pretty(&self.index).unwrap(),
        )
        .unwrap();
        std::fs::write(info.join("paths.json"), r#"{"paths": [], "paths_version": 1}"#).unwrap();
        Ok(())
    }
}

/// Fails after leaving a partial directory behind.
#[derive(Debug)]
struct FailingExtractor;

impl Extractor for FailingExtractor {
    fn extract(&self, tarball: &Path, dest: &Path, _cancel: &CancelToken) -> taipan::error::Result<()> {
        std::fs::create_dir_all(dest.join("info")).unwrap();
        Err(Error::Extract {
            path: tarball.to_path_buf(),
            reason: "scripted failure".to_string(),
        })
    }
}

fn options(index: Value) -> ExtractOptions {
    ExtractOptions {
        extractor: Arc::new(ScriptedExtractor { index }),
        semaphore: Arc::new(ExtractSemaphore::new(1)),
        cancel: CancelToken::new(),
    }
}

fn read_record(dir: &Path) -> Value {
    let path = dir.join("info").join("repodata_record.json");
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

const PKG_URL: &str =
    "https://conda.anaconda.org/conda-forge/linux-64/test-pkg-1.0-h123456_0.tar.bz2";
const PKG_BASENAME: &str = "test-pkg-1.0-h123456_0";

struct Setup {
    _dir: TempDir,
    cache_dir: PathBuf,
    caches: MultiPackageCache,
}

fn setup() -> Setup {
    let dir = TempDir::new().unwrap();
    let cache_dir = dir.path().join("pkgs");
    std::fs::create_dir_all(&cache_dir).unwrap();
    let caches = MultiPackageCache::new([cache_dir.clone()]);
    Setup {
        _dir: dir,
        cache_dir,
        caches,
    }
}

fn seed_tarball(setup: &Setup, name: &str) {
    std::fs::write(setup.cache_dir.join(name), b"scripted tarball bytes").unwrap();
}

fn seed_record(setup: &Setup, stem: &str, record: &Value) {
    let info = setup.cache_dir.join(stem).join("info");
    std::fs::create_dir_all(&info).unwrap();
    std::fs::write(
        info.join("repodata_record.json"),
        serde_json::to_string_pretty(record).unwrap(),
    )
    .unwrap();
}

/// A record written by an earlier buggy release (all three stub defaults) is
/// detected, removed, and re-extracted with correct values from index.json.
#[test]
fn heals_corrupted_cache() {
    let setup = setup();
    seed_tarball(&setup, &format!("{PKG_BASENAME}.tar.bz2"));
    seed_record(
        &setup,
        PKG_BASENAME,
        &json!({
            "name": "test-pkg",
            "version": "1.0",
            "build": "h123456_0",
            "timestamp": 0,
            "license": "",
            "build_number": 0,
            "fn": format!("{PKG_BASENAME}.tar.bz2"),
            "url": PKG_URL,
            "depends": [],
            "constrains": [],
        }),
    );

    let pkg = PackageInfo::from_url(PKG_URL).unwrap();
    let mut fetcher = PackageFetcher::new(pkg, &setup.caches).unwrap();

    // Corruption invalidates the extracted dir but the tarball is reusable.
    assert!(fetcher.needs_extract());
    assert!(!fetcher.needs_download());
    assert!(!setup.cache_dir.join(PKG_BASENAME).exists());

    fetcher
        .extract(&options(json!({
            "name": "test-pkg",
            "version": "1.0",
            "build": "h123456_0",
            "build_number": 42,
            "license": "MIT",
            "timestamp": 1_234_567_890_u64,
        })))
        .unwrap();
    assert!(!fetcher.needs_extract());

    let record = read_record(&setup.cache_dir.join(PKG_BASENAME));
    assert_eq!(record["license"], json!("MIT"));
    assert_eq!(record["build_number"], json!(42));
    assert_eq!(record["timestamp"], json!(1_234_567_890_u64));
    // Unknown in both sources: filled from the tarball itself.
    assert_eq!(
        record["size"],
        json!(b"scripted tarball bytes".len())
    );
    assert_eq!(record["md5"].as_str().unwrap().len(), 32);
    assert_eq!(record["sha256"].as_str().unwrap().len(), 64);
    assert_eq!(record["fn"], json!(format!("{PKG_BASENAME}.tar.bz2")));
    assert_eq!(record["url"], json!(PKG_URL));
    assert!(record["depends"].is_array());
    assert!(record["constrains"].is_array());
}

/// `timestamp == 0` alone is not the corruption signature; epoch-0 legacy
/// packages with a real license stay cached.
#[test]
fn epoch_zero_with_license_is_not_corruption() {
    let setup = setup();
    seed_record(
        &setup,
        PKG_BASENAME,
        &json!({
            "name": "test-pkg",
            "timestamp": 0,
            "license": "MIT",
            "build_number": 5,
        }),
    );

    let pkg = PackageInfo::from_url(PKG_URL).unwrap();
    let fetcher = PackageFetcher::new(pkg, &setup.caches).unwrap();
    assert!(!fetcher.needs_download());
    assert!(!fetcher.needs_extract());
    assert!(setup.cache_dir.join(PKG_BASENAME).exists());
}

/// A channel-patched empty `depends` survives the record write even when the
/// package's own index.json disagrees.
#[test]
fn preserves_channel_patched_empty_depends() {
    let setup = setup();
    let filename = "patched-pkg-1.0-h123456_0.tar.bz2";
    seed_tarball(&setup, filename);

    // Solver-derived: every field trusted, only the sentinel is defaulted.
    let pkg = PackageInfo {
        name: "patched-pkg".to_string(),
        version: "1.0".to_string(),
        build_string: "h123456_0".to_string(),
        filename: filename.to_string(),
        package_url: format!("https://example.org/ch/linux-64/{filename}"),
        dependencies: vec![],
        constrains: vec![],
        timestamp: 1_234_567_890,
        ..PackageInfo::default()
    };
    assert_eq!(
        pkg.defaulted_keys.iter().collect::<Vec<_>>(),
        vec!["_initialized"]
    );

    let mut fetcher = PackageFetcher::new(pkg, &setup.caches).unwrap();
    fetcher
        .extract(&options(json!({
            "name": "patched-pkg",
            "version": "1.0",
            "build": "h123456_0",
            "depends": ["broken-dependency"],
            "constrains": ["removed-constraint"],
        })))
        .unwrap();

    let record = read_record(&setup.cache_dir.join("patched-pkg-1.0-h123456_0"));
    assert_eq!(record["depends"], json!([]));
    assert_eq!(record["constrains"], json!([]));
}

/// A URL-derived package trusts index.json for its defaulted fields,
/// including `depends`.
#[test]
fn url_derived_package_takes_index_metadata() {
    let setup = setup();
    seed_tarball(&setup, &format!("{PKG_BASENAME}.tar.bz2"));

    let pkg = PackageInfo::from_url(PKG_URL).unwrap();
    let mut fetcher = PackageFetcher::new(pkg, &setup.caches).unwrap();
    fetcher
        .extract(&options(json!({
            "name": "test-pkg",
            "depends": ["python >=3.7"],
            "noarch": "python",
            "track_features": "",
            "python_site_packages_path": "lib/python3.13/site-packages",
        })))
        .unwrap();

    let record = read_record(&setup.cache_dir.join(PKG_BASENAME));
    assert_eq!(record["depends"], json!(["python >=3.7"]));
    // `noarch` is carried when non-empty, `track_features` dropped when
    // empty.
    assert_eq!(record["noarch"], json!("python"));
    assert!(record.get("track_features").is_none());
    assert_eq!(
        record["python_site_packages_path"],
        json!("lib/python3.13/site-packages")
    );
}

/// A missing `_initialized` sentinel is a construction-path bug: the write
/// aborts loudly and no record appears.
#[test]
fn missing_sentinel_fails_loud() {
    let setup = setup();
    let filename = "missing-init-pkg-1.0-h0_0.tar.bz2";
    seed_tarball(&setup, filename);

    let mut pkg = PackageInfo {
        name: "missing-init-pkg".to_string(),
        version: "1.0".to_string(),
        build_string: "h0_0".to_string(),
        filename: filename.to_string(),
        ..PackageInfo::default()
    };
    pkg.defaulted_keys =
        ["license".to_string(), "timestamp".to_string()].into_iter().collect();

    let mut fetcher = PackageFetcher::new(pkg, &setup.caches).unwrap();
    let err = fetcher.extract(&options(json!({ "name": "missing-init-pkg" }))).unwrap_err();
    assert!(matches!(err, Error::Logic { .. }));
    assert!(!setup
        .cache_dir
        .join("missing-init-pkg-1.0-h0_0/info/repodata_record.json")
        .exists());
}

/// Two consecutive runs against a valid cache do no work and change no
/// files.
#[test]
fn pipeline_is_idempotent() {
    let setup = setup();
    seed_tarball(&setup, &format!("{PKG_BASENAME}.tar.bz2"));

    let pkg = PackageInfo::from_url(PKG_URL).unwrap();
    let mut fetcher = PackageFetcher::new(pkg.clone(), &setup.caches).unwrap();
    fetcher
        .extract(&options(json!({ "name": "test-pkg", "license": "MIT" })))
        .unwrap();
    let first = read_record(&setup.cache_dir.join(PKG_BASENAME));

    // A fresh multi-cache observes the extracted state and plans no work.
    let caches = MultiPackageCache::new([setup.cache_dir.clone()]);
    let mut second = PackageFetcher::new(pkg, &caches).unwrap();
    assert!(!second.needs_download());
    assert!(!second.needs_extract());
    second
        .extract(&options(json!({ "name": "would-clobber" })))
        .unwrap();

    assert_eq!(first, read_record(&setup.cache_dir.join(PKG_BASENAME)));
}

/// The resolved URL is appended to the pinned cache's urls.txt once per
/// extraction.
#[test]
fn extraction_appends_the_url_log() {
    let setup = setup();
    seed_tarball(&setup, &format!("{PKG_BASENAME}.tar.bz2"));

    let pkg = PackageInfo::from_url(PKG_URL).unwrap();
    let mut fetcher = PackageFetcher::new(pkg, &setup.caches).unwrap();
    fetcher
        .extract(&options(json!({ "name": "test-pkg" })))
        .unwrap();

    let log = std::fs::read_to_string(setup.cache_dir.join("urls.txt")).unwrap();
    assert_eq!(log.lines().collect::<Vec<_>>(), vec![PKG_URL]);
}

/// Extraction failure surfaces the error and leaves the partial directory
/// for the caller to clean.
#[test]
fn failed_extraction_reports_and_leaves_partial_dir() {
    let setup = setup();
    seed_tarball(&setup, &format!("{PKG_BASENAME}.tar.bz2"));

    let pkg = PackageInfo::from_url(PKG_URL).unwrap();
    let mut fetcher = PackageFetcher::new(pkg, &setup.caches).unwrap();
    let options = ExtractOptions {
        extractor: Arc::new(FailingExtractor),
        semaphore: Arc::new(ExtractSemaphore::new(1)),
        cancel: CancelToken::new(),
    };
    assert!(matches!(
        fetcher.extract(&options).unwrap_err(),
        Error::Extract { .. }
    ));
    assert!(fetcher.needs_extract());
    assert!(setup.cache_dir.join(PKG_BASENAME).exists());
    // No record was written; the next run re-extracts.
    assert!(!setup
        .cache_dir
        .join(PKG_BASENAME)
        .join("info/repodata_record.json")
        .exists());
}

/// Cancellation before the extract call wins over the semaphore.
#[test]
fn cancelled_extraction_does_nothing() {
    let setup = setup();
    seed_tarball(&setup, &format!("{PKG_BASENAME}.tar.bz2"));

    let pkg = PackageInfo::from_url(PKG_URL).unwrap();
    let mut fetcher = PackageFetcher::new(pkg, &setup.caches).unwrap();
    let options = options(json!({ "name": "test-pkg" }));
    options.cancel.cancel();

    assert!(matches!(
        fetcher.extract(&options).unwrap_err(),
        Error::Cancelled { .. }
    ));
    assert!(!setup.cache_dir.join(PKG_BASENAME).exists());
}

/// A fetcher built against a package cached by a previous run (valid
/// extracted dir, nothing left to do) can still evict it.
#[test]
fn clear_cache_evicts_previously_cached_package() {
    let setup = setup();
    seed_tarball(&setup, &format!("{PKG_BASENAME}.tar.bz2"));
    seed_record(
        &setup,
        PKG_BASENAME,
        &json!({
            "name": "test-pkg",
            "timestamp": 1_234_567_890_u64,
            "license": "MIT",
            "build_number": 1,
        }),
    );

    let pkg = PackageInfo::from_url(PKG_URL).unwrap();
    let fetcher = PackageFetcher::new(pkg, &setup.caches).unwrap();
    assert!(!fetcher.needs_download());
    assert!(!fetcher.needs_extract());

    fetcher.clear_cache().unwrap();
    assert!(!setup.cache_dir.join(format!("{PKG_BASENAME}.tar.bz2")).exists());
    assert!(!setup.cache_dir.join(PKG_BASENAME).exists());
}

/// `clear_cache` removes both the tarball and the extracted tree.
#[test]
fn clear_cache_removes_both_artifacts() {
    let setup = setup();
    seed_tarball(&setup, &format!("{PKG_BASENAME}.tar.bz2"));

    let pkg = PackageInfo::from_url(PKG_URL).unwrap();
    let mut fetcher = PackageFetcher::new(pkg, &setup.caches).unwrap();
    fetcher
        .extract(&options(json!({ "name": "test-pkg" })))
        .unwrap();

    fetcher.clear_cache().unwrap();
    assert!(!setup.cache_dir.join(format!("{PKG_BASENAME}.tar.bz2")).exists());
    assert!(!setup.cache_dir.join(PKG_BASENAME).exists());
}
