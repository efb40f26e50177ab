// Copyright (c) The Taipan Project Developers.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The writable package cache.
//!
//! A cache directory holds downloaded tarballs, extracted package trees, and
//! an append-only `urls.txt` log. The marker file named `urls` is the
//! positive test for "this directory is a package cache". A
//! [`MultiPackageCache`] searches an ordered list of cache directories and
//! heals extracted records corrupted by earlier buggy releases.

use crate::error::{self, Result};
use crate::package::{strip_archive_extension, PackageInfo};
use serde_json::Value;
use snafu::ResultExt;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// The append-only log of fully resolved package URLs.
pub const URLS_TXT_FILE: &str = "urls.txt";

/// The marker file whose presence identifies a package cache directory.
pub const PACKAGE_CACHE_MAGIC_FILE: &str = "urls";

/// Writability state of a cache directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writable {
    /// Not probed yet.
    Unknown,
    /// The write probe succeeded.
    Writable,
    /// The directory exists but cannot be written.
    NotWritable,
    /// The directory (or its marker) does not exist yet.
    DirDoesNotExist,
}

#[derive(Debug, Default)]
struct QueryCache {
    extracted: HashMap<String, Option<PathBuf>>,
    tarball: HashMap<String, Option<PathBuf>>,
}

/// One package cache directory.
///
/// The writability probe and the on-demand creation of the directory are
/// serialized through an internal lock, so concurrent fetchers racing to
/// select the same "first writable path" observe one consistent outcome; the
/// probe itself is idempotent for readers.
#[derive(Debug)]
pub struct PackageCacheData {
    path: PathBuf,
    writable: Mutex<Writable>,
    queries: Mutex<QueryCache>,
    urls_txt: Mutex<()>,
}

impl PackageCacheData {
    /// Wraps a cache directory path; nothing is touched on disk yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writable: Mutex::new(Writable::Unknown),
            queries: Mutex::new(QueryCache::default()),
            urls_txt: Mutex::new(()),
        }
    }

    /// The cache directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Probes (and caches) the writability state of this directory.
    pub fn writability(&self) -> Writable {
        let mut state = lock(&self.writable);
        if *state == Writable::Unknown {
            *state = self.check_writable();
        }
        *state
    }

    fn check_writable(&self) -> Writable {
        let magic_file = self.path.join(PACKAGE_CACHE_MAGIC_FILE);
        if !magic_file.is_file() {
            log::debug!("'{}' does not exist", magic_file.display());
            return Writable::DirDoesNotExist;
        }
        // Probe by appending nothing to the URL log.
        let probe = OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.path.join(URLS_TXT_FILE));
        match probe {
            Ok(_) => {
                log::debug!("'{}' writable", self.path.display());
                Writable::Writable
            }
            Err(e) => {
                log::debug!("'{}' not writable: {e}", self.path.display());
                Writable::NotWritable
            }
        }
    }

    /// Creates the cache directory, its URL log, and its magic marker file.
    pub fn create_directory(&self) -> Result<()> {
        log::info!(
            "attempt to create package cache directory '{}'",
            self.path.display()
        );
        let mut state = lock(&self.writable);
        std::fs::create_dir_all(&self.path).context(error::DirCreateSnafu { path: &self.path })?;
        for file in [URLS_TXT_FILE, PACKAGE_CACHE_MAGIC_FILE] {
            let path = self.path.join(file);
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(&path)
                .context(error::FileWriteSnafu { path })?;
        }
        *state = Writable::Writable;
        Ok(())
    }

    /// Forgets cached query results for `pkg` so the next probe re-examines
    /// fresh on-disk state.
    pub fn clear_query_cache(&self, pkg: &PackageInfo) {
        let mut queries = lock(&self.queries);
        queries.extracted.remove(&pkg.filename);
        queries.tarball.remove(&pkg.filename);
    }

    /// The path to a valid extracted directory for `pkg`, if this cache holds
    /// one. A record carrying the corruption signature invalidates the
    /// directory and removes it so it gets re-extracted.
    pub fn extracted_dir(&self, pkg: &PackageInfo) -> Option<PathBuf> {
        let mut queries = lock(&self.queries);
        if let Some(hit) = queries.extracted.get(&pkg.filename) {
            return hit.clone();
        }
        let result = self.find_valid_extracted_dir(pkg);
        queries.extracted.insert(pkg.filename.clone(), result.clone());
        result
    }

    fn find_valid_extracted_dir(&self, pkg: &PackageInfo) -> Option<PathBuf> {
        let stem = strip_archive_extension(&pkg.filename).ok()?;
        let dir = self.path.join(stem);
        if !dir.is_dir() {
            return None;
        }
        let record_path = dir.join("info").join("repodata_record.json");
        let record: Value = std::fs::File::open(&record_path)
            .ok()
            .and_then(|f| serde_json::from_reader(f).ok())?;
        if record_is_corrupted(&record) {
            log::warn!(
                "detected corrupted package record at '{}', forcing re-extraction",
                record_path.display()
            );
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                log::warn!("could not remove '{}': {e}", dir.display());
            }
            return None;
        }
        Some(dir)
    }

    /// The path to a matching tarball for `pkg`, if this cache holds one.
    /// Size is compared when the package declares one, MD5 when known.
    pub fn tarball(&self, pkg: &PackageInfo) -> Option<PathBuf> {
        let mut queries = lock(&self.queries);
        if let Some(hit) = queries.tarball.get(&pkg.filename) {
            return hit.clone();
        }
        let result = self.find_valid_tarball(pkg);
        queries.tarball.insert(pkg.filename.clone(), result.clone());
        result
    }

    fn find_valid_tarball(&self, pkg: &PackageInfo) -> Option<PathBuf> {
        let tarball = self.path.join(&pkg.filename);
        let metadata = std::fs::metadata(&tarball).ok()?;
        if !metadata.is_file() {
            return None;
        }
        if pkg.size != 0 && metadata.len() != pkg.size {
            log::debug!(
                "cached tarball '{}' has wrong size ({} != {})",
                tarball.display(),
                metadata.len(),
                pkg.size
            );
            return None;
        }
        if !pkg.md5.is_empty() {
            match crate::crypto::md5_file(&tarball) {
                Ok(md5) if md5 == pkg.md5 => {}
                Ok(md5) => {
                    log::debug!(
                        "cached tarball '{}' has wrong md5 ({md5} != {})",
                        tarball.display(),
                        pkg.md5
                    );
                    return None;
                }
                Err(e) => {
                    log::debug!("could not hash '{}': {e}", tarball.display());
                    return None;
                }
            }
        }
        Some(tarball)
    }

    /// Appends a resolved package URL to the cache's `urls.txt`. Appends are
    /// serialized per cache directory.
    pub(crate) fn append_url(&self, url: &str) -> Result<()> {
        let _guard = lock(&self.urls_txt);
        let path = self.path.join(URLS_TXT_FILE);
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .context(error::FileWriteSnafu { path: &path })?;
        writeln!(file, "{url}").context(error::FileWriteSnafu { path })
    }
}

/// Whether an extracted record was written by an earlier buggy release: all
/// three stub defaults present simultaneously. A record with `timestamp == 0`
/// but a real license (epoch-0 legacy packages) is not corrupted.
pub(crate) fn record_is_corrupted(record: &Value) -> bool {
    let timestamp = record.get("timestamp").and_then(Value::as_u64);
    let license = record.get("license").and_then(Value::as_str);
    let build_number = record.get("build_number").and_then(Value::as_u64);
    timestamp == Some(0) && license == Some("") && build_number == Some(0)
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// An ordered list of package cache directories, queried front to back.
#[derive(Debug, Clone)]
pub struct MultiPackageCache {
    caches: Vec<Arc<PackageCacheData>>,
}

impl MultiPackageCache {
    /// Builds the multi-cache over the given directories, in priority order.
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            caches: paths
                .into_iter()
                .map(|p| Arc::new(PackageCacheData::new(p)))
                .collect(),
        }
    }

    /// The first directory containing a valid (non-corrupted) extracted
    /// record for `pkg`.
    pub fn get_extracted_dir_path(&self, pkg: &PackageInfo) -> Option<PathBuf> {
        self.caches.iter().find_map(|c| c.extracted_dir(pkg))
    }

    /// The first directory containing a tarball whose size and (when known)
    /// MD5 match `pkg`; returns the tarball path.
    pub fn get_tarball_path(&self, pkg: &PackageInfo) -> Option<PathBuf> {
        self.caches.iter().find_map(|c| c.tarball(pkg))
    }

    /// The first cache directory that exists (or can be created) and passes
    /// the write probe.
    pub fn first_writable_cache(&self) -> Result<Arc<PackageCacheData>> {
        for cache in &self.caches {
            log::debug!("checking dir '{}'", cache.path().display());
            match cache.writability() {
                Writable::Writable => return Ok(Arc::clone(cache)),
                Writable::DirDoesNotExist => {
                    if cache.create_directory().is_ok() {
                        return Ok(Arc::clone(cache));
                    }
                    log::error!(
                        "cannot create package cache directory '{}'",
                        cache.path().display()
                    );
                }
                Writable::NotWritable | Writable::Unknown => {}
            }
        }
        error::NoWritableCacheSnafu.fail()
    }

    /// Clears per-package query results in every cache directory.
    pub fn clear_query_cache(&self, pkg: &PackageInfo) {
        for cache in &self.caches {
            cache.clear_query_cache(pkg);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
