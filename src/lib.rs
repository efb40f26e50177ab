// Copyright (c) The Taipan Project Developers.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Taipan's content-trust and package-fetch core.
//!
//! This library implements the two tightly coupled subsystems at the heart of
//! the package manager:
//!
//! * a content-trust engine that walks a TUF-style delegation chain — `root`
//!   to `key_mgr` to `pkg_mgr` under the v0.6 metadata spec, with a parallel
//!   v1 profile — and culminates in a [`RepoIndexChecker`] able to verify
//!   channel-signed package indices; and
//! * a fetch / validate / extract / record pipeline that takes verified
//!   packages from tarball to a canonical on-disk cache entry, healing cache
//!   records corrupted by earlier releases along the way.
//!
//! The [`RepoChecker`] is the entry point to the trust engine: it loads the
//! initial trusted root, follows chained root updates from the channel, and
//! derives the index checker. [`fetcher::PackageFetcher`] is the entry point
//! to the pipeline and consumes the checker's verdicts upstream.
//!
//! Dependency solving, HTTP transport internals, and archive decoding are
//! external collaborators, reachable through the [`Transport`] and
//! [`extract::Extractor`] seams.
//!
//! # Testing
//!
//! Unit tests are run in the usual manner: `cargo test`. Integration tests
//! drive whole channels out of temporary directories over `file://` URLs.

#![forbid(missing_debug_implementations)]
#![deny(rust_2018_idioms)]
// missing_docs is on its own line to make it easy to comment out when making changes.
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc
)]

pub mod cache;
pub mod crypto;
pub mod error;
pub mod extract;
mod fetch;
pub mod fetcher;
pub mod package;
pub mod roles;
pub mod schema;
pub mod spec;
pub mod timeref;
pub mod transport;

use crate::error::{self as err, Result};
use crate::roles::{Role, RootRole};
use crate::timeref::TimeRef;
pub use crate::transport::{FilesystemTransport, Transport, TransportError, TransportErrorKind};
use serde_json::Value;
use snafu::ResultExt;
use std::borrow::Cow;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use url::Url;

/// The maximum allowable size in bytes for downloaded role metadata files.
/// Guards against endless-data responses.
pub(crate) const MAX_ROLE_SIZE: u64 = 1024 * 1024;

/// The maximum number of chained root updates to follow in one cycle.
const MAX_ROOT_UPDATES: u64 = 1024;

/// A cooperative cancellation flag shared between the caller and long-running
/// pipeline operations. Hashing and extraction check it at natural
/// boundaries; partial on-disk state left behind by a cancelled run is caught
/// by the next run's validation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token in the "keep going" state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Returns an error if cancellation has been requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            err::CancelledSnafu.fail()
        } else {
            Ok(())
        }
    }
}

/// Verifies channel package indices and individual packages against the
/// terminal role of an accepted delegation chain.
pub trait RepoIndexChecker: Debug + Send + Sync {
    /// Verifies every package of a repodata index against the index's
    /// signature envelope.
    fn verify_index(&self, repodata: &Value) -> Result<()>;

    /// Verifies a single package metadata block against its signature map.
    fn verify_package(&self, signed_meta: &Value, signatures: &Value) -> Result<()>;
}

/// Drives the trust establishment for one channel.
///
/// The checker owns the channel's base URL, a reference directory holding the
/// root metadata shipped with the application, and a cache directory where
/// accepted metadata is persisted between runs. [`RepoChecker::generate_index_checker`]
/// must be called before any verification; until then verification calls log
/// an error and verify nothing.
#[derive(Debug)]
pub struct RepoChecker {
    base_url: Url,
    ref_path: PathBuf,
    cache_path: PathBuf,
    transport: Box<dyn Transport>,
    root_version: u64,
    index_checker: Option<Box<dyn RepoIndexChecker>>,
}

impl RepoChecker {
    /// Creates a checker for the channel at `base_url`.
    ///
    /// `ref_path` is the directory holding the shipped trusted `root.json`;
    /// `cache_path` is a writable directory where accepted role metadata is
    /// persisted. The cache directory must exist.
    pub fn new(
        transport: Box<dyn Transport>,
        base_url: &str,
        ref_path: impl Into<PathBuf>,
        cache_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        Ok(Self {
            base_url: parse_url(base_url)?,
            ref_path: ref_path.into(),
            cache_path: cache_path.into(),
            transport,
            root_version: 0,
            index_checker: None,
        })
    }

    /// The cache directory where accepted role metadata is persisted.
    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// The version of the last accepted root metadata, 0 before trust has
    /// been established.
    pub fn root_version(&self) -> u64 {
        self.root_version
    }

    /// Establishes trust for the channel: loads the initial trusted root,
    /// follows chained root updates, checks the final root for a freeze
    /// attack, and derives the index checker from the delegated chain.
    ///
    /// The wall clock is sampled exactly once here; every expiration check in
    /// the cycle uses that sample.
    pub fn generate_index_checker(&mut self) -> Result<()> {
        if self.index_checker.is_some() {
            return Ok(());
        }

        let time_ref = TimeRef::now();
        let root = self.update_root_role(&time_ref)?;
        self.index_checker = root.build_index_checker(
            self.transport.as_ref(),
            &time_ref,
            &self.base_url,
            &self.cache_path,
        )?;

        if self.index_checker.is_some() {
            log::info!("index checker successfully generated for '{}'", self.base_url);
        }
        Ok(())
    }

    /// Verifies a parsed repodata index. A no-op (with an error log) until
    /// [`RepoChecker::generate_index_checker`] has produced a checker.
    pub fn verify_index(&self, repodata: &Value) -> Result<()> {
        match &self.index_checker {
            Some(checker) => checker.verify_index(repodata),
            None => {
                log::error!("index checker not valid");
                Ok(())
            }
        }
    }

    /// Verifies a repodata index read from a file. Per-package failures are
    /// reported at the index level.
    pub fn verify_index_file(&self, path: &Path) -> Result<()> {
        if self.index_checker.is_none() {
            log::error!("index checker not valid");
            return Ok(());
        }
        if !path.exists() {
            log::error!("'repodata' file not found at: {}", path.display());
            return err::IndexSnafu.fail();
        }
        let repodata = roles::read_json_file(path)?;
        match self.verify_index(&repodata) {
            Err(e @ error::Error::Package { .. }) => {
                log::error!(
                    "validation failed on package index: '{}': {e}",
                    path.display()
                );
                err::IndexSnafu.fail()
            }
            other => other,
        }
    }

    /// Verifies a single package metadata block against its parsed signature
    /// map. A no-op (with an error log) until a checker exists.
    pub fn verify_package(&self, signed_meta: &Value, signatures: &Value) -> Result<()> {
        match &self.index_checker {
            Some(checker) => checker.verify_package(signed_meta, signatures),
            None => {
                log::error!("index checker not valid");
                Ok(())
            }
        }
    }

    /// Verifies a single package metadata block against a raw signature
    /// payload. An empty or unparseable payload fails before any signature
    /// checking.
    pub fn verify_package_str(&self, signed_meta: &Value, signatures: &str) -> Result<()> {
        if signatures.trim().is_empty() {
            log::error!("the given package signatures are empty");
            return err::SignaturesSnafu.fail();
        }
        let Ok(parsed) = serde_json::from_str::<Value>(signatures) else {
            log::error!("the given package signatures are not valid JSON");
            return err::SignaturesSnafu.fail();
        };
        log::info!("verifying package...");
        self.verify_package(signed_meta, &parsed)
    }

    fn ref_root(&self) -> PathBuf {
        self.ref_path.join("root.json")
    }

    fn cached_root(&self) -> PathBuf {
        self.cache_path.join("root.json")
    }

    /// Prefers a previously accepted cached root over the shipped reference
    /// copy. One of the two must exist.
    fn initial_trusted_root(&self) -> Result<PathBuf> {
        let cached = self.cached_root();
        if cached.exists() {
            log::debug!("using cache for 'root' initial trusted file");
            return Ok(cached);
        }
        let reference = self.ref_root();
        if reference.exists() {
            return Ok(reference);
        }
        log::error!(
            "'root' initial trusted file not found at '{}' for repo '{}'",
            self.ref_path.display(),
            self.base_url
        );
        err::RoleFileSnafu.fail()
    }

    /// Copies an accepted metadata file over the cached `root.json`.
    fn persist_root(&self, file_path: &Path) -> Result<()> {
        let cached = self.cached_root();
        if cached.exists() {
            std::fs::remove_file(&cached).context(err::FileRemoveSnafu { path: &cached })?;
        }
        std::fs::copy(file_path, &cached).context(err::FileCopySnafu {
            src: file_path,
            dst: &cached,
        })?;
        Ok(())
    }

    /// Loads the initial trusted root and applies chained updates from the
    /// channel until no next update file exists, persisting each accepted
    /// step. The final root must not be expired.
    fn update_root_role(&mut self, time_ref: &TimeRef) -> Result<RootRole> {
        log::debug!("loading 'root' metadata for repo '{}'", self.base_url);
        let trusted_path = self.initial_trusted_root()?;
        let mut root = RootRole::from_trusted_file(&trusted_path)?;

        // Promote a reference-directory root into the cache so subsequent
        // runs start from the cache.
        if trusted_path != self.cached_root() {
            self.persist_root(&trusted_path)?;
        }

        let scratch = tempfile::tempdir().context(err::DirCreateSnafu {
            path: std::env::temp_dir(),
        })?;

        log::debug!("starting updates of 'root' metadata");
        let mut updates: u64 = 0;
        loop {
            if updates >= MAX_ROOT_UPDATES {
                return err::MaxUpdatesExceededSnafu {
                    max_updates: MAX_ROOT_UPDATES,
                }
                .fail();
            }

            // Probe the possible next files, most recent spec family first.
            let mut fetched = None;
            for file_name in root.possible_update_files() {
                let url = self.base_url.join(&file_name).context(err::JoinUrlSnafu {
                    path: &file_name,
                    url: self.base_url.clone(),
                })?;
                let dest = scratch.path().join(&file_name);
                match fetch::fetch_to_file(
                    self.transport.as_ref(),
                    url,
                    MAX_ROLE_SIZE,
                    "role metadata limit",
                    &dest,
                ) {
                    Ok(()) => {
                        fetched = Some(dest);
                        break;
                    }
                    Err(e) => log::debug!("no root update at '{file_name}': {e}"),
                }
            }

            let Some(update_path) = fetched else { break };

            root = root.update_from_file(&update_path)?;
            self.persist_root(&update_path)?;
            updates += 1;
        }

        self.root_version = root.version();
        log::debug!("latest 'root' metadata has version {}", self.root_version);

        if root.expired(time_ref) {
            log::error!(
                "possible freeze attack of 'root' metadata, expired: {}",
                root.expires()
            );
            return err::FreezeSnafu.fail();
        }

        Ok(root)
    }
}

fn parse_url(url: &str) -> Result<Url> {
    let mut url = Cow::from(url);
    if !url.ends_with('/') {
        url.to_mut().push('/');
    }
    Url::parse(&url).context(err::ParseUrlSnafu { url })
}
