// Copyright (c) The Taipan Project Developers.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Archive extraction seams and the extract concurrency gate.
//!
//! Decoding `.tar.bz2` / `.conda` archives is an external collaborator; this
//! module only defines the [`Extractor`] trait the pipeline drives, a
//! subprocess-backed implementation, and the counting semaphore that bounds
//! how many extractions run at once. A bound of 1 with an in-process
//! extractor and a larger bound with a subprocess extractor must behave
//! identically from the pipeline's point of view.

use crate::error::{self, Result};
use crate::CancelToken;
use std::fmt::Debug;
use std::path::Path;
use std::process::Command;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// Extracts a package archive into a destination directory.
///
/// Implementations should honor `cancel` at natural boundaries (per archive
/// entry); a partially extracted directory left behind on cancellation is
/// caught and cleaned by the next pipeline run.
pub trait Extractor: Debug + Send + Sync {
    /// Extracts `tarball` into `dest`. `dest` does not exist when called;
    /// the pipeline removes stale destinations first.
    fn extract(&self, tarball: &Path, dest: &Path, cancel: &CancelToken) -> Result<()>;
}

/// An [`Extractor`] that delegates to an external command, invoked as
/// `program [args...] <tarball> <dest>`. This is the subprocess side of the
/// subprocess-vs-inline choice; callers wanting in-process extraction plug in
/// their own implementation.
#[derive(Debug, Clone)]
pub struct SubprocessExtractor {
    program: String,
    args: Vec<String>,
}

impl SubprocessExtractor {
    /// Configures the external extraction command.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Extractor for SubprocessExtractor {
    fn extract(&self, tarball: &Path, dest: &Path, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(tarball)
            .arg(dest)
            .status()
            .map_err(|e| {
                error::ExtractSnafu {
                    path: tarball,
                    reason: format!("failed to spawn '{}': {e}", self.program),
                }
                .build()
            })?;
        if !status.success() {
            return error::ExtractSnafu {
                path: tarball,
                reason: format!("'{}' exited with {status}", self.program),
            }
            .fail();
        }
        Ok(())
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// A counting semaphore bounding concurrent extractions.
///
/// Downloads and hashing run outside the permit; the pipeline acquires it
/// strictly around the extract call.
#[derive(Debug)]
pub struct ExtractSemaphore {
    max: usize,
    permits: Mutex<usize>,
    available: Condvar,
}

impl ExtractSemaphore {
    /// Creates a semaphore with the given bound; a bound of 0 is treated as
    /// 1.
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            max,
            permits: Mutex::new(max),
            available: Condvar::new(),
        }
    }

    /// The configured bound.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Blocks until a permit is available.
    pub fn acquire(&self) -> ExtractPermit<'_> {
        let mut permits = self
            .permits
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *permits == 0 {
            permits = self
                .available
                .wait(permits)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *permits -= 1;
        ExtractPermit { semaphore: self }
    }
}

/// A held extract permit; released on drop.
#[derive(Debug)]
pub struct ExtractPermit<'a> {
    semaphore: &'a ExtractSemaphore,
}

impl Drop for ExtractPermit<'_> {
    fn drop(&mut self) {
        let mut permits = self
            .semaphore
            .permits
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *permits += 1;
        self.semaphore.available.notify_one();
    }
}

/// Everything the pipeline needs to run an extraction: the extractor seam,
/// the shared concurrency gate, and the cooperative cancellation flag.
/// Passed explicitly; there is no process-wide extraction state.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// The archive extraction backend.
    pub extractor: Arc<dyn Extractor>,
    /// The shared extract gate.
    pub semaphore: Arc<ExtractSemaphore>,
    /// Cooperative cancellation flag.
    pub cancel: CancelToken,
}

impl ExtractOptions {
    /// Bundles an extractor with a fresh semaphore of the given bound.
    pub fn new(extractor: Arc<dyn Extractor>, max_concurrent_extractions: usize) -> Self {
        Self {
            extractor,
            semaphore: Arc::new(ExtractSemaphore::new(max_concurrent_extractions)),
            cancel: CancelToken::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn semaphore_bounds_concurrency() {
        let semaphore = Arc::new(ExtractSemaphore::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let semaphore = Arc::clone(&semaphore);
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                std::thread::spawn(move || {
                    let _permit = semaphore.acquire();
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(10));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn zero_bound_is_clamped() {
        let semaphore = ExtractSemaphore::new(0);
        assert_eq!(semaphore.max(), 1);
        let _permit = semaphore.acquire();
    }

    #[test]
    fn cancelled_subprocess_extractor_stops_early() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let extractor = SubprocessExtractor::new("definitely-not-a-real-binary", vec![]);
        let err = extractor
            .extract(Path::new("a.tar.bz2"), Path::new("a"), &cancel)
            .unwrap_err();
        assert!(matches!(err, error::Error::Cancelled { .. }));
    }
}
