// Copyright (c) The Taipan Project Developers.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Contains the error type for this library.
//!
//! Trust-related variants keep the `"Content trust error. <reason>. Aborting."`
//! message shape; downstream tooling matches on that prefix and suffix.

use snafu::Snafu;
use std::io;
use std::path::PathBuf;

/// Alias for `Result<T, Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for this library.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
#[allow(missing_docs)]
pub enum Error {
    /// The signing backend failed to produce or use a key pair.
    #[snafu(display("Content trust error. Key generation failed: {}. Aborting.", reason))]
    Crypto { reason: String },

    /// Hex or base64 input was malformed. During signature tallying this is
    /// demoted to "invalid signature"; everywhere else it is fatal.
    #[snafu(display("Content trust error. Invalid encoding: {}. Aborting.", reason))]
    Encoding { reason: String },

    /// The number of distinct valid signatures fell below the role threshold.
    #[snafu(display(
        "Content trust error. Signatures threshold not met ({}/{}). Aborting.",
        valid_sig,
        threshold
    ))]
    Threshold { valid_sig: u64, threshold: u64 },

    /// A schema, type, or semantic rule inside `signed` was violated.
    #[snafu(display("Content trust error. Invalid role metadata. Aborting."))]
    RoleMetadata,

    /// A role file was missing where required, or its name violated the
    /// `N.svX.root.json` convention.
    #[snafu(display("Content trust error. Invalid role file. Aborting."))]
    RoleFile,

    /// The metadata declared a spec version this client cannot use.
    #[snafu(display("Content trust error. Unsupported specification version. Aborting."))]
    SpecVersion,

    /// A root update carried a version number at or below the trusted one.
    #[snafu(display("Content trust error. Possible rollback attack. Aborting."))]
    Rollback,

    /// An accepted role was already past its expiration.
    #[snafu(display("Content trust error. Possible freeze attack. Aborting."))]
    Freeze,

    /// A required role file could not be obtained and no cached fallback exists.
    #[snafu(display("Content trust error. Failed to fetch role metadata. Aborting."))]
    Fetching,

    /// A package inside an index failed its signature check.
    #[snafu(display("Content trust error. Invalid package. Aborting."))]
    Package { name: String },

    /// A package index was malformed, or a package inside it failed to verify.
    #[snafu(display("Content trust error. Invalid package index metadata. Aborting."))]
    Index,

    /// A package signature payload was empty or malformed.
    #[snafu(display("Content trust error. Invalid package signatures. Aborting."))]
    Signatures,

    /// More chained root updates than the client is willing to follow.
    #[snafu(display("Refused to download more than {} root metadata updates", max_updates))]
    MaxUpdatesExceeded { max_updates: u64 },

    #[snafu(display("Failed to parse URL '{}': {}", url, source))]
    ParseUrl {
        url: String,
        source: url::ParseError,
    },

    #[snafu(display("Failed to join '{}' to '{}': {}", path, url, source))]
    JoinUrl {
        path: String,
        url: url::Url,
        source: url::ParseError,
    },

    #[snafu(display("Transport failed to fetch '{}': {}", url, source))]
    Transport {
        url: url::Url,
        source: crate::transport::TransportError,
    },

    #[snafu(display("Fetched file exceeded {} bytes ({})", max_size, specifier))]
    MaxSizeExceeded {
        max_size: u64,
        specifier: &'static str,
    },

    #[snafu(display("Failed to parse metadata for role '{}': {}", role, source))]
    ParseMetadata {
        role: String,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to serialize {}: {}", what, source))]
    JsonSerialization {
        what: String,
        source: serde_json::Error,
    },

    #[snafu(display("Failed to read '{}': {}", path.display(), source))]
    FileRead { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to write '{}': {}", path.display(), source))]
    FileWrite { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to copy '{}' to '{}': {}", src.display(), dst.display(), source))]
    FileCopy {
        src: PathBuf,
        dst: PathBuf,
        source: io::Error,
    },

    #[snafu(display("Failed to remove '{}': {}", path.display(), source))]
    FileRemove { path: PathBuf, source: io::Error },

    #[snafu(display("Failed to create directory '{}': {}", path.display(), source))]
    DirCreate { path: PathBuf, source: io::Error },

    /// No configured package cache directory could be created or written to.
    #[snafu(display("Did not find a writable package cache directory"))]
    NoWritableCache,

    /// The package filename did not carry a recognized archive extension.
    #[snafu(display("Unknown package format '{}'", filename))]
    UnknownPackageFormat { filename: String },

    #[snafu(display("Failed to extract '{}': {}", path.display(), reason))]
    Extract { path: PathBuf, reason: String },

    /// An internal invariant was violated; this always indicates a bug in a
    /// caller-side construction path.
    #[snafu(display("Logic error: {}", reason))]
    Logic { reason: String },

    /// The operation was interrupted at a cancellation point.
    #[snafu(display("Operation was cancelled"))]
    Cancelled,
}
