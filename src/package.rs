// Copyright (c) The Taipan Project Developers.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The package identity and metadata record that travels through the fetch
//! pipeline.
//!
//! A [`PackageInfo`] is value-typed and copied freely. It tracks which of its
//! fields were filled with defaults rather than real data (`defaulted_keys`),
//! which is what lets the pipeline merge the package's own `info/index.json`
//! into the written record without clobbering channel-patched metadata.

use crate::error::{self, Result};
use serde_json::{json, Map, Value};
use snafu::ResultExt;
use std::collections::BTreeSet;
use url::Url;

/// Sentinel recorded in `defaulted_keys` by every approved construction
/// path. Its absence when a record is written indicates a bug and aborts the
/// write.
pub const INITIALIZED_SENTINEL: &str = "_initialized";

/// Identity and metadata of one package, as known before extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    /// The package name.
    pub name: String,
    /// The package version string.
    pub version: String,
    /// The build string, e.g. `h123456_0`.
    pub build_string: String,
    /// The build number.
    pub build_number: u64,
    /// The platform-architecture slice of the channel, e.g. `linux-64`.
    pub subdir: String,
    /// The archive file name.
    pub filename: String,
    /// The fully resolved package URL.
    pub package_url: String,
    /// The channel the package comes from.
    pub channel: String,
    /// The declared license, empty when unknown.
    pub license: String,
    /// The archive size in bytes, 0 when unknown.
    pub size: u64,
    /// The package timestamp, 0 when unknown.
    pub timestamp: u64,
    /// The hex MD5 of the archive, empty when unknown.
    pub md5: String,
    /// The hex SHA-256 of the archive, empty when unknown.
    pub sha256: String,
    /// Runtime dependencies.
    pub dependencies: Vec<String>,
    /// Version constraints on other packages.
    pub constrains: Vec<String>,
    /// Track features, usually empty.
    pub track_features: Vec<String>,
    /// The `noarch` kind; any non-empty value means the field is carried into
    /// the record.
    pub noarch: String,
    /// Where a noarch python package installs its site-packages, when the
    /// package declares it.
    pub python_site_packages_path: Option<String>,
    /// Record keys whose values are defaults rather than real data, plus the
    /// [`INITIALIZED_SENTINEL`].
    pub defaulted_keys: BTreeSet<String>,
}

impl Default for PackageInfo {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: String::new(),
            build_string: String::new(),
            build_number: 0,
            subdir: String::new(),
            filename: String::new(),
            package_url: String::new(),
            channel: String::new(),
            license: String::new(),
            size: 0,
            timestamp: 0,
            md5: String::new(),
            sha256: String::new(),
            dependencies: Vec::new(),
            constrains: Vec::new(),
            track_features: Vec::new(),
            noarch: String::new(),
            python_site_packages_path: None,
            defaulted_keys: [INITIALIZED_SENTINEL.to_string()].into_iter().collect(),
        }
    }
}

impl PackageInfo {
    /// Derives a `PackageInfo` from a package URL.
    ///
    /// Only the identity pieces can be recovered from a URL; everything else
    /// (license, timestamp, build number, checksums unless carried in the
    /// fragment, ...) is stubbed and recorded in `defaulted_keys` so the
    /// written record takes those fields from the package's own
    /// `info/index.json` instead.
    pub fn from_url(url_str: &str) -> Result<Self> {
        let url = Url::parse(url_str).context(error::ParseUrlSnafu { url: url_str })?;

        let segments: Vec<String> = url
            .path_segments()
            .map(|s| s.map(ToString::to_string).collect())
            .unwrap_or_default();
        let filename = segments
            .last()
            .filter(|s| !s.is_empty())
            .cloned()
            .map_or_else(
                || {
                    error::UnknownPackageFormatSnafu { filename: url_str }.fail()
                },
                Ok,
            )?;
        let stem = strip_archive_extension(&filename)?.to_string();
        let subdir = segments
            .get(segments.len().wrapping_sub(2))
            .cloned()
            .unwrap_or_default();

        let mut info = Self {
            filename: filename.clone(),
            subdir: subdir.clone(),
            ..Self::default()
        };

        // Everything the URL cannot tell us is a stub default.
        for key in [
            "build_number",
            "license",
            "timestamp",
            "size",
            "md5",
            "sha256",
            "depends",
            "constrains",
            "track_features",
            "noarch",
            "python_site_packages_path",
        ] {
            info.defaulted_keys.insert(key.to_string());
        }

        // `name-version-build` from the archive stem, stubbed when the stem
        // does not carry all three pieces.
        let mut pieces = stem.rsplitn(3, '-');
        let build = pieces.next().unwrap_or_default().to_string();
        let version = pieces.next().unwrap_or_default().to_string();
        let name = pieces.next().unwrap_or_default().to_string();
        if name.is_empty() {
            info.name = stem.clone();
            for key in ["name", "version", "build"] {
                info.defaulted_keys.insert(key.to_string());
            }
        } else {
            info.name = name;
            info.version = version;
            info.build_string = build;
        }

        // A trailing fragment pins a checksum: 32 hex chars for MD5, 64 for
        // SHA-256.
        if let Some(fragment) = url.fragment() {
            if fragment.len() == 32 && fragment.bytes().all(|b| b.is_ascii_hexdigit()) {
                info.md5 = fragment.to_lowercase();
                info.defaulted_keys.remove("md5");
            } else if fragment.len() == 64 && fragment.bytes().all(|b| b.is_ascii_hexdigit()) {
                info.sha256 = fragment.to_lowercase();
                info.defaulted_keys.remove("sha256");
            }
        }

        let mut package_url = url.clone();
        package_url.set_fragment(None);
        info.package_url = package_url.to_string();

        // The channel is the URL with the platform and filename stripped.
        let tail = format!("/{subdir}/{filename}");
        info.channel = info
            .package_url
            .strip_suffix(&tail)
            .or_else(|| info.package_url.strip_suffix(&format!("/{filename}")))
            .unwrap_or(&info.package_url)
            .to_string();

        Ok(info)
    }

    /// Serializes the record view of this package: the JSON object written to
    /// `repodata_record.json` before the `info/index.json` merge.
    ///
    /// `depends` and `constrains` are always present, `track_features` and
    /// `noarch` only when non-empty, `python_site_packages_path` only when
    /// declared.
    pub fn record_value(&self) -> Map<String, Value> {
        let mut record = Map::new();
        record.insert("name".to_string(), json!(self.name));
        record.insert("version".to_string(), json!(self.version));
        record.insert("build".to_string(), json!(self.build_string));
        record.insert("build_number".to_string(), json!(self.build_number));
        record.insert("subdir".to_string(), json!(self.subdir));
        record.insert("fn".to_string(), json!(self.filename));
        record.insert("url".to_string(), json!(self.package_url));
        record.insert("channel".to_string(), json!(self.channel));
        record.insert("license".to_string(), json!(self.license));
        record.insert("size".to_string(), json!(self.size));
        record.insert("timestamp".to_string(), json!(self.timestamp));
        record.insert("md5".to_string(), json!(self.md5));
        record.insert("sha256".to_string(), json!(self.sha256));
        record.insert("depends".to_string(), json!(self.dependencies));
        record.insert("constrains".to_string(), json!(self.constrains));
        if !self.track_features.is_empty() {
            record.insert("track_features".to_string(), json!(self.track_features));
        }
        if !self.noarch.is_empty() {
            record.insert("noarch".to_string(), json!(self.noarch));
        }
        if let Some(path) = &self.python_site_packages_path {
            record.insert("python_site_packages_path".to_string(), json!(path));
        }
        record
    }

    /// Whether this value was constructed through an approved factory.
    pub fn is_initialized(&self) -> bool {
        self.defaulted_keys.contains(INITIALIZED_SENTINEL)
    }
}

/// Strips a recognized archive extension from a package file name, yielding
/// the extraction directory stem.
pub(crate) fn strip_archive_extension(filename: &str) -> Result<&str> {
    filename
        .strip_suffix(".tar.bz2")
        .or_else(|| filename.strip_suffix(".conda"))
        .map_or_else(
            || {
                log::error!("unknown package format '{filename}'");
                error::UnknownPackageFormatSnafu { filename }.fail()
            },
            Ok,
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_url_parses_identity_and_stubs_the_rest() {
        let info = PackageInfo::from_url(
            "https://conda.anaconda.org/conda-forge/linux-64/test-pkg-1.0-h123456_0.conda",
        )
        .unwrap();
        assert_eq!(info.name, "test-pkg");
        assert_eq!(info.version, "1.0");
        assert_eq!(info.build_string, "h123456_0");
        assert_eq!(info.subdir, "linux-64");
        assert_eq!(info.filename, "test-pkg-1.0-h123456_0.conda");
        assert_eq!(info.channel, "https://conda.anaconda.org/conda-forge");

        // Stub defaults for everything a URL cannot declare.
        assert_eq!(info.timestamp, 0);
        assert_eq!(info.license, "");
        assert_eq!(info.build_number, 0);
        assert!(info.is_initialized());
        assert!(info.defaulted_keys.contains("license"));
        assert!(info.defaulted_keys.contains("timestamp"));
        assert!(info.defaulted_keys.contains("build_number"));
    }

    #[test]
    fn from_url_reads_checksum_fragments() {
        let md5 = "0123456789abcdef0123456789abcdef";
        let info = PackageInfo::from_url(&format!(
            "https://example.org/ch/noarch/pkg-1.0-0.tar.bz2#{md5}"
        ))
        .unwrap();
        assert_eq!(info.md5, md5);
        assert!(!info.defaulted_keys.contains("md5"));
        assert!(info.defaulted_keys.contains("sha256"));
        assert!(!info.package_url.contains('#'));
    }

    #[test]
    fn from_url_rejects_unknown_archive_format() {
        assert!(PackageInfo::from_url("https://example.org/ch/noarch/pkg-1.0-0.zip").is_err());
    }

    #[test]
    fn record_view_presence_rules() {
        let mut info = PackageInfo {
            name: "pkg".to_string(),
            dependencies: vec![],
            ..PackageInfo::default()
        };
        let record = info.record_value();
        assert_eq!(record["depends"], json!([]));
        assert_eq!(record["constrains"], json!([]));
        assert!(!record.contains_key("track_features"));
        assert!(!record.contains_key("noarch"));
        assert!(!record.contains_key("python_site_packages_path"));

        info.track_features = vec!["feat".to_string()];
        info.noarch = "python".to_string();
        info.python_site_packages_path = Some("lib/python3.12/site-packages".to_string());
        let record = info.record_value();
        assert_eq!(record["track_features"], json!(["feat"]));
        assert_eq!(record["noarch"], json!("python"));
        assert!(record.contains_key("python_site_packages_path"));
    }

    #[test]
    fn archive_extensions() {
        assert_eq!(strip_archive_extension("a-1.0-0.tar.bz2").unwrap(), "a-1.0-0");
        assert_eq!(strip_archive_extension("a-1.0-0.conda").unwrap(), "a-1.0-0");
        assert!(strip_archive_extension("a-1.0-0.tgz").is_err());
    }
}
