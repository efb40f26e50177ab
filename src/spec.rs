// Copyright (c) The Taipan Project Developers.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The two metadata spec profiles understood by this client.
//!
//! The profiles differ in JSON key names, in the canonical byte form that is
//! signed, in the shape of the signature container, and in their version
//! compatibility and upgrade rules. Everything else about role handling is
//! shared and lives in [`crate::roles`].

use crate::error::{self, Result};
use crate::schema::RoleSignature;
use serde_json::Value;
use snafu::{OptionExt, ResultExt};
use std::collections::BTreeMap;

/// Default version string for the v1 profile.
const V1_SPEC_VERSION: &str = "1.0.17";

/// Default version string for the v0.6 profile.
const V0_6_SPEC_VERSION: &str = "0.6.0";

/// A spec profile together with the concrete version string declared by the
/// role that carries it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecVersion {
    /// The strict v1 profile (TUF-like shape, compact canonical JSON).
    V1(String),
    /// The relaxed v0.6 profile (conda content-trust shape, two-space
    /// indented canonical JSON).
    V06(String),
}

impl SpecVersion {
    /// The v1 profile at its default version.
    pub fn v1() -> Self {
        SpecVersion::V1(V1_SPEC_VERSION.to_string())
    }

    /// The v0.6 profile at its default version.
    pub fn v0_6() -> Self {
        SpecVersion::V06(V0_6_SPEC_VERSION.to_string())
    }

    /// The declared version string, e.g. `"0.6.0"`.
    pub fn version_str(&self) -> &str {
        match self {
            SpecVersion::V1(v) | SpecVersion::V06(v) => v,
        }
    }

    /// The key under `signed` where the spec version is declared.
    pub fn json_key(&self) -> &'static str {
        match self {
            SpecVersion::V1(_) => "spec_version",
            SpecVersion::V06(_) => "metadata_spec_version",
        }
    }

    /// The key under `signed` where the expiration is declared.
    pub fn expiration_json_key(&self) -> &'static str {
        match self {
            SpecVersion::V1(_) => "expires",
            SpecVersion::V06(_) => "expiration",
        }
    }

    /// Whether this profile may be upgraded to a newer profile by a root
    /// update.
    pub fn upgradable(&self) -> bool {
        matches!(self, SpecVersion::V06(_))
    }

    /// The canonical byte form that signatures cover. This must stay
    /// byte-exact: v1 signs compact JSON, v0.6 signs two-space indented JSON,
    /// both with alphabetically ordered keys.
    pub fn canonicalize(&self, signed: &Value) -> Result<Vec<u8>> {
        let out = match self {
            SpecVersion::V1(_) => serde_json::to_string(signed),
            SpecVersion::V06(_) => serde_json::to_string_pretty(signed),
        };
        Ok(out
            .context(error::JsonSerializationSnafu {
                what: "signed role metadata",
            })?
            .into_bytes())
    }

    /// Parses the `signatures` container of a metadata document, deduplicated
    /// by key ID.
    ///
    /// v1 uses an array of `{keyid, sig, [other_headers]}` objects; v0.6 uses
    /// an object keyed by key ID.
    pub fn signatures(&self, doc: &Value) -> Result<Vec<RoleSignature>> {
        let container = doc.get("signatures").context(error::RoleMetadataSnafu)?;
        match self {
            SpecVersion::V1(_) => {
                let sigs: Vec<RoleSignature> = serde_json::from_value(container.clone())
                    .ok()
                    .context(error::RoleMetadataSnafu)?;
                let unique: BTreeMap<String, RoleSignature> =
                    sigs.into_iter().map(|s| (s.keyid.clone(), s)).collect();
                Ok(unique.into_values().collect())
            }
            SpecVersion::V06(_) => signatures_map(container),
        }
    }

    /// Reads the spec version a document declares for this profile, if any.
    pub fn doc_version(&self, doc: &Value) -> Option<String> {
        doc.get("signed")?
            .get(self.json_key())?
            .as_str()
            .map(ToString::to_string)
    }

    /// Whether a full version string belongs to the same compatibility family
    /// as this one.
    pub fn is_compatible(&self, version: &str) -> bool {
        starts_with_family(version, &self.compatible_prefix())
    }

    /// Whether the given document declares a compatible spec version under
    /// this profile's key.
    pub fn is_compatible_doc(&self, doc: &Value) -> bool {
        self.doc_version(doc)
            .is_some_and(|v| self.is_compatible(&v))
    }

    /// Whether a full version string is a supported upgrade family for this
    /// one.
    pub fn is_upgrade(&self, version: &str) -> bool {
        self.upgrade_prefixes()
            .iter()
            .any(|p| starts_with_family(version, p))
    }

    /// The version family this profile accepts: `major` for released specs,
    /// `major.minor` while major is 0.
    pub fn compatible_prefix(&self) -> String {
        match split_version(self.version_str()) {
            Some((0, minor)) => format!("0.{minor}"),
            Some((major, _)) => major.to_string(),
            None => self.version_str().to_string(),
        }
    }

    /// The version families accepted as upgrades, most recent first.
    pub fn upgrade_prefixes(&self) -> Vec<String> {
        match split_version(self.version_str()) {
            Some((0, minor)) => vec!["1".to_string(), format!("0.{}", minor + 1)],
            Some((major, _)) => vec![(major + 1).to_string()],
            None => Vec::new(),
        }
    }
}

/// Parses the v0.6 signature container: an object of
/// `keyid -> {signature, [other_headers]}`. Also used for the per-package
/// signature blocks of a signed repodata index.
pub(crate) fn signatures_map(container: &Value) -> Result<Vec<RoleSignature>> {
    let map = container.as_object().context(error::RoleMetadataSnafu)?;
    let mut unique = BTreeMap::new();
    for (keyid, entry) in map {
        let sig = entry
            .get("signature")
            .and_then(Value::as_str)
            .context(error::RoleMetadataSnafu)?;
        let pgp_trailer = entry
            .get("other_headers")
            .and_then(Value::as_str)
            .unwrap_or_default();
        unique.insert(
            keyid.clone(),
            RoleSignature {
                keyid: keyid.clone(),
                sig: sig.to_string(),
                pgp_trailer: pgp_trailer.to_string(),
            },
        );
    }
    Ok(unique.into_values().collect())
}

/// `true` when `version` is `prefix` itself or starts with `prefix.`.
fn starts_with_family(version: &str, prefix: &str) -> bool {
    version == prefix || version.starts_with(&format!("{prefix}."))
}

fn split_version(version: &str) -> Option<(u64, u64)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().map_or(Some(0), |m| m.parse().ok())?;
    Some((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn v1_compatibility_is_same_major() {
        let spec = SpecVersion::v1();
        assert!(spec.is_compatible("1.0.0"));
        assert!(spec.is_compatible("1.30.1"));
        assert!(!spec.is_compatible("0.6.0"));
        assert!(!spec.is_compatible("2.0.0"));
    }

    #[test]
    fn v1_upgrade_is_next_major_only() {
        let spec = SpecVersion::v1();
        assert!(spec.is_upgrade("2.0.0"));
        assert!(!spec.is_upgrade("1.1.0"));
        assert!(!spec.is_upgrade("3.0.0"));
        assert!(!spec.upgradable());
    }

    #[test]
    fn v0_6_compatibility_is_same_major_minor() {
        let spec = SpecVersion::v0_6();
        assert!(spec.is_compatible("0.6.0"));
        assert!(spec.is_compatible("0.6.1"));
        assert!(!spec.is_compatible("0.7.0"));
        assert!(!spec.is_compatible("1.0.0"));
    }

    #[test]
    fn v0_6_upgrade_families() {
        let spec = SpecVersion::v0_6();
        assert!(spec.is_upgrade("1.0.17"));
        assert!(spec.is_upgrade("0.7.0"));
        assert!(!spec.is_upgrade("0.8.0"));
        assert!(!spec.is_upgrade("2.0.0"));
        assert!(spec.upgradable());
        assert_eq!(spec.upgrade_prefixes(), vec!["1", "0.7"]);
    }

    #[test]
    fn canonical_forms_differ_between_profiles() {
        let signed = json!({ "b": 1, "a": { "c": [1, 2] } });
        let compact = SpecVersion::v1().canonicalize(&signed).unwrap();
        let pretty = SpecVersion::v0_6().canonicalize(&signed).unwrap();
        assert_eq!(
            String::from_utf8(compact).unwrap(),
            r#"{"a":{"c":[1,2]},"b":1}"#
        );
        let pretty = String::from_utf8(pretty).unwrap();
        assert!(pretty.starts_with("{\n  \"a\""));
        assert!(pretty.contains("\"b\": 1"));
    }

    #[test]
    fn canonicalization_round_trips_through_parse() {
        let spec = SpecVersion::v0_6();
        let signed = json!({ "version": 1, "delegations": { "root": { "pubkeys": ["aa"], "threshold": 1 } } });
        let bytes = spec.canonicalize(&signed).unwrap();
        let reparsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(spec.canonicalize(&reparsed).unwrap(), bytes);
    }

    #[test]
    fn signature_container_shapes() {
        let v1_doc = json!({
            "signatures": [
                { "keyid": "k1", "sig": "s1" },
                { "keyid": "k1", "sig": "s1" },
                { "keyid": "k2", "sig": "s2", "other_headers": "04ff" },
            ]
        });
        let sigs = SpecVersion::v1().signatures(&v1_doc).unwrap();
        assert_eq!(sigs.len(), 2);
        assert_eq!(sigs[1].pgp_trailer, "04ff");

        let v0_6_doc = json!({
            "signatures": {
                "k1": { "signature": "s1" },
                "k2": { "signature": "s2", "other_headers": "04ff" },
            }
        });
        let sigs = SpecVersion::v0_6().signatures(&v0_6_doc).unwrap();
        assert_eq!(sigs.len(), 2);
        assert_eq!(sigs[0].keyid, "k1");
        assert_eq!(sigs[1].pgp_trailer, "04ff");

        assert!(SpecVersion::v0_6().signatures(&json!({})).is_err());
    }
}
