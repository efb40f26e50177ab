// Copyright (c) The Taipan Project Developers.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Role mechanics shared by both spec profiles, and the chained root update.
//!
//! A role is a signed metadata object: it declares a version, an expiration,
//! a spec version, and a set of delegated roles with their keyrings. The
//! profile-specific concrete types live in [`v0_6`] and [`v1`]; the
//! [`RootRole`] enum discriminates the profile at the one boundary where a
//! chained update may cross from one profile to the other.

pub mod v0_6;
pub mod v1;

use crate::error::{self, Result};
use crate::schema::{RoleFullKeys, RoleSignature};
use crate::spec::SpecVersion;
use crate::timeref::{valid_timestamp_format, TimeRef};
use crate::transport::Transport;
use crate::RepoIndexChecker;
use serde_json::Value;
use snafu::{ensure, OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use url::Url;

/// Common behavior of signed role metadata.
pub trait Role {
    /// The role type string as it appears in metadata (`"root"`,
    /// `"key_mgr"`, ...).
    fn role_type(&self) -> &'static str;

    /// The metadata version; always `>= 1`.
    fn version(&self) -> u64;

    /// The expiration in strict `YYYY-MM-DDTHH:MM:SSZ` form.
    fn expires(&self) -> &str;

    /// The spec profile this role was parsed under.
    fn spec(&self) -> &SpecVersion;

    /// The keyring a verifier uses to check this role's own signatures.
    fn self_keys(&self) -> &RoleFullKeys;

    /// The roles this role delegates, with their resolved keyrings.
    fn defined_roles(&self) -> &BTreeMap<String, RoleFullKeys>;

    /// Whether the role is expired relative to the frozen update-start time.
    /// The strict timestamp format is total-order-preserving, so this is a
    /// lexicographic comparison.
    fn expired(&self, time_ref: &TimeRef) -> bool {
        time_ref.timestamp().as_str() >= self.expires()
    }
}

/// Verifies a threshold of signatures over canonical signed bytes.
///
/// Unknown key IDs and invalid signatures are warnings, not fatal errors;
/// only the final tally of distinct verifying key IDs decides.
pub(crate) fn check_signatures(
    signed_data: &[u8],
    signatures: &[RoleSignature],
    keyring: &RoleFullKeys,
) -> Result<()> {
    let mut valid_sig: u64 = 0;

    for s in signatures {
        if let Some(key) = keyring.keys.get(&s.keyid) {
            let ok = if s.pgp_trailer.is_empty() {
                crate::crypto::verify_hex(signed_data, &key.keyval, &s.sig)
            } else {
                crate::crypto::verify_gpg(signed_data, &s.pgp_trailer, &key.keyval, &s.sig)
            };
            if ok {
                valid_sig += 1;
            } else {
                log::warn!("invalid signature of metadata using keyid: {}", s.keyid);
            }
        } else {
            log::warn!("invalid keyid: {}", s.keyid);
        }
        if valid_sig >= keyring.threshold {
            break;
        }
    }

    ensure!(
        valid_sig >= keyring.threshold,
        error::ThresholdSnafu {
            valid_sig,
            threshold: keyring.threshold
        }
    );
    Ok(())
}

/// Verifies a whole metadata document against `keyring`: canonicalizes
/// `doc.signed` under `spec`, parses the signature container in the shape
/// `spec` mandates, and runs the threshold check.
pub(crate) fn check_role_signatures(
    doc: &Value,
    spec: &SpecVersion,
    keyring: &RoleFullKeys,
) -> Result<()> {
    let signed = doc.get("signed").context(error::RoleMetadataSnafu)?;
    let signed_data = spec.canonicalize(signed)?;
    let signatures = spec.signatures(doc)?;
    check_signatures(&signed_data, &signatures, keyring)
}

/// Validates the delegated-roles map of a role: the declared names must be
/// exactly the mandatory ones plus a subset of the optional ones, and every
/// declared role needs at least one key and a threshold of at least one.
pub(crate) fn check_defined_roles(
    role_type: &str,
    defined: &BTreeMap<String, RoleFullKeys>,
    mandatory: &[&str],
    optional: &[&str],
) -> Result<()> {
    for name in defined.keys() {
        if !mandatory.contains(&name.as_str()) && !optional.contains(&name.as_str()) {
            log::error!("invalid role defined in '{role_type}' metadata: '{name}'");
            return error::RoleMetadataSnafu.fail();
        }
    }
    for name in mandatory {
        if !defined.contains_key(*name) {
            log::error!("missing role while loading '{role_type}' metadata: '{name}'");
            return error::RoleMetadataSnafu.fail();
        }
    }
    for (name, keys) in defined {
        if keys.keys.is_empty() {
            log::error!(
                "'{role_type}' metadata should declare at least one key ID for role: '{name}'"
            );
            return error::RoleMetadataSnafu.fail();
        }
        if keys.threshold == 0 {
            log::error!(
                "'{role_type}' metadata should declare at least a 'threshold' of 1 for role: '{name}'"
            );
            return error::RoleMetadataSnafu.fail();
        }
    }
    Ok(())
}

/// Reads the mandatory `version` field (`>= 1`) out of a `signed` object.
pub(crate) fn parse_version(signed: &Value) -> Result<u64> {
    let version = signed
        .get("version")
        .and_then(Value::as_u64)
        .context(error::RoleMetadataSnafu)?;
    ensure!(version >= 1, error::RoleMetadataSnafu);
    Ok(version)
}

/// Reads and format-checks a strict UTC timestamp field out of a `signed`
/// object.
pub(crate) fn parse_timestamp_field(signed: &Value, key: &str) -> Result<String> {
    let ts = signed
        .get(key)
        .and_then(Value::as_str)
        .context(error::RoleMetadataSnafu)?;
    if !valid_timestamp_format(ts) {
        log::error!(
            "invalid timestamp format '{ts}', should be UTC ISO8601 ('<YYYY>-<MM>-<DD>T<HH>:<MM>:<SS>Z')"
        );
        return error::RoleMetadataSnafu.fail();
    }
    Ok(ts.to_string())
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The parsed pieces of a role metadata file name.
///
/// Role files are named using one of the following structures, where the
/// optional `sv` infix declares the spec family the file belongs to:
///
/// - trusted (reference) file: `FILENAME.EXT` or `svSPEC.FILENAME.EXT`
/// - update file: `VERSION.FILENAME.EXT` or `VERSION.svSPEC.FILENAME.EXT`
///
/// `SPEC` is either a major version (`1`) or, for pre-1.0 families, a
/// `major.minor` pair (`0.6`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RoleFileName {
    pub version: Option<u64>,
    pub spec_family: Option<String>,
    pub role_type: String,
    pub ext: String,
}

impl RoleFileName {
    pub(crate) fn parse(name: &str) -> Option<Self> {
        let parts: Vec<&str> = name.split('.').collect();
        if parts.len() < 2 || parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        let ext = parts[parts.len() - 1].to_string();
        let role_type = parts[parts.len() - 2].to_string();
        let mut prefix = &parts[..parts.len() - 2];

        let version = match prefix.first() {
            Some(first) if !first.starts_with("sv") => {
                let version = parse_version_component(first)?;
                prefix = &prefix[1..];
                Some(version)
            }
            _ => None,
        };

        let spec_family = if prefix.is_empty() {
            None
        } else {
            let family = prefix.join(".");
            let family = family.strip_prefix("sv")?;
            if !valid_spec_family(family) {
                return None;
            }
            Some(family.to_string())
        };

        Some(Self {
            version,
            spec_family,
            role_type,
            ext,
        })
    }
}

/// A version component is a decimal number without a leading zero.
fn parse_version_component(s: &str) -> Option<u64> {
    if s.starts_with('0') || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// A spec family is a nonzero major (`1`) or `0.minor` with nonzero minor
/// (`0.6`).
fn valid_spec_family(s: &str) -> bool {
    match s.split_once('.') {
        None => parse_version_component(s).is_some(),
        Some(("0", minor)) => parse_version_component(minor).is_some(),
        Some(_) => false,
    }
}

/// Validates a role file name against the naming convention and, for update
/// files, against the expected next version and the current spec family.
pub(crate) fn check_role_file_name(
    path: &Path,
    role_type: &str,
    spec: &SpecVersion,
    update: bool,
    next_version: u64,
) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .context(error::RoleFileSnafu)?;
    let parsed = RoleFileName::parse(file_name).map_or_else(
        || {
            log::error!("invalid file name for '{role_type}' metadata: {file_name}");
            error::RoleFileSnafu.fail()
        },
        Ok,
    )?;

    if parsed.ext != "json" {
        log::error!(
            "'{role_type}' metadata file should have 'json' extension, not: '{}'",
            parsed.ext
        );
        return error::RoleFileSnafu.fail();
    }
    if parsed.role_type != role_type {
        log::error!(
            "'{role_type}' metadata file should have '{role_type}' type, not: '{}'",
            parsed.role_type
        );
        return error::RoleFileSnafu.fail();
    }

    if let Some(family) = &parsed.spec_family {
        let family_version = format!("{family}.");
        if update && spec.is_upgrade(&family_version) && !spec.upgradable() {
            log::error!(
                "please check for a client update, unsupported spec version: '{family}'"
            );
            return error::SpecVersionSnafu.fail();
        }
        if !spec.is_compatible(&family_version) && !(update && spec.is_upgrade(&family_version)) {
            log::error!("invalid spec version specified in file name: '{family}'");
            return error::RoleFileSnafu.fail();
        }
    }

    if update {
        match parsed.version {
            Some(v) if v == next_version => {}
            Some(v) => {
                log::error!(
                    "'{role_type}' metadata file name should start with N+1 version ({next_version}), but starts with: {v}"
                );
                return error::RoleFileSnafu.fail();
            }
            None => {
                log::error!("missing version in file name for '{role_type}' metadata update");
                return error::RoleFileSnafu.fail();
            }
        }
    }

    Ok(())
}

/// Reads a JSON metadata file from disk.
pub(crate) fn read_json_file(path: &Path) -> Result<Value> {
    if !path.exists() {
        log::error!("file not found for role metadata: {}", path.display());
        return error::RoleFileSnafu.fail();
    }
    let file = File::open(path).context(error::FileReadSnafu { path })?;
    serde_json::from_reader(file).context(error::ParseMetadataSnafu {
        role: path.display().to_string(),
    })
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The trust anchor, in whichever profile the trusted metadata declares.
///
/// Chained updates replace the current value; an update may cross from the
/// v0.6 profile to v1 when the candidate declares an upgraded spec version.
#[derive(Debug, Clone)]
pub enum RootRole {
    /// A root parsed under the v0.6 profile.
    V06(v0_6::Root),
    /// A root parsed under the v1 profile.
    V1(v1::Root),
}

impl RootRole {
    /// Loads the initial trusted root from a file, detecting the profile from
    /// the declared spec version, and checks that the metadata satisfies its
    /// own `root` delegation (self-signing).
    pub fn from_trusted_file(path: &Path) -> Result<Self> {
        let doc = read_json_file(path)?;
        let root = Self::from_trusted_doc(&doc, path)?;
        check_role_file_name(path, "root", root.spec(), false, 0)?;
        Ok(root)
    }

    /// Same as [`RootRole::from_trusted_file`] for already parsed metadata.
    fn from_trusted_doc(doc: &Value, origin: &Path) -> Result<Self> {
        let root = if SpecVersion::v0_6().is_compatible_doc(doc) {
            log::info!("getting 'root' role, using spec v0.6");
            RootRole::V06(v0_6::Root::from_value(doc)?)
        } else if SpecVersion::v1().is_compatible_doc(doc) {
            log::info!("getting 'root' role, using spec v1");
            RootRole::V1(v1::Root::from_value(doc)?)
        } else {
            log::error!(
                "invalid 'root' initial trusted file '{}': unknown spec version",
                origin.display()
            );
            return error::RoleFileSnafu.fail();
        };
        check_role_signatures(doc, root.spec(), root.self_keys())?;
        Ok(root)
    }

    /// The update file names to probe for the next chained update, in
    /// priority order: upgrade spec families first, then the compatible
    /// family, then the un-suffixed form, each at version `N+1`.
    pub fn possible_update_files(&self) -> Vec<String> {
        let next = self.version() + 1;
        let mut files: Vec<String> = self
            .spec()
            .upgrade_prefixes()
            .iter()
            .map(|family| format!("{next}.sv{family}.root.json"))
            .collect();
        files.push(format!("{next}.sv{}.root.json", self.spec().compatible_prefix()));
        files.push(format!("{next}.root.json"));
        files
    }

    /// Applies one chained update from a downloaded candidate file.
    pub fn update_from_file(&self, path: &Path) -> Result<Self> {
        check_role_file_name(path, "root", self.spec(), true, self.version() + 1)?;
        let doc = read_json_file(path)?;
        self.update(&doc)
    }

    /// Applies one chained update from parsed candidate metadata.
    ///
    /// The candidate is verified against the *current* root's `root`
    /// delegation, which is what defends against arbitrary-key attacks, and
    /// must carry version `N+1` exactly. Expiration is not checked here; the
    /// orchestrator checks the final accepted root once the chain converges.
    pub fn update(&self, doc: &Value) -> Result<Self> {
        let candidate = self.create_update(doc)?;

        check_role_signatures(doc, candidate.spec(), self.self_keys())?;

        if candidate.version() != self.version() + 1 {
            if candidate.version() > self.version() + 1 {
                log::error!("invalid 'root' metadata version, should be exactly N+1");
                return error::RoleMetadataSnafu.fail();
            }
            log::error!("possible rollback attack of 'root' metadata");
            return error::RollbackSnafu.fail();
        }

        Ok(candidate)
    }

    /// Parses a candidate update under the profile it declares. A v0.6 root
    /// routes to v1 when the candidate declares a v1 spec; a v1 root never
    /// routes back.
    fn create_update(&self, doc: &Value) -> Result<Self> {
        match self {
            RootRole::V06(_) => {
                if SpecVersion::v0_6().is_compatible_doc(doc) {
                    Ok(RootRole::V06(v0_6::Root::from_value(doc)?))
                } else if SpecVersion::v1().is_compatible_doc(doc) {
                    log::debug!("updating 'root' role spec version");
                    Ok(RootRole::V1(v1::Root::from_value(doc)?))
                } else {
                    log::error!("invalid spec version for 'root' update");
                    error::SpecVersionSnafu.fail()
                }
            }
            RootRole::V1(_) => {
                if SpecVersion::v1().is_compatible_doc(doc) {
                    Ok(RootRole::V1(v1::Root::from_value(doc)?))
                } else {
                    log::error!("invalid spec version for 'root' update");
                    error::SpecVersionSnafu.fail()
                }
            }
        }
    }

    /// Derives the index checker for this channel by walking the delegated
    /// chain. Returns `Ok(None)` when the profile does not implement
    /// package-level verification yet.
    pub fn build_index_checker(
        &self,
        transport: &dyn Transport,
        time_ref: &TimeRef,
        base_url: &Url,
        cache_path: &Path,
    ) -> Result<Option<Box<dyn RepoIndexChecker>>> {
        match self {
            RootRole::V06(root) => root
                .build_index_checker(transport, time_ref, base_url, cache_path)
                .map(Some),
            RootRole::V1(root) => root.build_index_checker(),
        }
    }
}

impl Role for RootRole {
    fn role_type(&self) -> &'static str {
        "root"
    }

    fn version(&self) -> u64 {
        match self {
            RootRole::V06(r) => r.version(),
            RootRole::V1(r) => r.version(),
        }
    }

    fn expires(&self) -> &str {
        match self {
            RootRole::V06(r) => r.expires(),
            RootRole::V1(r) => r.expires(),
        }
    }

    fn spec(&self) -> &SpecVersion {
        match self {
            RootRole::V06(r) => r.spec(),
            RootRole::V1(r) => r.spec(),
        }
    }

    fn self_keys(&self) -> &RoleFullKeys {
        match self {
            RootRole::V06(r) => r.self_keys(),
            RootRole::V1(r) => r.self_keys(),
        }
    }

    fn defined_roles(&self) -> &BTreeMap<String, RoleFullKeys> {
        match self {
            RootRole::V06(r) => r.defined_roles(),
            RootRole::V1(r) => r.defined_roles(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_file_name_shapes() {
        let parsed = RoleFileName::parse("root.json").unwrap();
        assert_eq!(parsed.version, None);
        assert_eq!(parsed.spec_family, None);
        assert_eq!(parsed.role_type, "root");

        let parsed = RoleFileName::parse("2.root.json").unwrap();
        assert_eq!(parsed.version, Some(2));

        let parsed = RoleFileName::parse("2.sv1.root.json").unwrap();
        assert_eq!(parsed.version, Some(2));
        assert_eq!(parsed.spec_family.as_deref(), Some("1"));

        let parsed = RoleFileName::parse("10.sv0.6.root.json").unwrap();
        assert_eq!(parsed.version, Some(10));
        assert_eq!(parsed.spec_family.as_deref(), Some("0.6"));

        let parsed = RoleFileName::parse("sv0.6.root.json").unwrap();
        assert_eq!(parsed.version, None);
        assert_eq!(parsed.spec_family.as_deref(), Some("0.6"));
    }

    #[test]
    fn role_file_name_rejects_malformed_input() {
        assert!(RoleFileName::parse("json").is_none());
        assert!(RoleFileName::parse("0.root.json").is_none());
        assert!(RoleFileName::parse("02.root.json").is_none());
        assert!(RoleFileName::parse("2.sv0.0.root.json").is_none());
        assert!(RoleFileName::parse("2.svx.root.json").is_none());
        assert!(RoleFileName::parse("2..root.json").is_none());
    }

    #[test]
    fn update_file_name_requires_next_version() {
        let spec = SpecVersion::v0_6();
        assert!(check_role_file_name(Path::new("2.root.json"), "root", &spec, true, 2).is_ok());
        assert!(check_role_file_name(Path::new("3.root.json"), "root", &spec, true, 2).is_err());
        assert!(check_role_file_name(Path::new("root.json"), "root", &spec, true, 2).is_err());
        assert!(
            check_role_file_name(Path::new("2.sv0.6.root.json"), "root", &spec, true, 2).is_ok()
        );
        assert!(check_role_file_name(Path::new("2.sv1.root.json"), "root", &spec, true, 2).is_ok());
        // An unknown family is neither compatible nor an upgrade.
        assert!(
            check_role_file_name(Path::new("2.sv0.8.root.json"), "root", &spec, true, 2).is_err()
        );
    }

    #[test]
    fn upgrade_file_name_needs_an_upgradable_spec() {
        let spec = SpecVersion::v1();
        let err = check_role_file_name(Path::new("2.sv2.root.json"), "root", &spec, true, 2)
            .unwrap_err();
        assert!(matches!(err, crate::error::Error::SpecVersion { .. }));
    }

    #[test]
    fn threshold_counts_distinct_valid_keyids() {
        use crate::crypto;
        use crate::schema::{Key, RoleFullKeys};

        let (pk_a, sk_a) = crypto::generate_ed25519_keypair_hex().unwrap();
        let (pk_b, _) = crypto::generate_ed25519_keypair_hex().unwrap();
        let data = b"signed bytes";

        let keyring = RoleFullKeys {
            keys: [
                (pk_a.clone(), Key::from_ed25519(pk_a.clone())),
                (pk_b.clone(), Key::from_ed25519(pk_b.clone())),
            ]
            .into_iter()
            .collect(),
            threshold: 2,
        };

        let good = RoleSignature {
            keyid: pk_a.clone(),
            sig: crypto::sign_hex(data, &sk_a).unwrap(),
            pgp_trailer: String::new(),
        };
        // A known keyid with a bad signature only warns; the tally decides.
        let bad = RoleSignature {
            keyid: pk_b.clone(),
            sig: "ab".repeat(64),
            pgp_trailer: String::new(),
        };
        // An unknown keyid warns as well.
        let unknown = RoleSignature {
            keyid: "deadbeef".to_string(),
            sig: good.sig.clone(),
            pgp_trailer: String::new(),
        };

        let err = check_signatures(data, &[good.clone(), bad, unknown], &keyring).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Threshold {
                valid_sig: 1,
                threshold: 2
            }
        ));

        let keyring_one = RoleFullKeys {
            threshold: 1,
            ..keyring
        };
        check_signatures(data, &[good], &keyring_one).unwrap();
    }
}
