// Copyright (c) The Taipan Project Developers.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The v0.6 profile roles: `root`, `key_mgr`, and `pkg_mgr`.
//!
//! `root` delegates to `key_mgr`, which delegates to `pkg_mgr`, which signs
//! the per-package metadata blocks of a channel's repodata. The chain
//! terminates in a [`RepoIndexChecker`] backed by the `pkg_mgr` keyring.

use crate::error::{self, Result};
use crate::roles::{
    check_defined_roles, check_role_signatures, check_signatures, parse_timestamp_field,
    parse_version, read_json_file, Role,
};
use crate::schema::{RoleFullKeys, RolePubKeys};
use crate::spec::{signatures_map, SpecVersion};
use crate::timeref::TimeRef;
use crate::transport::Transport;
use crate::{fetch, RepoIndexChecker, MAX_ROLE_SIZE};
use serde_json::Value;
use snafu::{OptionExt, ResultExt};
use std::collections::BTreeMap;
use std::path::Path;
use url::Url;

/// Fields common to every v0.6 role's `signed` object.
#[derive(Debug, Clone)]
struct Common {
    version: u64,
    expires: String,
    spec: SpecVersion,
    defined_roles: BTreeMap<String, RoleFullKeys>,
}

/// Parses the shared v0.6 `signed` shape: `type`, `version`,
/// `metadata_spec_version`, `timestamp`, `expiration`, and `delegations`.
fn parse_common(doc: &Value, role_type: &str) -> Result<Common> {
    let signed = doc.get("signed").context(error::RoleMetadataSnafu)?;

    let declared_type = signed
        .get("type")
        .and_then(Value::as_str)
        .context(error::RoleMetadataSnafu)?;
    if declared_type != role_type {
        log::error!(
            "wrong 'type' found in '{role_type}' metadata, should be '{role_type}': '{declared_type}'"
        );
        return error::RoleMetadataSnafu.fail();
    }

    let base = SpecVersion::v0_6();
    let spec_version_str = signed
        .get(base.json_key())
        .and_then(Value::as_str)
        .context(error::RoleMetadataSnafu)?;
    if !base.is_compatible(spec_version_str) {
        log::error!(
            "incompatible 'metadata_spec_version' found in '{role_type}' metadata, should start with '{}' but is: '{spec_version_str}'",
            base.compatible_prefix()
        );
        return error::SpecVersionSnafu.fail();
    }
    let spec = SpecVersion::V06(spec_version_str.to_string());

    let version = parse_version(signed)?;
    let expires = parse_timestamp_field(signed, spec.expiration_json_key())?;
    // Creation timestamp; only its format matters.
    parse_timestamp_field(signed, "timestamp")?;

    let delegations: BTreeMap<String, RolePubKeys> = signed
        .get("delegations")
        .and_then(|d| serde_json::from_value(d.clone()).ok())
        .context(error::RoleMetadataSnafu)?;
    let defined_roles = delegations
        .iter()
        .map(|(name, pubkeys)| (name.clone(), RoleFullKeys::from_pubkeys(pubkeys)))
        .collect();

    Ok(Common {
        version,
        expires,
        spec,
        defined_roles,
    })
}

/// Fetches a delegated role file into scratch space, parses and verifies it,
/// checks it for a freeze attack, and promotes it into the metadata cache.
/// Falls back to a previously promoted copy when the channel cannot serve the
/// file; the freeze check applies to the fallback as well.
fn load_delegated_role<T, F>(
    transport: &dyn Transport,
    time_ref: &TimeRef,
    base_url: &Url,
    cache_path: &Path,
    file_name: &str,
    parse: F,
) -> Result<T>
where
    T: Role,
    F: Fn(&Value) -> Result<T>,
{
    let cached_path = cache_path.join(file_name);

    let url = base_url.join(file_name).context(error::JoinUrlSnafu {
        path: file_name,
        url: base_url.clone(),
    })?;

    let scratch = tempfile::tempdir().context(error::DirCreateSnafu {
        path: std::env::temp_dir(),
    })?;
    let scratch_path = scratch.path().join(file_name);

    match fetch::fetch_to_file(transport, url, MAX_ROLE_SIZE, "role metadata limit", &scratch_path)
    {
        Ok(()) => {
            let doc = read_json_file(&scratch_path)?;
            let role = parse(&doc)?;

            if role.expired(time_ref) {
                log::error!(
                    "possible freeze attack of '{}' metadata, expired: {}",
                    role.role_type(),
                    role.expires()
                );
                return error::FreezeSnafu.fail();
            }

            // Persist only after the role has been fully verified.
            if cached_path.exists() {
                std::fs::remove_file(&cached_path).context(error::FileRemoveSnafu {
                    path: &cached_path,
                })?;
            }
            std::fs::copy(&scratch_path, &cached_path).context(error::FileCopySnafu {
                src: &scratch_path,
                dst: &cached_path,
            })?;

            Ok(role)
        }
        Err(fetch_err) => {
            log::debug!("could not fetch '{file_name}' from the channel: {fetch_err}");
            if cached_path.exists() {
                log::debug!("falling back to cached '{file_name}'");
                let doc = read_json_file(&cached_path)?;
                let role = parse(&doc)?;
                if role.expired(time_ref) {
                    log::error!(
                        "possible freeze attack of '{}' metadata, expired: {}",
                        role.role_type(),
                        role.expires()
                    );
                    return error::FreezeSnafu.fail();
                }
                Ok(role)
            } else {
                log::error!("error while fetching '{file_name}' metadata");
                error::FetchingSnafu.fail()
            }
        }
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The v0.6 trust anchor. Delegates to itself (`root`) and to `key_mgr`.
#[derive(Debug, Clone)]
pub struct Root {
    common: Common,
}

impl Root {
    /// Parses v0.6 root metadata. Signature verification is a separate step
    /// because the verifying keyring depends on the caller: the initial
    /// trusted root satisfies its own `root` delegation, while a chained
    /// update is checked against its predecessor's.
    pub fn from_value(doc: &Value) -> Result<Self> {
        let common = parse_common(doc, "root")?;
        check_defined_roles("root", &common.defined_roles, &["root", "key_mgr"], &[])?;
        Ok(Self { common })
    }

    /// Walks the delegated chain to a `pkg_mgr`-backed index checker:
    /// `key_mgr.json` first, then `pkg_mgr.json`, each verified, checked for
    /// freeze, and promoted into the cache.
    pub(crate) fn build_index_checker(
        &self,
        transport: &dyn Transport,
        time_ref: &TimeRef,
        base_url: &Url,
        cache_path: &Path,
    ) -> Result<Box<dyn RepoIndexChecker>> {
        let key_mgr_keys = self.defined_roles()["key_mgr"].clone();
        let spec = self.spec().clone();
        let key_mgr = load_delegated_role(
            transport,
            time_ref,
            base_url,
            cache_path,
            "key_mgr.json",
            |doc| KeyMgr::from_value(doc, key_mgr_keys.clone(), &spec),
        )?;
        key_mgr.build_index_checker(transport, time_ref, base_url, cache_path)
    }
}

impl Role for Root {
    fn role_type(&self) -> &'static str {
        "root"
    }

    fn version(&self) -> u64 {
        self.common.version
    }

    fn expires(&self) -> &str {
        &self.common.expires
    }

    fn spec(&self) -> &SpecVersion {
        &self.common.spec
    }

    fn self_keys(&self) -> &RoleFullKeys {
        &self.common.defined_roles["root"]
    }

    fn defined_roles(&self) -> &BTreeMap<String, RoleFullKeys> {
        &self.common.defined_roles
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The `key_mgr` role: signed by the root-declared `key_mgr` keys, delegates
/// to `pkg_mgr`.
#[derive(Debug, Clone)]
pub struct KeyMgr {
    common: Common,
    keys: RoleFullKeys,
}

impl KeyMgr {
    /// Parses and verifies `key_mgr` metadata against the keyring its parent
    /// root declared for it. The metadata must use exactly the root's spec
    /// version.
    pub fn from_value(doc: &Value, keys: RoleFullKeys, root_spec: &SpecVersion) -> Result<Self> {
        let common = parse_common(doc, "key_mgr")?;
        if common.spec.version_str() != root_spec.version_str() {
            log::error!(
                "invalid spec version '{}' in 'key_mgr' metadata, it should match exactly 'root' spec version: '{}'",
                common.spec.version_str(),
                root_spec.version_str()
            );
            return error::SpecVersionSnafu.fail();
        }
        check_defined_roles("key_mgr", &common.defined_roles, &["pkg_mgr"], &[])?;
        check_role_signatures(doc, &common.spec, &keys)?;
        Ok(Self { common, keys })
    }

    /// Fetches and verifies `pkg_mgr.json`, yielding the index checker.
    pub(crate) fn build_index_checker(
        &self,
        transport: &dyn Transport,
        time_ref: &TimeRef,
        base_url: &Url,
        cache_path: &Path,
    ) -> Result<Box<dyn RepoIndexChecker>> {
        let pkg_mgr_keys = self.defined_roles()["pkg_mgr"].clone();
        let spec = self.spec().clone();
        let pkg_mgr = load_delegated_role(
            transport,
            time_ref,
            base_url,
            cache_path,
            "pkg_mgr.json",
            |doc| PkgMgr::from_value(doc, pkg_mgr_keys.clone(), &spec),
        )?;
        Ok(Box::new(pkg_mgr))
    }
}

impl Role for KeyMgr {
    fn role_type(&self) -> &'static str {
        "key_mgr"
    }

    fn version(&self) -> u64 {
        self.common.version
    }

    fn expires(&self) -> &str {
        &self.common.expires
    }

    fn spec(&self) -> &SpecVersion {
        &self.common.spec
    }

    fn self_keys(&self) -> &RoleFullKeys {
        &self.keys
    }

    fn defined_roles(&self) -> &BTreeMap<String, RoleFullKeys> {
        &self.common.defined_roles
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The `pkg_mgr` role: signed by the `key_mgr`-declared `pkg_mgr` keys. Its
/// keyring signs the per-package metadata blocks of a repodata index.
#[derive(Debug, Clone)]
pub struct PkgMgr {
    common: Common,
    keys: RoleFullKeys,
}

impl PkgMgr {
    /// Parses and verifies `pkg_mgr` metadata against the keyring its parent
    /// `key_mgr` declared for it.
    pub fn from_value(doc: &Value, keys: RoleFullKeys, parent_spec: &SpecVersion) -> Result<Self> {
        let common = parse_common(doc, "pkg_mgr")?;
        if common.spec.version_str() != parent_spec.version_str() {
            log::error!(
                "invalid spec version '{}' in 'pkg_mgr' metadata, it should match exactly 'root' spec version: '{}'",
                common.spec.version_str(),
                parent_spec.version_str()
            );
            return error::SpecVersionSnafu.fail();
        }
        check_defined_roles("pkg_mgr", &common.defined_roles, &[], &[])?;
        check_role_signatures(doc, &common.spec, &keys)?;
        Ok(Self { common, keys })
    }

    /// Runs the threshold check for one package metadata block against its
    /// signature map.
    fn check_pkg_signatures(&self, metadata: &Value, signatures: &Value) -> Result<()> {
        let signed_data = self.spec().canonicalize(metadata)?;
        let sigs = signatures_map(signatures)?;
        check_signatures(&signed_data, &sigs, self.self_keys())
    }
}

impl Role for PkgMgr {
    fn role_type(&self) -> &'static str {
        "pkg_mgr"
    }

    fn version(&self) -> u64 {
        self.common.version
    }

    fn expires(&self) -> &str {
        &self.common.expires
    }

    fn spec(&self) -> &SpecVersion {
        &self.common.spec
    }

    fn self_keys(&self) -> &RoleFullKeys {
        &self.keys
    }

    fn defined_roles(&self) -> &BTreeMap<String, RoleFullKeys> {
        &self.common.defined_roles
    }
}

impl RepoIndexChecker for PkgMgr {
    fn verify_index(&self, repodata: &Value) -> Result<()> {
        let packages = repodata
            .get("packages")
            .and_then(Value::as_object)
            .map_or_else(
                || {
                    log::error!("invalid package index metadata: missing 'packages'");
                    error::IndexSnafu.fail()
                },
                Ok,
            )?;
        let signatures = repodata
            .get("signatures")
            .and_then(Value::as_object)
            .map_or_else(
                || {
                    log::error!("invalid package index metadata: missing 'signatures'");
                    error::IndexSnafu.fail()
                },
                Ok,
            )?;

        for (pkg_name, pkg_meta) in packages {
            let Some(pkg_sigs) = signatures.get(pkg_name) else {
                log::error!("no signatures found for package: '{pkg_name}'");
                return error::PackageSnafu { name: pkg_name }.fail();
            };
            if let Err(e) = self.check_pkg_signatures(pkg_meta, pkg_sigs) {
                log::error!("validation failed on package: '{pkg_name}': {e}");
                return error::PackageSnafu { name: pkg_name }.fail();
            }
        }
        Ok(())
    }

    fn verify_package(&self, signed_meta: &Value, signatures: &Value) -> Result<()> {
        if let Err(e) = self.check_pkg_signatures(signed_meta, signatures) {
            let name = signed_meta
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("<unknown>");
            log::error!("validation failed on package: '{name}': {e}");
            return error::PackageSnafu { name }.fail();
        }
        Ok(())
    }
}
