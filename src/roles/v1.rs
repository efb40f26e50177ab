// Copyright (c) The Taipan Project Developers.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The v1 profile root role.
//!
//! The v1 profile follows the TUF shape: a top-level `keys` map plus a
//! `roles` map of key IDs and thresholds. Package-level verification for v1
//! channels is not implemented; [`Root::build_index_checker`] returns `None`
//! and the orchestrator refuses to verify until a checker exists.

use crate::error::{self, Result};
use crate::roles::{check_defined_roles, parse_timestamp_field, parse_version, Role};
use crate::schema::{Key, RoleFullKeys, RoleKeys};
use crate::spec::SpecVersion;
use crate::RepoIndexChecker;
use serde_json::Value;
use snafu::OptionExt;
use std::collections::BTreeMap;

/// The v1 trust anchor.
#[derive(Debug, Clone)]
pub struct Root {
    version: u64,
    expires: String,
    spec: SpecVersion,
    defined_roles: BTreeMap<String, RoleFullKeys>,
}

impl Root {
    /// Parses v1 root metadata. As with the v0.6 root, signature
    /// verification is the caller's explicit step.
    pub fn from_value(doc: &Value) -> Result<Self> {
        let signed = doc.get("signed").context(error::RoleMetadataSnafu)?;

        let declared_type = signed
            .get("_type")
            .and_then(Value::as_str)
            .context(error::RoleMetadataSnafu)?;
        if declared_type != "root" {
            log::error!(
                "wrong '_type' found in 'root' metadata, should be 'root': '{declared_type}'"
            );
            return error::RoleMetadataSnafu.fail();
        }

        let base = SpecVersion::v1();
        let spec_version_str = signed
            .get(base.json_key())
            .and_then(Value::as_str)
            .context(error::RoleMetadataSnafu)?;
        if !base.is_compatible(spec_version_str) {
            log::error!(
                "incompatible 'spec_version' found in 'root' metadata, should start with '{}' but is: '{spec_version_str}'",
                base.compatible_prefix()
            );
            return error::SpecVersionSnafu.fail();
        }
        let spec = SpecVersion::V1(spec_version_str.to_string());

        let version = parse_version(signed)?;
        let expires = parse_timestamp_field(signed, spec.expiration_json_key())?;

        let keys: BTreeMap<String, Key> = signed
            .get("keys")
            .and_then(|k| serde_json::from_value(k.clone()).ok())
            .context(error::RoleMetadataSnafu)?;
        let roles: BTreeMap<String, RoleKeys> = signed
            .get("roles")
            .and_then(|r| serde_json::from_value(r.clone()).ok())
            .context(error::RoleMetadataSnafu)?;

        let mut defined_roles = BTreeMap::new();
        for (name, role_keys) in &roles {
            let mut resolved = BTreeMap::new();
            for keyid in &role_keys.keyids {
                let key = keys.get(keyid).map_or_else(
                    || {
                        log::error!(
                            "missing key in 'keys' is used in '{name}' delegation: '{keyid}'"
                        );
                        error::RoleMetadataSnafu.fail()
                    },
                    Ok,
                )?;
                resolved.insert(keyid.clone(), key.clone());
            }
            defined_roles.insert(
                name.clone(),
                RoleFullKeys {
                    keys: resolved,
                    threshold: role_keys.threshold,
                },
            );
        }

        check_defined_roles(
            "root",
            &defined_roles,
            &["root", "snapshot", "targets", "timestamp"],
            &["mirrors"],
        )?;

        Ok(Self {
            version,
            expires,
            spec,
            defined_roles,
        })
    }

    /// Package-level verification is not implemented for v1 channels yet.
    /// This is a deliberate seam: the `targets` delegation is parsed and
    /// carried, but no index checker is derived from it.
    pub(crate) fn build_index_checker(&self) -> Result<Option<Box<dyn RepoIndexChecker>>> {
        log::warn!("package verification is not implemented for v1 metadata");
        Ok(None)
    }
}

impl Role for Root {
    fn role_type(&self) -> &'static str {
        "root"
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn expires(&self) -> &str {
        &self.expires
    }

    fn spec(&self) -> &SpecVersion {
        &self.spec
    }

    fn self_keys(&self) -> &RoleFullKeys {
        &self.defined_roles["root"]
    }

    fn defined_roles(&self) -> &BTreeMap<String, RoleFullKeys> {
        &self.defined_roles
    }
}
