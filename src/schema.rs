// Copyright (c) The Taipan Project Developers.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Key and signature descriptors shared by both metadata profiles.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A public key descriptor as it appears in role metadata. All current
/// channel metadata uses raw hex-encoded Ed25519 keys, where the key ID is
/// the public key itself.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Key {
    /// The key type; `"ed25519"` for all current inputs.
    pub keytype: String,
    /// The signature scheme; `"ed25519"` for all current inputs.
    pub scheme: String,
    /// The hex-encoded public key material.
    pub keyval: String,
}

impl Key {
    /// Builds a descriptor for a raw hex-encoded Ed25519 public key.
    pub fn from_ed25519(keyval: impl Into<String>) -> Self {
        Self {
            keytype: "ed25519".to_string(),
            scheme: "ed25519".to_string(),
            keyval: keyval.into(),
        }
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// One signature over the canonicalized `signed` bytes of a role or package.
///
/// When `pgp_trailer` is non-empty the signature was produced through the PGP
/// v4 hashing convention and verification goes through
/// [`crate::crypto::verify_gpg`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RoleSignature {
    /// The key ID that made this signature.
    pub keyid: String,
    /// The hex-encoded signature bytes.
    pub sig: String,
    /// An optional PGP v4 trailer, hex-encoded.
    #[serde(
        rename = "other_headers",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub pgp_trailer: String,
}

/// The key IDs and threshold for one role, as declared by a v1 `roles` map.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RoleKeys {
    /// The key IDs authorized for the role.
    pub keyids: Vec<String>,
    /// The number of distinct valid signatures required to accept the role.
    pub threshold: u64,
}

/// The public keys and threshold for one role, as declared by a v0.6
/// `delegations` map.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RolePubKeys {
    /// The hex-encoded public keys authorized for the role.
    pub pubkeys: Vec<String>,
    /// The number of distinct valid signatures required to accept the role.
    pub threshold: u64,
}

impl RolePubKeys {
    /// Converts to the keyid-based form. In the v0.6 profile the key ID is
    /// the public key itself.
    pub fn to_role_keys(&self) -> RoleKeys {
        RoleKeys {
            keyids: self.pubkeys.clone(),
            threshold: self.threshold,
        }
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The fully resolved keyring of a role: key ID to key material, plus the
/// signature threshold. Cheap to clone; each role owns its copy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoleFullKeys {
    /// The authorized keys, keyed by key ID.
    pub keys: BTreeMap<String, Key>,
    /// The number of distinct valid signatures required.
    pub threshold: u64,
}

impl RoleFullKeys {
    /// Resolves a v0.6 `pubkeys` declaration, where every key ID doubles as
    /// the key material.
    pub fn from_pubkeys(pubkeys: &RolePubKeys) -> Self {
        Self {
            keys: pubkeys
                .pubkeys
                .iter()
                .map(|pk| (pk.clone(), Key::from_ed25519(pk.clone())))
                .collect(),
            threshold: pubkeys.threshold,
        }
    }

    /// Returns the keyid-based view of this keyring.
    pub fn to_role_keys(&self) -> RoleKeys {
        RoleKeys {
            keyids: self.keys.keys().cloned().collect(),
            threshold: self.threshold,
        }
    }
}
