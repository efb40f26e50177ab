// Copyright (c) The Taipan Project Developers.
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cryptographic primitives used by the trust engine and the package
//! pipeline: Ed25519 signatures (including the PGP v4 hashed variant used by
//! channel signing tools), file digests, and the hex/base64 codecs.
//!
//! Conversion failures during signature verification never escape as errors;
//! they demote to "signature invalid" so that a single malformed signature
//! cannot abort an otherwise sufficient tally.

use crate::error::{self, Result};
use crate::CancelToken;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::Md5;
use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{self, Ed25519KeyPair, KeyPair};
use sha2::{Digest, Sha256};
use snafu::ResultExt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Size in bytes of an Ed25519 public or secret key.
pub const ED25519_KEY_SIZE: usize = 32;

/// Size in bytes of an Ed25519 signature.
pub const ED25519_SIG_SIZE: usize = 64;

/// Size in bytes of a SHA-256 digest.
pub const SHA256_SIZE: usize = 32;

/// Generates a fresh Ed25519 keypair, returned as `(public, secret)` raw
/// bytes.
pub fn generate_ed25519_keypair() -> Result<([u8; ED25519_KEY_SIZE], [u8; ED25519_KEY_SIZE])> {
    let rng = SystemRandom::new();
    let mut seed = [0_u8; ED25519_KEY_SIZE];
    rng.fill(&mut seed).map_err(|_| {
        error::CryptoSnafu {
            reason: "failed to gather randomness for key generation",
        }
        .build()
    })?;
    let key_pair = Ed25519KeyPair::from_seed_unchecked(&seed).map_err(|_| {
        error::CryptoSnafu {
            reason: "failed to derive an ed25519 key pair",
        }
        .build()
    })?;
    let mut pk = [0_u8; ED25519_KEY_SIZE];
    pk.copy_from_slice(key_pair.public_key().as_ref());
    Ok((pk, seed))
}

/// Generates a fresh Ed25519 keypair, returned as `(public, secret)` hex
/// strings.
pub fn generate_ed25519_keypair_hex() -> Result<(String, String)> {
    let (pk, sk) = generate_ed25519_keypair()?;
    Ok((hex::encode(pk), hex::encode(sk)))
}

/// Signs `data` with a raw Ed25519 secret key.
pub fn sign(data: &[u8], sk: &[u8; ED25519_KEY_SIZE]) -> Result<[u8; ED25519_SIG_SIZE]> {
    let key_pair = Ed25519KeyPair::from_seed_unchecked(sk).map_err(|_| {
        error::CryptoSnafu {
            reason: "failed to read the secret key during the signing step",
        }
        .build()
    })?;
    let mut sig = [0_u8; ED25519_SIG_SIZE];
    sig.copy_from_slice(key_pair.sign(data).as_ref());
    Ok(sig)
}

/// Signs `data` with a hex-encoded secret key, returning the hex signature.
pub fn sign_hex(data: &[u8], sk_hex: &str) -> Result<String> {
    let sk = decode_exact::<ED25519_KEY_SIZE>(sk_hex).ok_or_else(|| {
        error::EncodingSnafu {
            reason: format!("invalid secret key '{sk_hex}'"),
        }
        .build()
    })?;
    Ok(hex::encode(sign(data, &sk)?))
}

/// Verifies an Ed25519 signature over `data`.
pub fn verify(data: &[u8], pk: &[u8; ED25519_KEY_SIZE], sig: &[u8; ED25519_SIG_SIZE]) -> bool {
    signature::UnparsedPublicKey::new(&signature::ED25519, pk)
        .verify(data, sig)
        .is_ok()
}

/// Verifies a hex-encoded Ed25519 signature over `data`. Malformed hex input
/// counts as an invalid signature.
pub fn verify_hex(data: &[u8], pk_hex: &str, sig_hex: &str) -> bool {
    let Some(pk) = decode_exact::<ED25519_KEY_SIZE>(pk_hex) else {
        log::debug!("invalid public key '{pk_hex}'");
        return false;
    };
    let Some(sig) = decode_exact::<ED25519_SIG_SIZE>(sig_hex) else {
        log::debug!("invalid signature '{sig_hex}' for public key '{pk_hex}'");
        return false;
    };
    verify(data, &pk, &sig)
}

/// Verifies a signature produced through the PGP v4 hashing convention.
///
/// The signed digest is `SHA-256(data || trailer || 0x04 0xFF || len)` where
/// `trailer` is the hex-decoded v4 trailer and `len` is its byte length as a
/// 4-byte big-endian integer. The digest itself is then verified as the
/// Ed25519 message.
pub fn verify_gpg(data: &[u8], pgp_v4_trailer_hex: &str, pk_hex: &str, sig_hex: &str) -> bool {
    let Some(pk) = decode_exact::<ED25519_KEY_SIZE>(pk_hex) else {
        log::debug!("invalid public key '{pk_hex}'");
        return false;
    };
    let Some(sig) = decode_exact::<ED25519_SIG_SIZE>(sig_hex) else {
        log::debug!("invalid signature '{sig_hex}' for public key '{pk_hex}'");
        return false;
    };
    let Ok(trailer) = hex::decode(pgp_v4_trailer_hex) else {
        log::debug!("invalid PGP v4 trailer '{pgp_v4_trailer_hex}'");
        return false;
    };

    #[allow(clippy::cast_possible_truncation)]
    let trailer_len = (trailer.len() as u32).to_be_bytes();

    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.update(&trailer);
    hasher.update([0x04, 0xff]);
    hasher.update(trailer_len);
    let digest = hasher.finalize();

    verify_hashed_msg(&digest, &pk, &sig)
}

/// Verifies an Ed25519 signature whose message is a pre-computed SHA-256
/// digest.
fn verify_hashed_msg(
    digest: &[u8],
    pk: &[u8; ED25519_KEY_SIZE],
    sig: &[u8; ED25519_SIG_SIZE],
) -> bool {
    debug_assert_eq!(digest.len(), SHA256_SIZE);
    signature::UnparsedPublicKey::new(&signature::ED25519, pk)
        .verify(digest, sig)
        .is_ok()
}

/// Returns the hex-encoded SHA-256 digest of the file at `path`.
pub fn sha256_file(path: &Path) -> Result<String> {
    file_digest_hex::<Sha256>(path, None)
}

/// Returns the hex-encoded MD5 digest of the file at `path`.
pub fn md5_file(path: &Path) -> Result<String> {
    file_digest_hex::<Md5>(path, None)
}

/// Like [`sha256_file`], checking `cancel` between blocks.
pub(crate) fn sha256_file_cancellable(path: &Path, cancel: &CancelToken) -> Result<String> {
    file_digest_hex::<Sha256>(path, Some(cancel))
}

/// Like [`md5_file`], checking `cancel` between blocks.
pub(crate) fn md5_file_cancellable(path: &Path, cancel: &CancelToken) -> Result<String> {
    file_digest_hex::<Md5>(path, Some(cancel))
}

fn file_digest_hex<D: Digest>(path: &Path, cancel: Option<&CancelToken>) -> Result<String> {
    let mut file = File::open(path).context(error::FileReadSnafu { path })?;
    let mut hasher = D::new();
    let mut buf = [0; 8 * 1024];
    loop {
        if let Some(cancel) = cancel {
            cancel.check()?;
        }
        match file.read(&mut buf).context(error::FileReadSnafu { path })? {
            0 => break,
            n => hasher.update(&buf[..n]),
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Decodes hex input, failing on odd-length or non-hex characters.
pub fn hex_decode(input: &str) -> Result<Vec<u8>> {
    hex::decode(input).map_err(|e| {
        error::EncodingSnafu {
            reason: format!("'{input}' is not valid hex: {e}"),
        }
        .build()
    })
}

/// Encodes bytes as lowercase hex.
pub fn hex_encode(input: &[u8]) -> String {
    hex::encode(input)
}

/// Decodes standard base64 input.
pub fn base64_decode(input: &str) -> Result<Vec<u8>> {
    BASE64.decode(input).map_err(|e| {
        error::EncodingSnafu {
            reason: format!("'{input}' is not valid base64: {e}"),
        }
        .build()
    })
}

/// Encodes bytes as standard base64.
pub fn base64_encode(input: &[u8]) -> String {
    BASE64.encode(input)
}

/// Decodes a hex string into a fixed-size array, or `None` if the input is
/// malformed or the wrong length.
fn decode_exact<const N: usize>(input: &str) -> Option<[u8; N]> {
    let bytes = hex::decode(input).ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn keypair_signs_and_verifies() {
        let (pk, sk) = generate_ed25519_keypair().unwrap();
        let sig = sign(b"some signed bytes", &sk).unwrap();
        assert!(verify(b"some signed bytes", &pk, &sig));
        assert!(!verify(b"some tampered bytes", &pk, &sig));
    }

    #[test]
    fn hex_variants_round_trip() {
        let (pk_hex, sk_hex) = generate_ed25519_keypair_hex().unwrap();
        let sig_hex = sign_hex(b"payload", &sk_hex).unwrap();
        assert!(verify_hex(b"payload", &pk_hex, &sig_hex));
        assert!(!verify_hex(b"payload2", &pk_hex, &sig_hex));
    }

    #[test]
    fn malformed_hex_input_is_an_invalid_signature() {
        let (pk_hex, sk_hex) = generate_ed25519_keypair_hex().unwrap();
        let sig_hex = sign_hex(b"payload", &sk_hex).unwrap();
        // Odd-length and non-hex inputs must not panic or error out.
        assert!(!verify_hex(b"payload", &pk_hex, &sig_hex[1..]));
        assert!(!verify_hex(b"payload", "zz", &sig_hex));
        assert!(!verify_hex(b"payload", &pk_hex, "abc"));
    }

    #[test]
    fn gpg_trailer_path_verifies() {
        let (pk_hex, sk_hex) = generate_ed25519_keypair_hex().unwrap();
        let data = b"signed index excerpt";
        let trailer_hex = "04001608001d162104d4c8";

        // Reproduce the hashing convention to build the reference signature.
        let trailer = hex::decode(trailer_hex).unwrap();
        let mut hasher = Sha256::new();
        hasher.update(data);
        hasher.update(&trailer);
        hasher.update([0x04, 0xff]);
        hasher.update((trailer.len() as u32).to_be_bytes());
        let digest = hasher.finalize();
        let sig_hex = sign_hex(&digest, &sk_hex).unwrap();

        assert!(verify_gpg(data, trailer_hex, &pk_hex, &sig_hex));
        assert!(!verify_gpg(b"flipped", trailer_hex, &pk_hex, &sig_hex));
        assert!(!verify_gpg(data, "04001608001d162104d4c9", &pk_hex, &sig_hex));
        let mut bad_sig = sig_hex.clone().into_bytes();
        bad_sig[0] = if bad_sig[0] == b'a' { b'b' } else { b'a' };
        assert!(!verify_gpg(data, trailer_hex, &pk_hex, &String::from_utf8(bad_sig).unwrap()));
        // An odd-length trailer cannot be decoded and must fail closed.
        assert!(!verify_gpg(data, "04f", &pk_hex, &sig_hex));
    }

    #[test]
    fn file_digests() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        assert_eq!(
            sha256_file(file.path()).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(
            md5_file(file.path()).unwrap(),
            "5d41402abc4b2a76b9719d911017c592"
        );
    }

    #[test]
    fn hex_codec_rejects_odd_length() {
        assert_eq!(hex_decode("0a0b").unwrap(), vec![0x0a, 0x0b]);
        assert!(hex_decode("0a0").is_err());
        assert!(hex_decode("0g").is_err());
        assert_eq!(hex_encode(&[0xde, 0xad]), "dead");
    }

    #[test]
    fn base64_codec_round_trips() {
        let data: Vec<u8> = (0..=255).collect();
        assert_eq!(base64_decode(&base64_encode(&data)).unwrap(), data);
        assert!(base64_decode("not base64!").is_err());
    }
}
