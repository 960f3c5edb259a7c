//-
// Copyright (c) 2025, Briefbox developers
//
// This file is part of Briefbox.
//
// Briefbox is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Briefbox is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along
// with Briefbox. If not, see <http://www.gnu.org/licenses/>.

//! Crypto primitives: credential encryption at rest and token hashing.
//!
//! Mailbox credentials are sealed with AES-256-GCM under a single
//! process-wide master key. A sealed blob is `IV (12) || tag (16) ||
//! ciphertext`, base64-encoded for transport and storage. The IV is fresh
//! per encryption, so sealing the same plaintext twice yields distinct
//! blobs.
//!
//! Access tokens are never stored raw; only the SHA-256 of the raw token
//! (as 64 lowercase hex characters) ever reaches the database.

use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};
use rand::{rngs::OsRng, RngCore};

use crate::support::error::Error;

/// AES-256 key length.
const KEY_LEN: usize = 32;
/// GCM initialisation vector length (96 bits).
const IV_LEN: usize = 12;
/// GCM authentication tag length (128 bits).
const TAG_LEN: usize = 16;

/// The process-wide credential master key.
///
/// Loaded once at startup from configuration and injected into the services
/// that need it. The raw key bytes are deliberately not `Debug`.
#[derive(Clone)]
pub struct MasterKey {
    key: [u8; KEY_LEN],
}

impl MasterKey {
    /// Derive the key from its configured string form.
    ///
    /// A 64-character hex string decodes to the 32 key bytes directly; any
    /// other input is reduced to 32 bytes with SHA-256 so that ad-hoc
    /// passphrases still work in development.
    pub fn from_config(configured: &str) -> Self {
        let key = match unhex(configured) {
            Some(ref bytes) if KEY_LEN == bytes.len() => {
                let mut key = [0u8; KEY_LEN];
                key.copy_from_slice(bytes);
                key
            },
            _ => openssl::sha::sha256(configured.as_bytes()),
        };

        MasterKey { key }
    }

    /// Generate a random key and return its canonical 64-hex form.
    pub fn generate_hex() -> String {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        hex(&key)
    }

    /// Seal `plaintext` into a base64 blob.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, Error> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let mut tag = [0u8; TAG_LEN];
        let ciphertext = encrypt_aead(
            Cipher::aes_256_gcm(),
            &self.key,
            Some(&iv),
            &[],
            plaintext,
            &mut tag,
        )?;

        let mut blob = Vec::with_capacity(IV_LEN + TAG_LEN + ciphertext.len());
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&tag);
        blob.extend_from_slice(&ciphertext);
        Ok(base64::encode(&blob))
    }

    /// Open a blob produced by `encrypt()`.
    ///
    /// Malformed or truncated blobs fail with an encryption error;
    /// authentication failures surface as the underlying OpenSSL error.
    pub fn decrypt(&self, blob: &str) -> Result<Vec<u8>, Error> {
        let blob = base64::decode(blob)
            .map_err(|_| Error::Encryption("credential blob is not base64"))?;

        if blob.len() < IV_LEN + TAG_LEN + 1 {
            return Err(Error::Encryption("credential blob too short"));
        }

        let (iv, rest) = blob.split_at(IV_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        decrypt_aead(
            Cipher::aes_256_gcm(),
            &self.key,
            Some(iv),
            &[],
            ciphertext,
            tag,
        )
        .map_err(Into::into)
    }
}

/// SHA-256 of `bytes` as 64 lowercase hex characters.
///
/// Used for token hashes and attachment checksums alike.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex(&openssl::sha::sha256(bytes))
}

/// Generate a fresh opaque bearer token: 32 random bytes as 64 hex chars.
pub fn generate_token() -> String {
    let mut raw = [0u8; 32];
    OsRng.fill_bytes(&mut raw);
    hex(&raw)
}

/// The stored form of a token: SHA-256 of the raw wire form, 64 hex chars.
pub fn hash_token(raw: &str) -> String {
    sha256_hex(raw.as_bytes())
}

/// Compare two secrets without leaking their length or a mismatch position.
///
/// Both sides are hashed to equal-length digests first, then compared with
/// OpenSSL's timing-safe routine.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = openssl::sha::sha256(a.as_bytes());
    let b = openssl::sha::sha256(b.as_bytes());
    openssl::memcmp::eq(&a, &b)
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut s = String::with_capacity(2 * bytes.len());
    for byte in bytes {
        let _ = write!(s, "{:02x}", byte);
    }
    s
}

fn unhex(s: &str) -> Option<Vec<u8>> {
    if 0 != s.len() % 2 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    (0..s.len())
        .step_by(2)
        .map(|ix| u8::from_str_radix(&s[ix..ix + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let key = MasterKey::from_config("hunter2");
        let blob = key.encrypt(b"s3cret-password").unwrap();
        assert_eq!(b"s3cret-password".to_vec(), key.decrypt(&blob).unwrap());
    }

    #[test]
    fn fresh_iv_per_encryption() {
        let key = MasterKey::from_config("hunter2");
        let a = key.encrypt(b"same").unwrap();
        let b = key.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn bit_flips_fail_authentication() {
        let key = MasterKey::from_config("hunter2");
        let blob = key.encrypt(b"payload payload payload").unwrap();
        let mut raw = base64::decode(&blob).unwrap();

        for ix in 0..raw.len() {
            raw[ix] ^= 1;
            assert!(
                key.decrypt(&base64::encode(&raw)).is_err(),
                "bit flip at byte {} went unnoticed",
                ix
            );
            raw[ix] ^= 1;
        }
    }

    #[test]
    fn short_blobs_rejected() {
        let key = MasterKey::from_config("hunter2");
        assert_matches!(
            Err(crate::support::error::Error::Encryption(..)),
            key.decrypt("")
        );
        assert_matches!(
            Err(crate::support::error::Error::Encryption(..)),
            key.decrypt(&base64::encode(&[0u8; IV_LEN + TAG_LEN]))
        );
        assert_matches!(
            Err(crate::support::error::Error::Encryption(..)),
            key.decrypt("not/base64!!")
        );
    }

    #[test]
    fn wrong_key_fails() {
        let blob =
            MasterKey::from_config("hunter2").encrypt(b"secret").unwrap();
        assert!(MasterKey::from_config("hunter3").decrypt(&blob).is_err());
    }

    #[test]
    fn hex_key_decodes_directly() {
        let hex_key = MasterKey::generate_hex();
        assert_eq!(64, hex_key.len());

        // The same hex string must derive the same key both times.
        let a = MasterKey::from_config(&hex_key);
        let b = MasterKey::from_config(&hex_key);
        let blob = a.encrypt(b"x").unwrap();
        assert_eq!(b"x".to_vec(), b.decrypt(&blob).unwrap());
    }

    #[test]
    fn token_hash_shape() {
        let token = generate_token();
        assert_eq!(64, token.len());

        let digest = hash_token(&token);
        assert_eq!(64, digest.len());
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, digest);
    }

    #[test]
    fn constant_time_compare() {
        assert!(constant_time_eq("adminkey", "adminkey"));
        assert!(!constant_time_eq("adminkey", "adminkeX"));
        assert!(!constant_time_eq("adminkey", "longer-than-the-other"));
    }
}
