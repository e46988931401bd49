// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Image digest and signature checking.

use drv_ota_api::SignatureError;
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use p256::ecdsa::{Signature, VerifyingKey};
use sha2::{Digest, Sha256};

pub const DIGEST_LEN: usize = 32;

/// Length of a raw `r || s` P-256 signature.
const RAW_SIGNATURE_LEN: usize = 64;

pub trait ImageDigest {
    fn digest(&mut self, image: &[u8])
        -> Result<[u8; DIGEST_LEN], SignatureError>;
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Sha256Digest;

impl ImageDigest for Sha256Digest {
    fn digest(
        &mut self,
        image: &[u8],
    ) -> Result<[u8; DIGEST_LEN], SignatureError> {
        Ok(Sha256::digest(image).into())
    }
}

pub trait SignatureVerifier {
    /// Checks `signature` over `digest` with the key stored under
    /// `key_label`.
    fn verify(
        &self,
        key_label: &str,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<(), SignatureError>;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KeyringError {
    BadKey,
    Full,
}

/// Up to `N` P-256 public keys, looked up by label.
///
/// Signatures are accepted either raw (64 bytes, `r || s`) or DER encoded.
pub struct P256Keyring<const N: usize> {
    keys: heapless::Vec<(&'static str, VerifyingKey), N>,
}

impl<const N: usize> Default for P256Keyring<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> P256Keyring<N> {
    pub fn new() -> Self {
        Self {
            keys: heapless::Vec::new(),
        }
    }

    /// Adds a key in SEC1 encoding, replacing any key with the same label.
    pub fn insert_sec1(
        &mut self,
        label: &'static str,
        sec1: &[u8],
    ) -> Result<(), KeyringError> {
        let key = VerifyingKey::from_sec1_bytes(sec1)
            .map_err(|_| KeyringError::BadKey)?;
        self.insert(label, key)
    }

    pub fn insert(
        &mut self,
        label: &'static str,
        key: VerifyingKey,
    ) -> Result<(), KeyringError> {
        if let Some(slot) = self.keys.iter_mut().find(|(l, _)| *l == label) {
            slot.1 = key;
            return Ok(());
        }
        self.keys
            .push((label, key))
            .map_err(|_| KeyringError::Full)
    }

    fn find(&self, label: &str) -> Option<&VerifyingKey> {
        self.keys.iter().find(|(l, _)| *l == label).map(|(_, k)| k)
    }
}

impl<const N: usize> SignatureVerifier for P256Keyring<N> {
    fn verify(
        &self,
        key_label: &str,
        digest: &[u8],
        signature: &[u8],
    ) -> Result<(), SignatureError> {
        let key = self.find(key_label).ok_or(SignatureError::KeyNotFound)?;
        if digest.len() != DIGEST_LEN {
            return Err(SignatureError::DigestFailed);
        }
        let sig = if signature.len() == RAW_SIGNATURE_LEN {
            Signature::from_slice(signature)
        } else {
            Signature::from_der(signature)
        }
        .map_err(|_| SignatureError::Malformed)?;

        key.verify_prehash(digest, &sig)
            .map_err(|_| SignatureError::BadSignature)
    }
}
