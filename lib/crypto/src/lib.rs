//  Copyright (C) 2020-2022  The Authentic Execution developers.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Authenticated encryption suites of the Authentic Execution protocol.
//!
//! Two AEAD suites are negotiated per connection and per module: AES-GCM-128
//! and Spongent-128. Both use 16-byte keys and 16-byte tags appended to the
//! ciphertext; message freshness comes from the 16-bit nonces bound into the
//! associated data, so no separate IV travels on the wire.

#![deny(
    missing_docs,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces
)]

mod aes;
mod hash;
pub mod spongent;

pub use hash::sha256;

use failure::Fail;
use rand::RngCore;

/// Key size shared by both suites, in bytes.
pub const KEY_SIZE: usize = 16;

/// Tag size shared by both suites, in bytes.
pub const TAG_SIZE: usize = 16;

/// Crypto suite errors.
#[derive(Debug, Clone, PartialEq, Eq, Fail)]
pub enum CryptoError {
    /// Wrong key length for the selected suite
    #[fail(display = "bad key size {} (expected {})", _0, _1)]
    BadKeySize(usize, usize),
    /// Ciphertext too short to even hold the tag
    #[fail(display = "ciphertext of {} bytes is shorter than the tag", _0)]
    TruncatedCiphertext(usize),
    /// The authentication tag did not verify
    #[fail(display = "decryption failed: bad authentication tag")]
    BadTag,
    /// Requested digest length exceeds the hash output
    #[fail(display = "SHA-256 cannot compute digests with length {}", _0)]
    BadDigestSize(usize),
    /// Unknown encryption name in a descriptor
    #[fail(display = "no matching encryption type for {}", _0)]
    UnknownEncryption(String),
    /// Unknown encryption discriminant on the wire
    #[fail(display = "no matching encryption type for code {}", _0)]
    UnknownEncryptionCode(u8),
    /// The underlying AEAD refused to seal (oversized input)
    #[fail(display = "encryption failed")]
    SealFailed,
}

/// AEAD suite selector, as negotiated in deployment descriptors and bound
/// into the SetKey associated data.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Encryption {
    /// AES-GCM-128
    Aes,
    /// Spongent-128 SpongeWrap
    Spongent,
}

impl Encryption {
    /// Wire discriminant of the suite
    pub fn to_u8(self) -> u8 {
        match self {
            Encryption::Aes => 0x0,
            Encryption::Spongent => 0x1,
        }
    }

    /// Suite from its wire discriminant
    pub fn from_u8(value: u8) -> Result<Encryption, CryptoError> {
        match value {
            0x0 => Ok(Encryption::Aes),
            0x1 => Ok(Encryption::Spongent),
            other => Err(CryptoError::UnknownEncryptionCode(other)),
        }
    }

    /// Descriptor name of the suite
    pub fn to_str(self) -> &'static str {
        match self {
            Encryption::Aes => "aes",
            Encryption::Spongent => "spongent",
        }
    }

    /// Key size of the suite, in bytes
    pub fn key_size(self) -> usize {
        KEY_SIZE
    }

    /// Encrypt and authenticate `data`, binding `ad` into the tag. Returns
    /// ciphertext with the tag appended.
    pub fn encrypt(self, key: &[u8], ad: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Encryption::Aes => aes::encrypt(key, ad, data),
            Encryption::Spongent => spongent::wrap(key, ad, data),
        }
    }

    /// Verify the trailing tag under `ad` and decrypt. Fails only on a tag
    /// mismatch or malformed input.
    pub fn decrypt(self, key: &[u8], ad: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Encryption::Aes => aes::decrypt(key, ad, data),
            Encryption::Spongent => spongent::unwrap(key, ad, data),
        }
    }

    /// Authentication tag over `ad` alone (AEAD with empty plaintext).
    pub fn mac(self, key: &[u8], ad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.encrypt(key, ad, &[])
    }
}

impl std::str::FromStr for Encryption {
    type Err = CryptoError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_lowercase().as_str() {
            "aes" => Ok(Encryption::Aes),
            "spongent" => Ok(Encryption::Spongent),
            other => Err(CryptoError::UnknownEncryption(other.to_owned())),
        }
    }
}

impl std::fmt::Display for Encryption {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

impl serde::Serialize for Encryption {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.to_str())
    }
}

impl<'de> serde::Deserialize<'de> for Encryption {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// Generate `length` random bytes (connection keys, challenges).
pub fn generate_key(length: usize) -> Vec<u8> {
    let mut key = vec![0u8; length];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

pub(crate) fn check_key(key: &[u8]) -> Result<(), CryptoError> {
    if key.len() == KEY_SIZE {
        Ok(())
    } else {
        Err(CryptoError::BadKeySize(key.len(), KEY_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn encryption_names_round_trip() {
        for enc in &[Encryption::Aes, Encryption::Spongent] {
            assert_eq!(enc.to_str().parse::<Encryption>().expect("parse"), *enc);
            assert_eq!(Encryption::from_u8(enc.to_u8()).expect("from_u8"), *enc);
        }
        assert!("chacha".parse::<Encryption>().is_err());
        assert!(Encryption::from_u8(7).is_err());
    }

    #[test]
    fn both_suites_round_trip() {
        let key = generate_key(KEY_SIZE);
        let ad = [0u8, 3];
        let data = b"state dump";

        for enc in &[Encryption::Aes, Encryption::Spongent] {
            let cipher = enc.encrypt(&key, &ad, data).expect("encrypt");
            assert_eq!(cipher.len(), data.len() + TAG_SIZE);
            let plain = enc.decrypt(&key, &ad, &cipher).expect("decrypt");
            assert_eq!(plain, data);

            // Tag is bound to the associated data
            assert_eq!(
                enc.decrypt(&key, &[0u8, 4], &cipher),
                Err(CryptoError::BadTag)
            );
        }
    }

    #[test]
    fn mac_is_a_tag_over_empty_plaintext() {
        let key = generate_key(KEY_SIZE);
        for enc in &[Encryption::Aes, Encryption::Spongent] {
            let mac = enc.mac(&key, b"challenge").expect("mac");
            assert_eq!(mac.len(), TAG_SIZE);
            assert_eq!(mac, enc.encrypt(&key, b"challenge", &[]).expect("encrypt"));
        }
    }

    #[test]
    fn wrong_key_size_is_rejected() {
        let err = Encryption::Aes.encrypt(&[0u8; 12], &[], &[]).unwrap_err();
        assert_eq!(err, CryptoError::BadKeySize(12, KEY_SIZE));
        let err = Encryption::Spongent.encrypt(&[0u8; 32], &[], &[]).unwrap_err();
        assert_eq!(err, CryptoError::BadKeySize(32, KEY_SIZE));
    }
}
