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

//! AES-GCM-128 with a fixed all-zero nonce. Freshness comes from the 16-bit
//! message nonce carried inside the associated data, which is never reused
//! for the same key.

use crate::{check_key, CryptoError, TAG_SIZE};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};

const ZERO_NONCE: [u8; 12] = [0u8; 12];

fn aead_key(key: &[u8]) -> Result<LessSafeKey, CryptoError> {
    check_key(key)?;
    let unbound =
        UnboundKey::new(&AES_128_GCM, key).map_err(|_| CryptoError::BadKeySize(key.len(), 16))?;
    Ok(LessSafeKey::new(unbound))
}

pub(crate) fn encrypt(key: &[u8], ad: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let key = aead_key(key)?;
    let mut in_out = data.to_vec();

    let tag = key
        .seal_in_place_separate_tag(
            Nonce::assume_unique_for_key(ZERO_NONCE),
            Aad::from(ad),
            &mut in_out,
        )
        .map_err(|_| CryptoError::SealFailed)?;

    in_out.extend_from_slice(tag.as_ref());
    Ok(in_out)
}

pub(crate) fn decrypt(key: &[u8], ad: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < TAG_SIZE {
        return Err(CryptoError::TruncatedCiphertext(data.len()));
    }

    let key = aead_key(key)?;
    let mut in_out = data.to_vec();

    let plain = key
        .open_in_place(
            Nonce::assume_unique_for_key(ZERO_NONCE),
            Aad::from(ad),
            &mut in_out,
        )
        .map_err(|_| CryptoError::BadTag)?;

    Ok(plain.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // NIST GCM test vectors for a zero key and zero 96-bit IV.
    #[test]
    fn empty_plaintext_known_answer() {
        let tag = encrypt(&[0u8; 16], &[], &[]).expect("encrypt");
        assert_eq!(hex::encode(&tag), "58e2fccefa7e3061367f1d57a4e7455a");
    }

    #[test]
    fn zero_block_known_answer() {
        let cipher = encrypt(&[0u8; 16], &[], &[0u8; 16]).expect("encrypt");
        assert_eq!(
            hex::encode(&cipher),
            "0388dace60b6a392f328c2b971b2fe78ab6fa0d573255c614fdbeaab71e282ab"
        );
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = [7u8; 16];
        let mut cipher = encrypt(&key, &[0, 1], b"payload").expect("encrypt");
        cipher[0] ^= 0x80;
        assert_eq!(decrypt(&key, &[0, 1], &cipher), Err(CryptoError::BadTag));
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        assert_eq!(
            decrypt(&[7u8; 16], &[], &[0u8; 5]),
            Err(CryptoError::TruncatedCiphertext(5))
        );
    }
}
