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

//! Spongent-128 authenticated encryption.
//!
//! SPONGENT-128/128/8: a 136-bit state permuted over 70 rounds, duplexed one
//! byte at a time in the SpongeWrap mode. The MSP430-class enclaves use this
//! cipher in hardware; the deployer needs a software twin to wrap connection
//! keys and verify module MACs.

use crate::{check_key, CryptoError, KEY_SIZE, TAG_SIZE};

const STATE_BYTES: usize = 17;
const ROUNDS: usize = 70;
const LFSR_IV: u8 = 0x7a;

const SBOX: [u8; 16] = [
    0xe, 0xd, 0xb, 0x0, 0x2, 0x1, 0x4, 0xf, 0x7, 0xa, 0x8, 0x5, 0x9, 0xc, 0x3, 0x6,
];

fn lfsr_step(lfsr: u8) -> u8 {
    ((lfsr << 1) | (((lfsr >> 6) ^ (lfsr >> 5)) & 1)) & 0x7f
}

fn sbox_layer(state: &mut [u8; STATE_BYTES]) {
    for byte in state.iter_mut() {
        *byte = (SBOX[(*byte >> 4) as usize] << 4) | SBOX[(*byte & 0xf) as usize];
    }
}

// Bit j moves to j * b/4 mod (b - 1); the last bit is fixed.
fn p_layer(state: &mut [u8; STATE_BYTES]) {
    let mut out = [0u8; STATE_BYTES];
    for j in 0..136 {
        let dest = if j == 135 { 135 } else { (j * 34) % 135 };
        let bit = (state[j / 8] >> (j % 8)) & 1;
        out[dest / 8] |= bit << (dest % 8);
    }
    *state = out;
}

fn permute(state: &mut [u8; STATE_BYTES]) {
    let mut lfsr = LFSR_IV;
    for _ in 0..ROUNDS {
        state[0] ^= lfsr;
        state[STATE_BYTES - 1] ^= lfsr.reverse_bits();
        sbox_layer(state);
        p_layer(state);
        lfsr = lfsr_step(lfsr);
    }
}

/// Duplex object over the Spongent permutation, one data byte per call plus
/// a frame bit for the SpongeWrap domain separation.
struct Duplex {
    state: [u8; STATE_BYTES],
}

impl Duplex {
    fn new() -> Duplex {
        Duplex {
            state: [0u8; STATE_BYTES],
        }
    }

    fn duplexing(&mut self, block: Option<u8>, frame: bool) -> u8 {
        if let Some(byte) = block {
            self.state[0] ^= byte;
        }

        // Second byte takes the padding bit, the frame bit and the
        // block-present marker, so empty and zero blocks stay distinct.
        let mut marker = 0x01u8;
        if frame {
            marker |= 0x02;
        }
        if block.is_some() {
            marker |= 0x04;
        }
        self.state[1] ^= marker;

        permute(&mut self.state);
        self.state[0]
    }

    fn absorb_key(&mut self, key: &[u8]) {
        for (i, byte) in key.iter().enumerate() {
            self.duplexing(Some(*byte), i != key.len() - 1);
        }
    }

    fn absorb_ad(&mut self, ad: &[u8]) -> u8 {
        if ad.is_empty() {
            return self.duplexing(None, true);
        }

        let mut keystream = 0;
        for (i, byte) in ad.iter().enumerate() {
            keystream = self.duplexing(Some(*byte), i == ad.len() - 1);
        }
        keystream
    }

    fn squeeze_tag(&mut self, first: u8) -> [u8; TAG_SIZE] {
        let mut tag = [0u8; TAG_SIZE];
        tag[0] = first;
        for byte in tag.iter_mut().skip(1) {
            *byte = self.duplexing(None, false);
        }
        tag
    }
}

/// Encrypt and authenticate `data` under `key`, binding `ad` into the tag.
/// Returns ciphertext with the 16-byte tag appended.
pub fn wrap(key: &[u8], ad: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_key(key)?;

    let mut duplex = Duplex::new();
    duplex.absorb_key(key);
    let mut keystream = duplex.absorb_ad(ad);

    let mut output = Vec::with_capacity(data.len() + TAG_SIZE);
    for (i, byte) in data.iter().enumerate() {
        output.push(*byte ^ keystream);
        keystream = duplex.duplexing(Some(*byte), i != data.len() - 1);
    }
    if data.is_empty() {
        keystream = duplex.duplexing(None, false);
    }

    output.extend_from_slice(&duplex.squeeze_tag(keystream));
    Ok(output)
}

/// Verify the trailing tag and decrypt. The plaintext is only released when
/// the tag matches.
pub fn unwrap(key: &[u8], ad: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    check_key(key)?;

    if data.len() < TAG_SIZE {
        return Err(CryptoError::TruncatedCiphertext(data.len()));
    }
    let (cipher, tag) = data.split_at(data.len() - TAG_SIZE);

    let mut duplex = Duplex::new();
    duplex.absorb_key(key);
    let mut keystream = duplex.absorb_ad(ad);

    let mut plain = Vec::with_capacity(cipher.len());
    for (i, byte) in cipher.iter().enumerate() {
        let decrypted = *byte ^ keystream;
        plain.push(decrypted);
        keystream = duplex.duplexing(Some(decrypted), i != cipher.len() - 1);
    }
    if cipher.is_empty() {
        keystream = duplex.duplexing(None, false);
    }

    if duplex.squeeze_tag(keystream)[..] != *tag {
        return Err(CryptoError::BadTag);
    }

    Ok(plain)
}

/// Authentication tag over `ad` alone.
pub fn mac(key: &[u8], ad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    wrap(key, ad, &[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn permutation_diffuses() {
        let mut zero = [0u8; STATE_BYTES];
        permute(&mut zero);
        assert_ne!(zero, [0u8; STATE_BYTES]);

        // One flipped input bit must change the output state
        let mut flipped = [0u8; STATE_BYTES];
        flipped[8] = 0x10;
        permute(&mut flipped);
        assert_ne!(flipped, zero);
    }

    #[test]
    fn wrap_round_trips() {
        let key = [0x42u8; KEY_SIZE];
        let ad = [0x00, 0x07];
        let body = b"connection key material";

        let cipher = wrap(&key, &ad, body).expect("wrap");
        assert_eq!(cipher.len(), body.len() + TAG_SIZE);
        assert_ne!(&cipher[..body.len()], &body[..]);
        assert_eq!(unwrap(&key, &ad, &cipher).expect("unwrap"), body);
    }

    #[test]
    fn tag_binds_ad_and_key() {
        let key = [0x42u8; KEY_SIZE];
        let cipher = wrap(&key, &[0, 1], b"payload").expect("wrap");

        assert_eq!(unwrap(&key, &[0, 2], &cipher), Err(CryptoError::BadTag));
        assert_eq!(
            unwrap(&[0x43u8; KEY_SIZE], &[0, 1], &cipher),
            Err(CryptoError::BadTag)
        );

        let mut tampered = cipher;
        tampered[2] ^= 1;
        assert_eq!(unwrap(&key, &[0, 1], &tampered), Err(CryptoError::BadTag));
    }

    #[test]
    fn empty_bodies_and_ad() {
        let key = [0x01u8; KEY_SIZE];

        let tag_only = wrap(&key, b"ad", &[]).expect("wrap");
        assert_eq!(tag_only.len(), TAG_SIZE);
        assert_eq!(unwrap(&key, b"ad", &tag_only).expect("unwrap"), b"");

        let no_ad = wrap(&key, &[], b"x").expect("wrap");
        assert_eq!(unwrap(&key, &[], &no_ad).expect("unwrap"), b"x");

        // MAC of ad differs from MAC of the empty string
        assert_ne!(mac(&key, b"ad").expect("mac"), mac(&key, b"").expect("mac"));
    }
}
