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

//! Truncated SHA-256 digests, used for TrustZone key derivation.

use crate::CryptoError;
use ring::digest;

/// SHA-256 over `data`, truncated to `size` bytes (at most 32).
pub fn sha256(data: &[u8], size: usize) -> Result<Vec<u8>, CryptoError> {
    if size > 32 {
        return Err(CryptoError::BadDigestSize(size));
    }

    Ok(digest::digest(&digest::SHA256, data).as_ref()[..size].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn known_digests() {
        assert_eq!(
            hex::encode(sha256(b"", 32).expect("digest")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            hex::encode(sha256(b"abc", 32).expect("digest")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn truncation() {
        let full = sha256(b"abc", 32).expect("digest");
        let half = sha256(b"abc", 16).expect("digest");
        assert_eq!(half, &full[..16]);
        assert!(sha256(b"abc", 33).is_err());
    }
}
