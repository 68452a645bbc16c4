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

//! Serde helpers for the hex-encoded byte fields of deployment descriptors.

/// Hex-encoded `Vec<u8>`, for use with `#[serde(with = "hexser::bytes")]`.
pub mod bytes {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize bytes as a lowercase hex string
    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    /// Deserialize bytes from a hex string
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let string = String::deserialize(deserializer)?;
        hex::decode(&string).map_err(D::Error::custom)
    }
}

/// Hex-encoded `Option<Vec<u8>>`, for use with
/// `#[serde(with = "hexser::opt_bytes")]`.
pub mod opt_bytes {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize optional bytes as a hex string or null
    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize optional bytes from a hex string or null
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(string) => hex::decode(&string).map(Some).map_err(D::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_derive::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        #[serde(with = "crate::hexser::bytes")]
        key: Vec<u8>,
        #[serde(with = "crate::hexser::opt_bytes", default)]
        extra: Option<Vec<u8>>,
    }

    #[test]
    fn round_trip() {
        let record = Record {
            key: vec![0xde, 0xad, 0xbe, 0xef],
            extra: Some(vec![0x01]),
        };
        let json = serde_json::to_string(&record).expect("serialize");
        assert_eq!(json, r#"{"key":"deadbeef","extra":"01"}"#);
        let back: Record = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, record);
    }

    #[test]
    fn absent_optional_field() {
        let back: Record = serde_json::from_str(r#"{"key":""}"#).expect("deserialize");
        assert_eq!(back.key, Vec::<u8>::new());
        assert_eq!(back.extra, None);
    }

    #[test]
    fn bad_hex_is_rejected() {
        assert!(serde_json::from_str::<Record>(r#"{"key":"zz"}"#).is_err());
    }
}
