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

//! The predicate vocabulary the per-kind rule sets are built from.

use serde_json::{Map, Value};

/// The record maps the rules run over.
pub type Record = Map<String, Value>;

/// Key is present and not null.
pub fn is_present(record: &Record, key: &str) -> bool {
    matches!(record.get(key), Some(value) if !value.is_null())
}

/// Key is present and equal to the given value.
pub fn has_value(record: &Record, key: &str, value: &Value) -> bool {
    is_present(record, key) && record.get(key) == Some(value)
}

/// Key is present and `true`.
pub fn is_true(record: &Record, key: &str) -> bool {
    has_value(record, key, &Value::Bool(true))
}

/// Key is a positive integer representable in the given number of bits.
pub fn is_positive_number(record: &Record, key: &str, bits: u32) -> bool {
    match record.get(key).and_then(Value::as_u64) {
        Some(value) => value >= 1 && value <= (1u64 << bits) - 1,
        None => false,
    }
}

/// Every key of the record belongs to the authorized set.
pub fn authorized_keys(record: &Record, keys: &[&str]) -> bool {
    record.keys().all(|key| keys.contains(&key.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("test record must be an object"),
        }
    }

    #[test]
    fn presence() {
        let r = record(json!({"name": "n1", "key": null}));
        assert!(is_present(&r, "name"));
        assert!(!is_present(&r, "key"));
        assert!(!is_present(&r, "missing"));
    }

    #[test]
    fn values() {
        let r = record(json!({"direct": true, "port": 7000}));
        assert!(is_true(&r, "direct"));
        assert!(has_value(&r, "port", &json!(7000)));
        assert!(!is_true(&r, "port"));
    }

    #[test]
    fn positive_numbers() {
        let r = record(json!({"ok": 65535, "zero": 0, "big": 65536, "str": "5"}));
        assert!(is_positive_number(&r, "ok", 16));
        assert!(!is_positive_number(&r, "zero", 16));
        assert!(!is_positive_number(&r, "big", 16));
        assert!(!is_positive_number(&r, "str", 16));
        assert!(is_positive_number(&r, "big", 32));
    }

    #[test]
    fn key_whitelist() {
        let r = record(json!({"name": "n1", "type": "sgx"}));
        assert!(authorized_keys(&r, &["name", "type", "host"]));
        assert!(!authorized_keys(&r, &["name"]));
    }
}
