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

//! Per-kind validation rule sets, evaluated on raw records before typed
//! deserialization. Rules cover mandatory keys, mutual exclusion of
//! alternatives, key whitelists and the phase-dependent presence of
//! keys/nonces/ids.

use aex_rules_engine::predicates::*;
use aex_rules_engine::{enforce, rule, BrokenRules, Rule};

const NODE_TYPES: [&str; 5] = ["sancus", "sgx", "native", "nosgx", "trustzone"];
const MODULE_TYPES: [&str; 4] = ["sancus", "sgx", "native", "trustzone"];

fn type_of(record: &Record) -> &str {
    record.get("type").and_then(|v| v.as_str()).unwrap_or("")
}

/// Validate one node record.
pub fn check_node(record: &Record) -> Result<(), BrokenRules> {
    let mut rules = vec![
        rule("name not present", is_present(record, "name")),
        rule("host not present", is_present(record, "host")),
        rule(
            "reactive_port not a 16-bit port",
            is_positive_number(record, "reactive_port", 16),
        ),
        rule(
            "unknown node type",
            NODE_TYPES.contains(&type_of(record)),
        ),
    ];

    match type_of(record) {
        "sancus" => rules.extend(vec![
            rule(
                "vendor_id not a 16-bit id",
                is_positive_number(record, "vendor_id", 16),
            ),
            rule("vendor_key not present", is_present(record, "vendor_key")),
            rule(
                "only authorized keys",
                authorized_keys(
                    record,
                    &[
                        "type",
                        "name",
                        "host",
                        "reactive_port",
                        "deploy_port",
                        "vendor_id",
                        "vendor_key",
                    ],
                ),
            ),
        ]),
        "sgx" => rules.push(rule(
            "only authorized keys",
            authorized_keys(
                record,
                &[
                    "type",
                    "name",
                    "host",
                    "reactive_port",
                    "deploy_port",
                    "module_id",
                    "aesm_host",
                    "aesm_port",
                ],
            ),
        )),
        "native" | "nosgx" => rules.push(rule(
            "only authorized keys",
            authorized_keys(
                record,
                &[
                    "type",
                    "name",
                    "host",
                    "reactive_port",
                    "deploy_port",
                    "module_id",
                ],
            ),
        )),
        "trustzone" => rules.extend(vec![
            rule(
                "vendor_id not a 16-bit id",
                is_positive_number(record, "vendor_id", 16),
            ),
            rule(
                "at least one between node_key and vendor_key",
                is_present(record, "node_key") || is_present(record, "vendor_key"),
            ),
            rule(
                "only authorized keys",
                authorized_keys(
                    record,
                    &[
                        "type",
                        "name",
                        "host",
                        "reactive_port",
                        "deploy_port",
                        "vendor_id",
                        "node_key",
                        "vendor_key",
                        "module_id",
                    ],
                ),
            ),
        ]),
        _ => {}
    }

    enforce("node", &rules)
}

/// Validate one module record.
pub fn check_module(record: &Record) -> Result<(), BrokenRules> {
    let deployed = is_true(record, "deployed");

    let mut rules = vec![
        rule("name not present", is_present(record, "name")),
        rule("node not present", is_present(record, "node")),
        rule(
            "unknown module type",
            MODULE_TYPES.contains(&type_of(record)),
        ),
    ];

    match type_of(record) {
        "sancus" => rules.extend(vec![
            rule("files not present", is_present(record, "files")),
            rule(
                "id present ONLY after deployment",
                deployed == is_present(record, "id"),
            ),
            rule(
                "symtab present ONLY after deployment",
                deployed == is_present(record, "symtab"),
            ),
            rule(
                "only authorized keys",
                authorized_keys(
                    record,
                    &[
                        "type",
                        "name",
                        "node",
                        "old_node",
                        "priority",
                        "deployed",
                        "nonce",
                        "attested",
                        "files",
                        "cflags",
                        "ldflags",
                        "binary",
                        "id",
                        "symtab",
                        "key",
                        "deploy_name",
                    ],
                ),
            ),
        ]),
        "sgx" => rules.extend(vec![
            rule("vendor_key not present", is_present(record, "vendor_key")),
            rule("ra_settings not present", is_present(record, "ra_settings")),
            rule(
                "key present ONLY after attestation",
                is_true(record, "attested") == is_present(record, "key"),
            ),
            rule(
                "only authorized keys",
                authorized_keys(
                    record,
                    &[
                        "type",
                        "name",
                        "node",
                        "old_node",
                        "priority",
                        "deployed",
                        "nonce",
                        "attested",
                        "vendor_key",
                        "ra_settings",
                        "features",
                        "id",
                        "binary",
                        "sgxs",
                        "signature",
                        "key",
                        "data",
                        "folder",
                        "port",
                    ],
                ),
            ),
        ]),
        "native" => rules.push(rule(
            "only authorized keys",
            authorized_keys(
                record,
                &[
                    "type",
                    "name",
                    "node",
                    "old_node",
                    "priority",
                    "deployed",
                    "nonce",
                    "attested",
                    "features",
                    "id",
                    "binary",
                    "key",
                    "data",
                    "folder",
                    "port",
                ],
            ),
        )),
        "trustzone" => rules.extend(vec![
            rule(
                "uuid present ONLY after deployment",
                !deployed || is_present(record, "uuid"),
            ),
            rule(
                "only authorized keys",
                authorized_keys(
                    record,
                    &[
                        "type",
                        "name",
                        "node",
                        "old_node",
                        "priority",
                        "deployed",
                        "nonce",
                        "attested",
                        "binary",
                        "id",
                        "uuid",
                        "key",
                        "data",
                        "folder",
                    ],
                ),
            ),
        ]),
        _ => {}
    }

    enforce("module", &rules)
}

/// Validate one connection record.
pub fn check_connection(record: &Record) -> Result<(), BrokenRules> {
    let established = is_true(record, "established");

    let rules: Vec<Rule> = vec![
        rule("to_module not present", is_present(record, "to_module")),
        rule("encryption not present", is_present(record, "encryption")),
        rule(
            "either direct=True or from_module + from_{output, request}",
            is_true(record, "direct")
                != (is_present(record, "from_module")
                    && (is_present(record, "from_output") != is_present(record, "from_request"))),
        ),
        rule(
            "either one between to_input and to_handler",
            is_present(record, "to_input") != is_present(record, "to_handler"),
        ),
        rule(
            "direct or from_output->to_input or from_request->to_handler",
            is_true(record, "direct")
                || (is_present(record, "from_output") && is_present(record, "to_input"))
                || (is_present(record, "from_request") && is_present(record, "to_handler")),
        ),
        rule(
            "key present ONLY after establishment",
            established == is_present(record, "key"),
        ),
        rule(
            "nonce mandatory after establishment",
            !established || is_present(record, "nonce"),
        ),
        rule(
            "id mandatory after establishment",
            !established || is_present(record, "id"),
        ),
        rule(
            "name mandatory after establishment",
            !established || is_present(record, "name"),
        ),
        rule(
            "direct mandatory after establishment",
            !established || is_present(record, "direct"),
        ),
        rule(
            "from_module and to_module must be different",
            record.get("from_module") != record.get("to_module"),
        ),
        rule(
            "only authorized keys",
            authorized_keys(
                record,
                &[
                    "name",
                    "from_module",
                    "from_output",
                    "from_request",
                    "to_module",
                    "to_input",
                    "to_handler",
                    "encryption",
                    "key",
                    "id",
                    "direct",
                    "nonce",
                    "established",
                ],
            ),
        ),
    ];

    enforce("connection", &rules)
}

/// Validate one periodic event record.
pub fn check_periodic_event(record: &Record) -> Result<(), BrokenRules> {
    let rules = vec![
        rule("module not present", is_present(record, "module")),
        rule("entry not present", is_present(record, "entry")),
        rule(
            "frequency not a positive 32-bit number",
            is_positive_number(record, "frequency", 32),
        ),
        rule(
            "only authorized keys",
            authorized_keys(
                record,
                &["name", "id", "module", "entry", "frequency", "established"],
            ),
        ),
    ];

    enforce("periodic event", &rules)
}

/// Validate a manager record.
pub fn check_manager(record: &Record) -> Result<(), BrokenRules> {
    let rules = vec![
        rule("host not present", is_present(record, "host")),
        rule(
            "port not a 16-bit port",
            is_positive_number(record, "port", 16),
        ),
        rule("key not present", is_present(record, "key")),
        rule(
            "only authorized keys",
            authorized_keys(record, &["host", "port", "key"]),
        ),
    ];

    enforce("manager", &rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("test record must be an object"),
        }
    }

    #[test]
    fn valid_sgx_node_passes() {
        let r = record(json!({
            "type": "sgx",
            "name": "nA",
            "host": "127.0.0.1",
            "reactive_port": 7000,
            "deploy_port": 7001
        }));
        assert!(check_node(&r).is_ok());
    }

    #[test]
    fn sancus_node_requires_vendor_material() {
        let r = record(json!({
            "type": "sancus",
            "name": "n1",
            "host": "10.0.0.7",
            "reactive_port": 2001
        }));
        let err = check_node(&r).expect_err("vendor data missing");
        assert!(err.broken.contains(&"vendor_id not a 16-bit id".to_owned()));
        assert!(err.broken.contains(&"vendor_key not present".to_owned()));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let r = record(json!({
            "type": "native",
            "name": "n1",
            "host": "127.0.0.1",
            "reactive_port": 5000,
            "vendor_id": 1
        }));
        let err = check_node(&r).expect_err("vendor_id is not a native key");
        assert_eq!(err.broken, vec!["only authorized keys".to_owned()]);
    }

    #[test]
    fn fresh_connection_passes() {
        let r = record(json!({
            "from_module": "m1",
            "from_output": "out",
            "to_module": "m2",
            "to_input": "in",
            "encryption": "aes"
        }));
        assert!(check_connection(&r).is_ok());
    }

    #[test]
    fn direct_connection_excludes_from_endpoints() {
        let direct = record(json!({
            "direct": true,
            "to_module": "m2",
            "to_input": "in",
            "encryption": "aes"
        }));
        assert!(check_connection(&direct).is_ok());

        let both = record(json!({
            "direct": true,
            "from_module": "m1",
            "from_output": "out",
            "to_module": "m2",
            "to_input": "in",
            "encryption": "aes"
        }));
        assert!(check_connection(&both).is_err());
    }

    #[test]
    fn established_connection_requires_key_nonce_id() {
        let r = record(json!({
            "name": "conn0",
            "direct": true,
            "to_module": "m2",
            "to_input": "in",
            "encryption": "aes",
            "established": true
        }));
        let err = check_connection(&r).expect_err("missing key material");
        assert!(err
            .broken
            .contains(&"key present ONLY after establishment".to_owned()));
        assert!(err
            .broken
            .contains(&"nonce mandatory after establishment".to_owned()));
        assert!(err
            .broken
            .contains(&"id mandatory after establishment".to_owned()));
    }

    #[test]
    fn self_connection_is_rejected() {
        let r = record(json!({
            "from_module": "m1",
            "from_output": "out",
            "to_module": "m1",
            "to_input": "in",
            "encryption": "aes"
        }));
        let err = check_connection(&r).expect_err("loop to itself");
        assert!(err
            .broken
            .contains(&"from_module and to_module must be different".to_owned()));
    }

    #[test]
    fn event_frequency_must_be_positive() {
        let r = record(json!({"module": "m1", "entry": "tick", "frequency": 0}));
        assert!(check_periodic_event(&r).is_err());
        let r = record(json!({"module": "m1", "entry": "tick", "frequency": 500}));
        assert!(check_periodic_event(&r).is_ok());
    }

    #[test]
    fn manager_record_rules() {
        let r = record(json!({"host": "127.0.0.1", "port": 1300, "key": "abc"}));
        assert!(check_manager(&r).is_ok());
        let r = record(json!({"host": "127.0.0.1", "port": 1300}));
        assert!(check_manager(&r).is_err());
    }
}
