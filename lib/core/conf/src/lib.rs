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

//! Deployment descriptor records, I/O and validation rules.
//!
//! A deployment descriptor is one JSON or YAML document describing nodes,
//! modules, connections and periodic events. Records are validated against
//! the per-kind rule sets before they are deserialized, and the whole
//! document is rewritten (with keys, ids and lifecycle flags added) after
//! every successful command.

#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces
)]

#[macro_use]
extern crate serde_derive;

pub mod descriptor;
pub mod records;
pub mod rules;

pub use descriptor::DescriptorType;
pub use records::*;

use aex_rules_engine::BrokenRules;
use failure::Fail;
use serde_json::Value;

/// Descriptor handling errors.
#[derive(Debug, Fail)]
pub enum DescriptorError {
    /// The input file does not exist
    #[fail(display = "input file {} does not exist", _0)]
    Missing(String),
    /// I/O failure on a descriptor file
    #[fail(display = "i/o error on {}: {}", _0, _1)]
    Io(String, String),
    /// Neither JSON nor YAML parsed
    #[fail(display = "input file {} is not a JSON, nor a YAML", _0)]
    UnknownFormat(String),
    /// Unknown output format name
    #[fail(display = "bad deployment descriptor type: {}", _0)]
    BadType(String),
    /// A validation rule set failed
    #[fail(display = "{}", _0)]
    BrokenRules(BrokenRules),
    /// Structurally malformed descriptor
    #[fail(display = "malformed descriptor: {}", _0)]
    Malformed(String),
}

impl From<BrokenRules> for DescriptorError {
    fn from(e: BrokenRules) -> Self {
        DescriptorError::BrokenRules(e)
    }
}

/// The parsed and validated content of a deployment descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct Descriptor {
    /// Path of the manager descriptor file, if any
    pub manager: Option<String>,
    /// Node records
    pub nodes: Vec<NodeRecord>,
    /// Module records
    pub modules: Vec<ModuleRecord>,
    /// Next connection id to allocate
    pub connections_current_id: u16,
    /// Connection records
    pub connections: Vec<ConnectionRecord>,
    /// Next periodic event id to allocate
    pub events_current_id: u32,
    /// Periodic event records
    pub periodic_events: Vec<PeriodicEventRecord>,
}

impl Descriptor {
    /// Validate a raw descriptor value and deserialize its records.
    pub fn from_value(root: &Value) -> Result<Descriptor, DescriptorError> {
        let map = root
            .as_object()
            .ok_or_else(|| DescriptorError::Malformed("top level is not a map".to_owned()))?;

        let manager = match map.get("manager") {
            None | Some(Value::Null) => None,
            Some(Value::String(path)) => Some(path.clone()),
            Some(_) => {
                return Err(DescriptorError::Malformed(
                    "manager must be a file path".to_owned(),
                ))
            }
        };

        let nodes = records_of(map.get("nodes"), "nodes", rules::check_node)?;
        let modules = records_of(map.get("modules"), "modules", rules::check_module)?;
        let connections = records_of(map.get("connections"), "connections", rules::check_connection)?;
        let periodic_events = records_of(
            map.get("periodic-events"),
            "periodic-events",
            rules::check_periodic_event,
        )?;

        Ok(Descriptor {
            manager,
            nodes,
            modules,
            connections_current_id: counter(map.get("connections_current_id"))? as u16,
            connections,
            events_current_id: counter(map.get("events_current_id"))? as u32,
            periodic_events,
        })
    }

    /// Serialize back to a raw value, in the canonical key order.
    pub fn to_value(&self) -> Result<Value, DescriptorError> {
        let mut map = serde_json::Map::new();
        map.insert(
            "manager".to_owned(),
            match &self.manager {
                Some(path) => Value::String(path.clone()),
                None => Value::Null,
            },
        );
        map.insert("nodes".to_owned(), to_json(&self.nodes)?);
        map.insert("modules".to_owned(), to_json(&self.modules)?);
        map.insert(
            "connections_current_id".to_owned(),
            Value::from(self.connections_current_id),
        );
        map.insert("connections".to_owned(), to_json(&self.connections)?);
        map.insert(
            "events_current_id".to_owned(),
            Value::from(self.events_current_id),
        );
        map.insert("periodic-events".to_owned(), to_json(&self.periodic_events)?);
        Ok(Value::Object(map))
    }
}

fn to_json<T: serde::Serialize>(records: &T) -> Result<Value, DescriptorError> {
    serde_json::to_value(records).map_err(|e| DescriptorError::Malformed(e.to_string()))
}

fn counter(value: Option<&Value>) -> Result<u64, DescriptorError> {
    match value {
        None | Some(Value::Null) => Ok(0),
        Some(value) => value
            .as_u64()
            .ok_or_else(|| DescriptorError::Malformed("id counter is not a number".to_owned())),
    }
}

fn records_of<T: serde::de::DeserializeOwned>(
    value: Option<&Value>,
    what: &str,
    check: fn(&aex_rules_engine::predicates::Record) -> Result<(), BrokenRules>,
) -> Result<Vec<T>, DescriptorError> {
    let list = match value {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(list)) => list,
        Some(_) => {
            return Err(DescriptorError::Malformed(format!(
                "{} is not a list",
                what
            )))
        }
    };

    let mut records = Vec::with_capacity(list.len());
    for item in list {
        let map = item.as_object().ok_or_else(|| {
            DescriptorError::Malformed(format!("{} record is not a map", what))
        })?;
        check(map)?;
        let record = serde_json::from_value(item.clone())
            .map_err(|e| DescriptorError::Malformed(format!("{}: {}", what, e)))?;
        records.push(record);
    }
    Ok(records)
}
