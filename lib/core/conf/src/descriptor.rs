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

//! Descriptor file formats: auto-detecting loader and dumper.

use crate::DescriptorError;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

/// Serialization format of a deployment descriptor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DescriptorType {
    /// JSON, indented with four spaces on output
    Json,
    /// YAML
    Yaml,
}

impl DescriptorType {
    /// Format from its CLI name.
    pub fn from_str(name: &str) -> Result<DescriptorType, DescriptorError> {
        match name.to_lowercase().as_str() {
            "json" => Ok(DescriptorType::Json),
            "yaml" => Ok(DescriptorType::Yaml),
            other => Err(DescriptorError::BadType(other.to_owned())),
        }
    }

    /// Load a file in this format.
    pub fn load(self, path: &Path) -> Result<Value, DescriptorError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DescriptorError::Io(path.display().to_string(), e.to_string()))?;

        match self {
            DescriptorType::Json => serde_json::from_str(&content)
                .map_err(|e| DescriptorError::Malformed(e.to_string())),
            DescriptorType::Yaml => serde_yaml::from_str(&content)
                .map_err(|e| DescriptorError::Malformed(e.to_string())),
        }
    }

    /// Load a file, trying JSON first, then YAML. Returns the parsed value
    /// and the format that succeeded.
    pub fn load_any(path: &Path) -> Result<(Value, DescriptorType), DescriptorError> {
        if !path.exists() {
            return Err(DescriptorError::Missing(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| DescriptorError::Io(path.display().to_string(), e.to_string()))?;

        if let Ok(value) = serde_json::from_str::<Value>(&content) {
            return Ok((value, DescriptorType::Json));
        }
        if let Ok(value) = serde_yaml::from_str::<Value>(&content) {
            return Ok((value, DescriptorType::Yaml));
        }

        Err(DescriptorError::UnknownFormat(path.display().to_string()))
    }

    /// Write a value to a file in this format.
    pub fn dump(self, path: &Path, value: &Value) -> Result<(), DescriptorError> {
        let io_err = |e: &dyn std::fmt::Display| {
            DescriptorError::Io(path.display().to_string(), e.to_string())
        };

        let content = match self {
            DescriptorType::Json => {
                let mut out = Vec::new();
                let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
                let mut serializer =
                    serde_json::Serializer::with_formatter(&mut out, formatter);
                value.serialize(&mut serializer).map_err(|e| io_err(&e))?;
                out
            }
            DescriptorType::Yaml => serde_yaml::to_string(value)
                .map_err(|e| io_err(&e))?
                .into_bytes(),
        };

        std::fs::write(path, content).map_err(|e| io_err(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join("aex-conf-tests");
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir.join(name)
    }

    #[test]
    fn json_round_trip() {
        let path = tmp_path("round.json");
        let value = json!({"nodes": [], "connections_current_id": 3});

        DescriptorType::Json.dump(&path, &value).expect("dump");
        let (back, detected) = DescriptorType::load_any(&path).expect("load");
        assert_eq!(back, value);
        assert_eq!(detected, DescriptorType::Json);
    }

    #[test]
    fn yaml_round_trip() {
        let path = tmp_path("round.yaml");
        let value = json!({"modules": [{"name": "m1"}], "events_current_id": 0});

        DescriptorType::Yaml.dump(&path, &value).expect("dump");
        let (back, detected) = DescriptorType::load_any(&path).expect("load");
        assert_eq!(back, value);
        assert_eq!(detected, DescriptorType::Yaml);
    }

    #[test]
    fn garbage_is_neither_format() {
        let path = tmp_path("garbage.txt");
        std::fs::write(&path, ":\n\t: {{{").expect("write");
        match DescriptorType::load_any(&path) {
            Err(DescriptorError::UnknownFormat(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn missing_file() {
        match DescriptorType::load_any(Path::new("/nonexistent/aex.json")) {
            Err(DescriptorError::Missing(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
