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

//! Typed descriptor records, as persisted in deployment descriptors.
//!
//! Byte fields are hex strings, addresses are host strings resolved at load
//! time, and every field that only exists after a lifecycle step is an
//! `Option` that stays out of the document until it is set.

use aex_common_tools::hexser;
use aex_crypto::Encryption;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Reference to a module endpoint: either a name to look up in the module's
/// endpoint maps, or a raw id. Names that parse as numbers are ids.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EndpointRef {
    /// Pre-assigned endpoint id
    Id(u16),
    /// Endpoint name from the module sources
    Name(String),
}

impl EndpointRef {
    /// The id this reference carries directly, if any.
    pub fn as_id(&self) -> Option<u16> {
        match self {
            EndpointRef::Id(id) => Some(*id),
            EndpointRef::Name(name) => name.parse().ok(),
        }
    }
}

impl std::fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            EndpointRef::Id(id) => write!(f, "{}", id),
            EndpointRef::Name(name) => write!(f, "{}", name),
        }
    }
}

impl From<&str> for EndpointRef {
    fn from(name: &str) -> Self {
        EndpointRef::Name(name.to_owned())
    }
}

/// Endpoint manifest emitted by the code generators: name → id maps for
/// every endpoint kind a module exposes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointData {
    /// Input endpoints
    #[serde(default)]
    pub inputs: BTreeMap<String, u16>,
    /// Output endpoints
    #[serde(default)]
    pub outputs: BTreeMap<String, u16>,
    /// Callable entrypoints
    #[serde(default)]
    pub entrypoints: BTreeMap<String, u16>,
    /// Request/response handlers
    #[serde(default)]
    pub handlers: BTreeMap<String, u16>,
    /// Outgoing requests
    #[serde(default)]
    pub requests: BTreeMap<String, u16>,
}

/// Node record, tagged by backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NodeRecord {
    /// MSP430-class node
    #[serde(rename = "sancus")]
    Sancus(SancusNodeRecord),
    /// Intel SGX node
    #[serde(rename = "sgx")]
    Sgx(SgxNodeRecord),
    /// Non-TEE node
    #[serde(rename = "native", alias = "nosgx")]
    Native(NativeNodeRecord),
    /// ARM TrustZone node
    #[serde(rename = "trustzone")]
    TrustZone(TrustZoneNodeRecord),
}

impl NodeRecord {
    /// Node name
    pub fn name(&self) -> &str {
        match self {
            NodeRecord::Sancus(r) => &r.name,
            NodeRecord::Sgx(r) => &r.name,
            NodeRecord::Native(r) => &r.name,
            NodeRecord::TrustZone(r) => &r.name,
        }
    }
}

/// MSP430-class node record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SancusNodeRecord {
    /// Node name
    pub name: String,
    /// Host name or IP literal
    pub host: String,
    /// Command channel port
    pub reactive_port: u16,
    /// Load channel port (defaults to `reactive_port`)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deploy_port: Option<u16>,
    /// Vendor id baked into the node
    pub vendor_id: u16,
    /// Vendor key used for module key derivation
    #[serde(with = "hexser::bytes")]
    pub vendor_key: Vec<u8>,
}

/// SGX node record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SgxNodeRecord {
    /// Node name
    pub name: String,
    /// Host name or IP literal
    pub host: String,
    /// Command channel port
    pub reactive_port: u16,
    /// Load channel port (defaults to `reactive_port`)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deploy_port: Option<u16>,
    /// Next module id to allocate on this node
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub module_id: Option<u16>,
    /// AESM service host (defaults to the node host)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub aesm_host: Option<String>,
    /// AESM service port
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub aesm_port: Option<u16>,
}

/// Non-TEE node record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NativeNodeRecord {
    /// Node name
    pub name: String,
    /// Host name or IP literal
    pub host: String,
    /// Command channel port
    pub reactive_port: u16,
    /// Load channel port (defaults to `reactive_port`)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deploy_port: Option<u16>,
    /// Next module id to allocate on this node
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub module_id: Option<u16>,
}

/// TrustZone node record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrustZoneNodeRecord {
    /// Node name
    pub name: String,
    /// Host name or IP literal
    pub host: String,
    /// Command channel port
    pub reactive_port: u16,
    /// Load channel port (defaults to `reactive_port`)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deploy_port: Option<u16>,
    /// Vendor id
    pub vendor_id: u16,
    /// Device key; at least one of `node_key`/`vendor_key` is required
    #[serde(with = "hexser::opt_bytes", skip_serializing_if = "Option::is_none", default)]
    pub node_key: Option<Vec<u8>>,
    /// Vendor key; derived from the node key when absent
    #[serde(with = "hexser::opt_bytes", skip_serializing_if = "Option::is_none", default)]
    pub vendor_key: Option<Vec<u8>>,
    /// Next module id to allocate on this node
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub module_id: Option<u16>,
}

/// Fields shared by every module record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModuleCommonRecord {
    /// Module name
    pub name: String,
    /// Node the module deploys to
    pub node: String,
    /// Node the module ran on before an update
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub old_node: Option<String>,
    /// Deployment priority; priority modules deploy first, in order
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub priority: Option<u64>,
    /// Set once the module is loaded on its node
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deployed: Option<bool>,
    /// Rolling nonce for SetKey/Disable associated data
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nonce: Option<u16>,
    /// Set once the module key is established
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub attested: Option<bool>,
}

/// Module record, tagged by backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ModuleRecord {
    /// MSP430-class module
    #[serde(rename = "sancus")]
    Sancus(SancusModuleRecord),
    /// SGX enclave module
    #[serde(rename = "sgx")]
    Sgx(SgxModuleRecord),
    /// Native (no-TEE) module
    #[serde(rename = "native")]
    Native(NativeModuleRecord),
    /// TrustZone trusted application
    #[serde(rename = "trustzone")]
    TrustZone(TrustZoneModuleRecord),
}

impl ModuleRecord {
    /// Module name
    pub fn name(&self) -> &str {
        match self {
            ModuleRecord::Sancus(r) => &r.common.name,
            ModuleRecord::Sgx(r) => &r.common.name,
            ModuleRecord::Native(r) => &r.common.name,
            ModuleRecord::TrustZone(r) => &r.common.name,
        }
    }

    /// Common lifecycle fields
    pub fn common(&self) -> &ModuleCommonRecord {
        match self {
            ModuleRecord::Sancus(r) => &r.common,
            ModuleRecord::Sgx(r) => &r.common,
            ModuleRecord::Native(r) => &r.common,
            ModuleRecord::TrustZone(r) => &r.common,
        }
    }
}

/// MSP430-class module record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SancusModuleRecord {
    /// Common lifecycle fields
    #[serde(flatten)]
    pub common: ModuleCommonRecord,
    /// Source files
    pub files: Vec<PathBuf>,
    /// Extra compiler flags
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cflags: Option<Vec<String>>,
    /// Extra linker flags
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ldflags: Option<Vec<String>>,
    /// Built ELF
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub binary: Option<PathBuf>,
    /// On-node module id, assigned by the EM at load
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<u16>,
    /// Symbol table returned by the EM at load
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub symtab: Option<PathBuf>,
    /// Module key derived from the vendor key and the linked binary
    #[serde(with = "hexser::opt_bytes", skip_serializing_if = "Option::is_none", default)]
    pub key: Option<Vec<u8>>,
    /// Name the module registers under on the EM
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deploy_name: Option<String>,
}

/// SGX enclave module record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SgxModuleRecord {
    /// Common lifecycle fields
    #[serde(flatten)]
    pub common: ModuleCommonRecord,
    /// Vendor signing key (path)
    pub vendor_key: PathBuf,
    /// Remote attestation settings file
    pub ra_settings: PathBuf,
    /// Cargo features for the module build
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub features: Option<Vec<String>>,
    /// Module id, pre-allocated by the deployer
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<u16>,
    /// Built ELF
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub binary: Option<PathBuf>,
    /// Converted SGXS image
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sgxs: Option<PathBuf>,
    /// Enclave signature
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<PathBuf>,
    /// Session key established by remote attestation
    #[serde(with = "hexser::opt_bytes", skip_serializing_if = "Option::is_none", default)]
    pub key: Option<Vec<u8>>,
    /// Endpoint manifest from code generation
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<EndpointData>,
    /// Source folder (defaults to the module name)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub folder: Option<String>,
    /// Attestation port of the enclave
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub port: Option<u16>,
}

/// Native (no-TEE) module record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NativeModuleRecord {
    /// Common lifecycle fields
    #[serde(flatten)]
    pub common: ModuleCommonRecord,
    /// Cargo features for the module build
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub features: Option<Vec<String>>,
    /// Module id, pre-allocated by the deployer
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<u16>,
    /// Built ELF
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub binary: Option<PathBuf>,
    /// Module key generated at build time
    #[serde(with = "hexser::opt_bytes", skip_serializing_if = "Option::is_none", default)]
    pub key: Option<Vec<u8>>,
    /// Endpoint manifest from code generation
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<EndpointData>,
    /// Source folder (defaults to the module name)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub folder: Option<String>,
    /// Listening port of the module
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub port: Option<u16>,
}

/// TrustZone trusted application record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrustZoneModuleRecord {
    /// Common lifecycle fields
    #[serde(flatten)]
    pub common: ModuleCommonRecord,
    /// Built `.ta` binary
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub binary: Option<PathBuf>,
    /// Module id, pre-allocated by the deployer
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<u16>,
    /// 128-bit TA UUID, hex-encoded
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub uuid: Option<String>,
    /// Module key derived from the node key and the TA hash
    #[serde(with = "hexser::opt_bytes", skip_serializing_if = "Option::is_none", default)]
    pub key: Option<Vec<u8>>,
    /// Endpoint manifest from code generation
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<EndpointData>,
    /// Source folder (defaults to the module name)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub folder: Option<String>,
}

/// Connection record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Connection name (generated as `conn<id>` when absent)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    /// Source module; absent for direct connections
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub from_module: Option<String>,
    /// Source output endpoint
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub from_output: Option<EndpointRef>,
    /// Source request endpoint
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub from_request: Option<EndpointRef>,
    /// Destination module
    pub to_module: String,
    /// Destination input endpoint
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub to_input: Option<EndpointRef>,
    /// Destination handler endpoint
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub to_handler: Option<EndpointRef>,
    /// AEAD suite of the connection
    pub encryption: Encryption,
    /// Connection key, present once established
    #[serde(with = "hexser::opt_bytes", skip_serializing_if = "Option::is_none", default)]
    pub key: Option<Vec<u8>>,
    /// Connection id
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<u16>,
    /// Whether the deployer itself is the source endpoint
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub direct: Option<bool>,
    /// Rolling AEAD nonce
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nonce: Option<u16>,
    /// Whether keys are distributed and routing is set up
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub established: Option<bool>,
}

/// Periodic event record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeriodicEventRecord {
    /// Event name (generated as `event<id>` when absent)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    /// Event id
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<u32>,
    /// Module whose entrypoint is invoked
    pub module: String,
    /// Entrypoint to invoke
    pub entry: EndpointRef,
    /// Invocation period in milliseconds
    pub frequency: u32,
    /// Whether the event is registered on the EM
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub established: Option<bool>,
}

/// Manager record, stored in its own descriptor file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ManagerRecord {
    /// Manager service host
    pub host: String,
    /// Manager service port
    pub port: u16,
    /// Admin key for the manager API
    pub key: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn node_records_are_tagged_by_type() {
        let raw = json!({
            "type": "sancus",
            "name": "node1",
            "host": "10.0.0.7",
            "reactive_port": 2001,
            "deploy_port": 2000,
            "vendor_id": 4660,
            "vendor_key": "deadbeefdeadbeefdeadbeefdeadbeef"
        });
        let record: NodeRecord = serde_json::from_value(raw.clone()).expect("parse");
        match &record {
            NodeRecord::Sancus(node) => {
                assert_eq!(node.vendor_id, 4660);
                assert_eq!(node.vendor_key.len(), 16);
            }
            other => panic!("wrong variant: {:?}", other),
        }
        assert_eq!(serde_json::to_value(&record).expect("dump"), raw);
    }

    #[test]
    fn nosgx_aliases_native() {
        let raw = json!({
            "type": "nosgx",
            "name": "legacy",
            "host": "127.0.0.1",
            "reactive_port": 5000
        });
        match serde_json::from_value::<NodeRecord>(raw).expect("parse") {
            NodeRecord::Native(node) => assert_eq!(node.name, "legacy"),
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn connection_record_round_trip() {
        let raw = json!({
            "name": "conn0",
            "from_module": "m1",
            "from_output": "button_pressed",
            "to_module": "m2",
            "to_input": 3,
            "encryption": "spongent",
            "key": "000102030405060708090a0b0c0d0e0f",
            "id": 0,
            "direct": false,
            "nonce": 0,
            "established": true
        });
        let record: ConnectionRecord = serde_json::from_value(raw.clone()).expect("parse");
        assert_eq!(record.encryption, Encryption::Spongent);
        assert_eq!(record.to_input, Some(EndpointRef::Id(3)));
        assert_eq!(
            record.from_output,
            Some(EndpointRef::Name("button_pressed".to_owned()))
        );
        assert_eq!(serde_json::to_value(&record).expect("dump"), raw);
    }

    #[test]
    fn numeric_endpoint_names_are_ids() {
        assert_eq!(EndpointRef::Name("42".to_owned()).as_id(), Some(42));
        assert_eq!(EndpointRef::Name("init".to_owned()).as_id(), None);
        assert_eq!(EndpointRef::Id(7).as_id(), Some(7));
    }

    #[test]
    fn module_record_optional_fields_stay_out() {
        let record = ModuleRecord::Native(NativeModuleRecord {
            common: ModuleCommonRecord {
                name: "m1".to_owned(),
                node: "n1".to_owned(),
                old_node: None,
                priority: None,
                deployed: None,
                nonce: None,
                attested: None,
            },
            features: None,
            id: Some(1),
            binary: None,
            key: None,
            data: None,
            folder: None,
            port: None,
        });
        assert_eq!(
            serde_json::to_value(&record).expect("dump"),
            json!({"type": "native", "name": "m1", "node": "n1", "id": 1})
        );
    }
}
