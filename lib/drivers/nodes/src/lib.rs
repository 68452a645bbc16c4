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

//! Per-backend Event Manager drivers.
//!
//! A node driver talks the wire protocol to one EM. The operations every EM
//! understands (connect, call, output, request, register, disable, reset)
//! are provided once; deployment, key distribution and attestation differ
//! per backend. Drivers take plain data (ids, keys, artefact paths) so the
//! module layer on top owns all lifecycle state.

#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces
)]

#[macro_use]
extern crate log;

mod driver;
mod native;
mod sancus;
mod sgx;
mod trustzone;

pub use driver::{ConnectTarget, DisableArgs, NodeDriver, SetKeyArgs};
pub use native::NativeNode;
pub use sancus::SancusNode;
pub use sgx::SgxNode;
pub use trustzone::TrustZoneNode;

use aex_common_tools::InvalidHost;
use aex_conf::NodeRecord;
use aex_crypto::CryptoError;
use aex_wire::{CommandMessage, ReactiveResult, WireError};
use failure::Fail;
use std::net::IpAddr;
use tokio::sync::Mutex;

/// Node driver errors.
#[derive(Debug, Fail)]
pub enum NodeError {
    /// Wire-level failure (I/O, non-Ok result code)
    #[fail(display = "{}", _0)]
    Wire(WireError),
    /// Filesystem failure around node artefacts
    #[fail(display = "i/o error on {}: {}", _0, _1)]
    Io(String, String),
    /// The EM rejected a module load
    #[fail(display = "deploying {} on {} failed", _0, _1)]
    DeployFailed(String, String),
    /// A module response failed its MAC check
    #[fail(display = "module response has wrong tag")]
    BadResponseTag,
    /// A module returned an error code inside an authenticated response
    #[fail(display = "got error code {} from module", _0)]
    ModuleRefused(u16),
    /// Challenge-response attestation failed
    #[fail(display = "attestation of {} failed", _0)]
    AttestationFailed(String),
    /// The EM answered fewer bytes than the protocol requires
    #[fail(display = "truncated response from {}", _0)]
    TruncatedResponse(String),
    /// Node host could not be resolved
    #[fail(display = "{}", _0)]
    InvalidHost(InvalidHost),
    /// AEAD failure while preparing a payload
    #[fail(display = "{}", _0)]
    Crypto(CryptoError),
    /// TrustZone nodes need a node key or a vendor key
    #[fail(display = "at least one between node key and vendor key is needed")]
    MissingNodeKeys,
}

impl From<WireError> for NodeError {
    fn from(e: WireError) -> Self {
        NodeError::Wire(e)
    }
}

impl From<CryptoError> for NodeError {
    fn from(e: CryptoError) -> Self {
        NodeError::Crypto(e)
    }
}

impl From<InvalidHost> for NodeError {
    fn from(e: InvalidHost) -> Self {
        NodeError::InvalidHost(e)
    }
}

/// Fields and behavior shared by every node backend.
#[derive(Debug)]
pub struct NodeCommon {
    /// Node name
    pub name: String,
    /// Resolved node address
    pub ip_address: IpAddr,
    /// Command channel port
    pub reactive_port: u16,
    /// Load channel port
    pub deploy_port: u16,
    // Present when the EM cannot multiplex connections
    lock: Option<Mutex<()>>,
}

impl NodeCommon {
    /// Build the shared node state. `needs_lock` serializes all wire
    /// traffic to the node.
    pub fn new(
        name: String,
        ip_address: IpAddr,
        reactive_port: u16,
        deploy_port: u16,
        needs_lock: bool,
    ) -> NodeCommon {
        NodeCommon {
            name,
            ip_address,
            reactive_port,
            deploy_port,
            lock: if needs_lock {
                Some(Mutex::new(()))
            } else {
                None
            },
        }
    }

    /// Take the per-node serialization lock, when the backend has one.
    pub async fn serialized(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        match &self.lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        }
    }

    /// Send one command to the reactive port, honoring the per-node lock.
    pub async fn send_reactive_command(
        &self,
        command: CommandMessage,
        log: Option<String>,
    ) -> Result<Option<ReactiveResult>, NodeError> {
        let _guard = self.serialized().await;

        if let Some(log) = log {
            info!("{}", log);
        }

        Ok(aex_wire::send_command(self.ip_address, self.reactive_port, &command).await?)
    }
}

/// Node backends, tagged union over the supported TEE platforms.
#[derive(Debug)]
pub enum Node {
    /// MSP430-class node
    Sancus(SancusNode),
    /// Intel SGX node
    Sgx(SgxNode),
    /// Non-TEE node
    Native(NativeNode),
    /// ARM TrustZone node
    TrustZone(TrustZoneNode),
}

impl Node {
    /// Build a node from its descriptor record.
    pub fn load(record: NodeRecord) -> Result<Node, NodeError> {
        match record {
            NodeRecord::Sancus(r) => Ok(Node::Sancus(SancusNode::load(r)?)),
            NodeRecord::Sgx(r) => Ok(Node::Sgx(SgxNode::load(r)?)),
            NodeRecord::Native(r) => Ok(Node::Native(NativeNode::load(r)?)),
            NodeRecord::TrustZone(r) => Ok(Node::TrustZone(TrustZoneNode::load(r)?)),
        }
    }

    /// Dump the node back to its descriptor record.
    pub fn dump(&self) -> NodeRecord {
        match self {
            Node::Sancus(n) => NodeRecord::Sancus(n.dump()),
            Node::Sgx(n) => NodeRecord::Sgx(n.dump()),
            Node::Native(n) => NodeRecord::Native(n.dump()),
            Node::TrustZone(n) => NodeRecord::TrustZone(n.dump()),
        }
    }

    /// The driver interface of this node.
    pub fn driver(&self) -> &dyn NodeDriver {
        match self {
            Node::Sancus(n) => n,
            Node::Sgx(n) => n,
            Node::Native(n) => n,
            Node::TrustZone(n) => n,
        }
    }

    /// Shared node fields.
    pub fn common(&self) -> &NodeCommon {
        self.driver().common()
    }

    /// Node name.
    pub fn name(&self) -> &str {
        &self.common().name
    }

    /// Backend name, as used in descriptors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Node::Sancus(_) => "sancus",
            Node::Sgx(_) => "sgx",
            Node::Native(_) => "native",
            Node::TrustZone(_) => "trustzone",
        }
    }
}

pub(crate) fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub(crate) fn packed_ip(ip: IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(addr) => addr.octets().to_vec(),
        IpAddr::V6(addr) => addr.octets().to_vec(),
    }
}

pub(crate) fn io_error(what: &std::path::Path, e: &dyn std::fmt::Display) -> NodeError {
    NodeError::Io(what.display().to_string(), e.to_string())
}
