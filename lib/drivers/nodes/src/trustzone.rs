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

//! ARM TrustZone node driver.

use crate::driver::NodeDriver;
use crate::{io_error, put_u16, put_u32, NodeCommon, NodeError};
use aex_common_tools::resolve_ip;
use aex_conf::TrustZoneNodeRecord;
use aex_crypto::{sha256, Encryption};
use aex_wire::{CommandCode, CommandMessage, Entrypoint};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};

/// A node running the OP-TEE Event Manager.
#[derive(Debug)]
pub struct TrustZoneNode {
    common: NodeCommon,
    /// Vendor id
    pub vendor_id: u16,
    /// Device key module keys derive from; kept out of descriptors once a
    /// vendor key exists
    pub node_key: Option<Vec<u8>>,
    /// Vendor key, derived from the node key when not provisioned
    pub vendor_key: Vec<u8>,
    next_module_id: AtomicU16,
}

impl TrustZoneNode {
    /// Build the node from its descriptor record. A missing vendor key is
    /// derived as `SHA-256(node_key ‖ vendor_id)` with the id packed
    /// little-endian, matching the platform tooling.
    pub fn load(record: TrustZoneNodeRecord) -> Result<TrustZoneNode, NodeError> {
        let ip_address = resolve_ip(&record.host)?;
        let deploy_port = record.deploy_port.unwrap_or(record.reactive_port);

        let vendor_key = match (&record.vendor_key, &record.node_key) {
            (Some(vendor_key), _) => vendor_key.clone(),
            (None, Some(node_key)) => {
                let mut input = node_key.clone();
                input.extend_from_slice(&record.vendor_id.to_le_bytes());
                sha256(&input, 32)?
            }
            (None, None) => return Err(NodeError::MissingNodeKeys),
        };

        Ok(TrustZoneNode {
            vendor_id: record.vendor_id,
            node_key: record.node_key,
            vendor_key,
            next_module_id: AtomicU16::new(record.module_id.unwrap_or(1)),
            common: NodeCommon::new(
                record.name,
                ip_address,
                record.reactive_port,
                deploy_port,
                false,
            ),
        })
    }

    /// Dump the node back to its descriptor record.
    pub fn dump(&self) -> TrustZoneNodeRecord {
        TrustZoneNodeRecord {
            name: self.common.name.clone(),
            host: self.common.ip_address.to_string(),
            reactive_port: self.common.reactive_port,
            deploy_port: Some(self.common.deploy_port),
            vendor_id: self.vendor_id,
            node_key: self.node_key.clone(),
            vendor_key: Some(self.vendor_key.clone()),
            module_id: Some(self.next_module_id.load(Ordering::SeqCst)),
        }
    }

    /// Allocate the next on-node module id.
    pub fn allocate_module_id(&self) -> u16 {
        self.next_module_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Upload a trusted application:
    /// `total_len(u32) ‖ module_id(u16) ‖ uuid(16) ‖ ta`.
    pub async fn load_module(
        &self,
        module_name: &str,
        module_id: u16,
        uuid: u128,
        binary: &Path,
    ) -> Result<(), NodeError> {
        let data = tokio::fs::read(binary)
            .await
            .map_err(|e| io_error(binary, &e))?;

        let uuid_bytes = uuid.to_be_bytes();
        let mut payload = Vec::with_capacity(4 + 2 + 16 + data.len());
        put_u32(&mut payload, (data.len() + 2 + uuid_bytes.len()) as u32);
        put_u16(&mut payload, module_id);
        payload.extend_from_slice(&uuid_bytes);
        payload.extend_from_slice(&data);

        info!("Deploying {} on {}", module_name, self.common.name);
        aex_wire::send_load(self.common.ip_address, self.common.deploy_port, &payload).await?;

        Ok(())
    }

    /// Challenge-response attestation: the module answers a random 16-byte
    /// challenge with `AES-GCM-MAC(module_key, challenge)`.
    pub async fn attest(
        &self,
        module_name: &str,
        module_id: u16,
        module_key: &[u8],
    ) -> Result<(), NodeError> {
        let challenge = aex_crypto::generate_key(16);

        let mut payload = Vec::new();
        put_u16(&mut payload, module_id);
        put_u16(&mut payload, Entrypoint::Attest.to_u16());
        put_u16(&mut payload, challenge.len() as u16);
        payload.extend_from_slice(&challenge);

        let result = self
            .common
            .send_reactive_command(
                CommandMessage::new(CommandCode::Call, payload),
                Some(format!("Attesting {}", module_name)),
            )
            .await?;

        let response = result.map(|r| r.payload).unwrap_or_default();
        let expected = Encryption::Aes.mac(module_key, &challenge)?;

        if response != expected {
            debug!("Challenge: {}", hex::encode(&challenge));
            debug!("Response: {}", hex::encode(&response));
            debug!("Expected: {}", hex::encode(&expected));
            return Err(NodeError::AttestationFailed(module_name.to_owned()));
        }

        info!("Attestation of {} succeeded", module_name);
        Ok(())
    }
}

#[async_trait]
impl NodeDriver for TrustZoneNode {
    fn common(&self) -> &NodeCommon {
        &self.common
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn record(reactive_port: u16) -> TrustZoneNodeRecord {
        TrustZoneNodeRecord {
            name: "tz1".to_owned(),
            host: "127.0.0.1".to_owned(),
            reactive_port,
            deploy_port: None,
            vendor_id: 2,
            node_key: Some(vec![0xaa; 16]),
            vendor_key: None,
            module_id: None,
        }
    }

    #[test]
    fn vendor_key_derives_from_node_key() {
        let node = TrustZoneNode::load(record(4000)).expect("load");

        let mut input = vec![0xaa; 16];
        input.extend_from_slice(&2u16.to_le_bytes());
        assert_eq!(node.vendor_key, sha256(&input, 32).expect("digest"));
    }

    #[test]
    fn some_key_is_required() {
        let mut bare = record(4000);
        bare.node_key = None;
        match TrustZoneNode::load(bare) {
            Err(NodeError::MissingNodeKeys) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn attestation_verifies_the_challenge_mac() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let module_key = vec![0x55u8; 16];
        let em_key = module_key.clone();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut header = [0u8; 4];
            stream.read_exact(&mut header).await.expect("header");
            let len = u16::from_be_bytes([header[2], header[3]]) as usize;
            let mut payload = vec![0u8; len];
            stream.read_exact(&mut payload).await.expect("payload");

            // payload: module_id(2) ‖ entry(2) ‖ challenge_len(2) ‖ challenge
            assert_eq!(&payload[2..4], &1u16.to_be_bytes());
            let challenge = &payload[6..];
            let mac = Encryption::Aes.mac(&em_key, challenge).expect("mac");

            let mut response = vec![0u8, 0];
            response.extend_from_slice(&(mac.len() as u16).to_be_bytes());
            response.extend_from_slice(&mac);
            stream.write_all(&response).await.expect("write");
        });

        let node = TrustZoneNode::load(record(port)).expect("load");
        node.attest("m1", 1, &module_key).await.expect("attest");
    }

    #[tokio::test]
    async fn wrong_mac_fails_attestation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut header = [0u8; 4];
            stream.read_exact(&mut header).await.expect("header");
            let len = u16::from_be_bytes([header[2], header[3]]) as usize;
            let mut payload = vec![0u8; len];
            stream.read_exact(&mut payload).await.expect("payload");

            let mut response = vec![0u8, 0];
            response.extend_from_slice(&16u16.to_be_bytes());
            response.extend_from_slice(&[0u8; 16]);
            stream.write_all(&response).await.expect("write");
        });

        let node = TrustZoneNode::load(record(port)).expect("load");
        match node.attest("m1", 1, &[0x55u8; 16]).await {
            Err(NodeError::AttestationFailed(module)) => assert_eq!(module, "m1"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
