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

//! MSP430-class (Sancus) node driver.

use crate::driver::{NodeDriver, SetKeyArgs};
use crate::{io_error, put_u16, NodeCommon, NodeError};
use aex_common_tools::resolve_ip;
use aex_conf::SancusNodeRecord;
use aex_crypto::{spongent, Encryption};
use aex_wire::{CommandCode, CommandMessage, Entrypoint};
use async_trait::async_trait;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const DEFAULT_DEPLOY_PORT: u16 = 2000;
const DEFAULT_REACTIVE_PORT: u16 = 2001;

/// A node running the Contiki Event Manager on Sancus hardware.
///
/// The EM does not support *any* concurrent connections, not on the same
/// port, not on different ports, so all traffic to the node is serialized
/// behind the per-node lock.
#[derive(Debug)]
pub struct SancusNode {
    common: NodeCommon,
    /// Vendor id modules are registered under
    pub vendor_id: u16,
    /// Vendor key module keys derive from
    pub vendor_key: Vec<u8>,
}

impl SancusNode {
    /// Build the node from its descriptor record.
    pub fn load(record: SancusNodeRecord) -> Result<SancusNode, NodeError> {
        let ip_address = resolve_ip(&record.host)?;
        let reactive_port = if record.reactive_port == 0 {
            DEFAULT_REACTIVE_PORT
        } else {
            record.reactive_port
        };
        let deploy_port = record.deploy_port.unwrap_or(DEFAULT_DEPLOY_PORT);

        Ok(SancusNode {
            common: NodeCommon::new(record.name, ip_address, reactive_port, deploy_port, true),
            vendor_id: record.vendor_id,
            vendor_key: record.vendor_key,
        })
    }

    /// Dump the node back to its descriptor record.
    pub fn dump(&self) -> SancusNodeRecord {
        SancusNodeRecord {
            name: self.common.name.clone(),
            host: self.common.ip_address.to_string(),
            reactive_port: self.common.reactive_port,
            deploy_port: Some(self.common.deploy_port),
            vendor_id: self.vendor_id,
            vendor_key: self.vendor_key.clone(),
        }
    }

    /// Upload a module binary. The load channel speaks the legacy format
    /// `(length u16, name\0, vendor_id u16, elf)` and answers with the
    /// assigned module id followed by the symbol table.
    pub async fn deploy(
        &self,
        module_name: &str,
        binary: &Path,
    ) -> Result<(u16, Vec<u8>), NodeError> {
        let file_data = tokio::fs::read(binary)
            .await
            .map_err(|e| io_error(binary, &e))?;

        // +3 is the NULL terminator of the name plus 2 bytes of vendor id
        let length = (file_data.len() + module_name.len() + 3) as u16;

        let mut packet = Vec::with_capacity(usize::from(length) + 2);
        put_u16(&mut packet, length);
        packet.extend_from_slice(module_name.as_bytes());
        packet.push(0);
        put_u16(&mut packet, self.vendor_id);
        packet.extend_from_slice(&file_data);

        let _guard = self.common.serialized().await;

        info!("Deploying {} on {}", module_name, self.common.name);

        let mut stream = TcpStream::connect((self.common.ip_address, self.common.deploy_port))
            .await
            .map_err(|e| NodeError::Io(self.common.name.clone(), e.to_string()))?;
        stream
            .write_all(&packet)
            .await
            .map_err(|e| NodeError::Io(self.common.name.clone(), e.to_string()))?;
        stream
            .flush()
            .await
            .map_err(|e| NodeError::Io(self.common.name.clone(), e.to_string()))?;

        let mut id_bytes = [0u8; 2];
        stream
            .read_exact(&mut id_bytes)
            .await
            .map_err(|e| NodeError::Io(self.common.name.clone(), e.to_string()))?;
        let module_id = u16::from_be_bytes(id_bytes);

        if module_id == 0 {
            return Err(NodeError::DeployFailed(
                module_name.to_owned(),
                self.common.name.clone(),
            ));
        }

        let mut symtab = Vec::new();
        stream
            .read_to_end(&mut symtab)
            .await
            .map_err(|e| NodeError::Io(self.common.name.clone(), e.to_string()))?;
        // Drop the trailing NULL byte
        symtab.pop();

        Ok((module_id, symtab))
    }

    /// Challenge-response attestation against the module key.
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
        let expected = spongent::mac(module_key, &challenge)?;

        if response != expected {
            return Err(NodeError::AttestationFailed(module_name.to_owned()));
        }

        info!("Attestation of {} succeeded", module_name);
        Ok(())
    }
}

#[async_trait]
impl NodeDriver for SancusNode {
    fn common(&self) -> &NodeCommon {
        &self.common
    }

    /// SetKey with the connection key wrapped by Spongent under the module
    /// key. The module answers `(code u16, tag)`; the tag authenticates the
    /// nonce and the code.
    async fn set_key(&self, args: &SetKeyArgs<'_>) -> Result<(), NodeError> {
        let ad = args.associated_data();
        let cipher = Encryption::Spongent.encrypt(args.module_key, &ad, args.key)?;

        let mut payload = Vec::new();
        put_u16(&mut payload, args.module_id);
        put_u16(&mut payload, Entrypoint::SetKey.to_u16());
        payload.extend_from_slice(&ad);
        payload.extend_from_slice(&cipher);

        let result = self
            .common
            .send_reactive_command(
                CommandMessage::new(CommandCode::Call, payload),
                Some(format!(
                    "Setting key of connection {} ({}:{}) on {} to {}",
                    args.conn_id,
                    args.module_name,
                    args.io_id,
                    self.common.name,
                    hex::encode(args.key)
                )),
            )
            .await?;

        let response = result.map(|r| r.payload).unwrap_or_default();
        if response.len() < 2 {
            return Err(NodeError::TruncatedResponse(self.common.name.clone()));
        }

        let (code_bytes, tag) = response.split_at(2);
        let mut tag_ad = args.nonce.to_be_bytes().to_vec();
        tag_ad.extend_from_slice(code_bytes);
        let expected = spongent::mac(args.module_key, &tag_ad)?;

        if tag != &expected[..] {
            return Err(NodeError::BadResponseTag);
        }

        let code = u16::from_be_bytes([code_bytes[0], code_bytes[1]]);
        if code != 0 {
            return Err(NodeError::ModuleRefused(code));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    fn node(deploy_port: u16, reactive_port: u16) -> SancusNode {
        SancusNode::load(SancusNodeRecord {
            name: "sancus1".to_owned(),
            host: "127.0.0.1".to_owned(),
            reactive_port,
            deploy_port: Some(deploy_port),
            vendor_id: 0x1234,
            vendor_key: vec![0x42; 16],
        })
        .expect("load node")
    }

    #[tokio::test]
    async fn deploy_parses_id_and_symtab() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let elf = std::env::temp_dir().join("aex-sancus-deploy.elf");
        std::fs::write(&elf, b"\x7fELFdata").expect("write elf");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            // Packet: length(2) ‖ name\0 ‖ vendor_id(2) ‖ elf(8) = 15 bytes
            let mut packet = vec![0u8; 15];
            stream.read_exact(&mut packet).await.expect("read");

            stream.write_all(&5u16.to_be_bytes()).await.expect("id");
            stream
                .write_all(b"__sm_m1_io_out_idx = 0x1;\0")
                .await
                .expect("symtab");
            packet
        });

        let (id, symtab) = node(port, 9999)
            .deploy("m1", &elf)
            .await
            .expect("deploy");

        assert_eq!(id, 5);
        assert_eq!(symtab, b"__sm_m1_io_out_idx = 0x1;");

        let packet = server.await.expect("join");
        // length = 8 (elf) + 2 (name) + 3 = 13
        assert_eq!(&packet[..2], &13u16.to_be_bytes());
        assert_eq!(&packet[2..5], b"m1\0");
        assert_eq!(&packet[5..7], &0x1234u16.to_be_bytes());
        assert_eq!(&packet[7..], b"\x7fELFdata");
    }

    #[tokio::test]
    async fn deploy_fails_on_zero_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let elf = std::env::temp_dir().join("aex-sancus-deploy-zero.elf");
        std::fs::write(&elf, b"elf").expect("write elf");

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut packet = vec![0u8; 10];
            stream.read_exact(&mut packet).await.expect("read");
            stream.write_all(&0u16.to_be_bytes()).await.expect("id");
        });

        match node(port, 9999).deploy("m1", &elf).await {
            Err(NodeError::DeployFailed(module, _)) => assert_eq!(module, "m1"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn set_key_verifies_the_response_tag() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let module_key = vec![0x11u8; 16];
        let nonce = 3u16;

        // Mock EM: forward an authentic module response (code 0, tag over
        // nonce ‖ code under the module key)
        let em_key = module_key.clone();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut header = [0u8; 4];
            stream.read_exact(&mut header).await.expect("header");
            let len = u16::from_be_bytes([header[2], header[3]]) as usize;
            let mut payload = vec![0u8; len];
            stream.read_exact(&mut payload).await.expect("payload");

            let mut tag_ad = nonce.to_be_bytes().to_vec();
            tag_ad.extend_from_slice(&0u16.to_be_bytes());
            let tag = spongent::mac(&em_key, &tag_ad).expect("mac");

            // ReactiveResult: Ok ‖ length ‖ (code(2) ‖ tag)
            let mut response = vec![0u8, 0];
            response.extend_from_slice(&((2 + tag.len()) as u16).to_be_bytes());
            response.extend_from_slice(&0u16.to_be_bytes());
            response.extend_from_slice(&tag);
            stream.write_all(&response).await.expect("write");
        });

        let args = SetKeyArgs {
            module_name: "m1",
            module_id: 1,
            module_key: &module_key,
            conn_id: 0,
            io_id: 2,
            nonce,
            encryption: aex_crypto::Encryption::Spongent,
            key: &[0x77u8; 16],
        };

        node(9998, port).set_key(&args).await.expect("set_key");
    }
}
