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

//! Intel SGX node driver.

use crate::driver::NodeDriver;
use crate::{io_error, put_u32, NodeCommon, NodeError};
use aex_common_tools::resolve_ip;
use aex_conf::SgxNodeRecord;
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};

const DEFAULT_AESM_PORT: u16 = 13741;

/// A node running the SGX Event Manager. Module ids are allocated by the
/// deployer, monotonically per node.
#[derive(Debug)]
pub struct SgxNode {
    common: NodeCommon,
    /// Host of the AESM client service used during remote attestation
    pub aesm_host: String,
    /// Port of the AESM client service
    pub aesm_port: u16,
    next_module_id: AtomicU16,
}

impl SgxNode {
    /// Build the node from its descriptor record.
    pub fn load(record: SgxNodeRecord) -> Result<SgxNode, NodeError> {
        let ip_address = resolve_ip(&record.host)?;
        let deploy_port = record.deploy_port.unwrap_or(record.reactive_port);

        Ok(SgxNode {
            aesm_host: record.aesm_host.unwrap_or_else(|| ip_address.to_string()),
            aesm_port: record.aesm_port.unwrap_or(DEFAULT_AESM_PORT),
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
    pub fn dump(&self) -> SgxNodeRecord {
        SgxNodeRecord {
            name: self.common.name.clone(),
            host: self.common.ip_address.to_string(),
            reactive_port: self.common.reactive_port,
            deploy_port: Some(self.common.deploy_port),
            module_id: Some(self.next_module_id.load(Ordering::SeqCst)),
            aesm_host: Some(self.aesm_host.clone()),
            aesm_port: Some(self.aesm_port),
        }
    }

    /// Allocate the next on-node module id.
    pub fn allocate_module_id(&self) -> u16 {
        self.next_module_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Upload an enclave: `sgxs_len(u32) ‖ sgxs ‖ sig_len(u32) ‖ sig`.
    pub async fn load_module(
        &self,
        module_name: &str,
        sgxs: &Path,
        sig: &Path,
    ) -> Result<(), NodeError> {
        let sgxs_data = tokio::fs::read(sgxs).await.map_err(|e| io_error(sgxs, &e))?;
        let sig_data = tokio::fs::read(sig).await.map_err(|e| io_error(sig, &e))?;

        let mut payload = Vec::with_capacity(8 + sgxs_data.len() + sig_data.len());
        put_u32(&mut payload, sgxs_data.len() as u32);
        payload.extend_from_slice(&sgxs_data);
        put_u32(&mut payload, sig_data.len() as u32);
        payload.extend_from_slice(&sig_data);

        info!("Deploying {} on {}", module_name, self.common.name);
        aex_wire::send_load(self.common.ip_address, self.common.deploy_port, &payload).await?;

        Ok(())
    }
}

#[async_trait]
impl NodeDriver for SgxNode {
    fn common(&self) -> &NodeCommon {
        &self.common
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn module_ids_allocate_monotonically() {
        let node = SgxNode::load(SgxNodeRecord {
            name: "nA".to_owned(),
            host: "127.0.0.1".to_owned(),
            reactive_port: 7000,
            deploy_port: Some(7001),
            module_id: None,
            aesm_host: None,
            aesm_port: None,
        })
        .expect("load");

        assert_eq!(node.allocate_module_id(), 1);
        assert_eq!(node.allocate_module_id(), 2);
        assert_eq!(node.dump().module_id, Some(3));
        assert_eq!(node.aesm_port, DEFAULT_AESM_PORT);
        assert_eq!(node.aesm_host, "127.0.0.1");
    }

    #[tokio::test]
    async fn load_module_frames_sgxs_and_sig() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let dir = std::env::temp_dir();
        let sgxs = dir.join("aex-sgx-load.sgxs");
        let sig = dir.join("aex-sgx-load.sig");
        std::fs::write(&sgxs, b"SGXS").expect("write sgxs");
        std::fs::write(&sig, b"SIGSTRUCT").expect("write sig");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut payload = Vec::new();
            stream.read_to_end(&mut payload).await.expect("read");
            payload
        });

        let node = SgxNode::load(SgxNodeRecord {
            name: "nA".to_owned(),
            host: "127.0.0.1".to_owned(),
            reactive_port: 7000,
            deploy_port: Some(port),
            module_id: Some(1),
            aesm_host: None,
            aesm_port: None,
        })
        .expect("load");

        node.load_module("m1", &sgxs, &sig).await.expect("load");

        let payload = server.await.expect("join");
        assert_eq!(&payload[..4], &4u32.to_be_bytes());
        assert_eq!(&payload[4..8], b"SGXS");
        assert_eq!(&payload[8..12], &9u32.to_be_bytes());
        assert_eq!(&payload[12..], b"SIGSTRUCT");
    }
}
