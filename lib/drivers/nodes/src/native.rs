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

//! Non-TEE node driver, for modules running without an enclave.

use crate::driver::NodeDriver;
use crate::{io_error, put_u32, NodeCommon, NodeError};
use aex_common_tools::resolve_ip;
use aex_conf::NativeNodeRecord;
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU16, Ordering};

/// A node running the native Event Manager.
#[derive(Debug)]
pub struct NativeNode {
    common: NodeCommon,
    next_module_id: AtomicU16,
}

impl NativeNode {
    /// Build the node from its descriptor record.
    pub fn load(record: NativeNodeRecord) -> Result<NativeNode, NodeError> {
        let ip_address = resolve_ip(&record.host)?;
        let deploy_port = record.deploy_port.unwrap_or(record.reactive_port);

        Ok(NativeNode {
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
    pub fn dump(&self) -> NativeNodeRecord {
        NativeNodeRecord {
            name: self.common.name.clone(),
            host: self.common.ip_address.to_string(),
            reactive_port: self.common.reactive_port,
            deploy_port: Some(self.common.deploy_port),
            module_id: Some(self.next_module_id.load(Ordering::SeqCst)),
        }
    }

    /// Allocate the next on-node module id.
    pub fn allocate_module_id(&self) -> u16 {
        self.next_module_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Upload a module binary: `payload_len(u32) ‖ elf`.
    pub async fn load_module(&self, module_name: &str, binary: &Path) -> Result<(), NodeError> {
        let data = tokio::fs::read(binary)
            .await
            .map_err(|e| io_error(binary, &e))?;

        let mut payload = Vec::with_capacity(4 + data.len());
        put_u32(&mut payload, data.len() as u32);
        payload.extend_from_slice(&data);

        info!("Deploying {} on {}", module_name, self.common.name);
        aex_wire::send_load(self.common.ip_address, self.common.deploy_port, &payload).await?;

        Ok(())
    }
}

#[async_trait]
impl NodeDriver for NativeNode {
    fn common(&self) -> &NodeCommon {
        &self.common
    }
}
