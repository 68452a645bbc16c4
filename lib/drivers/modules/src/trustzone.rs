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

//! ARM TrustZone module driver.
//!
//! The TA is cross-compiled through the OP-TEE dev kit; its UUID comes out
//! of code generation. The module key is `SHA-256(node_key ‖ ta_hash)[:16]`,
//! where the hash sits in the TA header right after the 20-byte shdr.

use crate::codegen::{self, format_uuid, parse_uuid};
use crate::{io_error, Module, ModuleCommon, ModuleDriver, ModuleError};
use aex_common_tools::process;
use aex_conf::{EndpointData, EndpointRef, ModuleRecord, TrustZoneModuleRecord};
use aex_crypto::{sha256, Encryption};
use aex_manager::Context;
use aex_nodes::{Node, TrustZoneNode};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;

const CROSS_COMPILE: &str = "CROSS_COMPILE=arm-linux-gnueabihf-";
const PLATFORM: &str = "PLATFORM=vexpress-qemu_virt";
const DEV_KIT: &str = "TA_DEV_KIT_DIR=/optee/optee_os/out/arm/export-ta_arm32";

// The TA header: 20 bytes of struct shdr, then the 32-byte image hash
const TA_HASH_RANGE: std::ops::Range<usize> = 20..52;

/// A trusted application for OP-TEE nodes.
#[derive(Debug)]
pub struct TrustZoneModule {
    common: ModuleCommon,
    /// Module id, allocated by the deployer
    pub id: u16,
    /// Source folder
    pub folder: String,
    generate: OnceCell<(EndpointData, u128)>,
    build: OnceCell<PathBuf>,
    key: OnceCell<Vec<u8>>,
    attestation: OnceCell<()>,
}

impl TrustZoneModule {
    /// Build the driver from its descriptor record, allocating an id on the
    /// node when the record has none yet.
    pub fn load(
        record: TrustZoneModuleRecord,
        node: Arc<Node>,
        old_node: Arc<Node>,
        ctx: &Context,
    ) -> Result<TrustZoneModule, ModuleError> {
        let out_dir = ctx
            .build_dir
            .join(format!("trustzone-{}", record.common.name));

        let id = match (&*node, record.id) {
            (_, Some(id)) => id,
            (Node::TrustZone(tz), None) => tz.allocate_module_id(),
            _ => 0,
        };

        let generate = match (record.data, record.uuid.as_deref()) {
            (Some(data), Some(uuid)) => Some((data, parse_uuid(uuid)?)),
            _ => None,
        };

        Ok(TrustZoneModule {
            folder: record.folder.unwrap_or_else(|| record.common.name.clone()),
            common: ModuleCommon::new(&record.common, node, old_node, out_dir)?,
            id,
            generate: OnceCell::new_with(generate),
            build: OnceCell::new_with(record.binary),
            key: OnceCell::new_with(record.key),
            attestation: OnceCell::new_with(record.common.attested.and_then(|a| a.then(|| ()))),
        })
    }

    async fn generated(&self) -> Result<&(EndpointData, u128), ModuleError> {
        self.generate
            .get_or_try_init(|| async {
                codegen::tz_codegen(&self.common.name, &self.folder, &self.common.out_dir).await
            })
            .await
    }

    async fn uuid(&self) -> Result<u128, ModuleError> {
        self.generated().await.map(|(_, uuid)| *uuid)
    }

    async fn binary(&self, _ctx: &Context) -> Result<&PathBuf, ModuleError> {
        self.build
            .get_or_try_init(|| async {
                let (_, uuid) = self.generated().await?;
                let dashed = format_uuid(*uuid);

                let out_dir = self.common.out_dir.display();
                let command = format!(
                    "make -C {} {} {} {} BINARY={} O={}",
                    out_dir, CROSS_COMPILE, PLATFORM, DEV_KIT, dashed, out_dir
                );
                process::run_shell(&command).await?;

                Ok(self.common.out_dir.join(format!("{}.ta", dashed)))
            })
            .await
    }

    async fn derive_key(&self, ctx: &Context) -> Result<Vec<u8>, ModuleError> {
        let binary = self.binary(ctx).await?;
        let node = self.common.node();
        let tz = trustzone_node(&node)?;

        let node_key = tz
            .node_key
            .as_ref()
            .ok_or(ModuleError::Node(aex_nodes::NodeError::MissingNodeKeys))?;

        let ta = tokio::fs::read(binary).await.map_err(|e| io_error(binary, &e))?;
        if ta.len() < TA_HASH_RANGE.end {
            return Err(ModuleError::Io(
                binary.display().to_string(),
                "TA too short for a header".to_owned(),
            ));
        }

        let mut input = node_key.clone();
        input.extend_from_slice(&ta[TA_HASH_RANGE]);

        Ok(sha256(&input, Encryption::Aes.key_size())?)
    }

    async fn attest_manager(&self, ctx: &Context) -> Result<(), ModuleError> {
        let manager = match ctx.manager() {
            Some(manager) => manager,
            None => unreachable!("caller checked the manager"),
        };

        let node = self.common.node();

        let data = serde_json::json!({
            "id": self.id,
            "name": self.common.name,
            "host": node.common().ip_address.to_string(),
            "port": node.common().reactive_port,
            "em_port": node.common().reactive_port,
        });

        let data_file = self.common.out_dir.join("attest.json");
        std::fs::write(&data_file, data.to_string()).map_err(|e| io_error(&data_file, &e))?;

        // The manager performed the challenge, so its key is the session key
        let key = manager.attest("attest-trustzone", &data_file).await?;
        let key_for_cell = key.clone();
        self.key
            .get_or_try_init(|| async move { Ok::<_, ModuleError>(key_for_cell) })
            .await?;

        info!(
            "Done Remote Attestation of {}. Key: {}",
            self.common.name,
            hex::encode(&key)
        );
        self.common.set_attested();
        Ok(())
    }

    async fn endpoint_id(
        &self,
        kind: &'static str,
        endpoint: &EndpointRef,
    ) -> Result<u16, ModuleError> {
        if let Some(id) = endpoint.as_id() {
            return Ok(id);
        }

        let (data, _) = self
            .generate
            .get()
            .ok_or_else(|| ModuleError::NotDeployed(self.common.name.clone()))?;

        let map = match kind {
            "input" => &data.inputs,
            "output" => &data.outputs,
            "entry" => &data.entrypoints,
            _ => unreachable!("unknown endpoint kind"),
        };

        crate::lookup_endpoint(&self.common.name, kind, map, endpoint)
    }
}

#[async_trait]
impl ModuleDriver for TrustZoneModule {
    fn common(&self) -> &ModuleCommon {
        &self.common
    }

    fn dump(&self) -> ModuleRecord {
        let deployed = self.common.deployed();
        let generated = self.generate.get();

        ModuleRecord::TrustZone(TrustZoneModuleRecord {
            common: self.common.record(),
            binary: self.build.get().filter(|_| deployed).cloned(),
            id: Some(self.id),
            uuid: generated
                .filter(|_| deployed)
                .map(|(_, uuid)| format!("{:032x}", uuid)),
            key: self.key.get().filter(|_| deployed).cloned(),
            data: generated.filter(|_| deployed).map(|(data, _)| data.clone()),
            folder: Some(self.folder.clone()),
        })
    }

    fn clone_fresh(&self) -> Result<Module, ModuleError> {
        let common = self.common.fresh_clone()?;
        let node = common.node();

        let id = match &*node {
            Node::TrustZone(tz) => tz.allocate_module_id(),
            _ => 0,
        };

        Ok(Module::TrustZone(TrustZoneModule {
            common,
            id,
            folder: self.folder.clone(),
            generate: OnceCell::new(),
            build: OnceCell::new(),
            key: OnceCell::new(),
            attestation: OnceCell::new(),
        }))
    }

    fn supported_encryption(&self) -> &'static [Encryption] {
        &[Encryption::Aes, Encryption::Spongent]
    }

    fn default_encryption(&self) -> Encryption {
        Encryption::Aes
    }

    async fn build(&self, ctx: &Context) -> Result<(), ModuleError> {
        self.binary(ctx).await.map(|_| ())
    }

    async fn deploy(&self, ctx: &Context) -> Result<(), ModuleError> {
        if self.common.deployed() {
            return Ok(());
        }

        let uuid = self.uuid().await?;
        let binary = self.binary(ctx).await?.clone();
        let node = self.common.node();

        trustzone_node(&node)?
            .load_module(&self.common.name, self.id, uuid, &binary)
            .await?;

        self.common.set_deployed();
        Ok(())
    }

    async fn attest(&self, ctx: &Context) -> Result<(), ModuleError> {
        if ctx.manager().is_some() {
            return self.attest_manager(ctx).await;
        }

        self.attestation
            .get_or_try_init(|| async {
                let key = self.key(ctx).await?;
                let node = self.common.node();
                trustzone_node(&node)?
                    .attest(&self.common.name, self.id, &key)
                    .await?;
                self.common.set_attested();
                Ok(())
            })
            .await
            .map(|_| ())
    }

    async fn module_id(&self) -> Result<u16, ModuleError> {
        Ok(self.id)
    }

    async fn key(&self, ctx: &Context) -> Result<Vec<u8>, ModuleError> {
        self.key
            .get_or_try_init(|| self.derive_key(ctx))
            .await
            .map(Clone::clone)
    }

    async fn input_id(&self, input: &EndpointRef) -> Result<u16, ModuleError> {
        self.endpoint_id("input", input).await
    }

    async fn output_id(&self, output: &EndpointRef) -> Result<u16, ModuleError> {
        self.endpoint_id("output", output).await
    }

    async fn entry_id(&self, entry: &EndpointRef) -> Result<u16, ModuleError> {
        self.endpoint_id("entry", entry).await
    }
}

fn trustzone_node(node: &Arc<Node>) -> Result<&TrustZoneNode, ModuleError> {
    match &**node {
        Node::TrustZone(tz) => Ok(tz),
        other => Err(ModuleError::WrongNode(
            other.name().to_owned(),
            "trustzone module".to_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aex_conf::{ModuleCommonRecord, TrustZoneNodeRecord};
    use pretty_assertions::assert_eq;

    fn test_ctx(tag: &str) -> Context {
        let dir = std::env::temp_dir().join(format!("aex-tz-mod-{}", tag));
        std::fs::create_dir_all(&dir).expect("build dir");
        Context::new(aex_common_tools::BuildMode::Debug, dir, None)
    }

    fn test_node() -> Arc<Node> {
        Arc::new(Node::TrustZone(
            TrustZoneNode::load(TrustZoneNodeRecord {
                name: "tz1".to_owned(),
                host: "127.0.0.1".to_owned(),
                reactive_port: 4000,
                deploy_port: None,
                vendor_id: 1,
                node_key: Some(vec![0xaa; 16]),
                vendor_key: None,
                module_id: None,
            })
            .expect("node"),
        ))
    }

    fn record(binary: Option<PathBuf>) -> TrustZoneModuleRecord {
        TrustZoneModuleRecord {
            common: ModuleCommonRecord {
                name: "m1".to_owned(),
                node: "tz1".to_owned(),
                old_node: None,
                priority: None,
                deployed: None,
                nonce: None,
                attested: None,
            },
            binary,
            id: None,
            uuid: None,
            key: None,
            data: None,
            folder: None,
        }
    }

    #[tokio::test]
    async fn key_derives_from_node_key_and_ta_hash() {
        let ctx = test_ctx("key");

        // A fake TA: 20-byte header, 32-byte hash, some payload
        let ta = ctx.build_dir.join("fake.ta");
        let mut content = vec![0u8; 20];
        content.extend_from_slice(&[0x5a; 32]);
        content.extend_from_slice(b"payload");
        std::fs::write(&ta, &content).expect("write ta");

        let node = test_node();
        let module =
            TrustZoneModule::load(record(Some(ta)), node.clone(), node, &ctx).expect("load");

        let key = module.key(&ctx).await.expect("key");

        let mut input = vec![0xaa; 16];
        input.extend_from_slice(&[0x5a; 32]);
        assert_eq!(key, sha256(&input, 16).expect("digest"));
        assert_eq!(key.len(), 16);
    }

    #[tokio::test]
    async fn truncated_ta_is_rejected() {
        let ctx = test_ctx("short");

        let ta = ctx.build_dir.join("short.ta");
        std::fs::write(&ta, &[0u8; 30]).expect("write ta");

        let node = test_node();
        let module =
            TrustZoneModule::load(record(Some(ta)), node.clone(), node, &ctx).expect("load");

        assert!(module.key(&ctx).await.is_err());
    }
}
