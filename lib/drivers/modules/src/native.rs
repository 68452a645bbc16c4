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

//! Native (no-TEE) module driver. The module key is generated into the
//! sources at codegen time and trusted; attestation degrades to fetching
//! that key, unless it is offloaded to the manager for verification.

use crate::{codegen, io_error, Module, ModuleCommon, ModuleDriver, ModuleError};
use aex_common_tools::{process, BuildMode};
use aex_conf::{EndpointData, EndpointRef, ModuleRecord, NativeModuleRecord};
use aex_crypto::Encryption;
use aex_manager::Context;
use aex_nodes::{Node, NativeNode};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// A module running without an enclave, for development and benchmarks.
#[derive(Debug)]
pub struct NativeModule {
    common: ModuleCommon,
    /// Cargo features of the module build
    pub features: Vec<String>,
    /// Module id, allocated by the deployer
    pub id: u16,
    /// Listening port of the module
    pub port: u16,
    /// Source folder
    pub folder: String,
    generate: OnceCell<(EndpointData, Vec<u8>)>,
    build: OnceCell<PathBuf>,
}

impl NativeModule {
    /// Build the driver from its descriptor record, allocating an id on the
    /// node when the record has none yet.
    pub fn load(
        record: NativeModuleRecord,
        node: Arc<Node>,
        old_node: Arc<Node>,
        ctx: &Context,
    ) -> Result<NativeModule, ModuleError> {
        let folder = record.folder.unwrap_or_else(|| record.common.name.clone());
        let out_dir = ctx.build_dir.join(format!("native-{}", folder));

        let id = match (&*node, record.id) {
            (_, Some(id)) => id,
            (Node::Native(native), None) => native.allocate_module_id(),
            _ => 0,
        };
        let port = record
            .port
            .unwrap_or_else(|| node.common().reactive_port + id);

        let generate = match (record.data, record.key) {
            (Some(data), Some(key)) => Some((data, key)),
            _ => None,
        };

        Ok(NativeModule {
            common: ModuleCommon::new(&record.common, node, old_node, out_dir)?,
            features: record.features.unwrap_or_default(),
            id,
            port,
            folder,
            generate: OnceCell::new_with(generate),
            build: OnceCell::new_with(record.binary),
        })
    }

    async fn generated(&self, _ctx: &Context) -> Result<&(EndpointData, Vec<u8>), ModuleError> {
        self.generate
            .get_or_try_init(|| async {
                let node = self.common.node();

                let (data, key) = codegen::rust_sgx_gen(
                    &self.common.name,
                    &self.folder,
                    &self.common.out_dir,
                    self.id,
                    node.common().deploy_port,
                    "native",
                    None,
                )
                .await?;

                let key = key.ok_or_else(|| {
                    ModuleError::BadManifest(
                        self.common.name.clone(),
                        "native codegen did not return a module key".to_owned(),
                    )
                })?;

                Ok((data, key))
            })
            .await
    }

    async fn binary(&self, ctx: &Context) -> Result<&PathBuf, ModuleError> {
        self.build
            .get_or_try_init(|| async {
                self.generated(ctx).await?;

                let mut args = vec!["build".to_owned()];
                if ctx.build_mode == BuildMode::Release {
                    args.push("--release".to_owned());
                }
                if !self.features.is_empty() {
                    args.push("--features".to_owned());
                    args.push(self.features.join(" "));
                }
                args.push(format!(
                    "--manifest-path={}/Cargo.toml",
                    self.common.out_dir.display()
                ));

                process::run("cargo", &args).await?;

                let binary = self
                    .common
                    .out_dir
                    .join("target")
                    .join(ctx.build_mode.to_str())
                    .join(&self.folder);

                info!("Built module {}", self.common.name);
                Ok(binary)
            })
            .await
    }

    async fn attest_manager(&self, ctx: &Context) -> Result<(), ModuleError> {
        let manager = match ctx.manager() {
            Some(manager) => manager,
            None => unreachable!("caller checked the manager"),
        };

        let node = self.common.node();
        let local_key = self.key(ctx).await?;

        let data = serde_json::json!({
            "id": self.id,
            "name": self.common.name,
            "host": node.common().ip_address.to_string(),
            "port": self.port,
            "em_port": node.common().reactive_port,
            "key": local_key,
        });

        let data_file = self.common.out_dir.join("attest.json");
        std::fs::write(&data_file, data.to_string()).map_err(|e| io_error(&data_file, &e))?;

        let key = manager.attest("attest-native", &data_file).await?;
        if local_key != key {
            return Err(ModuleError::KeyMismatch(self.common.name.clone()));
        }

        info!(
            "Done Remote Attestation of {}. Key: {}",
            self.common.name,
            hex::encode(&key)
        );
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
            "request" => &data.requests,
            "handler" => &data.handlers,
            _ => unreachable!("unknown endpoint kind"),
        };

        crate::lookup_endpoint(&self.common.name, kind, map, endpoint)
    }
}

#[async_trait]
impl ModuleDriver for NativeModule {
    fn common(&self) -> &ModuleCommon {
        &self.common
    }

    fn dump(&self) -> ModuleRecord {
        let deployed = self.common.deployed();
        let generated = self.generate.get();

        ModuleRecord::Native(NativeModuleRecord {
            common: self.common.record(),
            features: Some(self.features.clone()),
            id: Some(self.id),
            binary: self.build.get().filter(|_| deployed).cloned(),
            // The key is generated at build time, not by attestation
            key: generated.filter(|_| deployed).map(|(_, key)| key.clone()),
            data: generated.filter(|_| deployed).map(|(data, _)| data.clone()),
            folder: Some(self.folder.clone()),
            port: Some(self.port),
        })
    }

    fn clone_fresh(&self) -> Result<Module, ModuleError> {
        let common = self.common.fresh_clone()?;
        let node = common.node();

        let id = match &*node {
            Node::Native(native) => native.allocate_module_id(),
            _ => 0,
        };
        let port = node.common().reactive_port + id;

        Ok(Module::Native(NativeModule {
            common,
            features: self.features.clone(),
            id,
            port,
            folder: self.folder.clone(),
            generate: OnceCell::new(),
            build: OnceCell::new(),
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

        let binary = self.binary(ctx).await?.clone();
        let node = self.common.node();
        match &*node {
            Node::Native(native) => native.load_module(&self.common.name, &binary).await?,
            other => {
                return Err(ModuleError::WrongNode(
                    other.name().to_owned(),
                    self.common.name.clone(),
                ))
            }
        }

        self.common.set_deployed();
        Ok(())
    }

    async fn attest(&self, ctx: &Context) -> Result<(), ModuleError> {
        if ctx.manager().is_some() {
            self.attest_manager(ctx).await?;
        } else {
            // The build key is trusted on this backend
            self.key(ctx).await?;
        }

        self.common.set_attested();
        Ok(())
    }

    async fn module_id(&self) -> Result<u16, ModuleError> {
        Ok(self.id)
    }

    async fn key(&self, ctx: &Context) -> Result<Vec<u8>, ModuleError> {
        self.generated(ctx).await.map(|(_, key)| key.clone())
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

    async fn request_id(&self, request: &EndpointRef) -> Result<u16, ModuleError> {
        self.endpoint_id("request", request).await
    }

    async fn handler_id(&self, handler: &EndpointRef) -> Result<u16, ModuleError> {
        self.endpoint_id("handler", handler).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aex_conf::{ModuleCommonRecord, NativeNodeRecord};
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    fn test_ctx(tag: &str) -> Context {
        let dir = std::env::temp_dir().join(format!("aex-native-mod-{}", tag));
        std::fs::create_dir_all(&dir).expect("build dir");
        Context::new(aex_common_tools::BuildMode::Debug, dir, None)
    }

    fn test_node() -> Arc<Node> {
        Arc::new(Node::Native(
            NativeNode::load(NativeNodeRecord {
                name: "n1".to_owned(),
                host: "127.0.0.1".to_owned(),
                reactive_port: 5000,
                deploy_port: None,
                module_id: None,
            })
            .expect("node"),
        ))
    }

    #[tokio::test]
    async fn seeded_module_serves_key_and_endpoints() {
        let ctx = test_ctx("seeded");
        let node = test_node();

        let record = NativeModuleRecord {
            common: ModuleCommonRecord {
                name: "m1".to_owned(),
                node: "n1".to_owned(),
                old_node: None,
                priority: None,
                deployed: Some(true),
                nonce: Some(0),
                attested: Some(true),
            },
            features: None,
            id: Some(1),
            binary: Some(PathBuf::from("/tmp/m1")),
            key: Some(vec![0x0f; 16]),
            data: Some(EndpointData {
                inputs: btreemap! {"feed".to_owned() => 0u16},
                ..EndpointData::default()
            }),
            folder: None,
            port: None,
        };

        let module = NativeModule::load(record, node.clone(), node, &ctx).expect("load");

        assert_eq!(module.key(&ctx).await.expect("key"), vec![0x0f; 16]);
        assert_eq!(
            module.input_id(&EndpointRef::from("feed")).await.expect("input"),
            0
        );
        assert_eq!(module.port, 5001);

        // Attestation trusts the build key
        module.attest(&ctx).await.expect("attest");
        assert!(module.common().attested());
    }
}
