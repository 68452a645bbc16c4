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

//! Intel SGX module driver.
//!
//! The pipeline is codegen → cargo build for the Fortanix target →
//! `ftxsgx-elf2sgxs` conversion → `sgxs-sign` with the vendor key. The
//! session key comes out of remote attestation, driven by the external
//! `sgx-attester` helper.

use crate::{codegen, io_error, Module, ModuleCommon, ModuleDriver, ModuleError};
use aex_common_tools::{process, BuildMode};
use aex_conf::{DescriptorType, EndpointData, EndpointRef, ModuleRecord, SgxModuleRecord};
use aex_crypto::Encryption;
use aex_manager::{Context, SpKeys};
use aex_nodes::{Node, SgxNode};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

const ATTESTER: &str = "sgx-attester";
const SGX_TARGET: &str = "x86_64-fortanix-unknown-sgx";
const ROOT_CA_URL: &str =
    "https://certificates.trustedservices.intel.com/Intel_SGX_Attestation_RootCA.pem";

/// An enclave module for SGX nodes.
#[derive(Debug)]
pub struct SgxModule {
    common: ModuleCommon,
    /// Vendor signing key
    pub vendor_key: PathBuf,
    /// Remote attestation settings file
    pub ra_settings: PathBuf,
    /// Cargo features of the module build
    pub features: Vec<String>,
    /// Module id, allocated by the deployer
    pub id: u16,
    /// Attestation port of the enclave
    pub port: u16,
    /// Source folder
    pub folder: String,
    generate: OnceCell<EndpointData>,
    build: OnceCell<PathBuf>,
    convert: OnceCell<(PathBuf, PathBuf)>,
    key: OnceCell<Vec<u8>>,
}

impl SgxModule {
    /// Build the driver from its descriptor record, allocating an id on the
    /// node when the record has none yet.
    pub fn load(
        record: SgxModuleRecord,
        node: Arc<Node>,
        old_node: Arc<Node>,
        ctx: &Context,
    ) -> Result<SgxModule, ModuleError> {
        let folder = record.folder.unwrap_or_else(|| record.common.name.clone());
        let out_dir = ctx.build_dir.join(format!("sgx-{}", folder));

        let id = match (&*node, record.id) {
            (_, Some(id)) => id,
            (Node::Sgx(sgx), None) => sgx.allocate_module_id(),
            _ => 0,
        };
        let port = record
            .port
            .unwrap_or_else(|| node.common().reactive_port + id);

        let convert = match (record.sgxs, record.signature) {
            (Some(sgxs), Some(sig)) => Some((sgxs, sig)),
            _ => None,
        };

        Ok(SgxModule {
            common: ModuleCommon::new(&record.common, node, old_node, out_dir)?,
            vendor_key: record.vendor_key,
            ra_settings: record.ra_settings,
            features: record.features.unwrap_or_default(),
            id,
            port,
            folder,
            generate: OnceCell::new_with(record.data),
            build: OnceCell::new_with(record.binary),
            convert: OnceCell::new_with(convert),
            key: OnceCell::new_with(record.key),
        })
    }

    async fn data(&self, ctx: &Context) -> Result<&EndpointData, ModuleError> {
        self.generate
            .get_or_try_init(|| async {
                let node = self.common.node();
                let sp_key = match ctx.manager() {
                    Some(manager) => manager.sp_pubkey(&ctx.build_dir).await?,
                    None => sp_keys(ctx).await?.pubkey.clone(),
                };

                let (data, _) = codegen::rust_sgx_gen(
                    &self.common.name,
                    &self.folder,
                    &self.common.out_dir,
                    self.id,
                    node.common().deploy_port,
                    "sgx",
                    Some(&sp_key),
                )
                .await?;
                Ok(data)
            })
            .await
    }

    /// Endpoint manifest of the module, available once code was generated.
    pub fn endpoints(&self) -> Option<&EndpointData> {
        self.generate.get()
    }

    async fn binary(&self, ctx: &Context) -> Result<&PathBuf, ModuleError> {
        self.build
            .get_or_try_init(|| async {
                self.data(ctx).await?;

                let mut args = vec!["build".to_owned()];
                if ctx.build_mode == BuildMode::Release {
                    args.push("--release".to_owned());
                }
                if !self.features.is_empty() {
                    args.push("--features".to_owned());
                    args.push(self.features.join(" "));
                }
                args.push(format!("--target={}", SGX_TARGET));
                args.push(format!(
                    "--manifest-path={}/Cargo.toml",
                    self.common.out_dir.display()
                ));

                process::run("cargo", &args).await?;

                let binary = self
                    .common
                    .out_dir
                    .join("target")
                    .join(SGX_TARGET)
                    .join(ctx.build_mode.to_str())
                    .join(&self.folder);

                info!("Built module {}", self.common.name);
                Ok(binary)
            })
            .await
    }

    async fn converted(&self, ctx: &Context) -> Result<&(PathBuf, PathBuf), ModuleError> {
        self.convert
            .get_or_try_init(|| async {
                let binary = self.binary(ctx).await?;

                let sgxs = PathBuf::from(format!("{}.sgxs", binary.display()));
                // Include the module name so two modules built from the
                // same sources with different vendor keys keep distinct
                // signatures
                let sig =
                    PathBuf::from(format!("{}-{}.sig", binary.display(), self.common.name));

                let mut convert_args = vec![
                    binary.display().to_string(),
                    "--heap-size".to_owned(),
                    "0x400000".to_owned(),
                    "--stack-size".to_owned(),
                    "0x400000".to_owned(),
                    "--threads".to_owned(),
                    "4".to_owned(),
                ];
                let mut sign_args = vec![
                    "--key".to_owned(),
                    self.vendor_key.display().to_string(),
                    sgxs.display().to_string(),
                    sig.display().to_string(),
                ];
                if ctx.build_mode == BuildMode::Debug {
                    convert_args.push("--debug".to_owned());
                    sign_args.push("--debug".to_owned());
                }

                process::run("ftxsgx-elf2sgxs", &convert_args).await?;
                process::run("sgxs-sign", &sign_args).await?;

                info!("Converted & signed module {}", self.common.name);
                Ok((sgxs, sig))
            })
            .await
    }

    async fn attest_local(&self, ctx: &Context) -> Result<Vec<u8>, ModuleError> {
        let node = self.common.node();
        let sgx = sgx_node(&node)?;
        let keys = sp_keys(ctx).await?;
        let (_, sig) = self.converted(ctx).await?;

        let request = serde_json::json!({
            "sp_privkey": keys.privkey.display().to_string(),
            "ias_cert": keys.ias_cert.display().to_string(),
            "enclave_settings": self.ra_settings.display().to_string(),
            "enclave_sig": sig.display().to_string(),
            "enclave_host": node.common().ip_address.to_string(),
            "enclave_port": self.port,
            "aesm_host": sgx.aesm_host,
            "aesm_port": sgx.aesm_port,
        });

        let input_file = self.common.out_dir.join("attest.yaml");
        DescriptorType::Yaml
            .dump(&input_file, &request)
            .map_err(|e| io_error(&input_file, &e))?;

        let out = process::run_with_output(ATTESTER, &[input_file.display().to_string()]).await?;
        let key = aex_manager::parse_byte_literal(&String::from_utf8_lossy(&out))?;

        // Give the enclave a moment to reopen its socket
        tokio::time::sleep(Duration::from_millis(100)).await;

        info!(
            "Done Remote Attestation of {}. Key: {}",
            self.common.name,
            hex::encode(&key)
        );
        Ok(key)
    }

    async fn attest_manager(&self, ctx: &Context) -> Result<Vec<u8>, ModuleError> {
        let manager = match ctx.manager() {
            Some(manager) => manager,
            None => unreachable!("caller checked the manager"),
        };

        let node = self.common.node();
        let sgx = sgx_node(&node)?;
        let (_, sig) = self.converted(ctx).await?;

        let data = serde_json::json!({
            "id": self.id,
            "name": self.common.name,
            "host": node.common().ip_address.to_string(),
            "port": self.port,
            "em_port": node.common().reactive_port,
            "aesm_client_host": sgx.aesm_host,
            "aesm_client_port": sgx.aesm_port,
            "sigstruct": sig.display().to_string(),
            "config": self.ra_settings.display().to_string(),
        });

        let data_file = self.common.out_dir.join("attest.json");
        std::fs::write(&data_file, data.to_string()).map_err(|e| io_error(&data_file, &e))?;

        let key = manager.attest("attest-sgx", &data_file).await?;

        tokio::time::sleep(Duration::from_millis(100)).await;

        info!(
            "Done Remote Attestation of {}. Key: {}",
            self.common.name,
            hex::encode(&key)
        );
        Ok(key)
    }
}

#[async_trait]
impl ModuleDriver for SgxModule {
    fn common(&self) -> &ModuleCommon {
        &self.common
    }

    fn dump(&self) -> ModuleRecord {
        let deployed = self.common.deployed();
        let converted = self.convert.get();

        ModuleRecord::Sgx(SgxModuleRecord {
            common: self.common.record(),
            vendor_key: self.vendor_key.clone(),
            ra_settings: self.ra_settings.clone(),
            features: Some(self.features.clone()),
            id: Some(self.id),
            binary: self.build.get().filter(|_| deployed).cloned(),
            sgxs: converted.filter(|_| deployed).map(|(sgxs, _)| sgxs.clone()),
            signature: converted.filter(|_| deployed).map(|(_, sig)| sig.clone()),
            key: self.key.get().filter(|_| self.common.attested()).cloned(),
            data: self.generate.get().filter(|_| deployed).cloned(),
            folder: Some(self.folder.clone()),
            port: Some(self.port),
        })
    }

    fn clone_fresh(&self) -> Result<Module, ModuleError> {
        let common = self.common.fresh_clone()?;
        let node = common.node();

        let id = match &*node {
            Node::Sgx(sgx) => sgx.allocate_module_id(),
            _ => 0,
        };
        let port = node.common().reactive_port + id;

        Ok(Module::Sgx(SgxModule {
            common,
            vendor_key: self.vendor_key.clone(),
            ra_settings: self.ra_settings.clone(),
            features: self.features.clone(),
            id,
            port,
            folder: self.folder.clone(),
            generate: OnceCell::new(),
            build: OnceCell::new(),
            convert: OnceCell::new(),
            key: OnceCell::new(),
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

        let (sgxs, sig) = self.converted(ctx).await?;
        let node = self.common.node();
        sgx_node(&node)?
            .load_module(&self.common.name, sgxs, sig)
            .await?;

        self.common.set_deployed();
        Ok(())
    }

    async fn attest(&self, ctx: &Context) -> Result<(), ModuleError> {
        if ctx.manager().is_some() {
            self.key
                .get_or_try_init(|| self.attest_manager(ctx))
                .await?;
        } else {
            self.key.get_or_try_init(|| self.attest_local(ctx)).await?;
        }

        self.common.set_attested();
        Ok(())
    }

    async fn module_id(&self) -> Result<u16, ModuleError> {
        Ok(self.id)
    }

    async fn key(&self, _ctx: &Context) -> Result<Vec<u8>, ModuleError> {
        self.key
            .get()
            .cloned()
            .ok_or_else(|| ModuleError::NoKey(self.common.name.clone()))
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

impl SgxModule {
    async fn endpoint_id(
        &self,
        kind: &'static str,
        endpoint: &EndpointRef,
    ) -> Result<u16, ModuleError> {
        if let Some(id) = endpoint.as_id() {
            return Ok(id);
        }

        let data = self
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

/// SGX service-provider key material: an RSA keypair generated with
/// `openssl` and the Intel attestation root certificate fetched with
/// `curl`. Generated once per process; artefacts persist under the build
/// directory across runs.
pub(crate) async fn sp_keys(ctx: &Context) -> Result<&SpKeys, ModuleError> {
    ctx.sgx_sp_keys
        .get_or_try_init(|| async {
            let privkey = ctx.build_dir.join("private_key.pem");
            let pubkey = ctx.build_dir.join("public_key.pem");
            let ias_cert = ctx.build_dir.join("ias_root_ca.pem");

            let keys = SpKeys {
                pubkey: pubkey.clone(),
                privkey: privkey.clone(),
                ias_cert: ias_cert.clone(),
            };

            // Reuse material from a previous run
            if privkey.exists() && pubkey.exists() && ias_cert.exists() {
                return Ok(keys);
            }

            let genrsa = vec![
                "genrsa".to_owned(),
                "-f4".to_owned(),
                "-out".to_owned(),
                privkey.display().to_string(),
                "2048".to_owned(),
            ];
            process::run("openssl", &genrsa).await?;

            let pubout = vec![
                "rsa".to_owned(),
                "-in".to_owned(),
                privkey.display().to_string(),
                "-outform".to_owned(),
                "PEM".to_owned(),
                "-pubout".to_owned(),
                "-out".to_owned(),
                pubkey.display().to_string(),
            ];
            process::run("openssl", &pubout).await?;

            process::run_with_output_file("curl", &[ROOT_CA_URL.to_owned()], &ias_cert).await?;

            Ok(keys)
        })
        .await
}

fn sgx_node(node: &Arc<Node>) -> Result<&SgxNode, ModuleError> {
    match &**node {
        Node::Sgx(sgx) => Ok(sgx),
        other => Err(ModuleError::WrongNode(
            other.name().to_owned(),
            "sgx module".to_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aex_conf::{ModuleCommonRecord, SgxNodeRecord};
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    fn test_ctx(tag: &str) -> Context {
        let dir = std::env::temp_dir().join(format!("aex-sgx-mod-{}", tag));
        std::fs::create_dir_all(&dir).expect("build dir");
        Context::new(aex_common_tools::BuildMode::Debug, dir, None)
    }

    fn test_node() -> Arc<Node> {
        Arc::new(Node::Sgx(
            SgxNode::load(SgxNodeRecord {
                name: "nA".to_owned(),
                host: "127.0.0.1".to_owned(),
                reactive_port: 7000,
                deploy_port: Some(7001),
                module_id: None,
                aesm_host: None,
                aesm_port: None,
            })
            .expect("node"),
        ))
    }

    fn record(data: Option<EndpointData>) -> SgxModuleRecord {
        SgxModuleRecord {
            common: ModuleCommonRecord {
                name: "m1".to_owned(),
                node: "nA".to_owned(),
                old_node: None,
                priority: None,
                deployed: None,
                nonce: None,
                attested: None,
            },
            vendor_key: PathBuf::from("keys/vendor.pem"),
            ra_settings: PathBuf::from("ra/settings.yaml"),
            features: None,
            id: None,
            binary: None,
            sgxs: None,
            signature: None,
            key: None,
            data,
            folder: None,
            port: None,
        }
    }

    #[tokio::test]
    async fn ids_and_ports_allocate_from_the_node() {
        let ctx = test_ctx("alloc");
        let node = test_node();

        let first =
            SgxModule::load(record(None), node.clone(), node.clone(), &ctx).expect("load");
        let second = SgxModule::load(record(None), node.clone(), node, &ctx).expect("load");

        assert_eq!(first.id, 1);
        assert_eq!(first.port, 7001);
        assert_eq!(second.id, 2);
        assert_eq!(second.port, 7002);
        assert_eq!(first.module_id().await.expect("id"), 1);
    }

    #[tokio::test]
    async fn endpoints_resolve_from_the_manifest() {
        let ctx = test_ctx("endpoints");
        let node = test_node();

        let data = EndpointData {
            inputs: btreemap! {"feed".to_owned() => 0u16},
            outputs: btreemap! {"alarm".to_owned() => 1u16},
            entrypoints: btreemap! {"init".to_owned() => 5u16},
            handlers: btreemap! {"query".to_owned() => 2u16},
            requests: btreemap! {"fetch".to_owned() => 3u16},
        };

        let module =
            SgxModule::load(record(Some(data)), node.clone(), node, &ctx).expect("load");

        assert_eq!(
            module.input_id(&EndpointRef::from("feed")).await.expect("input"),
            0
        );
        assert_eq!(
            module
                .output_id(&EndpointRef::from("alarm"))
                .await
                .expect("output"),
            1
        );
        assert_eq!(
            module
                .handler_id(&EndpointRef::from("query"))
                .await
                .expect("handler"),
            2
        );
        assert_eq!(
            module
                .request_id(&EndpointRef::from("fetch"))
                .await
                .expect("request"),
            3
        );
        assert!(module.entry_id(&EndpointRef::from("stop")).await.is_err());
    }

    #[tokio::test]
    async fn key_is_required_before_use() {
        let ctx = test_ctx("nokey");
        let node = test_node();
        let module = SgxModule::load(record(None), node.clone(), node, &ctx).expect("load");

        match module.key(&ctx).await {
            Err(ModuleError::NoKey(name)) => assert_eq!(name, "m1"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
