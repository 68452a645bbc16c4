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

//! MSP430-class (Sancus) module driver.
//!
//! The toolchain compiles each source file with `sancus-cc` and links with
//! `sancus-ld`; the EM assigns the module id at load time and returns the
//! symbol table, which later resolves endpoint indices and feeds the module
//! key derivation.

use crate::{io_error, Module, ModuleCommon, ModuleDriver, ModuleError};
use aex_common_tools::{increment_suffix, process, Verbosity};
use aex_conf::{EndpointRef, ModuleRecord, SancusModuleRecord};
use aex_crypto::Encryption;
use aex_manager::Context;
use aex_nodes::{Node, SancusNode};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;

const CC: &str = "sancus-cc";
const LD: &str = "sancus-ld";
const CRYPTO: &str = "sancus-crypto";
const MSP430_LD: &str = "msp430-ld";

/// A protected module for Sancus hardware.
#[derive(Debug)]
pub struct SancusModule {
    common: ModuleCommon,
    /// Source files the module builds from
    pub files: Vec<PathBuf>,
    /// Extra compiler flags
    pub cflags: Vec<String>,
    /// Extra linker flags
    pub ldflags: Vec<String>,
    /// Name the module registers under on the EM; diverges from `name`
    /// after updates
    pub deploy_name: String,
    build: OnceCell<PathBuf>,
    deployment: OnceCell<(u16, PathBuf)>,
    key: OnceCell<Vec<u8>>,
    attestation: OnceCell<()>,
}

impl SancusModule {
    /// Build the driver from its descriptor record.
    pub fn load(
        record: SancusModuleRecord,
        node: Arc<Node>,
        old_node: Arc<Node>,
        ctx: &Context,
    ) -> Result<SancusModule, ModuleError> {
        let out_dir = ctx.build_dir.join(format!("sancus-{}", record.common.name));
        let common = ModuleCommon::new(&record.common, node, old_node, out_dir)?;

        let deployment = match (record.id, record.symtab) {
            (Some(id), Some(symtab)) => Some((id, symtab)),
            _ => None,
        };

        Ok(SancusModule {
            deploy_name: record
                .deploy_name
                .unwrap_or_else(|| record.common.name.clone()),
            common,
            files: record.files,
            cflags: record.cflags.unwrap_or_default(),
            ldflags: record.ldflags.unwrap_or_default(),
            build: OnceCell::new_with(record.binary),
            deployment: OnceCell::new_with(deployment),
            key: OnceCell::new_with(record.key),
            attestation: OnceCell::new_with(record.common.attested.and_then(|a| a.then(|| ()))),
        })
    }

    async fn binary(&self, ctx: &Context) -> Result<&PathBuf, ModuleError> {
        self.build.get_or_try_init(|| self.build_binary(ctx)).await
    }

    async fn build_binary(&self, _ctx: &Context) -> Result<PathBuf, ModuleError> {
        info!(
            "Building module {} from {}",
            self.common.name,
            self.files
                .iter()
                .map(|f| f.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let out_dir = &self.common.out_dir;
        clean_dir(out_dir)?;

        // Copy the sources over, substituting the deploy name
        let mut sources = Vec::with_capacity(self.files.len());
        for file in &self.files {
            let content = tokio::fs::read_to_string(file)
                .await
                .map_err(|e| io_error(file, &e))?;
            let content = content.replace("{name}", &self.deploy_name);

            let target = out_dir.join(file.file_name().ok_or_else(|| {
                ModuleError::Io(file.display().to_string(), "not a file".to_owned())
            })?);
            tokio::fs::write(&target, content)
                .await
                .map_err(|e| io_error(&target, &e))?;
            sources.push(target);
        }

        let verbose_flags: Vec<String> = if Verbosity::current() == Verbosity::Debug {
            vec!["--debug".to_owned()]
        } else {
            Vec::new()
        };

        // Compile every source to an object, concurrently
        let mut objects = Vec::with_capacity(sources.len());
        let compilations = sources.iter().map(|source| {
            let object = source.with_extension("o");
            objects.push(object.clone());

            let mut args = verbose_flags.clone();
            args.extend(self.cflags.iter().cloned());
            args.push("-c".to_owned());
            args.push("-o".to_owned());
            args.push(object.display().to_string());
            args.push(source.display().to_string());

            async move { process::run(CC, &args).await }
        });
        futures_join_all(compilations).await?;

        // Link, with the per-module config file carrying the connection count
        let mut ldflags = verbose_flags;
        ldflags.push("--inline-arithmetic".to_owned());
        ldflags.extend(self.ldflags.iter().cloned());
        let ldflags = self.prepare_config_file(ldflags)?;

        let binary = out_dir.join(format!("{}.elf", self.deploy_name));
        let mut args = ldflags;
        args.push("-o".to_owned());
        args.push(binary.display().to_string());
        args.extend(objects.iter().map(|o| o.display().to_string()));

        process::run(LD, &args).await?;
        Ok(binary)
    }

    // The linker needs an sm-config-file declaring at least as many
    // connections as the module will carry. An existing flag is honored and
    // its file amended; otherwise a fresh one is generated.
    fn prepare_config_file(&self, mut ldflags: Vec<String>) -> Result<Vec<String>, ModuleError> {
        use serde_yaml::{Mapping, Value};

        let config_file = match ldflags
            .iter()
            .position(|flag| flag == "--sm-config-file")
            .and_then(|i| ldflags.get(i + 1).cloned())
        {
            Some(path) => PathBuf::from(path),
            None => {
                let path = self
                    .common
                    .out_dir
                    .join(format!("{}-config.yaml", self.deploy_name));
                ldflags.push("--sm-config-file".to_owned());
                ldflags.push(path.display().to_string());
                path
            }
        };

        let mut config: Mapping = std::fs::read_to_string(&config_file)
            .ok()
            .and_then(|content| serde_yaml::from_str(&content).ok())
            .unwrap_or_default();

        let module_key = Value::String(self.deploy_name.clone());
        let entries = match config.get(&module_key) {
            Some(Value::Sequence(entries)) => entries.clone(),
            _ => Vec::new(),
        };

        let declared = entries
            .iter()
            .filter_map(|entry| entry.get("num_connections"))
            .filter_map(Value::as_u64)
            .max();

        let needed = u64::from(self.common.connection_count());
        let mut entries = entries;
        if declared.map(|n| n < needed).unwrap_or(true) {
            let mut setting = Mapping::new();
            setting.insert(
                Value::String("num_connections".to_owned()),
                Value::Number(needed.into()),
            );
            entries.push(Value::Mapping(setting));
        }
        config.insert(module_key, Value::Sequence(entries));

        let content = serde_yaml::to_string(&Value::Mapping(config))
            .map_err(|e| io_error(&config_file, &e))?;
        std::fs::write(&config_file, content).map_err(|e| io_error(&config_file, &e))?;

        Ok(ldflags)
    }

    async fn deployment(&self, ctx: &Context) -> Result<&(u16, PathBuf), ModuleError> {
        self.deployment
            .get_or_try_init(|| async {
                let binary = self.binary(ctx).await?.clone();
                let node = self.common.node();
                let sancus = sancus_node(&node)?;

                let (module_id, symtab_bytes) = sancus.deploy(&self.deploy_name, &binary).await?;

                let symtab = self.common.out_dir.join(format!("{}.ld", self.deploy_name));
                tokio::fs::write(&symtab, symtab_bytes)
                    .await
                    .map_err(|e| io_error(&symtab, &e))?;

                self.common.set_deployed();
                Ok((module_id, symtab))
            })
            .await
    }

    async fn derive_key(&self, ctx: &Context) -> Result<Vec<u8>, ModuleError> {
        let (_, symtab) = self.deployment(ctx).await?;
        let binary = self.binary(ctx).await?;

        // Link against the deployed symbol table to reproduce the exact
        // image the node measured
        let linked = self
            .common
            .out_dir
            .join(format!("{}-linked.elf", self.deploy_name));

        // --noinhibit-exec: the linker complains about .bss alignment but
        // still produces the output we need
        let args = vec![
            "-T".to_owned(),
            symtab.display().to_string(),
            "-o".to_owned(),
            linked.display().to_string(),
            "--noinhibit-exec".to_owned(),
            binary.display().to_string(),
        ];
        process::run(MSP430_LD, &args).await?;

        let node = self.common.node();
        let sancus = sancus_node(&node)?;

        let args = vec![
            linked.display().to_string(),
            "--gen-sm-key".to_owned(),
            self.deploy_name.clone(),
            "--key".to_owned(),
            hex::encode(&sancus.vendor_key),
        ];
        let key = process::run_with_output(CRYPTO, &args).await?;

        info!("Module key for {}: {}", self.common.name, hex::encode(&key));
        Ok(key)
    }

    async fn symbol(&self, symbol: &str) -> Result<Option<u16>, ModuleError> {
        let (_, symtab) = self
            .deployment
            .get()
            .ok_or_else(|| ModuleError::NotDeployed(self.common.name.clone()))?;

        let content = tokio::fs::read_to_string(symtab)
            .await
            .map_err(|e| io_error(symtab, &e))?;

        // Symbol table lines are linker script assignments:
        //   __sm_foo_io_bar_idx = 0x2;
        let pattern = unwrap::unwrap!(Regex::new(
            r"(?m)^\s*(\S+)\s*=\s*(0x[0-9a-fA-F]+|\d+)\s*;"
        ));

        for capture in pattern.captures_iter(&content) {
            if &capture[1] != symbol {
                continue;
            }
            let value = &capture[2];
            let parsed = if let Some(hex_value) = value.strip_prefix("0x") {
                u16::from_str_radix(hex_value, 16)
            } else {
                value.parse()
            };
            return parsed.map(Some).map_err(|e| {
                ModuleError::Io(symtab.display().to_string(), e.to_string())
            });
        }

        Ok(None)
    }

    async fn io_id(&self, io: &EndpointRef) -> Result<u16, ModuleError> {
        if let Some(id) = io.as_id() {
            return Ok(id);
        }

        let symbol = format!("__sm_{}_io_{}_idx", self.deploy_name, io);
        self.symbol(&symbol)
            .await?
            .ok_or_else(|| ModuleError::UnknownEndpoint {
                module: self.common.name.clone(),
                kind: "endpoint",
                name: io.to_string(),
            })
    }

    async fn attest_manager(&self, ctx: &Context) -> Result<(), ModuleError> {
        let manager = match ctx.manager() {
            Some(manager) => manager,
            None => unreachable!("caller checked the manager"),
        };

        let node = self.common.node();
        let local_key = self.key(ctx).await?;

        let data = serde_json::json!({
            "id": self.module_id().await?,
            "name": self.common.name,
            "host": node.common().ip_address.to_string(),
            "port": node.common().reactive_port,
            "em_port": node.common().reactive_port,
            "key": local_key,
        });

        let data_file = self.common.out_dir.join("attest.json");
        std::fs::write(&data_file, data.to_string()).map_err(|e| io_error(&data_file, &e))?;

        let key = manager.attest("attest-sancus", &data_file).await?;
        if local_key != key {
            return Err(ModuleError::KeyMismatch(self.common.name.clone()));
        }

        info!(
            "Done Remote Attestation of {}. Key: {}",
            self.common.name,
            hex::encode(&key)
        );
        self.common.set_attested();
        Ok(())
    }
}

#[async_trait]
impl ModuleDriver for SancusModule {
    fn common(&self) -> &ModuleCommon {
        &self.common
    }

    fn dump(&self) -> ModuleRecord {
        let deployed = self.common.deployed();
        let deployment = self.deployment.get();

        ModuleRecord::Sancus(SancusModuleRecord {
            common: self.common.record(),
            files: self.files.clone(),
            cflags: Some(self.cflags.clone()),
            ldflags: Some(self.ldflags.clone()),
            binary: self.build.get().filter(|_| deployed).cloned(),
            id: deployment.filter(|_| deployed).map(|(id, _)| *id),
            symtab: deployment
                .filter(|_| deployed)
                .map(|(_, symtab)| symtab.clone()),
            key: self.key.get().filter(|_| deployed).cloned(),
            deploy_name: Some(self.deploy_name.clone()),
        })
    }

    fn clone_fresh(&self) -> Result<Module, ModuleError> {
        Ok(Module::Sancus(SancusModule {
            common: self.common.fresh_clone()?,
            files: self.files.clone(),
            cflags: self.cflags.clone(),
            ldflags: self.ldflags.clone(),
            deploy_name: increment_suffix(&self.deploy_name),
            build: OnceCell::new(),
            deployment: OnceCell::new(),
            key: OnceCell::new(),
            attestation: OnceCell::new(),
        }))
    }

    fn supported_encryption(&self) -> &'static [Encryption] {
        &[Encryption::Spongent]
    }

    fn default_encryption(&self) -> Encryption {
        Encryption::Spongent
    }

    async fn build(&self, ctx: &Context) -> Result<(), ModuleError> {
        self.binary(ctx).await.map(|_| ())
    }

    async fn deploy(&self, ctx: &Context) -> Result<(), ModuleError> {
        self.deployment(ctx).await.map(|_| ())
    }

    async fn attest(&self, ctx: &Context) -> Result<(), ModuleError> {
        if ctx.manager().is_some() {
            return self.attest_manager(ctx).await;
        }

        self.attestation
            .get_or_try_init(|| async {
                let module_id = self.module_id().await?;
                let key = self.key(ctx).await?;
                let node = self.common.node();
                sancus_node(&node)?
                    .attest(&self.common.name, module_id, &key)
                    .await?;
                self.common.set_attested();
                Ok(())
            })
            .await
            .map(|_| ())
    }

    async fn module_id(&self) -> Result<u16, ModuleError> {
        self.deployment
            .get()
            .map(|(id, _)| *id)
            .ok_or_else(|| ModuleError::NotDeployed(self.common.name.clone()))
    }

    async fn key(&self, ctx: &Context) -> Result<Vec<u8>, ModuleError> {
        self.key
            .get_or_try_init(|| self.derive_key(ctx))
            .await
            .map(Clone::clone)
    }

    async fn input_id(&self, input: &EndpointRef) -> Result<u16, ModuleError> {
        self.io_id(input).await
    }

    async fn output_id(&self, output: &EndpointRef) -> Result<u16, ModuleError> {
        self.io_id(output).await
    }

    async fn entry_id(&self, entry: &EndpointRef) -> Result<u16, ModuleError> {
        if let Some(id) = entry.as_id() {
            return Ok(id);
        }

        let symbol = format!("__sm_{}_entry_{}_idx", self.deploy_name, entry);
        self.symbol(&symbol)
            .await?
            .ok_or_else(|| ModuleError::UnknownEndpoint {
                module: self.common.name.clone(),
                kind: "entry",
                name: entry.to_string(),
            })
    }
}

fn sancus_node(node: &Arc<Node>) -> Result<&SancusNode, ModuleError> {
    match &**node {
        Node::Sancus(sancus) => Ok(sancus),
        other => Err(ModuleError::WrongNode(
            other.name().to_owned(),
            "sancus module".to_owned(),
        )),
    }
}

fn clean_dir(dir: &Path) -> Result<(), ModuleError> {
    for entry in std::fs::read_dir(dir).map_err(|e| io_error(dir, &e))? {
        let entry = entry.map_err(|e| io_error(dir, &e))?;
        if entry.path().is_file() {
            std::fs::remove_file(entry.path()).map_err(|e| io_error(&entry.path(), &e))?;
        }
    }
    Ok(())
}

async fn futures_join_all<I, F>(futures: I) -> Result<(), ModuleError>
where
    I: IntoIterator<Item = F>,
    F: std::future::Future<Output = Result<(), aex_common_tools::process::ProcessError>>,
{
    for result in futures::future::join_all(futures).await {
        result?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aex_common_tools::BuildMode;
    use aex_conf::{ModuleCommonRecord, SancusNodeRecord};
    use pretty_assertions::assert_eq;

    fn test_ctx(tag: &str) -> Context {
        let dir = std::env::temp_dir().join(format!("aex-sancus-mod-{}", tag));
        std::fs::create_dir_all(&dir).expect("build dir");
        Context::new(BuildMode::Debug, dir, None)
    }

    fn test_node() -> Arc<Node> {
        Arc::new(Node::Sancus(
            SancusNode::load(SancusNodeRecord {
                name: "n1".to_owned(),
                host: "127.0.0.1".to_owned(),
                reactive_port: 2001,
                deploy_port: Some(2000),
                vendor_id: 1,
                vendor_key: vec![0x42; 16],
            })
            .expect("node"),
        ))
    }

    fn seeded_record(symtab: &Path) -> SancusModuleRecord {
        SancusModuleRecord {
            common: ModuleCommonRecord {
                name: "m1".to_owned(),
                node: "n1".to_owned(),
                old_node: None,
                priority: None,
                deployed: Some(true),
                nonce: Some(4),
                attested: None,
            },
            files: vec![PathBuf::from("sm.c")],
            cflags: None,
            ldflags: None,
            binary: Some(PathBuf::from("/tmp/m1.elf")),
            id: Some(7),
            symtab: Some(symtab.to_owned()),
            key: Some(vec![0x11; 16]),
            deploy_name: None,
        }
    }

    #[tokio::test]
    async fn symbols_resolve_from_the_symbol_table() {
        let ctx = test_ctx("symbols");
        let symtab = ctx.build_dir.join("m1.ld");
        std::fs::write(
            &symtab,
            "__sm_m1_io_button_idx = 0x2;\n__sm_m1_entry_init_idx = 1;\nother = 0x99;\n",
        )
        .expect("symtab");

        let node = test_node();
        let module =
            SancusModule::load(seeded_record(&symtab), node.clone(), node, &ctx).expect("load");

        assert_eq!(
            module
                .input_id(&EndpointRef::from("button"))
                .await
                .expect("io id"),
            2
        );
        assert_eq!(
            module
                .entry_id(&EndpointRef::from("init"))
                .await
                .expect("entry id"),
            1
        );
        assert_eq!(
            module.entry_id(&EndpointRef::from("5")).await.expect("id"),
            5
        );
        assert!(module.input_id(&EndpointRef::from("missing")).await.is_err());
        assert_eq!(module.module_id().await.expect("module id"), 7);
    }

    #[tokio::test]
    async fn clone_clears_runtime_state_and_bumps_deploy_name() {
        let ctx = test_ctx("clone");
        let symtab = ctx.build_dir.join("m1.ld");
        std::fs::write(&symtab, "").expect("symtab");

        let node = test_node();
        let module =
            SancusModule::load(seeded_record(&symtab), node.clone(), node, &ctx).expect("load");
        assert!(module.common().deployed());

        let clone = module.clone_fresh().expect("clone");
        let clone = match clone {
            Module::Sancus(clone) => clone,
            other => panic!("wrong backend: {:?}", other),
        };

        assert_eq!(clone.deploy_name, "m2");
        assert!(!clone.common().deployed());
        assert_eq!(clone.common().nonce(), 0);
        assert!(clone.module_id().await.is_err());
    }

    #[test]
    fn config_file_covers_the_connection_count() {
        let ctx = test_ctx("config");
        let symtab = ctx.build_dir.join("m1.ld");
        std::fs::write(&symtab, "").expect("symtab");

        let node = test_node();
        let module =
            SancusModule::load(seeded_record(&symtab), node.clone(), node, &ctx).expect("load");
        module.common().add_connection();
        module.common().add_connection();

        let ldflags = module.prepare_config_file(Vec::new()).expect("prepare");
        let file_flag = ldflags
            .iter()
            .position(|f| f == "--sm-config-file")
            .expect("flag present");
        let config_path = PathBuf::from(&ldflags[file_flag + 1]);

        let content = std::fs::read_to_string(config_path).expect("config file");
        let config: serde_yaml::Value = serde_yaml::from_str(&content).expect("yaml");
        let entries = config.get("m1").and_then(|v| v.as_sequence()).expect("entries");
        assert_eq!(
            entries
                .iter()
                .filter_map(|e| e.get("num_connections"))
                .filter_map(|v| v.as_u64())
                .max(),
            Some(2)
        );
    }
}
