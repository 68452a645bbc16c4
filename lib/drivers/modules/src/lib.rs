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

//! Per-backend module drivers.
//!
//! A module driver owns the artefact pipeline of one software module
//! (generate → build → convert/sign → deploy → key → attest) and its
//! lifecycle state. Every artefact is a memoised async computation: the
//! first caller runs it, concurrent callers await the same run, and a
//! failure leaves the slot empty.

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
#[macro_use]
extern crate serde_derive;

mod codegen;
mod native;
mod sancus;
mod sgx;
mod trustzone;

pub use native::NativeModule;
pub use sancus::SancusModule;
pub use sgx::SgxModule;
pub use trustzone::TrustZoneModule;

use aex_common_tools::process::ProcessError;
use aex_conf::{EndpointRef, ModuleCommonRecord, ModuleRecord};
use aex_crypto::{CryptoError, Encryption};
use aex_manager::{Context, ManagerError};
use aex_nodes::{DisableArgs, Node, NodeError, SetKeyArgs};
use failure::Fail;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, MutexGuard};
use unwrap::unwrap;

/// Module driver errors.
#[derive(Debug, Fail)]
pub enum ModuleError {
    /// Node driver failure
    #[fail(display = "{}", _0)]
    Node(NodeError),
    /// External toolchain failure
    #[fail(display = "{}", _0)]
    Process(ProcessError),
    /// Crypto failure while deriving or wrapping keys
    #[fail(display = "{}", _0)]
    Crypto(CryptoError),
    /// Attestation manager failure
    #[fail(display = "{}", _0)]
    Manager(ManagerError),
    /// Filesystem failure around module artefacts
    #[fail(display = "i/o error on {}: {}", _0, _1)]
    Io(String, String),
    /// Operation needs the module deployed first
    #[fail(display = "module {} is not deployed yet", _0)]
    NotDeployed(String),
    /// Operation needs the module key established first
    #[fail(display = "module {} has no key yet", _0)]
    NoKey(String),
    /// Endpoint name not found in the module artefacts
    #[fail(display = "module {} has no {} named {}", module, kind, name)]
    UnknownEndpoint {
        /// Module name
        module: String,
        /// Endpoint kind (input, output, entry, request, handler)
        kind: &'static str,
        /// Looked-up name
        name: String,
    },
    /// The backend has no request/handler endpoints
    #[fail(display = "{} messages not supported for {}", kind, module)]
    EndpointsUnsupported {
        /// Module name
        module: String,
        /// Endpoint kind
        kind: &'static str,
    },
    /// The connection suite is not supported by the module
    #[fail(display = "module {} does not support {} encryption", _0, _1)]
    UnsupportedEncryption(String, Encryption),
    /// Module type and node type do not match
    #[fail(display = "node {} does not support module {}", _0, _1)]
    WrongNode(String, String),
    /// Remotely attested key differs from the locally derived one
    #[fail(display = "received key is different from {} key", _0)]
    KeyMismatch(String),
    /// Code generator output did not parse
    #[fail(display = "bad code generator manifest for {}: {}", _0, _1)]
    BadManifest(String, String),
    /// Malformed TA UUID
    #[fail(display = "bad TA uuid: {}", _0)]
    BadUuid(String),
}

impl From<NodeError> for ModuleError {
    fn from(e: NodeError) -> Self {
        ModuleError::Node(e)
    }
}

impl From<ProcessError> for ModuleError {
    fn from(e: ProcessError) -> Self {
        ModuleError::Process(e)
    }
}

impl From<CryptoError> for ModuleError {
    fn from(e: CryptoError) -> Self {
        ModuleError::Crypto(e)
    }
}

impl From<ManagerError> for ModuleError {
    fn from(e: ManagerError) -> Self {
        ModuleError::Manager(e)
    }
}

pub(crate) fn io_error(what: &std::path::Path, e: &dyn std::fmt::Display) -> ModuleError {
    ModuleError::Io(what.display().to_string(), e.to_string())
}

/// The endpoint of a connection on one module side.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionIo {
    /// Source output endpoint
    Output(EndpointRef),
    /// Destination input endpoint
    Input(EndpointRef),
    /// Source request endpoint
    Request(EndpointRef),
    /// Destination handler endpoint
    Handler(EndpointRef),
}

impl ConnectionIo {
    /// The endpoint reference this side carries.
    pub fn endpoint(&self) -> &EndpointRef {
        match self {
            ConnectionIo::Output(e)
            | ConnectionIo::Input(e)
            | ConnectionIo::Request(e)
            | ConnectionIo::Handler(e) => e,
        }
    }

    /// Resolve the endpoint to its index on the given module.
    pub async fn index(&self, module: &Module) -> Result<u16, ModuleError> {
        match self {
            ConnectionIo::Output(e) => module.driver().output_id(e).await,
            ConnectionIo::Input(e) => module.driver().input_id(e).await,
            ConnectionIo::Request(e) => module.driver().request_id(e).await,
            ConnectionIo::Handler(e) => module.driver().handler_id(e).await,
        }
    }
}

impl std::fmt::Display for ConnectionIo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.endpoint())
    }
}

/// Lifecycle state and fields shared by every module backend.
#[derive(Debug)]
pub struct ModuleCommon {
    /// Module name
    pub name: String,
    /// Deployment priority
    pub priority: Option<u64>,
    /// Per-module build directory
    pub out_dir: PathBuf,
    node: RwLock<Arc<Node>>,
    old_node: RwLock<Arc<Node>>,
    deployed: AtomicBool,
    attested: AtomicBool,
    nonce: AtomicU16,
    nonce_lock: Mutex<()>,
    connections: AtomicU16,
}

impl ModuleCommon {
    /// Build the shared module state, creating the build directory.
    pub fn new(
        record: &ModuleCommonRecord,
        node: Arc<Node>,
        old_node: Arc<Node>,
        out_dir: PathBuf,
    ) -> Result<ModuleCommon, ModuleError> {
        std::fs::create_dir_all(&out_dir).map_err(|e| io_error(&out_dir, &e))?;

        Ok(ModuleCommon {
            name: record.name.clone(),
            priority: record.priority,
            out_dir,
            node: RwLock::new(node),
            old_node: RwLock::new(old_node),
            deployed: AtomicBool::new(record.deployed.unwrap_or(false)),
            attested: AtomicBool::new(record.attested.unwrap_or(false)),
            nonce: AtomicU16::new(record.nonce.unwrap_or(0)),
            nonce_lock: Mutex::new(()),
            connections: AtomicU16::new(0),
        })
    }

    /// Copy of this state with the lifecycle cleared, for module clones.
    pub fn fresh_clone(&self) -> Result<ModuleCommon, ModuleError> {
        ModuleCommon::new(
            &ModuleCommonRecord {
                name: self.name.clone(),
                node: self.node().name().to_owned(),
                old_node: Some(self.old_node().name().to_owned()),
                priority: self.priority,
                deployed: None,
                nonce: None,
                attested: None,
            },
            self.node(),
            self.old_node(),
            self.out_dir.clone(),
        )
    }

    /// Node the module deploys to.
    pub fn node(&self) -> Arc<Node> {
        unwrap!(self.node.read()).clone()
    }

    /// Re-home the module (used by the update flow).
    pub fn set_node(&self, node: Arc<Node>) {
        *unwrap!(self.node.write()) = node;
    }

    /// Node the module ran on before an update.
    pub fn old_node(&self) -> Arc<Node> {
        unwrap!(self.old_node.read()).clone()
    }

    /// Record the pre-update node.
    pub fn set_old_node(&self, node: Arc<Node>) {
        *unwrap!(self.old_node.write()) = node;
    }

    /// Whether the module is loaded on its node.
    pub fn deployed(&self) -> bool {
        self.deployed.load(Ordering::SeqCst)
    }

    /// Mark the module deployed.
    pub fn set_deployed(&self) {
        self.deployed.store(true, Ordering::SeqCst);
    }

    /// Whether the module key is established.
    pub fn attested(&self) -> bool {
        self.attested.load(Ordering::SeqCst)
    }

    /// Mark the module attested.
    pub fn set_attested(&self) {
        self.attested.store(true, Ordering::SeqCst);
    }

    /// Current SetKey/Disable nonce.
    pub fn nonce(&self) -> u16 {
        self.nonce.load(Ordering::SeqCst)
    }

    /// Serialize nonce users; the guard must be held from reading the nonce
    /// until `bump_nonce`, so concurrent senders produce strictly
    /// increasing values.
    pub async fn nonce_guard(&self) -> MutexGuard<'_, ()> {
        self.nonce_lock.lock().await
    }

    /// Advance the nonce after a successful send.
    pub fn bump_nonce(&self) {
        self.nonce.fetch_add(1, Ordering::SeqCst);
    }

    /// Count one connection endpoint on this module.
    pub fn add_connection(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of connection endpoints on this module.
    pub fn connection_count(&self) -> u16 {
        self.connections.load(Ordering::SeqCst)
    }

    /// Common descriptor fields of the current state. Lifecycle flags only
    /// appear once they are set.
    pub fn record(&self) -> ModuleCommonRecord {
        ModuleCommonRecord {
            name: self.name.clone(),
            node: self.node().name().to_owned(),
            old_node: Some(self.old_node().name().to_owned()),
            priority: self.priority,
            deployed: if self.deployed() { Some(true) } else { None },
            nonce: Some(self.nonce()),
            attested: if self.attested() { Some(true) } else { None },
        }
    }
}

/// Driver interface of one software module.
#[async_trait::async_trait]
pub trait ModuleDriver: Send + Sync {
    /// Shared lifecycle state.
    fn common(&self) -> &ModuleCommon;

    /// Dump the module back to its descriptor record.
    fn dump(&self) -> ModuleRecord;

    /// Copy of the module with cleared runtime state, for updates.
    fn clone_fresh(&self) -> Result<Module, ModuleError>;

    /// AEAD suites the module can speak.
    fn supported_encryption(&self) -> &'static [Encryption];

    /// Preferred AEAD suite.
    fn default_encryption(&self) -> Encryption;

    /// Produce the module binary from sources.
    async fn build(&self, ctx: &Context) -> Result<(), ModuleError>;

    /// Load the module onto its node.
    async fn deploy(&self, ctx: &Context) -> Result<(), ModuleError>;

    /// Establish the module key.
    async fn attest(&self, ctx: &Context) -> Result<(), ModuleError>;

    /// On-node module id.
    async fn module_id(&self) -> Result<u16, ModuleError>;

    /// Module key.
    async fn key(&self, ctx: &Context) -> Result<Vec<u8>, ModuleError>;

    /// Index of an input endpoint.
    async fn input_id(&self, input: &EndpointRef) -> Result<u16, ModuleError>;

    /// Index of an output endpoint.
    async fn output_id(&self, output: &EndpointRef) -> Result<u16, ModuleError>;

    /// Index of a callable entrypoint.
    async fn entry_id(&self, entry: &EndpointRef) -> Result<u16, ModuleError>;

    /// Index of an outgoing request endpoint.
    async fn request_id(&self, request: &EndpointRef) -> Result<u16, ModuleError> {
        let _ = request;
        Err(ModuleError::EndpointsUnsupported {
            module: self.common().name.clone(),
            kind: "request",
        })
    }

    /// Index of a request handler endpoint.
    async fn handler_id(&self, handler: &EndpointRef) -> Result<u16, ModuleError> {
        let _ = handler;
        Err(ModuleError::EndpointsUnsupported {
            module: self.common().name.clone(),
            kind: "handler",
        })
    }

    /// Cleanup hook invoked before the deployer terminates.
    async fn cleanup(&self) -> Result<(), ModuleError> {
        Ok(())
    }
}

/// Module backends, tagged union over the supported TEE platforms.
#[derive(Debug)]
pub enum Module {
    /// MSP430-class module
    Sancus(SancusModule),
    /// SGX enclave module
    Sgx(SgxModule),
    /// Native (no-TEE) module
    Native(NativeModule),
    /// TrustZone trusted application
    TrustZone(TrustZoneModule),
}

impl Module {
    /// Build a module from its descriptor record, checking that its node
    /// backend matches.
    pub fn load(
        record: ModuleRecord,
        node: Arc<Node>,
        old_node: Arc<Node>,
        ctx: &Context,
    ) -> Result<Module, ModuleError> {
        let mismatch = |module: &ModuleCommonRecord| {
            ModuleError::WrongNode(node.name().to_owned(), module.name.clone())
        };

        match record {
            ModuleRecord::Sancus(r) => match &*node {
                Node::Sancus(_) => Ok(Module::Sancus(SancusModule::load(
                    r,
                    node.clone(),
                    old_node,
                    ctx,
                )?)),
                _ => Err(mismatch(&r.common)),
            },
            ModuleRecord::Sgx(r) => match &*node {
                Node::Sgx(_) => Ok(Module::Sgx(SgxModule::load(r, node.clone(), old_node, ctx)?)),
                _ => Err(mismatch(&r.common)),
            },
            ModuleRecord::Native(r) => match &*node {
                Node::Native(_) => Ok(Module::Native(NativeModule::load(
                    r,
                    node.clone(),
                    old_node,
                    ctx,
                )?)),
                _ => Err(mismatch(&r.common)),
            },
            ModuleRecord::TrustZone(r) => match &*node {
                Node::TrustZone(_) => Ok(Module::TrustZone(TrustZoneModule::load(
                    r,
                    node.clone(),
                    old_node,
                    ctx,
                )?)),
                _ => Err(mismatch(&r.common)),
            },
        }
    }

    /// The driver interface of this module.
    pub fn driver(&self) -> &dyn ModuleDriver {
        match self {
            Module::Sancus(m) => m,
            Module::Sgx(m) => m,
            Module::Native(m) => m,
            Module::TrustZone(m) => m,
        }
    }

    /// Shared lifecycle state.
    pub fn common(&self) -> &ModuleCommon {
        self.driver().common()
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.common().name
    }

    /// Backend name, as used in descriptors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Module::Sancus(_) => "sancus",
            Module::Sgx(_) => "sgx",
            Module::Native(_) => "native",
            Module::TrustZone(_) => "trustzone",
        }
    }

    /// Node the module deploys to.
    pub fn node(&self) -> Arc<Node> {
        self.common().node()
    }

    /// Install a connection key on this module. Uses the module nonce as
    /// associated data and advances it once the EM acknowledged the key.
    pub async fn set_key(
        &self,
        ctx: &Context,
        conn_id: u16,
        conn_io: &ConnectionIo,
        encryption: Encryption,
        key: &[u8],
    ) -> Result<(), ModuleError> {
        if !self.driver().supported_encryption().contains(&encryption) {
            return Err(ModuleError::UnsupportedEncryption(
                self.name().to_owned(),
                encryption,
            ));
        }

        let io_id = conn_io.index(self).await?;
        let module_id = self.driver().module_id().await?;
        let module_key = self.driver().key(ctx).await?;
        let node = self.node();

        let _guard = self.common().nonce_guard().await;
        let nonce = self.common().nonce();

        node.driver()
            .set_key(&SetKeyArgs {
                module_name: self.name(),
                module_id,
                module_key: &module_key,
                conn_id,
                io_id,
                nonce,
                encryption,
                key,
            })
            .await?;

        self.common().bump_nonce();
        Ok(())
    }

    /// Permanently disable this module on the node it was deployed to
    /// before any update.
    pub async fn disable(&self, ctx: &Context) -> Result<(), ModuleError> {
        let module_id = self.driver().module_id().await?;
        let module_key = self.driver().key(ctx).await?;
        let old_node = self.common().old_node();

        let _guard = self.common().nonce_guard().await;
        let nonce = self.common().nonce();

        old_node
            .driver()
            .disable_module(&DisableArgs {
                module_name: self.name(),
                module_id,
                module_key: &module_key,
                nonce,
                encryption: self.driver().default_encryption(),
            })
            .await?;

        self.common().bump_nonce();
        Ok(())
    }

    /// Call an entrypoint of this module, returning the response payload.
    pub async fn call(
        &self,
        entry: &EndpointRef,
        arg: Option<&[u8]>,
    ) -> Result<Vec<u8>, ModuleError> {
        let module_id = self.driver().module_id().await?;
        let entry_id = self.driver().entry_id(entry).await?;

        Ok(self
            .node()
            .driver()
            .call(self.name(), module_id, entry_id, arg)
            .await?)
    }

    /// Register a periodic invocation of an entrypoint of this module.
    pub async fn register_entrypoint(
        &self,
        entry: &EndpointRef,
        frequency_ms: u32,
    ) -> Result<(), ModuleError> {
        let module_id = self.driver().module_id().await?;
        let entry_id = self.driver().entry_id(entry).await?;

        Ok(self
            .node()
            .driver()
            .register_entrypoint(self.name(), module_id, entry_id, frequency_ms)
            .await?)
    }
}

pub(crate) fn lookup_endpoint(
    module: &str,
    kind: &'static str,
    map: &BTreeMap<String, u16>,
    endpoint: &EndpointRef,
) -> Result<u16, ModuleError> {
    if let Some(id) = endpoint.as_id() {
        return Ok(id);
    }

    let name = match endpoint {
        EndpointRef::Name(name) => name,
        EndpointRef::Id(_) => unreachable!("ids are handled above"),
    };

    map.get(name)
        .copied()
        .ok_or_else(|| ModuleError::UnknownEndpoint {
            module: module.to_owned(),
            kind,
            name: name.clone(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    #[test]
    fn endpoint_lookup_prefers_numeric_ids() {
        let map = btreemap! {"feed".to_owned() => 3u16, "7".to_owned() => 9u16};

        let by_name = lookup_endpoint("m1", "input", &map, &EndpointRef::from("feed"));
        assert_eq!(by_name.expect("by name"), 3);

        // A numeric-looking name is an id, even if a map entry shadows it
        let numeric = lookup_endpoint("m1", "input", &map, &EndpointRef::from("7"));
        assert_eq!(numeric.expect("numeric"), 7);

        match lookup_endpoint("m1", "input", &map, &EndpointRef::from("missing")) {
            Err(ModuleError::UnknownEndpoint { kind, name, .. }) => {
                assert_eq!(kind, "input");
                assert_eq!(name, "missing");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
