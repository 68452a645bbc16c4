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

//! Connections between module endpoints (or from the deployer itself), and
//! their establishment state machine.

use crate::errors::Error;
use aex_conf::ConnectionRecord;
use aex_crypto::Encryption;
use aex_manager::Context;
use aex_modules::{ConnectionIo, Module};
use aex_nodes::ConnectTarget;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

/// One connection of the deployment graph: an output→input or
/// request→handler edge, or a direct edge from the deployer to a module.
#[derive(Debug)]
pub struct Connection {
    /// Connection id, unique in the descriptor
    pub id: u16,
    /// Human-readable name
    pub name: String,
    /// Source module; `None` for direct connections
    pub from_module: Option<Arc<Module>>,
    /// Source endpoint; `None` for direct connections
    pub from_io: Option<ConnectionIo>,
    /// Destination module
    pub to_module: Arc<Module>,
    /// Destination endpoint
    pub to_io: ConnectionIo,
    /// AEAD suite protecting the events of this connection
    pub encryption: Encryption,
    /// Whether the deployer itself is the source
    pub direct: bool,
    key: Vec<u8>,
    nonce: AtomicU16,
    established: AtomicBool,
}

impl Connection {
    /// Build a connection, counting one endpoint on each involved module
    /// (the MSP430-class linker wants the count at build time).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u16,
        name: String,
        from_module: Option<Arc<Module>>,
        from_io: Option<ConnectionIo>,
        to_module: Arc<Module>,
        to_io: ConnectionIo,
        encryption: Encryption,
        key: Option<Vec<u8>>,
        direct: bool,
        nonce: u16,
        established: bool,
    ) -> Connection {
        if let Some(from_module) = &from_module {
            from_module.common().add_connection();
        }
        to_module.common().add_connection();

        Connection {
            id,
            name,
            from_module,
            from_io,
            to_module,
            to_io,
            encryption,
            direct,
            key: key.unwrap_or_else(|| aex_crypto::generate_key(encryption.key_size())),
            nonce: AtomicU16::new(nonce),
            established: AtomicBool::new(established),
        }
    }

    /// One-shot connection used by the update flow to transfer state from
    /// the old module's output to the new module's input.
    pub fn transfer(
        id: u16,
        from_module: Arc<Module>,
        from_output: ConnectionIo,
        to_module: Arc<Module>,
        to_input: ConnectionIo,
    ) -> Connection {
        let encryption = from_module.driver().default_encryption();
        Connection::new(
            id,
            "__transfer".to_owned(),
            Some(from_module),
            Some(from_output),
            to_module,
            to_input,
            encryption,
            None,
            false,
            0,
            false,
        )
    }

    /// Copy of this connection with a fresh key and cleared establishment
    /// state, endpoints retargeted from `old` to `new` where they match.
    pub fn clone_fresh(&self, old: &Arc<Module>, new: &Arc<Module>) -> Connection {
        let retarget = |module: &Arc<Module>| {
            if Arc::ptr_eq(module, old) {
                new.clone()
            } else {
                module.clone()
            }
        };

        Connection {
            id: self.id,
            name: self.name.clone(),
            from_module: self.from_module.as_ref().map(retarget),
            from_io: self.from_io.clone(),
            to_module: retarget(&self.to_module),
            to_io: self.to_io.clone(),
            encryption: self.encryption,
            direct: self.direct,
            key: aex_crypto::generate_key(self.encryption.key_size()),
            nonce: AtomicU16::new(0),
            established: AtomicBool::new(false),
        }
    }

    /// Whether one of this connection's endpoints is the given module.
    pub fn involves(&self, module: &Arc<Module>) -> bool {
        Arc::ptr_eq(&self.to_module, module)
            || self
                .from_module
                .as_ref()
                .map(|from| Arc::ptr_eq(from, module))
                .unwrap_or(false)
    }

    /// Connection key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Current AEAD nonce.
    pub fn nonce(&self) -> u16 {
        self.nonce.load(Ordering::SeqCst)
    }

    /// Whether keys are distributed and routing is set up.
    pub fn established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    /// Distribute the connection key to both sides, then install the route
    /// on the source EM. Any failure leaves the connection unestablished
    /// and nothing is persisted.
    pub async fn establish(&self, ctx: &Context) -> Result<(), Error> {
        if self.established() {
            return Ok(());
        }

        self.to_module
            .set_key(ctx, self.id, &self.to_io, self.encryption, &self.key)
            .await?;

        if let (Some(from_module), Some(from_io)) = (&self.from_module, &self.from_io) {
            from_module
                .set_key(ctx, self.id, from_io, self.encryption, &self.key)
                .await?;

            let from_node = from_module.node();
            let to_node = self.to_module.node();
            let target = ConnectTarget {
                module_name: self.to_module.name().to_owned(),
                module_id: self.to_module.driver().module_id().await?,
                is_local: Arc::ptr_eq(&from_node, &to_node),
                reactive_port: to_node.common().reactive_port,
                ip_address: to_node.common().ip_address,
            };

            from_node.driver().connect(self.id, &target).await?;
        }

        self.established.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Trigger the output of this (direct) connection with the given
    /// argument. The 16-bit nonce is the associated data and advances by
    /// one per event.
    pub async fn output(&self, arg: &[u8]) -> Result<(), Error> {
        let nonce = self.nonce();
        let cipher = self
            .encryption
            .encrypt(&self.key, &nonce.to_be_bytes(), arg)?;

        let node = self.to_module.node();
        node.driver()
            .output(
                &self.name,
                self.id,
                self.to_module.name(),
                self.to_module.driver().module_id().await?,
                cipher,
            )
            .await?;

        self.nonce.store(nonce.wrapping_add(1), Ordering::SeqCst);
        Ok(())
    }

    /// Trigger the request of this (direct) connection; the response is
    /// authenticated under `nonce + 1` and the nonce advances by two.
    pub async fn request(&self, arg: &[u8]) -> Result<Vec<u8>, Error> {
        let nonce = self.nonce();
        let cipher = self
            .encryption
            .encrypt(&self.key, &nonce.to_be_bytes(), arg)?;

        let node = self.to_module.node();
        let response = node
            .driver()
            .request(
                &self.name,
                self.id,
                self.to_module.name(),
                self.to_module.driver().module_id().await?,
                cipher,
            )
            .await?;

        let plain = self.encryption.decrypt(
            &self.key,
            &nonce.wrapping_add(1).to_be_bytes(),
            &response,
        )?;

        self.nonce.store(nonce.wrapping_add(2), Ordering::SeqCst);
        Ok(plain)
    }

    /// Dump the connection back to its descriptor record. The key only
    /// persists once the connection is established.
    pub fn dump(&self) -> ConnectionRecord {
        let established = self.established();

        let (from_output, from_request) = match &self.from_io {
            Some(ConnectionIo::Output(endpoint)) => (Some(endpoint.clone()), None),
            Some(ConnectionIo::Request(endpoint)) => (None, Some(endpoint.clone())),
            _ => (None, None),
        };
        let (to_input, to_handler) = match &self.to_io {
            ConnectionIo::Input(endpoint) => (Some(endpoint.clone()), None),
            ConnectionIo::Handler(endpoint) => (None, Some(endpoint.clone())),
            _ => (None, None),
        };

        ConnectionRecord {
            name: Some(self.name.clone()),
            from_module: self.from_module.as_ref().map(|m| m.name().to_owned()),
            from_output,
            from_request,
            to_module: self.to_module.name().to_owned(),
            to_input,
            to_handler,
            encryption: self.encryption,
            key: if established {
                Some(self.key.clone())
            } else {
                None
            },
            id: Some(self.id),
            direct: Some(self.direct),
            nonce: Some(self.nonce()),
            established: if established { Some(true) } else { None },
        }
    }
}
