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

//! The node driver interface: shared EM operations as provided methods,
//! backend-specific behavior per implementation.

use crate::{packed_ip, put_u16, put_u32, NodeCommon, NodeError};
use aex_crypto::Encryption;
use aex_wire::{CommandCode, CommandMessage, Entrypoint};
use async_trait::async_trait;
use std::net::IpAddr;

/// Destination of a `Connect` command: where the events of a connection
/// have to be routed.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    /// Destination module name, for logging
    pub module_name: String,
    /// Destination module id
    pub module_id: u16,
    /// Whether source and destination live on the same node
    pub is_local: bool,
    /// Reactive port of the destination node
    pub reactive_port: u16,
    /// Address of the destination node
    pub ip_address: IpAddr,
}

/// Arguments of a SetKey delivery.
#[derive(Debug)]
pub struct SetKeyArgs<'a> {
    /// Module name, for logging
    pub module_name: &'a str,
    /// Module id on this node
    pub module_id: u16,
    /// Module key the connection key is wrapped under
    pub module_key: &'a [u8],
    /// Connection id
    pub conn_id: u16,
    /// Endpoint index the key is installed for
    pub io_id: u16,
    /// Module nonce bound into the associated data
    pub nonce: u16,
    /// AEAD suite of the connection
    pub encryption: Encryption,
    /// Connection key to install
    pub key: &'a [u8],
}

impl SetKeyArgs<'_> {
    /// The associated data of the SetKey payload:
    /// `encryption(u8) ‖ conn_id(u16) ‖ io_id(u16) ‖ nonce(u16)`.
    pub fn associated_data(&self) -> Vec<u8> {
        let mut ad = vec![self.encryption.to_u8()];
        put_u16(&mut ad, self.conn_id);
        put_u16(&mut ad, self.io_id);
        put_u16(&mut ad, self.nonce);
        ad
    }
}

/// Arguments of a Disable delivery.
#[derive(Debug)]
pub struct DisableArgs<'a> {
    /// Module name, for logging
    pub module_name: &'a str,
    /// Module id on this node
    pub module_id: u16,
    /// Module key authenticating the request
    pub module_key: &'a [u8],
    /// Module nonce bound into the associated data
    pub nonce: u16,
    /// AEAD suite the module speaks by default
    pub encryption: Encryption,
}

/// Driver interface of one Event Manager.
///
/// The provided methods implement the commands all EMs share; `deploy`-time
/// loading, `set_key` and `attest` live on the concrete backends.
#[async_trait]
pub trait NodeDriver: Send + Sync {
    /// Shared node fields.
    fn common(&self) -> &NodeCommon;

    /// Install a connection key on a module of this node. The default
    /// delivery wraps the key with AES-GCM under the module key, inside a
    /// `Call` of the reserved SetKey entrypoint.
    async fn set_key(&self, args: &SetKeyArgs<'_>) -> Result<(), NodeError> {
        let ad = args.associated_data();
        let cipher = Encryption::Aes.encrypt(args.module_key, &ad, args.key)?;

        let mut payload = Vec::new();
        put_u16(&mut payload, args.module_id);
        put_u16(&mut payload, Entrypoint::SetKey.to_u16());
        payload.extend_from_slice(&ad);
        payload.extend_from_slice(&cipher);

        self.common()
            .send_reactive_command(
                CommandMessage::new(CommandCode::Call, payload),
                Some(format!(
                    "Setting key of connection {} ({}:{}) on {} to {}",
                    args.conn_id,
                    args.module_name,
                    args.io_id,
                    self.common().name,
                    hex::encode(args.key)
                )),
            )
            .await?;

        Ok(())
    }

    /// Inform this (source) EM that a connection has been established, so
    /// events can be routed to the destination.
    async fn connect(&self, conn_id: u16, to: &ConnectTarget) -> Result<(), NodeError> {
        let mut payload = Vec::new();
        put_u16(&mut payload, conn_id);
        put_u16(&mut payload, to.module_id);
        payload.push(u8::from(to.is_local));
        put_u16(&mut payload, to.reactive_port);
        payload.extend_from_slice(&packed_ip(to.ip_address));

        self.common()
            .send_reactive_command(
                CommandMessage::new(CommandCode::Connect, payload),
                Some(format!("Connecting id {} to {}", conn_id, to.module_name)),
            )
            .await?;

        Ok(())
    }

    /// Call an entrypoint of a module on this node, returning the response
    /// payload.
    async fn call(
        &self,
        module_name: &str,
        module_id: u16,
        entry_id: u16,
        arg: Option<&[u8]>,
    ) -> Result<Vec<u8>, NodeError> {
        let mut payload = Vec::new();
        put_u16(&mut payload, module_id);
        put_u16(&mut payload, entry_id);
        if let Some(arg) = arg {
            payload.extend_from_slice(arg);
        }

        let result = self
            .common()
            .send_reactive_command(
                CommandMessage::new(CommandCode::Call, payload),
                Some(format!(
                    "Sending call command to {}:{} ({}:{}) on {}",
                    module_name,
                    entry_id,
                    module_id,
                    entry_id,
                    self.common().name
                )),
            )
            .await?;

        Ok(result.map(|r| r.payload).unwrap_or_default())
    }

    /// Trigger the output of a direct connection on this (destination)
    /// node. Fire-and-forget, like any output event.
    async fn output(
        &self,
        conn_name: &str,
        conn_id: u16,
        to_module_name: &str,
        to_module_id: u16,
        cipher: Vec<u8>,
    ) -> Result<(), NodeError> {
        let mut payload = Vec::new();
        put_u16(&mut payload, to_module_id);
        put_u16(&mut payload, conn_id);
        payload.extend_from_slice(&cipher);

        self.common()
            .send_reactive_command(
                CommandMessage::new(CommandCode::RemoteOutput, payload),
                Some(format!(
                    "Sending handle_output command of connection {}:{} to {} on {}",
                    conn_id,
                    conn_name,
                    to_module_name,
                    self.common().name
                )),
            )
            .await?;

        Ok(())
    }

    /// Trigger the request of a direct connection on this (destination)
    /// node, returning the encrypted response.
    async fn request(
        &self,
        conn_name: &str,
        conn_id: u16,
        to_module_name: &str,
        to_module_id: u16,
        cipher: Vec<u8>,
    ) -> Result<Vec<u8>, NodeError> {
        let mut payload = Vec::new();
        put_u16(&mut payload, to_module_id);
        put_u16(&mut payload, conn_id);
        payload.extend_from_slice(&cipher);

        let result = self
            .common()
            .send_reactive_command(
                CommandMessage::new(CommandCode::RemoteRequest, payload),
                Some(format!(
                    "Sending handle_request command of connection {}:{} to {} on {}",
                    conn_id,
                    conn_name,
                    to_module_name,
                    self.common().name
                )),
            )
            .await?;

        Ok(result.map(|r| r.payload).unwrap_or_default())
    }

    /// Register a periodic invocation of a module entrypoint.
    async fn register_entrypoint(
        &self,
        module_name: &str,
        module_id: u16,
        entry_id: u16,
        frequency_ms: u32,
    ) -> Result<(), NodeError> {
        let mut payload = Vec::new();
        put_u16(&mut payload, module_id);
        put_u16(&mut payload, entry_id);
        put_u32(&mut payload, frequency_ms);

        self.common()
            .send_reactive_command(
                CommandMessage::new(CommandCode::RegisterEntrypoint, payload),
                Some(format!(
                    "Sending RegisterEntrypoint command of {}:{} ({}:{}) on {}",
                    module_name,
                    entry_id,
                    module_id,
                    entry_id,
                    self.common().name
                )),
            )
            .await?;

        Ok(())
    }

    /// Permanently disable a module. The request is authenticated with the
    /// module key over the module's rolling nonce.
    async fn disable_module(&self, args: &DisableArgs<'_>) -> Result<(), NodeError> {
        let ad = args.nonce.to_be_bytes().to_vec();
        let cipher = args.encryption.encrypt(args.module_key, &ad, &ad)?;

        // Payload format: [module_id, entry_id, 16-bit nonce, cipher+tag]
        let mut payload = Vec::new();
        put_u16(&mut payload, args.module_id);
        put_u16(&mut payload, Entrypoint::Disable.to_u16());
        payload.extend_from_slice(&ad);
        payload.extend_from_slice(&cipher);

        self.common()
            .send_reactive_command(
                CommandMessage::new(CommandCode::Call, payload),
                Some(format!(
                    "Sending disable command to module {}",
                    args.module_name
                )),
            )
            .await?;

        Ok(())
    }

    /// Reset the node, deleting all modules and connections.
    async fn reset(&self) -> Result<(), NodeError> {
        self.common()
            .send_reactive_command(
                CommandMessage::new(CommandCode::Reset, Vec::new()),
                Some(format!("Resetting node {}", self.common().name)),
            )
            .await?;

        Ok(())
    }

    /// Cleanup hook invoked before the deployer terminates.
    async fn cleanup(&self) -> Result<(), NodeError> {
        Ok(())
    }
}
