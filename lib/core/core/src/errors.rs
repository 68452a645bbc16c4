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

//! Orchestrator errors.

use aex_conf::DescriptorError;
use aex_crypto::CryptoError;
use aex_manager::ManagerError;
use aex_modules::ModuleError;
use aex_nodes::NodeError;
use failure::Fail;

/// Top-level error of every orchestrator operation.
#[derive(Debug, Fail)]
pub enum Error {
    /// Descriptor loading, validation or dumping failed
    #[fail(display = "{}", _0)]
    Descriptor(DescriptorError),
    /// A module driver failed
    #[fail(display = "{}", _0)]
    Module(ModuleError),
    /// A node driver failed
    #[fail(display = "{}", _0)]
    Node(NodeError),
    /// An AEAD operation failed
    #[fail(display = "{}", _0)]
    Crypto(CryptoError),
    /// The attestation manager failed
    #[fail(display = "{}", _0)]
    Manager(ManagerError),
    /// An operation was requested out of lifecycle order
    #[fail(display = "{}", _0)]
    Precondition(String),
    /// Unknown node name
    #[fail(display = "No node with name {}", _0)]
    NoSuchNode(String),
    /// Unknown module name
    #[fail(display = "No module with name {}", _0)]
    NoSuchModule(String),
    /// Unknown connection name
    #[fail(display = "No connection with name {}", _0)]
    NoSuchConnection(String),
    /// Unknown connection id
    #[fail(display = "No connection with ID {}", _0)]
    NoSuchConnectionId(u16),
    /// Unknown periodic event name
    #[fail(display = "No periodic event with name {}", _0)]
    NoSuchEvent(String),
    /// Filesystem failure
    #[fail(display = "i/o error on {}: {}", _0, _1)]
    Io(String, String),
}

impl From<DescriptorError> for Error {
    fn from(e: DescriptorError) -> Self {
        Error::Descriptor(e)
    }
}

impl From<ModuleError> for Error {
    fn from(e: ModuleError) -> Self {
        Error::Module(e)
    }
}

impl From<NodeError> for Error {
    fn from(e: NodeError) -> Self {
        Error::Node(e)
    }
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self {
        Error::Crypto(e)
    }
}

impl From<ManagerError> for Error {
    fn from(e: ManagerError) -> Self {
        Error::Manager(e)
    }
}
