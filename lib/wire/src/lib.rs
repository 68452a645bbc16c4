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

//! Command framing of the Event Manager wire protocol.
//!
//! Every command on the reactive port is `code(u16) ‖ length(u16) ‖ payload`,
//! big-endian; responses are `code(u16) ‖ length(u16) ‖ payload`. Artefact
//! uploads travel on the deploy port and carry their own length fields, so
//! they bypass the 16-bit frame.

#![deny(
    missing_docs,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces
)]

#[macro_use]
extern crate log;

mod message;

pub use message::{read_result, send_command, send_load, write_command, CommandMessage};

use failure::Fail;

/// Command codes understood by the Event Managers. The numeric identity is
/// fixed by the EM ABI.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommandCode {
    /// Route a connection on the source EM
    Connect,
    /// Invoke a module entrypoint
    Call,
    /// Deliver an output event to a remote input
    RemoteOutput,
    /// Deliver a request event to a remote handler
    RemoteRequest,
    /// Upload a module artefact (deploy port)
    Load,
    /// Drop all modules and connections of the EM
    Reset,
    /// Register a periodic entrypoint invocation
    RegisterEntrypoint,
    /// Direct key distribution, for EMs that accept it outside `Call`
    SetKey,
}

impl CommandCode {
    /// Wire value of the command
    pub fn to_u16(self) -> u16 {
        match self {
            CommandCode::Connect => 0x0,
            CommandCode::Call => 0x1,
            CommandCode::RemoteOutput => 0x2,
            CommandCode::RemoteRequest => 0x3,
            CommandCode::Load => 0x4,
            CommandCode::Reset => 0x5,
            CommandCode::RegisterEntrypoint => 0x6,
            CommandCode::SetKey => 0x7,
        }
    }

    /// Command from its wire value
    pub fn from_u16(value: u16) -> Result<CommandCode, WireError> {
        match value {
            0x0 => Ok(CommandCode::Connect),
            0x1 => Ok(CommandCode::Call),
            0x2 => Ok(CommandCode::RemoteOutput),
            0x3 => Ok(CommandCode::RemoteRequest),
            0x4 => Ok(CommandCode::Load),
            0x5 => Ok(CommandCode::Reset),
            0x6 => Ok(CommandCode::RegisterEntrypoint),
            0x7 => Ok(CommandCode::SetKey),
            other => Err(WireError::UnknownCommand(other)),
        }
    }

    /// Whether the EM answers this command with a `ReactiveResult`. Output
    /// events are fire-and-forget; loads are acknowledged out of band.
    pub fn has_response(self) -> bool {
        !matches!(self, CommandCode::RemoteOutput | CommandCode::Load)
    }
}

/// Entrypoints every module reserves for the deployer, used as the inner
/// selector of a `Call`. User entrypoints start after these.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Entrypoint {
    /// Install a connection key
    SetKey,
    /// Challenge-response attestation
    Attest,
    /// Permanently disable the module
    Disable,
    /// Deliver an input event
    HandleInput,
    /// Deliver a request event
    HandleHandler,
}

impl Entrypoint {
    /// Wire value of the entrypoint
    pub fn to_u16(self) -> u16 {
        match self {
            Entrypoint::SetKey => 0x0,
            Entrypoint::Attest => 0x1,
            Entrypoint::Disable => 0x2,
            Entrypoint::HandleInput => 0x3,
            Entrypoint::HandleHandler => 0x4,
        }
    }
}

/// Result codes of a `ReactiveResult`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResultCode {
    /// Success
    Ok,
    /// The EM does not know the command
    IllegalCommand,
    /// Malformed payload
    IllegalPayload,
    /// EM-side failure
    InternalError,
    /// Unknown module, entrypoint or connection
    BadRequest,
    /// AEAD verification failed on the module side
    CryptoError,
    /// Code outside the known set
    Unknown(u16),
}

impl ResultCode {
    /// Result code from its wire value
    pub fn from_u16(value: u16) -> ResultCode {
        match value {
            0x0 => ResultCode::Ok,
            0x1 => ResultCode::IllegalCommand,
            0x2 => ResultCode::IllegalPayload,
            0x3 => ResultCode::InternalError,
            0x4 => ResultCode::BadRequest,
            0x5 => ResultCode::CryptoError,
            other => ResultCode::Unknown(other),
        }
    }

    /// Wire value of the result code
    pub fn to_u16(self) -> u16 {
        match self {
            ResultCode::Ok => 0x0,
            ResultCode::IllegalCommand => 0x1,
            ResultCode::IllegalPayload => 0x2,
            ResultCode::InternalError => 0x3,
            ResultCode::BadRequest => 0x4,
            ResultCode::CryptoError => 0x5,
            ResultCode::Unknown(other) => other,
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Response of an Event Manager to a framed command.
#[derive(Debug, Clone)]
pub struct ReactiveResult {
    /// Result code; anything but `Ok` is an error
    pub code: ResultCode,
    /// Response payload
    pub payload: Vec<u8>,
}

impl ReactiveResult {
    /// Whether the command succeeded
    pub fn ok(&self) -> bool {
        self.code == ResultCode::Ok
    }
}

/// Errors of the wire layer.
#[derive(Debug, Fail)]
pub enum WireError {
    /// TCP or framing I/O failed
    #[fail(display = "i/o error on EM channel: {}", _0)]
    Io(std::io::Error),
    /// The EM answered with a non-Ok result code
    #[fail(display = "reactive command {:?} failed with code {}", _0, _1)]
    CommandFailed(CommandCode, ResultCode),
    /// Unknown command code on the wire
    #[fail(display = "unknown command code {}", _0)]
    UnknownCommand(u16),
    /// Payload cannot be expressed in a 16-bit frame
    #[fail(display = "payload of {} bytes exceeds the frame limit", _0)]
    PayloadTooLarge(usize),
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        WireError::Io(e)
    }
}
