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

//! Process-wide state of one deployer run, passed explicitly to every
//! operation that needs it.

use crate::Manager;
use aex_common_tools::BuildMode;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Service-provider RSA key material for SGX remote attestation, generated
/// once per process.
#[derive(Debug, Clone)]
pub struct SpKeys {
    /// Public key PEM
    pub pubkey: PathBuf,
    /// Private key PEM
    pub privkey: PathBuf,
    /// IAS root certificate PEM
    pub ias_cert: PathBuf,
}

/// State shared by all operations of one deployer run.
#[derive(Debug)]
pub struct Context {
    /// Build mode for the module toolchains
    pub build_mode: BuildMode,
    /// Root of all generated artefacts
    pub build_dir: PathBuf,
    /// Attestation manager, when offloading was requested
    pub manager: Option<Arc<Manager>>,
    /// SGX service-provider keys, generated on first use
    pub sgx_sp_keys: OnceCell<SpKeys>,
}

impl Context {
    /// Assemble the context of one run.
    pub fn new(build_mode: BuildMode, build_dir: PathBuf, manager: Option<Arc<Manager>>) -> Context {
        Context {
            build_mode,
            build_dir,
            manager,
            sgx_sp_keys: OnceCell::new(),
        }
    }

    /// The active manager, if attestation is offloaded.
    pub fn manager(&self) -> Option<&Manager> {
        self.manager.as_deref()
    }
}
