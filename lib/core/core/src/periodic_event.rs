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

//! Periodic invocations of module entrypoints, scheduled by the EM after
//! registration.

use crate::errors::Error;
use aex_conf::{EndpointRef, PeriodicEventRecord};
use aex_modules::Module;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A periodic event: the EM calls `entry` on `module` every `frequency_ms`.
#[derive(Debug)]
pub struct PeriodicEvent {
    /// Event id, unique in the descriptor
    pub id: u32,
    /// Human-readable name
    pub name: String,
    /// Module whose entrypoint is invoked
    pub module: Arc<Module>,
    /// Entrypoint to invoke
    pub entry: EndpointRef,
    /// Invocation period in milliseconds
    pub frequency_ms: u32,
    established: AtomicBool,
}

impl PeriodicEvent {
    /// Build the event.
    pub fn new(
        id: u32,
        name: String,
        module: Arc<Module>,
        entry: EndpointRef,
        frequency_ms: u32,
        established: bool,
    ) -> PeriodicEvent {
        PeriodicEvent {
            id,
            name,
            module,
            entry,
            frequency_ms,
            established: AtomicBool::new(established),
        }
    }

    /// Whether the event is registered on the EM.
    pub fn established(&self) -> bool {
        self.established.load(Ordering::SeqCst)
    }

    /// Register the event on the module's EM. Idempotent once established.
    pub async fn register(&self) -> Result<(), Error> {
        if self.established() {
            return Ok(());
        }

        self.module
            .register_entrypoint(&self.entry, self.frequency_ms)
            .await?;

        info!(
            "Registered {}:{} on {} every {} ms",
            self.module.name(),
            self.entry,
            self.module.node().name(),
            self.frequency_ms
        );

        self.established.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Dump the event back to its descriptor record.
    pub fn dump(&self) -> PeriodicEventRecord {
        PeriodicEventRecord {
            name: Some(self.name.clone()),
            id: Some(self.id),
            module: self.module.name().to_owned(),
            entry: self.entry.clone(),
            frequency: self.frequency_ms,
            established: if self.established() { Some(true) } else { None },
        }
    }
}
