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

//! Deployment graph and lifecycle orchestrator.
//!
//! The `Config` holds the in-memory graph of nodes, modules, connections
//! and periodic events, drives the lifecycle (build → deploy → attest →
//! connect → register), and rewrites the deployment descriptor after every
//! successful command. Fan-out operations run concurrently unless ordered
//! execution is requested; priority modules always deploy first and in
//! order.

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

mod connection;
mod errors;
mod periodic_event;

pub use crate::connection::Connection;
pub use crate::errors::Error;
pub use crate::periodic_event::PeriodicEvent;

use aex_common_tools::BuildMode;
use aex_conf::{
    rules, ConnectionRecord, Descriptor, DescriptorType, EndpointRef, ManagerRecord,
    PeriodicEventRecord,
};
use aex_manager::{Context, Manager};
use aex_modules::{ConnectionIo, Module};
use aex_nodes::Node;
use futures::future::try_join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Options of one deployer run, as selected on the command line.
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Offload attestation to the manager named in the descriptor
    pub manager_active: bool,
    /// Print per-phase timing records
    pub measure_time: bool,
    /// Output descriptor format; defaults to the input format
    pub output_type: Option<DescriptorType>,
    /// Build mode for the module toolchains
    pub build_mode: BuildMode,
    /// Artefact directory; defaults to `build/` under the working directory
    pub build_dir: Option<PathBuf>,
}

/// The in-memory deployment graph.
#[derive(Debug)]
pub struct Config {
    /// Nodes of the network
    pub nodes: Vec<Arc<Node>>,
    /// Modules of the network
    pub modules: Vec<Arc<Module>>,
    /// Connections between module endpoints
    pub connections: Vec<Connection>,
    /// Periodic events
    pub periodic_events: Vec<PeriodicEvent>,
    /// Next connection id to allocate
    pub connections_current_id: u16,
    /// Next event id to allocate
    pub events_current_id: u32,
    /// Format the descriptor is rewritten in
    pub output_type: DescriptorType,
    /// Print per-phase timing records
    pub measure_time: bool,
    manager: Option<Arc<Manager>>,
}

/// Load and validate a deployment descriptor, returning the graph and the
/// run context.
pub fn load(path: &Path, options: &LoadOptions) -> Result<(Config, Context), Error> {
    let (value, input_type) = DescriptorType::load_any(path)?;
    let descriptor = Descriptor::from_value(&value)?;

    let build_dir = match &options.build_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()
            .map_err(|e| Error::Io(".".to_owned(), e.to_string()))?
            .join("build"),
    };
    std::fs::create_dir_all(&build_dir)
        .map_err(|e| Error::Io(build_dir.display().to_string(), e.to_string()))?;

    let manager = load_manager(descriptor.manager.as_deref(), options.manager_active)?;
    let ctx = Context::new(
        options.build_mode,
        build_dir,
        if options.manager_active {
            manager.clone()
        } else {
            None
        },
    );

    let mut nodes: Vec<Arc<Node>> = Vec::with_capacity(descriptor.nodes.len());
    for record in descriptor.nodes {
        if nodes.iter().any(|n| n.name() == record.name()) {
            return Err(Error::Precondition(format!(
                "duplicate node name {}",
                record.name()
            )));
        }
        nodes.push(Arc::new(Node::load(record)?));
    }

    let get_node = |name: &str| -> Result<Arc<Node>, Error> {
        nodes
            .iter()
            .find(|n| n.name() == name)
            .cloned()
            .ok_or_else(|| Error::NoSuchNode(name.to_owned()))
    };

    let mut modules: Vec<Arc<Module>> = Vec::with_capacity(descriptor.modules.len());
    for record in descriptor.modules {
        if modules.iter().any(|m| m.name() == record.name()) {
            return Err(Error::Precondition(format!(
                "duplicate module name {}",
                record.name()
            )));
        }

        let node = get_node(&record.common().node)?;
        let old_node = match &record.common().old_node {
            Some(name) => get_node(name)?,
            None => node.clone(),
        };
        modules.push(Arc::new(Module::load(record, node, old_node, &ctx)?));
    }

    let mut connections_current_id = descriptor.connections_current_id;
    let mut connections = Vec::with_capacity(descriptor.connections.len());
    for record in descriptor.connections {
        let connection = load_connection(record, &modules, &mut connections_current_id)?;
        if connections.iter().any(|c: &Connection| c.id == connection.id) {
            return Err(Error::Precondition(format!(
                "duplicate connection id {}",
                connection.id
            )));
        }
        connections.push(connection);
    }

    let mut events_current_id = descriptor.events_current_id;
    let mut periodic_events = Vec::with_capacity(descriptor.periodic_events.len());
    for record in descriptor.periodic_events {
        periodic_events.push(load_event(record, &modules, &mut events_current_id)?);
    }

    let config = Config {
        nodes,
        modules,
        connections,
        periodic_events,
        connections_current_id,
        events_current_id,
        output_type: options.output_type.unwrap_or(input_type),
        measure_time: options.measure_time,
        manager,
    };

    Ok((config, ctx))
}

fn load_manager(path: Option<&str>, required: bool) -> Result<Option<Arc<Manager>>, Error> {
    let path = match path {
        Some(path) => PathBuf::from(path),
        None if required => {
            return Err(Error::Precondition(
                "Error while parsing manager information".to_owned(),
            ))
        }
        None => return Ok(None),
    };

    let manager = DescriptorType::load_any(&path).and_then(|(value, _)| {
        let map = value.as_object().ok_or_else(|| {
            aex_conf::DescriptorError::Malformed("manager descriptor is not a map".to_owned())
        })?;
        rules::check_manager(map)?;
        let record: ManagerRecord = serde_json::from_value(value.clone())
            .map_err(|e| aex_conf::DescriptorError::Malformed(e.to_string()))?;
        Ok(Manager::load(path.clone(), record))
    });

    match manager {
        Ok(manager) => Ok(Some(Arc::new(manager))),
        Err(e) if required => Err(e.into()),
        Err(e) => {
            warn!("ignoring manager descriptor: {}", e);
            Ok(None)
        }
    }
}

fn load_connection(
    record: ConnectionRecord,
    modules: &[Arc<Module>],
    next_id: &mut u16,
) -> Result<Connection, Error> {
    let find = |name: &str| -> Result<Arc<Module>, Error> {
        modules
            .iter()
            .find(|m| m.name() == name)
            .cloned()
            .ok_or_else(|| Error::NoSuchModule(name.to_owned()))
    };

    let direct = record.direct.unwrap_or(false);

    let from_module = match &record.from_module {
        Some(name) => Some(find(name)?),
        None => None,
    };
    let from_io = match (record.from_output, record.from_request) {
        (Some(output), None) => Some(ConnectionIo::Output(output)),
        (None, Some(request)) => Some(ConnectionIo::Request(request)),
        (None, None) => None,
        _ => {
            return Err(Error::Precondition(
                "a connection has exactly one source endpoint".to_owned(),
            ))
        }
    };
    let to_module = find(&record.to_module)?;
    let to_io = match (record.to_input, record.to_handler) {
        (Some(input), None) => ConnectionIo::Input(input),
        (None, Some(handler)) => ConnectionIo::Handler(handler),
        _ => {
            return Err(Error::Precondition(
                "a connection has exactly one destination endpoint".to_owned(),
            ))
        }
    };

    // The chosen suite must be spoken by every involved module
    for module in from_module.iter().chain(std::iter::once(&to_module)) {
        if !module
            .driver()
            .supported_encryption()
            .contains(&record.encryption)
        {
            return Err(Error::Precondition(format!(
                "module {} does not support {} encryption",
                module.name(),
                record.encryption
            )));
        }
    }

    let id = match record.id {
        Some(id) => id,
        None => {
            let id = *next_id;
            *next_id += 1;
            id
        }
    };

    Ok(Connection::new(
        id,
        record.name.unwrap_or_else(|| format!("conn{}", id)),
        from_module,
        from_io,
        to_module,
        to_io,
        record.encryption,
        record.key,
        direct,
        record.nonce.unwrap_or(0),
        record.established.unwrap_or(false),
    ))
}

fn load_event(
    record: PeriodicEventRecord,
    modules: &[Arc<Module>],
    next_id: &mut u32,
) -> Result<PeriodicEvent, Error> {
    let module = modules
        .iter()
        .find(|m| m.name() == record.module)
        .cloned()
        .ok_or_else(|| Error::NoSuchModule(record.module.clone()))?;

    let id = match record.id {
        Some(id) => id,
        None => {
            let id = *next_id;
            *next_id += 1;
            id
        }
    };

    Ok(PeriodicEvent::new(
        id,
        record.name.unwrap_or_else(|| format!("event{}", id)),
        module,
        record.entry,
        record.frequency,
        record.established.unwrap_or(false),
    ))
}

impl Config {
    /// Node by name.
    pub fn get_node(&self, name: &str) -> Result<Arc<Node>, Error> {
        self.nodes
            .iter()
            .find(|n| n.name() == name)
            .cloned()
            .ok_or_else(|| Error::NoSuchNode(name.to_owned()))
    }

    /// Module by name.
    pub fn get_module(&self, name: &str) -> Result<Arc<Module>, Error> {
        self.modules
            .iter()
            .find(|m| m.name() == name)
            .cloned()
            .ok_or_else(|| Error::NoSuchModule(name.to_owned()))
    }

    /// Connection by name.
    pub fn get_connection_by_name(&self, name: &str) -> Result<&Connection, Error> {
        self.connections
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::NoSuchConnection(name.to_owned()))
    }

    /// Connection by id.
    pub fn get_connection_by_id(&self, id: u16) -> Result<&Connection, Error> {
        self.connections
            .iter()
            .find(|c| c.id == id)
            .ok_or(Error::NoSuchConnectionId(id))
    }

    /// Connection by name, or by id when the reference is numeric.
    pub fn find_connection(&self, reference: &str) -> Result<&Connection, Error> {
        match reference.parse::<u16>() {
            Ok(id) => self.get_connection_by_id(id),
            Err(_) => self.get_connection_by_name(reference),
        }
    }

    /// Periodic event by name.
    pub fn get_periodic_event(&self, name: &str) -> Result<&PeriodicEvent, Error> {
        self.periodic_events
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::NoSuchEvent(name.to_owned()))
    }

    /// Replace a module (matched by name) after an update.
    pub fn replace_module(&mut self, module: Arc<Module>) -> Result<(), Error> {
        let name = module.name().to_owned();
        match self.modules.iter_mut().find(|m| m.name() == name) {
            Some(slot) => {
                *slot = module;
                Ok(())
            }
            None => Err(Error::NoSuchModule(name)),
        }
    }

    // -- lifecycle -------------------------------------------------------

    async fn deploy_module(&self, module: &Arc<Module>, ctx: &Context) -> Result<(), Error> {
        let t1 = self.record_time();
        module.driver().build(ctx).await?;
        let t2 = self.record_time_since(t1, &format!("Build time for {}", module.name()));
        module.driver().deploy(ctx).await?;
        self.record_time_since(t2, &format!("Deploy time for {}", module.name()));
        Ok(())
    }

    async fn build_module(&self, module: &Arc<Module>, ctx: &Context) -> Result<(), Error> {
        let t1 = self.record_time();
        module.driver().build(ctx).await?;
        self.record_time_since(t1, &format!("Build time for {}", module.name()));
        Ok(())
    }

    async fn attest_module(&self, module: &Arc<Module>, ctx: &Context) -> Result<(), Error> {
        let t1 = self.record_time();
        module.driver().attest(ctx).await?;
        self.record_time_since(t1, &format!("Attest time for {}", module.name()));
        Ok(())
    }

    async fn establish_connection(
        &self,
        connection: &Connection,
        ctx: &Context,
    ) -> Result<(), Error> {
        let t1 = self.record_time();
        connection.establish(ctx).await?;
        self.record_time_since(t1, &format!("Establish time for {}", connection.name));
        Ok(())
    }

    async fn register_event(&self, event: &PeriodicEvent) -> Result<(), Error> {
        let t1 = self.record_time();
        event.register().await?;
        self.record_time_since(t1, &format!("Register time for {}", event.name));
        Ok(())
    }

    fn pending_priority_modules(&self) -> Vec<Arc<Module>> {
        let mut priority_modules: Vec<Arc<Module>> = self
            .modules
            .iter()
            .filter(|m| m.common().priority.is_some() && !m.common().deployed())
            .cloned()
            .collect();
        priority_modules.sort_by_key(|m| m.common().priority);
        priority_modules
    }

    async fn deploy_priority_modules(&self, ctx: &Context) -> Result<(), Error> {
        let priority_modules = self.pending_priority_modules();
        debug!(
            "Priority modules: {:?}",
            priority_modules.iter().map(|m| m.name()).collect::<Vec<_>>()
        );

        for module in &priority_modules {
            self.deploy_module(module, ctx).await?;
        }
        Ok(())
    }

    /// Build and deploy modules. Priority modules go first, strictly in
    /// priority order; the rest fans out unless `in_order` is requested.
    /// Already-deployed modules are skipped.
    pub async fn deploy(
        &self,
        ctx: &Context,
        in_order: bool,
        module: Option<&str>,
    ) -> Result<(), Error> {
        if let Some(name) = module {
            let module = self.get_module(name)?;
            if module.common().deployed() {
                return Err(Error::Precondition(format!(
                    "Module {} already deployed",
                    name
                )));
            }
            info!("Deploying {}", name);
            return self.deploy_module(&module, ctx).await;
        }

        self.deploy_priority_modules(ctx).await?;

        let pending: Vec<Arc<Module>> = self
            .modules
            .iter()
            .filter(|m| !m.common().deployed())
            .cloned()
            .collect();

        if in_order {
            for module in &pending {
                self.deploy_module(module, ctx).await?;
            }
        } else {
            try_join_all(pending.iter().map(|m| self.deploy_module(m, ctx))).await?;
        }
        Ok(())
    }

    /// Build module binaries without deploying them.
    pub async fn build(&self, ctx: &Context, module: Option<&str>) -> Result<(), Error> {
        let targets: Vec<Arc<Module>> = match module {
            Some(name) => vec![self.get_module(name)?],
            None => self.modules.clone(),
        };

        try_join_all(targets.iter().map(|m| self.build_module(m, ctx))).await?;
        Ok(())
    }

    /// Attest deployed modules. Already-attested modules are skipped; a
    /// not-yet-deployed module in the target set is a precondition error
    /// and nothing is sent.
    pub async fn attest(
        &self,
        ctx: &Context,
        in_order: bool,
        module: Option<&str>,
    ) -> Result<(), Error> {
        let candidates: Vec<Arc<Module>> = match module {
            Some(name) => vec![self.get_module(name)?],
            None => self.modules.clone(),
        };

        let to_attest: Vec<Arc<Module>> = candidates
            .into_iter()
            .filter(|m| !m.common().attested())
            .collect();

        if to_attest.iter().any(|m| !m.common().deployed()) {
            return Err(Error::Precondition(
                "One or more modules to attest are not deployed yet".to_owned(),
            ));
        }

        info!(
            "To attest: {:?}",
            to_attest.iter().map(|m| m.name()).collect::<Vec<_>>()
        );

        if in_order {
            for module in &to_attest {
                self.attest_module(module, ctx).await?;
            }
        } else {
            try_join_all(to_attest.iter().map(|m| self.attest_module(m, ctx))).await?;
        }
        Ok(())
    }

    /// Establish connections between attested modules. Established
    /// connections are skipped; an unattested endpoint in the target set is
    /// a precondition error and nothing is sent.
    pub async fn connect(
        &self,
        ctx: &Context,
        in_order: bool,
        connection: Option<&str>,
    ) -> Result<(), Error> {
        let targets: Vec<&Connection> = match connection {
            Some(reference) => vec![self.get_connection_by_name(reference)?],
            None => self.connections.iter().collect(),
        };

        let to_connect: Vec<&Connection> =
            targets.into_iter().filter(|c| !c.established()).collect();

        let attested = |c: &Connection| {
            c.to_module.common().attested()
                && c.from_module
                    .as_ref()
                    .map(|m| m.common().attested())
                    .unwrap_or(true)
        };
        if !to_connect.iter().all(|c| attested(c)) {
            return Err(Error::Precondition(
                "One or more modules to connect are not attested yet".to_owned(),
            ));
        }

        info!(
            "To connect: {:?}",
            to_connect.iter().map(|c| c.name.as_str()).collect::<Vec<_>>()
        );

        if in_order {
            for connection in &to_connect {
                self.establish_connection(connection, ctx).await?;
            }
        } else {
            try_join_all(
                to_connect
                    .iter()
                    .map(|c| self.establish_connection(c, ctx)),
            )
            .await?;
        }
        Ok(())
    }

    /// Register periodic events whose modules are attested.
    pub async fn register(&self, event: Option<&str>) -> Result<(), Error> {
        let targets: Vec<&PeriodicEvent> = match event {
            Some(name) => vec![self.get_periodic_event(name)?],
            None => self.periodic_events.iter().collect(),
        };

        let to_register: Vec<&PeriodicEvent> =
            targets.into_iter().filter(|e| !e.established()).collect();

        if to_register.iter().any(|e| !e.module.common().attested()) {
            return Err(Error::Precondition(
                "One or more modules are not attested yet".to_owned(),
            ));
        }

        info!(
            "To register: {:?}",
            to_register.iter().map(|e| e.name.as_str()).collect::<Vec<_>>()
        );

        try_join_all(to_register.iter().map(|e| self.register_event(e))).await?;
        Ok(())
    }

    /// Call an entrypoint of a module, returning the response payload.
    pub async fn call(
        &self,
        module: &str,
        entry: &EndpointRef,
        arg: Option<&[u8]>,
    ) -> Result<Vec<u8>, Error> {
        let module = self.get_module(module)?;

        let t1 = self.record_time();
        let response = module.call(entry, arg).await?;
        self.record_time_since(
            t1,
            &format!("Call time for {}:{}", module.name(), entry),
        );

        Ok(response)
    }

    /// Trigger the output of a direct connection.
    pub async fn trigger_output(&self, connection: &str, arg: &[u8]) -> Result<(), Error> {
        let connection = self.find_connection(connection)?;

        if !connection.direct {
            return Err(Error::Precondition("Connection is not direct.".to_owned()));
        }
        if !matches!(connection.to_io, ConnectionIo::Input(_)) {
            return Err(Error::Precondition(
                "Not a output-input connection".to_owned(),
            ));
        }
        if !connection.established() {
            return Err(Error::Precondition(format!(
                "Connection {} is not established yet",
                connection.name
            )));
        }

        let t1 = self.record_time();
        connection.output(arg).await?;
        self.record_time_since(t1, &format!("Output time for {}", connection.name));
        Ok(())
    }

    /// Trigger the request of a direct connection, returning the decrypted
    /// response.
    pub async fn trigger_request(&self, connection: &str, arg: &[u8]) -> Result<Vec<u8>, Error> {
        let connection = self.find_connection(connection)?;

        if !connection.direct {
            return Err(Error::Precondition("Connection is not direct.".to_owned()));
        }
        if !matches!(connection.to_io, ConnectionIo::Handler(_)) {
            return Err(Error::Precondition(
                "Not a request-handler connection".to_owned(),
            ));
        }
        if !connection.established() {
            return Err(Error::Precondition(format!(
                "Connection {} is not established yet",
                connection.name
            )));
        }

        let t1 = self.record_time();
        let response = connection.request(arg).await?;
        self.record_time_since(t1, &format!("Request time for {}", connection.name));
        Ok(response)
    }

    /// Permanently disable a module.
    pub async fn disable(&self, ctx: &Context, module: &str) -> Result<(), Error> {
        let module = self.get_module(module)?;

        let t1 = self.record_time();
        module.disable(ctx).await?;
        self.record_time_since(t1, &format!("Disable time for {}", module.name()));
        Ok(())
    }

    /// State-preserving module replacement: clone, deploy and attest the
    /// clone, disable the old instance, optionally transfer its state
    /// through a one-shot connection, then re-establish every connection
    /// that involves the module.
    pub async fn update(
        &mut self,
        ctx: &Context,
        module: &str,
        transfer: Option<(EndpointRef, EndpointRef, EndpointRef)>,
    ) -> Result<(), Error> {
        let old_module = self.get_module(module)?;
        if !old_module.common().deployed() {
            return Err(Error::Precondition(
                "Module is not deployed yet.".to_owned(),
            ));
        }

        let t1 = self.record_time();

        // Clone first, then point the old instance back at the node it
        // actually runs on
        let new_module = Arc::new(old_module.driver().clone_fresh()?);
        old_module.common().set_node(old_module.common().old_node());
        new_module.common().set_old_node(new_module.common().node());

        info!("Deploying and attesting new {}", old_module.name());
        self.deploy_module(&new_module, ctx).await?;
        self.attest_module(&new_module, ctx).await?;

        info!("Disabling old module");
        old_module.disable(ctx).await?;

        if let Some((entry, output, input)) = transfer {
            let t = self.record_time();

            let transfer_connection = Connection::transfer(
                self.connections_current_id,
                old_module.clone(),
                ConnectionIo::Output(output),
                new_module.clone(),
                ConnectionIo::Input(input),
            );
            transfer_connection.establish(ctx).await?;

            // Trigger the state dump, then retire both endpoints
            old_module.call(&entry, None).await?;
            old_module.disable(ctx).await?;
            new_module.disable(ctx).await?;

            self.record_time_since(t, &format!("Transfer time for {}", new_module.name()));
        }

        let t2 = self.record_time();
        let involved: Vec<usize> = self
            .connections
            .iter()
            .enumerate()
            .filter(|(_, c)| c.involves(&old_module))
            .map(|(i, _)| i)
            .collect();

        for index in involved {
            let fresh = self.connections[index].clone_fresh(&old_module, &new_module);
            info!(
                "Re-establishing connection {} with id {}",
                fresh.name, fresh.id
            );
            fresh.establish(ctx).await?;
            self.connections[index] = fresh;
        }
        self.record_time_since(t2, &format!("Connect time for {}", new_module.name()));

        self.replace_module(new_module.clone())?;

        info!("Update complete");
        self.record_time_since(t1, &format!("Update time for {}", new_module.name()));
        Ok(())
    }

    /// Disable every live module, then reset every node.
    pub async fn reset(&self, ctx: &Context) -> Result<(), Error> {
        info!(
            "To reset: {:?}",
            self.nodes.iter().map(|n| n.name()).collect::<Vec<_>>()
        );

        try_join_all(
            self.modules
                .iter()
                .filter(|m| m.common().deployed() && m.common().attested())
                .map(|m| m.disable(ctx)),
        )
        .await?;

        try_join_all(self.nodes.iter().map(|n| n.driver().reset())).await?;
        Ok(())
    }

    /// Run every node and module cleanup hook.
    pub async fn cleanup(&self) -> Result<(), Error> {
        try_join_all(self.nodes.iter().map(|n| n.driver().cleanup())).await?;
        try_join_all(self.modules.iter().map(|m| m.driver().cleanup())).await?;
        Ok(())
    }

    // -- persistence -----------------------------------------------------

    /// Serialize the whole graph back to a descriptor value.
    pub fn dump(&self) -> Result<serde_json::Value, Error> {
        let manager = match &self.manager {
            Some(manager) => Some(manager.dump()?),
            None => None,
        };

        let descriptor = Descriptor {
            manager,
            nodes: self.nodes.iter().map(|n| n.dump()).collect(),
            modules: self.modules.iter().map(|m| m.driver().dump()).collect(),
            connections_current_id: self.connections_current_id,
            connections: self.connections.iter().map(Connection::dump).collect(),
            events_current_id: self.events_current_id,
            periodic_events: self.periodic_events.iter().map(PeriodicEvent::dump).collect(),
        };

        Ok(descriptor.to_value()?)
    }

    /// Rewrite the descriptor file in the configured output format.
    pub fn dump_to(&self, path: &Path) -> Result<(), Error> {
        info!("Writing post-deployment configuration to {}", path.display());
        Ok(self.output_type.dump(path, &self.dump()?)?)
    }

    // -- timing ----------------------------------------------------------

    fn record_time(&self) -> Option<Instant> {
        if self.measure_time {
            Some(Instant::now())
        } else {
            None
        }
    }

    fn record_time_since(&self, previous: Option<Instant>, label: &str) -> Option<Instant> {
        let previous = previous?;
        let now = Instant::now();
        println!("{}: {:.3}", label, (now - previous).as_secs_f64());
        Some(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_fixture(tag: &str, content: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("aex-core-tests");
        std::fs::create_dir_all(&dir).expect("fixture dir");
        let path = dir.join(format!("{}.json", tag));
        std::fs::write(&path, content).expect("fixture");
        path
    }

    fn test_options() -> LoadOptions {
        LoadOptions {
            build_dir: Some(std::env::temp_dir().join("aex-core-tests").join("build")),
            ..LoadOptions::default()
        }
    }

    fn fixture_descriptor() -> String {
        serde_json::json!({
            "nodes": [
                {"type": "native", "name": "n1", "host": "127.0.0.1",
                 "reactive_port": 5000}
            ],
            "modules": [
                {"type": "native", "name": "mA", "node": "n1", "priority": 2,
                 "deployed": true, "nonce": 0, "attested": true, "id": 1,
                 "key": "00112233445566778899aabbccddeeff",
                 "data": {"inputs": {"feed": 0}, "outputs": {},
                          "entrypoints": {}, "handlers": {}, "requests": {}}},
                {"type": "native", "name": "mB", "node": "n1"},
                {"type": "native", "name": "mC", "node": "n1", "priority": 1}
            ],
            "connections_current_id": 0,
            "connections": [
                {"direct": true, "to_module": "mA", "to_input": "feed",
                 "encryption": "aes"}
            ],
            "events_current_id": 0,
            "periodic-events": [
                {"module": "mA", "entry": "2", "frequency": 500}
            ]
        })
        .to_string()
    }

    #[test]
    fn descriptor_loads_into_a_graph() {
        let path = write_fixture("load", &fixture_descriptor());
        let (config, _ctx) = load(&path, &test_options()).expect("load");

        assert_eq!(config.nodes.len(), 1);
        assert_eq!(config.modules.len(), 3);
        assert_eq!(config.connections.len(), 1);
        assert_eq!(config.periodic_events.len(), 1);

        // Ids and names are allocated from the rolling counters
        let connection = &config.connections[0];
        assert_eq!(connection.id, 0);
        assert_eq!(connection.name, "conn0");
        assert_eq!(config.connections_current_id, 1);
        assert_eq!(config.periodic_events[0].name, "event0");
        assert_eq!(config.events_current_id, 1);

        let module = config.get_module("mA").expect("module");
        assert!(module.common().deployed());
        assert!(module.common().attested());
    }

    #[test]
    fn priority_modules_deploy_lowest_first() {
        let path = write_fixture("priority", &fixture_descriptor());
        let (config, _ctx) = load(&path, &test_options()).expect("load");

        // mA is already deployed, so only mC (priority 1) is pending
        let order: Vec<String> = config
            .pending_priority_modules()
            .iter()
            .map(|m| m.name().to_owned())
            .collect();
        assert_eq!(order, vec!["mC".to_owned()]);
    }

    #[tokio::test]
    async fn attest_requires_deployment() {
        let path = write_fixture("attest-pre", &fixture_descriptor());
        let (config, ctx) = load(&path, &test_options()).expect("load");

        match config.attest(&ctx, false, None).await {
            Err(Error::Precondition(msg)) => {
                assert_eq!(msg, "One or more modules to attest are not deployed yet")
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn deploy_refuses_an_already_deployed_module() {
        let path = write_fixture("redeploy", &fixture_descriptor());
        let (config, ctx) = load(&path, &test_options()).expect("load");

        match config.deploy(&ctx, false, Some("mA")).await {
            Err(Error::Precondition(msg)) => assert_eq!(msg, "Module mA already deployed"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn output_needs_a_direct_established_connection() {
        let path = write_fixture("output-pre", &fixture_descriptor());
        let (config, _ctx) = load(&path, &test_options()).expect("load");

        // conn0 exists but is not established
        match config.trigger_output("conn0", &[1, 2]).await {
            Err(Error::Precondition(msg)) => {
                assert_eq!(msg, "Connection conn0 is not established yet")
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn dump_round_trips() {
        let path = write_fixture("roundtrip", &fixture_descriptor());
        let (config, _ctx) = load(&path, &test_options()).expect("load");

        let dumped = config.dump().expect("dump");
        let path2 = write_fixture("roundtrip2", &dumped.to_string());
        let (config2, _ctx) = load(&path2, &test_options()).expect("reload");

        assert_eq!(config2.dump().expect("dump"), dumped);
    }

    #[test]
    fn update_of_an_unknown_module_fails() {
        let path = write_fixture("unknown", &fixture_descriptor());
        let (config, _ctx) = load(&path, &test_options()).expect("load");

        match config.get_module("nope") {
            Err(Error::NoSuchModule(name)) => assert_eq!(name, "nope"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
