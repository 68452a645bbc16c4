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

//! Deployer and orchestrator for Authentic Execution networks.

#![deny(
    missing_docs,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces
)]

mod cli;
mod logger;

use crate::cli::*;
use aex_common_tools::BuildMode;
use aex_conf::{DescriptorType, EndpointRef};
use aex_core::{Error, LoadOptions};
use failure::Fail;
use log::{error, info};
use std::path::{Path, PathBuf};
use structopt::StructOpt;

fn main() {
    let opt = AexDeployOpt::from_args();

    if let Err(e) = logger::init(opt.verbose, opt.debug) {
        eprintln!("failed to initialize the logger: {}", e);
        std::process::exit(-1);
    }

    let debug = opt.debug;

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start the runtime: {}", e);
            std::process::exit(-1);
        }
    };

    if let Err(e) = runtime.block_on(run(opt)) {
        error!("{}", e);
        if debug {
            for cause in Fail::iter_causes(&e) {
                error!("caused by: {}", cause);
            }
            error!("{:?}", e);
        }
        std::process::exit(-1);
    }
}

#[derive(Clone, Copy)]
struct GlobalOpts {
    manager: bool,
    timing: bool,
}

async fn run(opt: AexDeployOpt) -> Result<(), Error> {
    let globals = GlobalOpts {
        manager: opt.manager,
        timing: opt.timing,
    };

    match opt.cmd {
        AexSubCommand::Deploy(args) => handle_deploy(&globals, args).await,
        AexSubCommand::Build(args) => handle_build(&globals, args).await,
        AexSubCommand::Attest(args) => handle_attest(&globals, args).await,
        AexSubCommand::Connect(args) => handle_connect(&globals, args).await,
        AexSubCommand::Register(args) => handle_register(&globals, args).await,
        AexSubCommand::Call(args) => handle_call(&globals, args).await,
        AexSubCommand::Output(args) => handle_output(&globals, args).await,
        AexSubCommand::Request(args) => handle_request(&globals, args).await,
        AexSubCommand::Disable(args) => handle_disable(&globals, args).await,
        AexSubCommand::Update(args) => handle_update(&globals, args).await,
        AexSubCommand::Reset(args) => handle_reset(&globals, args).await,
    }
}

fn load_options(
    globals: &GlobalOpts,
    build_mode: BuildMode,
    output: Option<&str>,
) -> Result<LoadOptions, Error> {
    let output_type = match output {
        Some(name) => Some(DescriptorType::from_str(name)?),
        None => None,
    };

    Ok(LoadOptions {
        manager_active: globals.manager,
        measure_time: globals.timing,
        output_type,
        build_mode,
        build_dir: None,
    })
}

fn enter_workspace(workspace: &Path) -> Result<(), Error> {
    std::env::set_current_dir(workspace)
        .map_err(|e| Error::Io(workspace.display().to_string(), e.to_string()))
}

fn result_file(result: Option<PathBuf>, config: PathBuf) -> PathBuf {
    result.unwrap_or(config)
}

fn write_response(out: Option<&Path>, payload: &[u8]) -> Result<(), Error> {
    match out {
        Some(path) => std::fs::write(path, payload)
            .map_err(|e| Error::Io(path.display().to_string(), e.to_string())),
        None => {
            info!("Response: \"{}\"", hex::encode(payload));
            Ok(())
        }
    }
}

async fn handle_deploy(globals: &GlobalOpts, args: DeployOpt) -> Result<(), Error> {
    info!("Deploying {}", args.config.display());

    enter_workspace(&args.workspace)?;
    let options = load_options(globals, args.mode, args.output.as_deref())?;
    let (config, ctx) = aex_core::load(&args.config, &options)?;

    config
        .deploy(&ctx, args.deploy_in_order, args.module.as_deref())
        .await?;

    config.dump_to(&result_file(args.result, args.config))?;
    config.cleanup().await
}

async fn handle_build(globals: &GlobalOpts, args: BuildOpt) -> Result<(), Error> {
    info!("Building {}", args.config.display());

    enter_workspace(&args.workspace)?;
    let options = load_options(globals, args.mode, None)?;
    let (config, ctx) = aex_core::load(&args.config, &options)?;

    config.build(&ctx, args.module.as_deref()).await?;
    config.cleanup().await
}

async fn handle_attest(globals: &GlobalOpts, args: AttestOpt) -> Result<(), Error> {
    info!("Attesting modules");

    let options = load_options(globals, BuildMode::default(), args.output.as_deref())?;
    let (config, ctx) = aex_core::load(&args.config, &options)?;

    config
        .attest(&ctx, args.in_order, args.module.as_deref())
        .await?;

    config.dump_to(&result_file(args.result, args.config))?;
    config.cleanup().await
}

async fn handle_connect(globals: &GlobalOpts, args: ConnectOpt) -> Result<(), Error> {
    info!("Connecting modules");

    let options = load_options(globals, BuildMode::default(), args.output.as_deref())?;
    let (config, ctx) = aex_core::load(&args.config, &options)?;

    config
        .connect(&ctx, args.in_order, args.connection.as_deref())
        .await?;

    config.dump_to(&result_file(args.result, args.config))?;
    config.cleanup().await
}

async fn handle_register(globals: &GlobalOpts, args: RegisterOpt) -> Result<(), Error> {
    info!("Registering periodic events");

    let options = load_options(globals, BuildMode::default(), args.output.as_deref())?;
    let (config, _ctx) = aex_core::load(&args.config, &options)?;

    config.register(args.event.as_deref()).await?;

    config.dump_to(&result_file(args.result, args.config))?;
    config.cleanup().await
}

async fn handle_call(globals: &GlobalOpts, args: CallOpt) -> Result<(), Error> {
    info!("Calling {}:{}", args.module, args.entry);

    let options = load_options(globals, BuildMode::default(), None)?;
    let (config, _ctx) = aex_core::load(&args.config, &options)?;

    let response = config
        .call(
            &args.module,
            &EndpointRef::from(args.entry.as_str()),
            args.arg.as_deref(),
        )
        .await?;

    write_response(args.out.as_deref(), &response)?;
    config.cleanup().await
}

async fn handle_output(globals: &GlobalOpts, args: OutputOpt) -> Result<(), Error> {
    info!("Triggering output of connection {}", args.connection);

    let options = load_options(globals, BuildMode::default(), None)?;
    let (config, _ctx) = aex_core::load(&args.config, &options)?;

    config
        .trigger_output(&args.connection, args.arg.as_deref().unwrap_or_default())
        .await?;

    config.dump_to(&result_file(args.result, args.config))?;
    config.cleanup().await
}

async fn handle_request(globals: &GlobalOpts, args: RequestOpt) -> Result<(), Error> {
    info!("Triggering request of connection {}", args.connection);

    let options = load_options(globals, BuildMode::default(), None)?;
    let (config, _ctx) = aex_core::load(&args.config, &options)?;

    let response = config
        .trigger_request(&args.connection, args.arg.as_deref().unwrap_or_default())
        .await?;

    write_response(args.out.as_deref(), &response)?;
    config.dump_to(&result_file(args.result, args.config))?;
    config.cleanup().await
}

async fn handle_disable(globals: &GlobalOpts, args: DisableOpt) -> Result<(), Error> {
    info!("Disabling {}", args.module);

    let options = load_options(globals, BuildMode::default(), None)?;
    let (config, ctx) = aex_core::load(&args.config, &options)?;

    config.disable(&ctx, &args.module).await?;

    config.dump_to(&result_file(args.result, args.config))?;
    config.cleanup().await
}

async fn handle_update(globals: &GlobalOpts, args: UpdateOpt) -> Result<(), Error> {
    let transfer = match (args.entry, args.output, args.input) {
        (None, None, None) => None,
        (Some(entry), Some(output), Some(input)) => Some((
            EndpointRef::from(entry.as_str()),
            EndpointRef::from(output.as_str()),
            EndpointRef::from(input.as_str()),
        )),
        _ => {
            return Err(Error::Precondition(
                "Required either none or all: [--entry, --output, --input]".to_owned(),
            ))
        }
    };

    info!("Updating {}", args.module);

    let options = load_options(globals, BuildMode::default(), None)?;
    let (mut config, ctx) = aex_core::load(&args.config, &options)?;

    config.update(&ctx, &args.module, transfer).await?;

    config.dump_to(&result_file(args.result, args.config))?;
    config.cleanup().await
}

async fn handle_reset(globals: &GlobalOpts, args: ResetOpt) -> Result<(), Error> {
    info!("Resetting the network");

    let options = load_options(globals, BuildMode::default(), None)?;
    let (config, ctx) = aex_core::load(&args.config, &options)?;

    config.reset(&ctx).await?;
    config.cleanup().await
}
