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

//! Command line options of the deployer.

use aex_common_tools::BuildMode;
use std::path::PathBuf;
use structopt::StructOpt;

fn parse_hex(arg: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(arg)
}

#[derive(StructOpt, Debug)]
#[structopt(name = "aex-deploy")]
/// Deployer and orchestrator for Authentic Execution networks
pub struct AexDeployOpt {
    /// Verbose output
    #[structopt(long = "verbose")]
    pub verbose: bool,
    /// Debug output
    #[structopt(long = "debug")]
    pub debug: bool,
    /// Offload the task to the Attestation Manager, if possible
    #[structopt(long = "manager")]
    pub manager: bool,
    /// Measure time between operations, for evaluation
    #[structopt(long = "timing")]
    pub timing: bool,
    /// Subcommand to run
    #[structopt(subcommand)]
    pub cmd: AexSubCommand,
}

#[derive(StructOpt, Debug)]
/// Deployer subcommands
pub enum AexSubCommand {
    /// Deploy a reactive network
    #[structopt(name = "deploy")]
    Deploy(DeployOpt),
    /// Build the executables of the SMs as declared in the input
    /// configuration file
    #[structopt(name = "build")]
    Build(BuildOpt),
    /// Attest deployed modules
    #[structopt(name = "attest")]
    Attest(AttestOpt),
    /// Connect deployed and attested modules
    #[structopt(name = "connect")]
    Connect(ConnectOpt),
    /// Register periodic events
    #[structopt(name = "register")]
    Register(RegisterOpt),
    /// Call a deployed module
    #[structopt(name = "call")]
    Call(CallOpt),
    /// Trigger the output of a "direct" connection (between deployer and SM)
    #[structopt(name = "output")]
    Output(OutputOpt),
    /// Trigger the request of a "direct" connection (between deployer and SM)
    #[structopt(name = "request")]
    Request(RequestOpt),
    /// Send a request to disable a module
    #[structopt(name = "disable")]
    Disable(DisableOpt),
    /// Update a module
    #[structopt(name = "update")]
    Update(UpdateOpt),
    /// Disable all modules and reset every node
    #[structopt(name = "reset")]
    Reset(ResetOpt),
}

#[derive(StructOpt, Debug)]
/// Options of the deploy subcommand
pub struct DeployOpt {
    /// Name of the configuration file describing the network
    pub config: PathBuf,
    /// Build mode of modules, between "debug" and "release"
    #[structopt(long = "mode", default_value = "debug")]
    pub mode: BuildMode,
    /// Root directory containing all the modules and the configuration file
    #[structopt(long = "workspace", default_value = ".")]
    pub workspace: PathBuf,
    /// File to write the resulting configuration to
    #[structopt(long = "result")]
    pub result: Option<PathBuf>,
    /// Deploy modules in the order they are found in the config file
    #[structopt(long = "deploy-in-order")]
    pub deploy_in_order: bool,
    /// Output file type, between JSON and YAML
    #[structopt(long = "output")]
    pub output: Option<String>,
    /// Module to deploy (if not specified, deploy all modules)
    #[structopt(long = "module")]
    pub module: Option<String>,
}

#[derive(StructOpt, Debug)]
/// Options of the build subcommand
pub struct BuildOpt {
    /// Name of the configuration file describing the network
    pub config: PathBuf,
    /// Build mode of modules, between "debug" and "release"
    #[structopt(long = "mode", default_value = "debug")]
    pub mode: BuildMode,
    /// Root directory containing all the modules and the configuration file
    #[structopt(long = "workspace", default_value = ".")]
    pub workspace: PathBuf,
    /// Module to build (if not specified, build all modules)
    #[structopt(long = "module")]
    pub module: Option<String>,
}

#[derive(StructOpt, Debug)]
/// Options of the attest subcommand
pub struct AttestOpt {
    /// Specify configuration file to use
    pub config: PathBuf,
    /// File to write the resulting configuration to
    #[structopt(long = "result")]
    pub result: Option<PathBuf>,
    /// Output file type, between JSON and YAML
    #[structopt(long = "output")]
    pub output: Option<String>,
    /// Attest modules one at a time, in the order of the config file
    #[structopt(long = "in-order")]
    pub in_order: bool,
    /// Module to attest (if not specified, attest all modules)
    #[structopt(long = "module")]
    pub module: Option<String>,
}

#[derive(StructOpt, Debug)]
/// Options of the connect subcommand
pub struct ConnectOpt {
    /// Specify configuration file to use
    pub config: PathBuf,
    /// File to write the resulting configuration to
    #[structopt(long = "result")]
    pub result: Option<PathBuf>,
    /// Output file type, between JSON and YAML
    #[structopt(long = "output")]
    pub output: Option<String>,
    /// Establish connections one at a time, in the order of the config file
    #[structopt(long = "in-order")]
    pub in_order: bool,
    /// Connection to establish (if unspecified, establish all connections)
    #[structopt(long = "connection")]
    pub connection: Option<String>,
}

#[derive(StructOpt, Debug)]
/// Options of the register subcommand
pub struct RegisterOpt {
    /// Specify configuration file to use
    pub config: PathBuf,
    /// File to write the resulting configuration to
    #[structopt(long = "result")]
    pub result: Option<PathBuf>,
    /// Output file type, between JSON and YAML
    #[structopt(long = "output")]
    pub output: Option<String>,
    /// Event to register (if not specified, register all events)
    #[structopt(long = "event")]
    pub event: Option<String>,
}

#[derive(StructOpt, Debug)]
/// Options of the call subcommand
pub struct CallOpt {
    /// Specify configuration file to use
    pub config: PathBuf,
    /// Name of the module to call
    #[structopt(long = "module")]
    pub module: String,
    /// Name of the module's entry point to call
    #[structopt(long = "entry")]
    pub entry: String,
    /// Argument to pass to the entry point (hex byte array)
    #[structopt(long = "arg", parse(try_from_str = parse_hex))]
    pub arg: Option<Vec<u8>>,
    /// File to write the received result to
    #[structopt(long = "out")]
    pub out: Option<PathBuf>,
}

#[derive(StructOpt, Debug)]
/// Options of the output subcommand
pub struct OutputOpt {
    /// Specify configuration file to use
    pub config: PathBuf,
    /// Connection ID or name of the connection
    #[structopt(long = "connection")]
    pub connection: String,
    /// Argument to pass to the output (hex byte array)
    #[structopt(long = "arg", parse(try_from_str = parse_hex))]
    pub arg: Option<Vec<u8>>,
    /// File to write the resulting configuration to
    #[structopt(long = "result")]
    pub result: Option<PathBuf>,
}

#[derive(StructOpt, Debug)]
/// Options of the request subcommand
pub struct RequestOpt {
    /// Specify configuration file to use
    pub config: PathBuf,
    /// Connection ID or name of the connection
    #[structopt(long = "connection")]
    pub connection: String,
    /// Argument to pass to the request (hex byte array)
    #[structopt(long = "arg", parse(try_from_str = parse_hex))]
    pub arg: Option<Vec<u8>>,
    /// File to write the resulting configuration to
    #[structopt(long = "result")]
    pub result: Option<PathBuf>,
    /// File to write the received result to
    #[structopt(long = "out")]
    pub out: Option<PathBuf>,
}

#[derive(StructOpt, Debug)]
/// Options of the disable subcommand
pub struct DisableOpt {
    /// Specify configuration file to use
    pub config: PathBuf,
    /// Name of the module to disable
    #[structopt(long = "module")]
    pub module: String,
    /// File to write the resulting configuration to
    #[structopt(long = "result")]
    pub result: Option<PathBuf>,
}

#[derive(StructOpt, Debug)]
/// Options of the update subcommand
pub struct UpdateOpt {
    /// Specify configuration file to use
    pub config: PathBuf,
    /// Name of the module to update
    #[structopt(long = "module")]
    pub module: String,
    /// File to write the resulting configuration to
    #[structopt(long = "result")]
    pub result: Option<PathBuf>,
    /// Entry point of the old module to call (for state transfer)
    #[structopt(long = "entry")]
    pub entry: Option<String>,
    /// Output of the old module to connect (for state transfer)
    #[structopt(long = "output")]
    pub output: Option<String>,
    /// Input of the new module to connect (for state transfer)
    #[structopt(long = "input")]
    pub input: Option<String>,
}

#[derive(StructOpt, Debug)]
/// Options of the reset subcommand
pub struct ResetOpt {
    /// Specify configuration file to use
    pub config: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_flags_parse() {
        let opt = AexDeployOpt::from_iter(&[
            "aex-deploy",
            "--verbose",
            "--timing",
            "deploy",
            "network.json",
            "--mode",
            "release",
            "--deploy-in-order",
            "--module",
            "m1",
        ]);

        assert!(opt.verbose);
        assert!(opt.timing);
        match opt.cmd {
            AexSubCommand::Deploy(deploy) => {
                assert_eq!(deploy.config, PathBuf::from("network.json"));
                assert_eq!(deploy.mode, BuildMode::Release);
                assert!(deploy.deploy_in_order);
                assert_eq!(deploy.module.as_deref(), Some("m1"));
            }
            other => panic!("unexpected subcommand: {:?}", other),
        }
    }

    #[test]
    fn call_arg_is_hex_decoded() {
        let opt = AexDeployOpt::from_iter(&[
            "aex-deploy",
            "call",
            "network.json",
            "--module",
            "m1",
            "--entry",
            "init",
            "--arg",
            "01020304",
        ]);

        match opt.cmd {
            AexSubCommand::Call(call) => {
                assert_eq!(call.arg, Some(vec![1, 2, 3, 4]));
            }
            other => panic!("unexpected subcommand: {:?}", other),
        }
    }
}
