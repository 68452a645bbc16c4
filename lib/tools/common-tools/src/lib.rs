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

//! Common tools for the Authentic Execution deployer.

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

pub mod hexser;
pub mod process;

use failure::Fail;
use std::net::{IpAddr, ToSocketAddrs};

/// Build mode requested for the module toolchains.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BuildMode {
    /// Unoptimized build with debug assertions
    Debug,
    /// Optimized build
    Release,
}

impl Default for BuildMode {
    fn default() -> Self {
        BuildMode::Debug
    }
}

impl BuildMode {
    /// Mode name as passed to the external toolchains
    pub fn to_str(self) -> &'static str {
        match self {
            BuildMode::Debug => "debug",
            BuildMode::Release => "release",
        }
    }
}

impl std::str::FromStr for BuildMode {
    type Err = BadBuildMode;

    fn from_str(mode: &str) -> Result<Self, Self::Err> {
        match mode.to_lowercase().as_str() {
            "debug" => Ok(BuildMode::Debug),
            "release" => Ok(BuildMode::Release),
            _ => Err(BadBuildMode(mode.to_owned())),
        }
    }
}

/// Error raised for an unknown build mode.
#[derive(Debug, Clone, Fail)]
#[fail(display = "bad build mode: {}", _0)]
pub struct BadBuildMode(pub String);

/// Verbosity derived from the active log level.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Verbosity {
    /// Warnings and errors only
    Normal,
    /// Informational output
    Verbose,
    /// Full debug output (subprocess stderr is passed through)
    Debug,
}

impl Verbosity {
    /// Verbosity matching the level the logger is enabled for
    pub fn current() -> Verbosity {
        if log_enabled!(log::Level::Debug) {
            Verbosity::Debug
        } else if log_enabled!(log::Level::Info) {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        }
    }
}

/// Error raised when a host is neither an IP literal nor resolvable.
#[derive(Debug, Clone, Fail)]
#[fail(display = "invalid host: {}", _0)]
pub struct InvalidHost(pub String);

/// Resolve a host to an IP address. IP literals pass through, anything else
/// goes through the system resolver.
pub fn resolve_ip(host: &str) -> Result<IpAddr, InvalidHost> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    (host, 0u16)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(|addr| addr.ip())
        .ok_or_else(|| InvalidHost(host.to_owned()))
}

/// Increment the numeric suffix of a string, appending `2` if there is none.
/// Used to derive fresh deploy names when a module is cloned for an update.
pub fn increment_suffix(value: &str) -> String {
    let digits = value
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .count();
    let (stem, suffix) = value.split_at(value.len() - digits);

    match suffix.parse::<u64>() {
        Ok(n) => format!("{}{}", stem, n + 1),
        Err(_) => format!("{}2", stem),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn build_mode_round_trip() {
        let mode: BuildMode = "Release".parse().expect("parse release");
        assert_eq!(mode, BuildMode::Release);
        assert_eq!(mode.to_str(), "release");
        assert!("fast".parse::<BuildMode>().is_err());
    }

    #[test]
    fn resolve_ip_literals() {
        assert_eq!(
            resolve_ip("127.0.0.1").expect("v4 literal"),
            "127.0.0.1".parse::<IpAddr>().expect("addr")
        );
        assert_eq!(
            resolve_ip("::1").expect("v6 literal"),
            "::1".parse::<IpAddr>().expect("addr")
        );
        assert!(resolve_ip("no.such.host.invalid.").is_err());
    }

    #[test]
    fn increment_suffix_variants() {
        assert_eq!(increment_suffix("sensor"), "sensor2");
        assert_eq!(increment_suffix("sensor2"), "sensor3");
        assert_eq!(increment_suffix("sensor19"), "sensor20");
    }
}
