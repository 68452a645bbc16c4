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

//! Client for the external attestation manager, driven through `attman-cli`.

use aex_common_tools::process::{self, ProcessError};
use aex_conf::{DescriptorType, ManagerRecord};
use failure::Fail;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// The `attman-cli` binary, expected on PATH.
pub const ATTMAN_CLI: &str = "attman-cli";

/// Attestation manager client errors.
#[derive(Debug, Fail)]
pub enum ManagerError {
    /// `attman-cli` failed
    #[fail(display = "{}", _0)]
    Process(ProcessError),
    /// The manager answered something that is not a byte-array literal
    #[fail(display = "manager returned an invalid response: {}", _0)]
    BadResponse(String),
    /// Filesystem failure around manager artefacts
    #[fail(display = "i/o error on {}: {}", _0, _1)]
    Io(String, String),
}

impl From<ProcessError> for ManagerError {
    fn from(e: ProcessError) -> Self {
        ManagerError::Process(e)
    }
}

/// Handle to the external attestation manager service.
#[derive(Debug)]
pub struct Manager {
    /// Path of the manager descriptor file
    pub config: PathBuf,
    /// Manager service host
    pub host: String,
    /// Manager service port
    pub port: u16,
    /// Admin key for the manager API
    pub key: String,
    // get-pub-key runs at most once; concurrent callers wait on the lock
    sp_pubkey: Mutex<Option<PathBuf>>,
}

impl Manager {
    /// Build the client from its descriptor record.
    pub fn load(config: PathBuf, record: ManagerRecord) -> Manager {
        Manager {
            config,
            host: record.host,
            port: record.port,
            key: record.key,
            sp_pubkey: Mutex::new(None),
        }
    }

    /// Rewrite the manager descriptor file and return its path, which is
    /// what the deployment descriptor references.
    pub fn dump(&self) -> Result<String, ManagerError> {
        let record = ManagerRecord {
            host: self.host.clone(),
            port: self.port,
            key: self.key.clone(),
        };
        let value = serde_json::to_value(&record)
            .map_err(|e| ManagerError::Io(self.config.display().to_string(), e.to_string()))?;

        DescriptorType::Yaml
            .dump(&self.config, &value)
            .map_err(|e| ManagerError::Io(self.config.display().to_string(), e.to_string()))?;

        Ok(self.config.display().to_string())
    }

    /// Fetch the service-provider public key from the manager, caching the
    /// resulting PEM under the build directory. The subprocess runs at most
    /// once per process.
    pub async fn sp_pubkey(&self, build_dir: &Path) -> Result<PathBuf, ManagerError> {
        let mut cached = self.sp_pubkey.lock().await;
        if let Some(path) = cached.as_ref() {
            return Ok(path.clone());
        }

        let out = self.invoke("get-pub-key", None).await?;

        let path = build_dir.join("manager-sp_pubkey.pem");
        std::fs::write(&path, out)
            .map_err(|e| ManagerError::Io(path.display().to_string(), e.to_string()))?;

        *cached = Some(path.clone());
        Ok(path)
    }

    /// Run an attestation request against the manager, returning the key it
    /// prints as a byte-array literal.
    pub async fn attest(&self, request: &str, data_file: &Path) -> Result<Vec<u8>, ManagerError> {
        let out = self.invoke(request, Some(data_file)).await?;
        parse_byte_literal(&String::from_utf8_lossy(&out))
    }

    async fn invoke(&self, request: &str, data: Option<&Path>) -> Result<Vec<u8>, ManagerError> {
        let mut args = vec![
            "--config".to_owned(),
            self.config.display().to_string(),
            "--request".to_owned(),
            request.to_owned(),
        ];
        if let Some(data) = data {
            args.push("--data".to_owned());
            args.push(data.display().to_string());
        }

        debug!("querying manager: {}", request);
        Ok(process::run_with_output(ATTMAN_CLI, &args).await?)
    }
}

/// Parse a byte-array literal (`[18, 52, ...]`) as printed by the manager
/// and attestation tools.
pub fn parse_byte_literal(text: &str) -> Result<Vec<u8>, ManagerError> {
    let trimmed = text.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .ok_or_else(|| ManagerError::BadResponse(trimmed.to_owned()))?;

    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }

    inner
        .split(',')
        .map(|item| {
            item.trim()
                .parse::<u8>()
                .map_err(|_| ManagerError::BadResponse(trimmed.to_owned()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn byte_literals_parse() {
        assert_eq!(
            parse_byte_literal("[0, 1, 255]\n").expect("parse"),
            vec![0, 1, 255]
        );
        assert_eq!(parse_byte_literal("[]").expect("parse"), Vec::<u8>::new());
    }

    #[test]
    fn malformed_literals_are_rejected() {
        assert!(parse_byte_literal("no key").is_err());
        assert!(parse_byte_literal("[1, two]").is_err());
        assert!(parse_byte_literal("[300]").is_err());
    }
}
