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

//! Invocation of the external code generators. The generators rewrite the
//! module sources into a runnable event-driven skeleton and print a JSON
//! manifest with the endpoint name → id maps, which is the source of truth
//! for endpoint resolution.

use crate::ModuleError;
use aex_common_tools::process;
use aex_conf::EndpointData;
use std::path::Path;

/// The SGX/native code generator CLI, expected on PATH.
pub const RUST_SGX_GEN: &str = "rust-sgx-gen";

/// The TrustZone code generator CLI, expected on PATH.
pub const TZ_CODEGEN: &str = "tz-codegen";

#[derive(Debug, Deserialize)]
struct RustSgxGenManifest {
    #[serde(flatten)]
    data: EndpointData,
    #[serde(default)]
    key: Option<Vec<u8>>,
}

#[derive(Debug, Deserialize)]
struct TzCodegenManifest {
    #[serde(flatten)]
    data: EndpointData,
    uuid: String,
}

/// Run `rust-sgx-gen` over a module folder. Returns the endpoint manifest
/// and, for the native runner, the module key generated into the sources.
pub(crate) async fn rust_sgx_gen(
    module_name: &str,
    input: &str,
    output: &Path,
    module_id: u16,
    em_port: u16,
    runner: &str,
    sp_key: Option<&Path>,
) -> Result<(EndpointData, Option<Vec<u8>>), ModuleError> {
    let mut args = vec![
        "--input".to_owned(),
        input.to_owned(),
        "--output".to_owned(),
        output.display().to_string(),
        "--module-id".to_owned(),
        module_id.to_string(),
        "--em-port".to_owned(),
        em_port.to_string(),
        "--runner".to_owned(),
        runner.to_owned(),
    ];
    if let Some(sp_key) = sp_key {
        args.push("--spkey".to_owned());
        args.push(sp_key.display().to_string());
    }

    let out = process::run_with_output(RUST_SGX_GEN, &args).await?;
    let manifest: RustSgxGenManifest = serde_json::from_slice(&out)
        .map_err(|e| ModuleError::BadManifest(module_name.to_owned(), e.to_string()))?;

    info!("Generated code for module {}", module_name);
    Ok((manifest.data, manifest.key))
}

/// Run `tz-codegen` over a module folder. Returns the endpoint manifest and
/// the TA UUID it generated.
pub(crate) async fn tz_codegen(
    module_name: &str,
    input: &str,
    output: &Path,
) -> Result<(EndpointData, u128), ModuleError> {
    let args = vec![
        "--input".to_owned(),
        input.to_owned(),
        "--output".to_owned(),
        output.display().to_string(),
    ];

    let out = process::run_with_output(TZ_CODEGEN, &args).await?;
    let manifest: TzCodegenManifest = serde_json::from_slice(&out)
        .map_err(|e| ModuleError::BadManifest(module_name.to_owned(), e.to_string()))?;

    let uuid = parse_uuid(&manifest.uuid)?;

    info!("Generated code for module {}", module_name);
    Ok((manifest.data, uuid))
}

/// Parse a 128-bit TA UUID from its hex form, dashed or plain.
pub fn parse_uuid(text: &str) -> Result<u128, ModuleError> {
    let plain: String = text.chars().filter(|c| *c != '-').collect();
    if plain.len() != 32 {
        return Err(ModuleError::BadUuid(text.to_owned()));
    }
    u128::from_str_radix(&plain, 16).map_err(|_| ModuleError::BadUuid(text.to_owned()))
}

/// Format a TA UUID the way the OP-TEE build wants it:
/// `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`.
pub fn format_uuid(uuid: u128) -> String {
    let hex = format!("{:032x}", uuid);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn uuid_round_trip() {
        let uuid = 0x8aaaf200_2450_11e4_abe2_0002a5d5c51b_u128;
        let dashed = format_uuid(uuid);
        assert_eq!(dashed, "8aaaf200-2450-11e4-abe2-0002a5d5c51b");
        assert_eq!(parse_uuid(&dashed).expect("dashed"), uuid);
        assert_eq!(
            parse_uuid("8aaaf200245011e4abe20002a5d5c51b").expect("plain"),
            uuid
        );
        assert!(parse_uuid("not-a-uuid").is_err());
    }

    #[test]
    fn manifests_parse() {
        let manifest: RustSgxGenManifest = serde_json::from_str(
            r#"{"inputs": {"feed": 0}, "outputs": {}, "entrypoints": {"init": 5}, "key": [1, 2]}"#,
        )
        .expect("parse");
        assert_eq!(manifest.data.inputs["feed"], 0);
        assert_eq!(manifest.data.entrypoints["init"], 5);
        assert_eq!(manifest.key, Some(vec![1, 2]));

        let manifest: TzCodegenManifest = serde_json::from_str(
            r#"{"inputs": {}, "uuid": "8aaaf200-2450-11e4-abe2-0002a5d5c51b"}"#,
        )
        .expect("parse");
        assert!(manifest.data.inputs.is_empty());
        assert_eq!(manifest.uuid, "8aaaf200-2450-11e4-abe2-0002a5d5c51b");
    }
}
