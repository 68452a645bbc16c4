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

//! Direct connections against a mock Event Manager: output and request
//! events from the deployer itself.

use aex_core::{load, LoadOptions};
use aex_crypto::Encryption;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const KEY_HEX: &str = "00112233445566778899aabbccddeeff";

fn key() -> Vec<u8> {
    hex::decode(KEY_HEX).expect("key")
}

fn write_fixture(tag: &str, reactive_port: u16, to_handler: bool) -> PathBuf {
    let endpoint = if to_handler {
        r#""to_handler": "query""#
    } else {
        r#""to_input": "feed""#
    };

    let content = format!(
        r#"{{
        "nodes": [
            {{"type": "native", "name": "n1", "host": "127.0.0.1",
              "reactive_port": {port}}}
        ],
        "modules": [
            {{"type": "native", "name": "m1", "node": "n1",
              "deployed": true, "attested": true, "nonce": 0, "id": 1,
              "key": "{key}",
              "data": {{"inputs": {{"feed": 7}}, "outputs": {{}},
                        "entrypoints": {{}}, "handlers": {{"query": 9}},
                        "requests": {{}}}}}}
        ],
        "connections_current_id": 1,
        "connections": [
            {{"name": "conn0", "direct": true, "to_module": "m1", {endpoint},
              "encryption": "aes", "key": "{key}", "id": 0, "nonce": 0,
              "established": true}}
        ],
        "events_current_id": 0,
        "periodic-events": []
    }}"#,
        port = reactive_port,
        key = KEY_HEX,
        endpoint = endpoint,
    );

    let dir = std::env::temp_dir().join("aex-direct-tests");
    std::fs::create_dir_all(&dir).expect("fixture dir");
    let path = dir.join(format!("{}.json", tag));
    std::fs::write(&path, content).expect("fixture");
    path
}

fn options() -> LoadOptions {
    LoadOptions {
        build_dir: Some(std::env::temp_dir().join("aex-direct-tests").join("build")),
        ..LoadOptions::default()
    }
}

#[tokio::test]
async fn direct_output_encrypts_under_the_rolling_nonce() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let em = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.expect("header");
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.expect("payload");
        (header, payload)
    });

    let path = write_fixture("output", port, false);
    let (config, _ctx) = load(&path, &options()).expect("load");

    config
        .trigger_output("conn0", &[0x01, 0x02, 0x03, 0x04])
        .await
        .expect("output");

    let (header, payload) = em.await.expect("join");

    // RemoteOutput frame
    assert_eq!(u16::from_be_bytes([header[0], header[1]]), 0x2);
    // to_module_id ‖ conn_id ‖ AEAD(key, ad = nonce 0, arg)
    assert_eq!(&payload[..2], &1u16.to_be_bytes());
    assert_eq!(&payload[2..4], &0u16.to_be_bytes());
    let plain = Encryption::Aes
        .decrypt(&key(), &0u16.to_be_bytes(), &payload[4..])
        .expect("decrypt");
    assert_eq!(plain, vec![0x01, 0x02, 0x03, 0x04]);

    // The nonce advanced by one
    let connection = config.get_connection_by_id(0).expect("connection");
    assert_eq!(connection.nonce(), 1);
}

#[tokio::test]
async fn direct_request_decrypts_the_response_under_nonce_plus_one() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let em = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.expect("header");
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.expect("payload");

        // Decrypt the request under nonce 0, answer under nonce 1
        let key = hex::decode(KEY_HEX).expect("key");
        let arg = Encryption::Aes
            .decrypt(&key, &0u16.to_be_bytes(), &payload[4..])
            .expect("request decrypt");
        let mut answer = arg;
        answer.reverse();
        let cipher = Encryption::Aes
            .encrypt(&key, &1u16.to_be_bytes(), &answer)
            .expect("answer encrypt");

        let mut response = vec![0u8, 0];
        response.extend_from_slice(&(cipher.len() as u16).to_be_bytes());
        response.extend_from_slice(&cipher);
        stream.write_all(&response).await.expect("write");

        u16::from_be_bytes([header[0], header[1]])
    });

    let path = write_fixture("request", port, true);
    let (config, _ctx) = load(&path, &options()).expect("load");

    let response = config
        .trigger_request("conn0", &[0xaa, 0xbb])
        .await
        .expect("request");
    assert_eq!(response, vec![0xbb, 0xaa]);

    // RemoteRequest frame, nonce advanced by two
    assert_eq!(em.await.expect("join"), 0x3);
    let connection = config.get_connection_by_id(0).expect("connection");
    assert_eq!(connection.nonce(), 2);
}

#[tokio::test]
async fn output_on_a_non_direct_connection_is_refused() {
    let path = write_fixture("nondirect", 1, false);

    // Rewrite the connection as module-to-module
    let content = std::fs::read_to_string(&path)
        .expect("fixture")
        .replace(r#""direct": true"#, r#""direct": false, "from_module": "m2", "from_output": "out""#);
    let content = content.replace(
        r#""modules": ["#,
        r#""modules": [
            {"type": "native", "name": "m2", "node": "n1",
             "deployed": true, "attested": true, "nonce": 0, "id": 2,
             "key": "00112233445566778899aabbccddeeff",
             "data": {"inputs": {}, "outputs": {"out": 1}, "entrypoints": {},
                      "handlers": {}, "requests": {}}},"#,
    );
    std::fs::write(&path, content).expect("rewrite");

    let (config, _ctx) = load(&path, &options()).expect("load");
    let err = config
        .trigger_output("conn0", &[1])
        .await
        .expect_err("not direct");
    assert_eq!(err.to_string(), "Connection is not direct.");
}
