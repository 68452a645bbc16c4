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

//! Framing and one-shot TCP exchanges with an Event Manager.

use crate::{CommandCode, ReactiveResult, ResultCode, WireError};
use byteorder::{BigEndian, WriteBytesExt};
use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

/// One framed command for the reactive port of an EM.
#[derive(Debug, Clone)]
pub struct CommandMessage {
    /// Command code
    pub code: CommandCode,
    /// Command payload
    pub payload: Vec<u8>,
}

impl CommandMessage {
    /// Build a command message.
    pub fn new(code: CommandCode, payload: Vec<u8>) -> CommandMessage {
        CommandMessage { code, payload }
    }

    /// Encode the frame: `code(u16) ‖ length(u16) ‖ payload`, big-endian.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        if self.payload.len() > usize::from(u16::max_value()) {
            return Err(WireError::PayloadTooLarge(self.payload.len()));
        }

        let mut frame = Vec::with_capacity(4 + self.payload.len());
        WriteBytesExt::write_u16::<BigEndian>(&mut frame, self.code.to_u16())?;
        WriteBytesExt::write_u16::<BigEndian>(&mut frame, self.payload.len() as u16)?;
        frame.extend_from_slice(&self.payload);
        Ok(frame)
    }
}

/// Write one framed command.
pub async fn write_command<W: AsyncWrite + Unpin>(
    writer: &mut W,
    command: &CommandMessage,
) -> Result<(), WireError> {
    writer.write_all(&command.to_bytes()?).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one `ReactiveResult`: `code(u16) ‖ length(u16) ‖ payload`.
pub async fn read_result<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<ReactiveResult, WireError> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await?;

    let code = ResultCode::from_u16(u16::from_be_bytes([header[0], header[1]]));
    let length = usize::from(u16::from_be_bytes([header[2], header[3]]));

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(ReactiveResult { code, payload })
}

/// Send one command to the reactive port of an EM over a fresh connection.
/// For commands that carry a response, a non-Ok code is turned into an
/// error; fire-and-forget commands return `None`.
pub async fn send_command(
    ip: IpAddr,
    port: u16,
    command: &CommandMessage,
) -> Result<Option<ReactiveResult>, WireError> {
    let mut stream = TcpStream::connect((ip, port)).await?;
    write_command(&mut stream, command).await?;

    if !command.code.has_response() {
        return Ok(None);
    }

    let result = read_result(&mut stream).await?;
    if !result.ok() {
        error!(
            "reactive command {:?} failed with code {}",
            command.code, result.code
        );
        return Err(WireError::CommandFailed(command.code, result.code));
    }

    Ok(Some(result))
}

/// Upload raw artefact bytes to the deploy port of an EM. The payload
/// carries its own length fields, so no frame is added.
pub async fn send_load(ip: IpAddr, port: u16, payload: &[u8]) -> Result<(), WireError> {
    let mut stream = TcpStream::connect((ip, port)).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Entrypoint;
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    #[test]
    fn frame_layout() {
        let command = CommandMessage::new(CommandCode::Call, vec![0x00, 0x01, 0x00, 0x05, 0xff]);
        assert_eq!(
            command.to_bytes().expect("encode"),
            vec![0x00, 0x01, 0x00, 0x05, 0x00, 0x01, 0x00, 0x05, 0xff]
        );

        let empty = CommandMessage::new(CommandCode::Reset, vec![]);
        assert_eq!(empty.to_bytes().expect("encode"), vec![0, 5, 0, 0]);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let command = CommandMessage::new(CommandCode::Call, vec![0u8; 65536]);
        match command.to_bytes() {
            Err(WireError::PayloadTooLarge(65536)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn response_expectations() {
        assert!(CommandCode::Call.has_response());
        assert!(CommandCode::Connect.has_response());
        assert!(CommandCode::RegisterEntrypoint.has_response());
        assert!(!CommandCode::RemoteOutput.has_response());
        assert!(!CommandCode::Load.has_response());
    }

    #[test]
    fn reserved_entrypoints_stay_low() {
        assert_eq!(Entrypoint::SetKey.to_u16(), 0);
        assert_eq!(Entrypoint::Attest.to_u16(), 1);
        assert_eq!(Entrypoint::Disable.to_u16(), 2);
    }

    #[tokio::test]
    async fn read_result_parses_code_and_payload() {
        let mut raw: &[u8] = &[0x00, 0x00, 0x00, 0x02, 0xab, 0xcd];
        let result = read_result(&mut raw).await.expect("parse");
        assert!(result.ok());
        assert_eq!(result.payload, vec![0xab, 0xcd]);

        let mut raw: &[u8] = &[0x00, 0x05, 0x00, 0x00];
        let result = read_result(&mut raw).await.expect("parse");
        assert_eq!(result.code, ResultCode::CryptoError);
    }

    #[tokio::test]
    async fn command_round_trip_against_mock_em() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut frame = [0u8; 8];
            stream.read_exact(&mut frame).await.expect("read");
            // Echo the payload back under an Ok code
            stream
                .write_all(&[0x00, 0x00, 0x00, 0x04])
                .await
                .expect("write");
            stream.write_all(&frame[4..]).await.expect("write");
            frame
        });

        let command = CommandMessage::new(CommandCode::Call, vec![0x00, 0x01, 0x00, 0x05]);
        let result = send_command(addr.ip(), addr.port(), &command)
            .await
            .expect("send")
            .expect("response");

        assert_eq!(result.payload, vec![0x00, 0x01, 0x00, 0x05]);
        let frame = server.await.expect("join");
        assert_eq!(&frame[..4], &[0x00, 0x01, 0x00, 0x04]);
    }

    #[tokio::test]
    async fn non_ok_response_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut frame = [0u8; 4];
            stream.read_exact(&mut frame).await.expect("read");
            stream
                .write_all(&[0x00, 0x04, 0x00, 0x00])
                .await
                .expect("write");
        });

        let command = CommandMessage::new(CommandCode::Reset, vec![]);
        match send_command(addr.ip(), addr.port(), &command).await {
            Err(WireError::CommandFailed(CommandCode::Reset, ResultCode::BadRequest)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
