//! Remote console client for running instances.
//!
//! Packets are `i32 size | i32 id | i32 type | body | 0 | 0`, little-endian,
//! where `size` counts everything after itself. Each command opens its own
//! connection: authenticate, send one command, read one response.

use bytes::{Buf, BufMut, BytesMut};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const TYPE_AUTH: i32 = 3;
const TYPE_AUTH_RESPONSE: i32 = 2;
const TYPE_EXEC_COMMAND: i32 = 2;
const TYPE_RESPONSE_VALUE: i32 = 0;

const AUTH_ID: i32 = 1;
const COMMAND_ID: i32 = 2;

/// Upper bound on a single packet, header included.
const MAX_PACKET: usize = 4096 + 10;

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("console transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("console did not answer within {0:?}")]
    Timeout(Duration),

    #[error("console password rejected")]
    AuthRejected,

    #[error("malformed console packet: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Packet {
    id: i32,
    kind: i32,
    body: String,
}

fn encode(id: i32, kind: i32, body: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(body.len() + 14);
    buf.put_i32_le(body.len() as i32 + 10);
    buf.put_i32_le(id);
    buf.put_i32_le(kind);
    buf.put_slice(body.as_bytes());
    buf.put_u8(0);
    buf.put_u8(0);
    buf
}

async fn read_packet(stream: &mut TcpStream) -> Result<Packet, ConsoleError> {
    let size = stream.read_i32_le().await?;
    if size < 10 || size as usize > MAX_PACKET {
        return Err(ConsoleError::Malformed(format!("packet size {size}")));
    }
    let mut raw = BytesMut::zeroed(size as usize);
    stream.read_exact(&mut raw).await?;

    let id = raw.get_i32_le();
    let kind = raw.get_i32_le();
    let body = raw.split_to(raw.len() - 2);
    let body = String::from_utf8_lossy(&body).into_owned();
    Ok(Packet { id, kind, body })
}

async fn exchange(address: &str, port: u16, password: &str, command: &str) -> Result<Vec<String>, ConsoleError> {
    let mut stream = TcpStream::connect((address, port)).await?;

    stream.write_all(&encode(AUTH_ID, TYPE_AUTH, password)).await?;
    loop {
        let packet = read_packet(&mut stream).await?;
        // Servers may send an empty response value ahead of the auth reply.
        if packet.kind != TYPE_AUTH_RESPONSE {
            continue;
        }
        if packet.id == -1 {
            return Err(ConsoleError::AuthRejected);
        }
        break;
    }

    stream.write_all(&encode(COMMAND_ID, TYPE_EXEC_COMMAND, command)).await?;
    loop {
        let packet = read_packet(&mut stream).await?;
        if packet.kind == TYPE_RESPONSE_VALUE && packet.id == COMMAND_ID {
            return Ok(packet
                .body
                .lines()
                .map(str::to_string)
                .filter(|l| !l.is_empty())
                .collect());
        }
    }
}

/// Send one command and return the response lines.
pub async fn send_command(
    address: &str,
    port: u16,
    password: &str,
    command: &str,
    timeout: Duration,
) -> Result<Vec<String>, ConsoleError> {
    debug!(address, port, "Sending console command");
    tokio::time::timeout(timeout, exchange(address, port, password, command))
        .await
        .map_err(|_| ConsoleError::Timeout(timeout))?
}
