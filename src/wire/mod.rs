//! Wire protocol: handshake, framed request/reply, and bandwidth/RTT
//! accounting.
//!
//! Grounded on `examples/original_source/src/sharedstate.cc`'s
//! `serverHandShake`/`clientHandShake` (version round-trip doubling as an
//! RTT probe) and `sendNetworkMessage`/`receiveNetworkMessage` (length-
//! prefixed framing, total-bytes-received ack).

pub mod stats;

use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::WireError;
use crate::net::ConnectedSocket;
use crate::store::TypeState;

/// Bumped whenever the framing or handshake changes incompatibly.
pub const WIRE_PROTO_VERSION: u32 = 1;

/// Default TCP port peers listen for reqsync connections on.
pub const SHARED_STATE_PORT: u16 = 3490;

/// Valid range for the 1-byte type-name length prefix.
const TYPE_NAME_LEN_RANGE: std::ops::RangeInclusive<u8> = 1..=255;

/// Valid range for the 4-byte data length prefix (spec §4.7). `2` is the
/// minimum because a JSON payload is at least `{}`.
const DATA_LEN_MIN: u32 = 2;

/// A decoded or to-be-encoded sync message: one type's full state slice.
#[derive(Clone, Debug)]
pub struct NetworkMessage {
    pub type_name: String,
    pub state: TypeState,
}

impl NetworkMessage {
    pub fn new(type_name: impl Into<String>, state: TypeState) -> Self {
        Self { type_name: type_name.into(), state }
    }

    fn encode_data(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(&self.state)?)
    }

    fn decode_data(type_name: String, bytes: &[u8]) -> Result<Self, WireError> {
        let state: TypeState = serde_json::from_slice(bytes)?;
        Ok(Self { type_name, state })
    }
}

/// Per-exchange measurements, persisted by [`stats::StatsFile`].
#[derive(Clone, Debug)]
pub struct ExchangeStats {
    pub rtt: Duration,
    pub up_mbps: f64,
    pub down_mbps: f64,
}

impl Default for ExchangeStats {
    fn default() -> Self {
        Self { rtt: Duration::ZERO, up_mbps: 0.0, down_mbps: 0.0 }
    }
}

fn mbit_per_sec(bytes: usize, elapsed: Duration) -> f64 {
    if elapsed.is_zero() {
        return 0.0;
    }
    (bytes as f64 * 8.0) / elapsed.as_secs_f64() / 1_000_000.0
}

async fn send_all(socket: &ConnectedSocket, buf: &[u8]) -> Result<usize, WireError> {
    let n = socket.send(buf).await.map_err(io_from_errno)?;
    if n != buf.len() {
        return Err(WireError::PeerClosed);
    }
    Ok(n)
}

async fn recv_all(socket: &ConnectedSocket, buf: &mut [u8]) -> Result<usize, WireError> {
    let n = socket.recv(buf).await.map_err(io_from_errno)?;
    if n != buf.len() {
        return Err(WireError::PeerClosed);
    }
    Ok(n)
}

fn io_from_errno(e: nix::errno::Errno) -> WireError {
    WireError::Io(std::io::Error::from_raw_os_error(e as i32))
}

/// Client side of the version handshake: sends our version, reads the
/// peer's, and sends it back — the round trip doubles as an RTT probe
/// (spec §4.7 / original `clientHandShake`).
pub async fn client_handshake(socket: &ConnectedSocket) -> Result<Duration, WireError> {
    let begin = Instant::now();
    send_all(socket, &WIRE_PROTO_VERSION.to_be_bytes()).await?;

    let mut peer_version = [0u8; 4];
    recv_all(socket, &mut peer_version).await?;
    let elapsed = begin.elapsed();

    let peer_version = u32::from_be_bytes(peer_version);
    if peer_version != WIRE_PROTO_VERSION {
        return Err(WireError::VersionMismatch { local: WIRE_PROTO_VERSION, peer: peer_version });
    }
    send_all(socket, &peer_version.to_be_bytes()).await?;
    Ok(elapsed)
}

/// Server side of the version handshake (spec §4.7 / original
/// `serverHandShake`).
pub async fn server_handshake(socket: &ConnectedSocket) -> Result<Duration, WireError> {
    let mut peer_version = [0u8; 4];
    recv_all(socket, &mut peer_version).await?;
    let peer_version = u32::from_be_bytes(peer_version);
    if peer_version != WIRE_PROTO_VERSION {
        return Err(WireError::VersionMismatch { local: WIRE_PROTO_VERSION, peer: peer_version });
    }

    let begin = Instant::now();
    send_all(socket, &WIRE_PROTO_VERSION.to_be_bytes()).await?;

    let mut echoed = [0u8; 4];
    recv_all(socket, &mut echoed).await?;
    Ok(begin.elapsed())
}

/// Sends a [`NetworkMessage`], then awaits the peer's total-bytes-received
/// ack. Bandwidth is measured strictly over the data phase, per spec
/// (confirmed by `sendBTP`/`ackETP` bracketing only the framed bytes, not
/// the handshake).
pub async fn send_message(
    socket: &ConnectedSocket,
    msg: &NetworkMessage,
) -> Result<(usize, f64), WireError> {
    let type_name_bytes = msg.type_name.as_bytes();
    if !TYPE_NAME_LEN_RANGE.contains(&(type_name_bytes.len() as u8)) || type_name_bytes.len() > 255
    {
        return Err(WireError::TypeNameLength(type_name_bytes.len()));
    }
    let data = msg.encode_data()?;
    let data_len: u32 = data.len().try_into().map_err(|_| WireError::DataLength(u32::MAX))?;

    let begin = Instant::now();
    let mut total = 0;
    total += send_all(socket, &[type_name_bytes.len() as u8]).await?;
    total += send_all(socket, type_name_bytes).await?;
    total += send_all(socket, &data_len.to_be_bytes()).await?;
    total += send_all(socket, &data).await?;

    let mut ack = [0u8; 4];
    recv_all(socket, &mut ack).await?;
    let elapsed = begin.elapsed();
    let acked = u32::from_be_bytes(ack);
    if acked as usize != total {
        return Err(WireError::AckMismatch { sent: total as u32, acked });
    }

    Ok((total, mbit_per_sec(total, elapsed)))
}

/// Receives a [`NetworkMessage`], then acks the total bytes received so the
/// sender can estimate upload bandwidth (spec §4.7 / original
/// `receiveNetworkMessage`).
pub async fn recv_message(socket: &ConnectedSocket) -> Result<(NetworkMessage, f64), WireError> {
    let begin = Instant::now();
    let mut total = 0usize;

    let mut len_byte = [0u8; 1];
    total += recv_all(socket, &mut len_byte).await?;
    let type_name_len = len_byte[0];
    if !TYPE_NAME_LEN_RANGE.contains(&type_name_len) {
        return Err(WireError::TypeNameLength(type_name_len as usize));
    }

    let mut type_name_buf = vec![0u8; type_name_len as usize];
    total += recv_all(socket, &mut type_name_buf).await?;
    let type_name = String::from_utf8(type_name_buf).map_err(|_| WireError::TypeNameLength(0))?;

    let mut len_buf = [0u8; 4];
    total += recv_all(socket, &mut len_buf).await?;
    let data_len = u32::from_be_bytes(len_buf);
    if data_len < DATA_LEN_MIN {
        return Err(WireError::DataLength(data_len));
    }

    let mut data = vec![0u8; data_len as usize];
    total += recv_all(socket, &mut data).await?;
    let elapsed = begin.elapsed();

    send_all(socket, &(total as u32).to_be_bytes()).await?;

    let msg = NetworkMessage::decode_data(type_name, &data)?;
    Ok((msg, mbit_per_sec(total, elapsed)))
}

/// Just the raw JSON payload, used by [`NetworkMessage::encode_data`]'s
/// test below to sanity-check round-tripping without a live socket.
#[cfg(test)]
fn state_json(state: &TypeState) -> Value {
    serde_json::to_value(state).unwrap()
}
