//! Networking primitives.
//!
//! Goals:
//! - Provide a reliable (TCP) and best-effort (UDP) channel.
//! - Provide the command, notification and snapshot messages used by client/server.
//! - Keep serialization explicit and versionable.
//!
//! TCP carries commands and notifications as length-prefixed JSON frames.
//! UDP carries one JSON message per datagram and is only used for snapshots.

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, UdpSocket,
    },
    time,
};

use crate::{
    math::{Quat, Transform, Vec3},
    nav::OffMeshLinkData,
    participant::ParticipantId,
};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted TCP frame.
const MAX_FRAME_LEN: usize = 1 << 20;

/// High-level message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NetMsg {
    // ─── Connection handshake ───
    Hello {
        protocol: u32,
    },
    /// Client announces its UDP port to the server.
    UdpHello {
        client_udp_port: u16,
    },
    Welcome {
        participant: ParticipantId,
    },

    // ─── Entity lifecycle ───
    /// Server spawns an entity on the client.
    EntitySpawn {
        id: ParticipantId,
        transform: Transform,
    },
    /// Server removes an entity.
    EntityDelete {
        id: ParticipantId,
    },

    // ─── Movement ───
    /// Client -> server: move my entity toward `point`.
    SetDestination {
        point: Vec3,
    },
    /// Server -> clients: the destination the server resolved for `entity`.
    DestinationUpdate {
        entity: ParticipantId,
        point: Vec3,
    },
    /// Server -> origin: the destination command was adopted as `point`.
    DestinationAccepted {
        point: Vec3,
    },
    /// Server -> clients: `entity` reached its destination and stopped.
    DestinationReached {
        entity: ParticipantId,
    },
    /// Server -> clients: `entity` entered an off-mesh link; replay it locally.
    BeginLinkTraversal {
        entity: ParticipantId,
        link: OffMeshLinkData,
    },
    /// Server -> clients (best-effort): authoritative transforms.
    Snapshot(Snapshot),

    // ─── Token ───
    /// Server -> one client: show or hide that client's token indicator.
    SetTokenVisible {
        visible: bool,
    },
    /// Server -> clients: the current token holder.
    TokenHolder {
        holder: ParticipantId,
    },

    // ─── Session ───
    /// Request to start the token relay. Only the authority may do this.
    StartSession,

    Disconnect {
        reason: String,
    },
}

impl NetMsg {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            NetMsg::Hello { .. } => "Hello",
            NetMsg::UdpHello { .. } => "UdpHello",
            NetMsg::Welcome { .. } => "Welcome",
            NetMsg::EntitySpawn { .. } => "EntitySpawn",
            NetMsg::EntityDelete { .. } => "EntityDelete",
            NetMsg::SetDestination { .. } => "SetDestination",
            NetMsg::DestinationUpdate { .. } => "DestinationUpdate",
            NetMsg::DestinationAccepted { .. } => "DestinationAccepted",
            NetMsg::DestinationReached { .. } => "DestinationReached",
            NetMsg::BeginLinkTraversal { .. } => "BeginLinkTraversal",
            NetMsg::Snapshot(_) => "Snapshot",
            NetMsg::SetTokenVisible { .. } => "SetTokenVisible",
            NetMsg::TokenHolder { .. } => "TokenHolder",
            NetMsg::StartSession => "StartSession",
            NetMsg::Disconnect { .. } => "Disconnect",
        }
    }
}

/// Replicated transform of one entity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct EntityState {
    pub id: ParticipantId,
    pub position: Vec3,
    pub rotation: Quat,
}

/// All entity transforms after one authority tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub tick: u32,
    pub entities: Vec<EntityState>,
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, msg: &NetMsg) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(msg).context("serialize msg")?;
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    w.write_all(&buf).await.context("tcp write")?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<NetMsg> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await.context("tcp read len")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    anyhow::ensure!(len <= MAX_FRAME_LEN, "frame of {len} bytes exceeds limit");
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .await
        .context("tcp read payload")?;
    let msg = serde_json::from_slice(&payload).context("deserialize msg")?;
    Ok(msg)
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        Ok(Self::new(stream))
    }

    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        write_frame(&mut self.stream, msg).await
    }

    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        read_frame(&mut self.stream).await
    }

    /// Splits into halves so a reader task can own the receiving side.
    pub fn into_split(self) -> (ReliableReader, ReliableWriter) {
        let (r, w) = self.stream.into_split();
        (ReliableReader { half: r }, ReliableWriter { half: w })
    }
}

/// Receiving half of a [`ReliableConn`].
#[derive(Debug)]
pub struct ReliableReader {
    half: OwnedReadHalf,
}

impl ReliableReader {
    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        read_frame(&mut self.half).await
    }
}

/// Sending half of a [`ReliableConn`].
#[derive(Debug)]
pub struct ReliableWriter {
    half: OwnedWriteHalf,
}

impl ReliableWriter {
    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        write_frame(&mut self.half, msg).await
    }
}

/// Best-effort channel over UDP.
#[derive(Debug)]
pub struct UnreliableConn {
    socket: UdpSocket,
}

impl UnreliableConn {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.context("udp bind")?;
        socket.connect(peer).await.context("udp connect")?;
        Ok(Self { socket })
    }

    /// Receives one raw datagram within the given timeout.
    ///
    /// Decoding is left to the caller so a malformed datagram can be
    /// dropped without tearing down the channel.
    pub async fn recv_raw_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Option<Bytes>> {
        let mut buf = vec![0u8; 64 * 1024];
        match time::timeout(timeout, self.socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(Some(Bytes::from(buf)))
            }
            Ok(Err(e)) => Err(e).context("udp recv")?,
            Err(_) => Ok(None),
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}

/// Convenience codec helpers.
pub fn encode_to_bytes(msg: &NetMsg) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize")?;
    Ok(Bytes::from(payload))
}

pub fn decode_from_bytes(b: &[u8]) -> anyhow::Result<NetMsg> {
    serde_json::from_slice(b).context("deserialize")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_roundtrip_bytes() {
        let msg = NetMsg::Snapshot(Snapshot {
            tick: 7,
            entities: vec![EntityState {
                id: ParticipantId(2),
                position: Vec3::new(1.0, 0.0, -3.5),
                rotation: Quat::look_rotation(Vec3::new(1.0, 0.0, 0.0)),
            }],
        });
        let bytes = encode_to_bytes(&msg).unwrap();
        let back = decode_from_bytes(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[tokio::test]
    async fn frames_survive_split_stream() -> anyhow::Result<()> {
        let listener = ReliableListener::bind("127.0.0.1:0".parse()?).await?;
        let addr = listener.local_addr()?;

        let client = tokio::spawn(async move {
            let mut conn = ReliableConn::connect(addr).await?;
            conn.send(&NetMsg::SetDestination {
                point: Vec3::new(1.0, 0.0, 2.0),
            })
            .await?;
            conn.send(&NetMsg::StartSession).await?;
            Ok::<_, anyhow::Error>(())
        });

        let (conn, _) = listener.accept().await?;
        let (mut reader, _writer) = conn.into_split();
        assert_eq!(
            reader.recv().await?,
            NetMsg::SetDestination {
                point: Vec3::new(1.0, 0.0, 2.0)
            }
        );
        assert_eq!(reader.recv().await?, NetMsg::StartSession);
        client.await??;
        Ok(())
    }
}
