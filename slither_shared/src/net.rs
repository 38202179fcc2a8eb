//! Networking primitives.
//!
//! Goals:
//! - Provide a reliable ordered (TCP) and unreliable (UDP) channel.
//! - Provide the replication, notification and snapshot messages used by
//!   client/server.
//! - Keep serialization explicit and versionable.
//!
//! Replication model: the authority writes every outgoing message into an
//! [`Outbox`] together with a [`Target`]. Spawns, despawns and length changes
//! go to everyone; collision outcomes go to exactly one client.

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, UdpSocket,
    },
    time,
};

use crate::{
    ecs::EntityId,
    math::{Quat, Vec3},
    pool::TemplateId,
};

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 2;

/// Largest accepted reliable frame.
pub const MAX_FRAME_LEN: usize = 1 << 20;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a peer. `ClientId::SERVER` owns server-spawned entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl ClientId {
    pub const SERVER: ClientId = ClientId(0);

    pub fn new_unique() -> Self {
        ClientId(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Collision arbitration payload: a peer and its length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerData {
    pub id: u64,
    pub length: u16,
}

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
        client_id: ClientId,
    },
    /// Client has processed the initial world state and wants a character.
    ClientReady {
        client_id: ClientId,
    },

    // ─── Entity replication ───
    /// Server spawns an entity on the client.
    EntitySpawn(EntitySpawn),
    /// Server removes an entity.
    EntityDespawn {
        id: EntityId,
    },
    /// Authoritative length counter of a character changed.
    LengthChanged {
        id: EntityId,
        previous: u16,
        value: u16,
    },

    // ─── Collision outcomes (targeted) ───
    /// Sent only to the winner.
    AtePlayer {
        loser: PlayerData,
    },
    /// Sent only to the loser.
    GameOver {
        winner: PlayerData,
    },

    // ─── Gameplay ───
    /// Client -> server: steering input for a given tick.
    PlayerCommand(PlayerCommand),
    /// Server -> client: transforms of every active networked entity.
    Snapshot(Snapshot),

    // ─── Disconnect ───
    Disconnect {
        reason: String,
    },
}

/// Entity spawn packet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntitySpawn {
    pub id: EntityId,
    pub template: TemplateId,
    pub owner: ClientId,
    pub position: Vec3,
    pub rotation: Quat,
    /// Current length counter, present for characters.
    #[serde(default)]
    pub length: Option<u16>,
}

/// Client input for one tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerCommand {
    pub client_id: ClientId,
    pub tick: u32,
    /// World-space point the head steers toward.
    pub target: Vec3,
}

/// A minimal entity state for replication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityState {
    pub id: EntityId,
    pub position: Vec3,
    pub rotation: Quat,
}

/// World snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub tick: u32,
    pub entities: Vec<EntityState>,
}

/// Who an outgoing message is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    All,
    Client(ClientId),
}

impl Target {
    pub fn includes(self, client: ClientId) -> bool {
        match self {
            Target::All => true,
            Target::Client(id) => id == client,
        }
    }
}

/// One queued outgoing message.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub target: Target,
    pub msg: NetMsg,
}

/// Ordered queue of outgoing reliable messages.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: Vec<Outgoing>,
}

impl Outbox {
    pub fn broadcast(&mut self, msg: NetMsg) {
        self.push(Target::All, msg);
    }

    pub fn send_to(&mut self, client: ClientId, msg: NetMsg) {
        self.push(Target::Client(client), msg);
    }

    pub fn push(&mut self, target: Target, msg: NetMsg) {
        self.queue.push(Outgoing { target, msg });
    }

    pub fn drain(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.queue)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Encodes a reliable frame: 4-byte big-endian length, then JSON.
pub fn encode_frame(msg: &NetMsg) -> anyhow::Result<Bytes> {
    let payload = serde_json::to_vec(msg).context("serialize msg")?;
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);
    Ok(buf.freeze())
}

async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> anyhow::Result<NetMsg> {
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .context("tcp read len")?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame too large: {len} bytes");
    }
    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
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

    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        let frame = encode_frame(msg)?;
        self.stream.write_all(&frame).await.context("tcp write")?;
        Ok(())
    }

    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        read_frame(&mut self.stream).await
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Splits into independently owned read and write halves.
    pub fn into_split(self) -> (ReliableReader, ReliableWriter) {
        let (read, write) = self.stream.into_split();
        (ReliableReader { read }, ReliableWriter { write })
    }
}

/// Read half of a [`ReliableConn`].
#[derive(Debug)]
pub struct ReliableReader {
    read: OwnedReadHalf,
}

impl ReliableReader {
    pub async fn recv(&mut self) -> anyhow::Result<NetMsg> {
        read_frame(&mut self.read).await
    }

    /// Forwards every received frame into `tx` until the connection or the
    /// channel closes.
    ///
    /// Reading happens on its own task so the simulation loop never cancels a
    /// half-read frame.
    pub async fn forward<K: Copy + Send>(
        mut self,
        key: K,
        tx: tokio::sync::mpsc::Sender<(K, Inbound)>,
    ) {
        loop {
            let event = match self.recv().await {
                Ok(msg) => Inbound::Msg(msg),
                Err(e) => Inbound::Closed(e.to_string()),
            };
            let closed = matches!(event, Inbound::Closed(_));
            if tx.send((key, event)).await.is_err() || closed {
                break;
            }
        }
    }
}

/// What a reader task hands to the simulation loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Msg(NetMsg),
    Closed(String),
}

/// Write half of a [`ReliableConn`].
#[derive(Debug)]
pub struct ReliableWriter {
    write: OwnedWriteHalf,
}

impl ReliableWriter {
    pub async fn send(&mut self, msg: &NetMsg) -> anyhow::Result<()> {
        let frame = encode_frame(msg)?;
        self.send_frame(&frame).await
    }

    /// Writes an already encoded frame (lets broadcasts encode once).
    pub async fn send_frame(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        self.write.write_all(frame).await.context("tcp write")?;
        Ok(())
    }

    /// Writes every frame received on `rx` until the channel closes or a
    /// write fails. Frames queued before the sender dropped are still written.
    pub async fn drain(mut self, mut rx: tokio::sync::mpsc::Receiver<Bytes>) -> anyhow::Result<()> {
        while let Some(frame) = rx.recv().await {
            self.send_frame(&frame).await?;
        }
        Ok(())
    }
}

/// Unreliable channel over UDP.
#[derive(Debug)]
pub struct UnreliableConn {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UnreliableConn {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.context("udp bind")?;
        socket.connect(peer).await.context("udp connect")?;
        Ok(Self { socket, peer })
    }

    pub async fn send(&self, msg: &NetMsg) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(msg).context("serialize udp msg")?;
        self.socket.send(&payload).await.context("udp send")?;
        Ok(())
    }

    /// Receives a datagram within the given timeout.
    pub async fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> anyhow::Result<Option<NetMsg>> {
        let mut buf = vec![0u8; 64 * 1024];
        match time::timeout(timeout, self.socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                let msg = serde_json::from_slice(&buf[..n]).context("deserialize udp msg")?;
                Ok(Some(msg))
            }
            Ok(Err(e)) => Err(e).context("udp recv")?,
            Err(_) => Ok(None),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
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

/// Convenience codec helpers for datagrams.
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
    fn frame_has_big_endian_length_prefix() {
        let msg = NetMsg::EntityDespawn { id: EntityId(9) };
        let frame = encode_frame(&msg).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        assert_eq!(decode_from_bytes(&frame[4..]).unwrap(), msg);
    }

    #[test]
    fn spawn_without_length_field_decodes() {
        let json = r#"{"EntitySpawn":{"id":3,"template":2,"owner":0,
            "position":{"x":1.0,"y":2.0,"z":0.0},
            "rotation":{"x":0.0,"y":0.0,"z":0.0,"w":1.0}}}"#;
        match decode_from_bytes(json.as_bytes()).unwrap() {
            NetMsg::EntitySpawn(spawn) => {
                assert_eq!(spawn.template, TemplateId::FOOD);
                assert_eq!(spawn.owner, ClientId::SERVER);
                assert_eq!(spawn.length, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn target_selection() {
        let a = ClientId(1);
        let b = ClientId(2);
        assert!(Target::All.includes(a));
        assert!(Target::Client(a).includes(a));
        assert!(!Target::Client(a).includes(b));
    }

    #[test]
    fn outbox_preserves_order() {
        let mut outbox = Outbox::default();
        outbox.broadcast(NetMsg::EntityDespawn { id: EntityId(1) });
        outbox.send_to(
            ClientId(4),
            NetMsg::GameOver {
                winner: PlayerData { id: 5, length: 3 },
            },
        );
        let drained = outbox.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].target, Target::All);
        assert_eq!(drained[1].target, Target::Client(ClientId(4)));
        assert!(outbox.is_empty());
    }
}
