//! Server implementation.
//!
//! Tick-based network shell around the [`Authority`] session. It supports:
//! - Client handshake over TCP (Hello, UdpHello, Welcome) on its own task
//! - One reader task per client feeding an mpsc channel
//! - One writer task per client draining a bounded frame queue
//! - Snapshot replication over UDP
//!
//! Nothing awaited inside [`GameServer::step`] depends on a peer, so a slow
//! or silent client cannot stall the tick.
//!
//! Determinism notes:
//! - Keep simulation in a fixed timestep.
//! - Avoid wall-clock-dependent branching in gameplay code.
//! - Use stable ordering when iterating collections.

use anyhow::Context;
use bytes::Bytes;
use slither_shared::{
    config::GameConfig,
    net::{
        encode_frame, ClientId, Inbound, NetMsg, PlayerCommand, ReliableConn, ReliableListener,
        ReliableReader, ReliableWriter, PROTOCOL_VERSION,
    },
};
use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};
use tokio::{
    net::UdpSocket,
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::authority::Authority;

const INBOUND_CAPACITY: usize = 256;
/// Frames queued per client before it counts as stalled and is dropped.
const OUTBOUND_CAPACITY: usize = 1024;
/// Deadline for Hello and UdpHello after the TCP accept.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);
/// How long shutdown waits for writer tasks to flush their queues.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Connected client state.
struct ClientState {
    outbound: mpsc::Sender<Bytes>,
    writer_task: JoinHandle<()>,
    udp_peer: SocketAddr,
}

/// A peer that finished the handshake and waits to be admitted.
struct Joined {
    id: ClientId,
    reader: ReliableReader,
    writer: ReliableWriter,
    udp_peer: SocketAddr,
}

/// Game server.
pub struct GameServer {
    pub cfg: GameConfig,
    authority: Authority,
    clients: BTreeMap<ClientId, ClientState>,

    tcp: ReliableListener,
    udp: UdpSocket,

    inbound_tx: mpsc::Sender<(ClientId, Inbound)>,
    inbound_rx: mpsc::Receiver<(ClientId, Inbound)>,
    joined_tx: mpsc::Sender<Joined>,
    joined_rx: mpsc::Receiver<Joined>,
}

impl GameServer {
    /// Binds TCP and UDP on `cfg.server_addr`.
    pub async fn new(cfg: GameConfig) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let tcp = ReliableListener::bind(addr).await?;
        let udp = UdpSocket::bind(addr).await.context("udp bind")?;
        Ok(Self::from_sockets(cfg, tcp, udp))
    }

    fn from_sockets(cfg: GameConfig, tcp: ReliableListener, udp: UdpSocket) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (joined_tx, joined_rx) = mpsc::channel(INBOUND_CAPACITY);
        Self {
            authority: Authority::new(cfg.clone()),
            cfg,
            clients: BTreeMap::new(),
            tcp,
            udp,
            inbound_tx,
            inbound_rx,
            joined_tx,
            joined_rx,
        }
    }

    /// Returns the local address (after binding).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Starts the authority session and broadcasts the initial spawns.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        self.authority.start().context("start authority session")?;
        self.flush_outbox();
        Ok(())
    }

    /// Waits up to `timeout` for a TCP connection and hands it to a
    /// handshake task. Returns the clients admitted by this call, i.e. those
    /// whose handshake finished since the last admission.
    pub async fn try_accept(&mut self, timeout: Duration) -> anyhow::Result<Vec<ClientId>> {
        match tokio::time::timeout(timeout, self.tcp.accept()).await {
            Ok(Ok((conn, peer))) => self.spawn_handshake(conn, peer),
            Ok(Err(e)) => return Err(e),
            Err(_) => {} // Timeout
        }
        Ok(self.admit_joined())
    }

    /// Accepts exactly one client and waits for its handshake.
    pub async fn accept_one(&mut self) -> anyhow::Result<ClientId> {
        let (conn, peer) = self.tcp.accept().await?;
        let joined = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(conn, peer))
            .await
            .context("handshake timed out")??;
        let id = joined.id;
        self.admit(joined);
        Ok(id)
    }

    fn spawn_handshake(&self, conn: ReliableConn, peer: SocketAddr) {
        let joined_tx = self.joined_tx.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(conn, peer)).await {
                Ok(Ok(joined)) => {
                    let _ = joined_tx.send(joined).await;
                }
                Ok(Err(e)) => warn!(%peer, error = %e, "Handshake failed"),
                Err(_) => warn!(%peer, "Handshake timed out"),
            }
        });
    }

    /// Admits every peer whose handshake task has finished.
    fn admit_joined(&mut self) -> Vec<ClientId> {
        let mut admitted = Vec::new();
        while let Ok(joined) = self.joined_rx.try_recv() {
            admitted.push(joined.id);
            self.admit(joined);
        }
        admitted
    }

    fn admit(&mut self, joined: Joined) {
        let Joined {
            id,
            reader,
            writer,
            udp_peer,
        } = joined;
        tokio::spawn(reader.forward(id, self.inbound_tx.clone()));

        let (outbound, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let writer_task = tokio::spawn(async move {
            if let Err(e) = writer.drain(rx).await {
                debug!(client_id = ?id, error = %e, "Writer stopped");
            }
        });

        self.clients.insert(
            id,
            ClientState {
                outbound,
                writer_task,
                udp_peer,
            },
        );
        self.authority.connect_peer(id);
        self.flush_outbox();

        info!(client_id = ?id, %udp_peer, "Client connected");
    }

    /// Runs the server for a number of ticks, accepting clients in between.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = Duration::from_secs_f32(self.cfg.tick_secs());
        let mut next = Instant::now();

        for _ in 0..ticks {
            next += dt;
            self.try_accept(Duration::from_millis(1)).await?;
            self.step(dt.as_secs_f32()).await?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes one fixed simulation step.
    pub async fn step(&mut self, dt_sec: f32) -> anyhow::Result<()> {
        self.admit_joined();
        self.poll_reliable();
        self.recv_commands()?;
        self.authority.step(dt_sec).context("authority step")?;
        self.flush_outbox();
        self.send_snapshots()?;
        Ok(())
    }

    /// Ends the session and tells every client. Queued frames are written
    /// before the connections close.
    pub async fn shutdown(&mut self) {
        self.authority.stop();
        self.flush_outbox();
        let writers: Vec<JoinHandle<()>> = std::mem::take(&mut self.clients)
            .into_values()
            .map(|c| c.writer_task)
            .collect();
        for task in writers {
            if tokio::time::timeout(DRAIN_TIMEOUT, task).await.is_err() {
                debug!("Writer did not drain before shutdown");
            }
        }
    }

    fn poll_reliable(&mut self) {
        while let Ok((id, event)) = self.inbound_rx.try_recv() {
            match event {
                Inbound::Msg(NetMsg::ClientReady { .. }) => {
                    match self.authority.spawn_player(id) {
                        Ok(Some(head)) => debug!(client_id = ?id, entity = ?head, "Client ready"),
                        Ok(None) => debug!(client_id = ?id, "Ready ignored"),
                        Err(e) => warn!(client_id = ?id, error = %e, "Player spawn failed"),
                    }
                }
                Inbound::Msg(NetMsg::Disconnect { reason }) => {
                    info!(client_id = ?id, %reason, "Client left");
                    self.drop_client(id);
                }
                Inbound::Msg(other) => debug!(client_id = ?id, ?other, "Unexpected TCP message"),
                Inbound::Closed(reason) => {
                    debug!(client_id = ?id, %reason, "Connection closed");
                    self.drop_client(id);
                }
            }
        }
    }

    fn drop_client(&mut self, id: ClientId) {
        if self.clients.remove(&id).is_some() {
            self.authority.disconnect_peer(id);
        }
    }

    fn recv_commands(&mut self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            match self.udp.try_recv_from(&mut buf) {
                Ok((n, from)) => match serde_json::from_slice::<NetMsg>(&buf[..n]) {
                    Ok(NetMsg::PlayerCommand(cmd)) => self.on_command(from, cmd),
                    Ok(other) => debug!(?other, "Unexpected UDP message"),
                    Err(e) => debug!(%from, error = %e, "Malformed datagram"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e).context("udp recv"),
            }
        }
        Ok(())
    }

    fn on_command(&mut self, from: SocketAddr, cmd: PlayerCommand) {
        if let Some(c) = self.clients.get_mut(&cmd.client_id) {
            c.udp_peer = from;
            self.authority.apply_command(&cmd);
        }
    }

    /// Queues every outgoing message for the clients its target includes.
    /// A client whose queue is full or whose writer stopped is dropped.
    fn flush_outbox(&mut self) {
        let mut failed = Vec::new();
        for out in self.authority.drain_outbox() {
            let frame = match encode_frame(&out.msg) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Failed to encode message");
                    continue;
                }
            };
            for (id, client) in self.clients.iter() {
                if !out.target.includes(*id) || failed.contains(id) {
                    continue;
                }
                match client.outbound.try_send(frame.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!(client_id = ?id, "Reliable queue full");
                        failed.push(*id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!(client_id = ?id, "Reliable writer closed");
                        failed.push(*id);
                    }
                }
            }
        }
        for id in failed {
            self.drop_client(id);
        }
    }

    fn send_snapshots(&self) -> anyhow::Result<()> {
        if self.clients.is_empty() {
            return Ok(());
        }
        let snap = NetMsg::Snapshot(self.authority.snapshot());
        let payload = serde_json::to_vec(&snap).context("serialize snapshot")?;

        for (id, c) in &self.clients {
            if let Err(e) = self.udp.try_send_to(&payload, c.udp_peer) {
                if e.kind() != std::io::ErrorKind::WouldBlock {
                    debug!(client_id = ?id, error = %e, "Snapshot send failed");
                }
            }
        }
        Ok(())
    }
}

/// Reads Hello and UdpHello from a fresh connection and answers Welcome.
async fn handshake(mut conn: ReliableConn, peer: SocketAddr) -> anyhow::Result<Joined> {
    match conn.recv().await? {
        NetMsg::Hello { protocol } if protocol == PROTOCOL_VERSION => {}
        NetMsg::Hello { protocol } => {
            let _ = conn
                .send(&NetMsg::Disconnect {
                    reason: format!("protocol {protocol} unsupported"),
                })
                .await;
            anyhow::bail!("client protocol {protocol}, expected {PROTOCOL_VERSION}");
        }
        other => anyhow::bail!("unexpected handshake msg: {other:?}"),
    }
    let client_udp_port = match conn.recv().await? {
        NetMsg::UdpHello { client_udp_port } => client_udp_port,
        other => anyhow::bail!("expected UdpHello, got {other:?}"),
    };

    let id = ClientId::new_unique();
    conn.send(&NetMsg::Welcome { client_id: id }).await?;

    let (reader, writer) = conn.into_split();
    Ok(Joined {
        id,
        reader,
        writer,
        udp_peer: SocketAddr::new(peer.ip(), client_udp_port),
    })
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral(tick_hz: u32) -> anyhow::Result<(GameServer, GameConfig)> {
    let cfg = GameConfig {
        server_addr: format!("{}:{}", IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        tick_hz,
        seed: Some(1),
        ..Default::default()
    };

    // Bind TCP first to get an ephemeral port, then bind UDP to that same port.
    let tcp = ReliableListener::bind(cfg.server_addr.parse()?).await?;
    let addr = tcp.local_addr()?;
    let mut cfg = cfg;
    cfg.server_addr = addr.to_string();

    let udp_bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port());
    let udp = UdpSocket::bind(udp_bind).await?;

    Ok((GameServer::from_sockets(cfg.clone(), tcp, udp), cfg))
}
