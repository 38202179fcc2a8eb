//! Client implementation.
//!
//! The client maintains:
//! - A reliable control stream (handshake, replication, notifications) read
//!   by a background task
//! - An unreliable datagram socket (snapshots, input)
//! - Snapshot history for interpolation
//! - The [`Observer`] session fed by both

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use slither_shared::{
    config::GameConfig,
    ecs::Transform,
    net::{
        ClientId, Inbound, NetMsg, PlayerCommand, ReliableConn, ReliableWriter, UnreliableConn,
        PROTOCOL_VERSION,
    },
};
use tokio::{net::TcpStream, sync::mpsc};
use tracing::{debug, info, warn};

use crate::{
    input::{build_command, InputState},
    interp::SnapshotBuffer,
    observer::Observer,
};

const INBOUND_CAPACITY: usize = 256;

/// High-level game client.
pub struct GameClient {
    pub client_id: ClientId,
    pub observer: Observer,

    writer: ReliableWriter,
    inbound: mpsc::Receiver<((), Inbound)>,
    pub unreliable: UnreliableConn,
    pub snaps: SnapshotBuffer,
    tick: u32,
}

impl GameClient {
    /// Connects to a server and performs handshake.
    pub async fn connect(cfg: &GameConfig) -> anyhow::Result<Self> {
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;

        info!(server = %server_addr, name = %cfg.player_name, "Connecting to server");

        // Bind UDP first so we can tell the server where to send snapshots.
        let unreliable = UnreliableConn::connect(udp_bind_addr(server_addr), server_addr).await?;
        let client_udp_port = unreliable.local_addr().context("udp local_addr")?.port();

        let stream = TcpStream::connect(server_addr)
            .await
            .context("tcp connect")?;
        let mut reliable = ReliableConn::new(stream);

        reliable
            .send(&NetMsg::Hello {
                protocol: PROTOCOL_VERSION,
            })
            .await?;

        reliable.send(&NetMsg::UdpHello { client_udp_port }).await?;

        let welcome = reliable.recv().await?;
        let client_id = match welcome {
            NetMsg::Welcome { client_id } => client_id,
            NetMsg::Disconnect { reason } => anyhow::bail!("server refused: {reason}"),
            other => anyhow::bail!("expected Welcome, got {other:?}"),
        };

        info!(client_id = ?client_id, "Connected to server");

        let mut observer = Observer::new(cfg.clone());
        observer.handle(NetMsg::Welcome { client_id });

        let (reader, writer) = reliable.into_split();
        let (tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
        tokio::spawn(reader.forward((), tx));

        Ok(Self {
            client_id,
            observer,
            writer,
            inbound,
            unreliable,
            snaps: SnapshotBuffer::new(32),
            tick: 0,
        })
    }

    /// Applies every reliable message received so far, then sends whatever
    /// the observer queued for the server. Returns the number applied.
    pub async fn poll_reliable(&mut self) -> anyhow::Result<usize> {
        let mut applied = 0;
        while let Ok(((), event)) = self.inbound.try_recv() {
            match event {
                Inbound::Msg(msg) => {
                    self.observer.handle(msg);
                    applied += 1;
                }
                Inbound::Closed(reason) => {
                    warn!(%reason, "Reliable connection closed");
                    self.observer.on_connection_lost();
                }
            }
        }
        for msg in self.observer.drain_outgoing() {
            self.writer.send(&msg).await.context("send to server")?;
        }
        Ok(applied)
    }

    /// Polls until `done` holds or `timeout` passes. Returns whether it held.
    pub async fn poll_until(
        &mut self,
        timeout: Duration,
        mut done: impl FnMut(&Observer) -> bool,
    ) -> anyhow::Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.poll_reliable().await?;
            if done(&self.observer) {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Asks the server for a character.
    pub async fn send_ready(&mut self) -> anyhow::Result<()> {
        self.writer
            .send(&NetMsg::ClientReady {
                client_id: self.client_id,
            })
            .await?;
        info!("Sent ready signal to server");
        Ok(())
    }

    /// Leaves the session.
    pub async fn disconnect(&mut self, reason: &str) -> anyhow::Result<()> {
        self.writer
            .send(&NetMsg::Disconnect {
                reason: reason.to_string(),
            })
            .await
    }

    /// Advances one client tick: local frame, then input command.
    pub async fn tick(&mut self, dt: f32, input: InputState) -> anyhow::Result<PlayerCommand> {
        self.observer.step(dt);
        let cmd = build_command(self.client_id, self.tick, input);
        self.unreliable
            .send(&NetMsg::PlayerCommand(cmd.clone()))
            .await?;
        self.tick += 1;
        Ok(cmd)
    }

    /// Receives messages over unreliable channel.
    pub async fn recv_snapshot(&mut self) -> anyhow::Result<()> {
        if let Some(msg) = self
            .unreliable
            .recv_timeout(Duration::from_millis(20))
            .await?
        {
            match msg {
                NetMsg::Snapshot(s) => {
                    if self.snaps.push(s.clone()) {
                        self.observer.handle(NetMsg::Snapshot(s));
                    }
                }
                other => {
                    debug!(?other, "Unexpected UDP message");
                }
            }
        }
        Ok(())
    }

    /// Interpolated transform of our head for rendering.
    pub fn head_sample(&self, alpha: f32) -> Option<Transform> {
        self.snaps.sample(self.observer.own_head()?, alpha)
    }

    pub fn is_shutdown(&self) -> bool {
        self.observer.is_shutdown()
    }
}

/// Wildcard address in the server's address family, ephemeral port.
fn udp_bind_addr(server: SocketAddr) -> SocketAddr {
    let ip = match server {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_binds_every_interface_of_the_server_family() {
        let remote: SocketAddr = "192.168.1.20:40000".parse().unwrap();
        assert_eq!(udp_bind_addr(remote), "0.0.0.0:0".parse().unwrap());
        let remote: SocketAddr = "[2001:db8::1]:40000".parse().unwrap();
        assert_eq!(udp_bind_addr(remote), "[::]:0".parse().unwrap());
    }
}
