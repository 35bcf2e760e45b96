//! Client implementation.
//!
//! The client maintains:
//! - A reliable stream (handshake, commands, notifications), read by a
//!   background task so polling never cancels a half-read frame
//! - An unreliable datagram socket for snapshots
//! - A [`ReplicaWorld`] mirroring the authority
//! - A local navmesh copy for snapping picked destinations

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use hotpotato_shared::{
    config::SessionConfig,
    math::Vec3,
    navmesh::RegionNavMesh,
    net::{
        decode_from_bytes, NetMsg, ReliableConn, ReliableReader, ReliableWriter, UnreliableConn,
        PROTOCOL_VERSION,
    },
    participant::ParticipantId,
};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    input::{destination_command, pick_destination},
    replica::ReplicaWorld,
};

/// Client connection state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    /// Handshake done, mirroring the session.
    Connected,
    /// Server went away or we left.
    Disconnected,
}

/// What the reader task hands to the client.
#[derive(Debug)]
enum Inbound {
    Msg(NetMsg),
    Closed(String),
}

/// High-level game client.
pub struct GameClient {
    pub participant: ParticipantId,
    pub state: ClientState,
    pub world: ReplicaWorld,

    cfg: SessionConfig,
    navmesh: RegionNavMesh,

    writer: ReliableWriter,
    inbound: mpsc::Receiver<Inbound>,
    reader: JoinHandle<()>,
    pub unreliable: UnreliableConn,
}

impl GameClient {
    /// Connects to a server and performs handshake.
    pub async fn connect(cfg: &SessionConfig) -> anyhow::Result<Self> {
        let server_addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let navmesh = match &cfg.navmesh {
            Some(path) => RegionNavMesh::load(path)?,
            None => RegionNavMesh::demo(),
        };

        info!(server = %server_addr, "Connecting to server");

        // Bind UDP first so we can tell the server where to send snapshots.
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let unreliable = UnreliableConn::connect(bind, server_addr).await?;
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

        let participant = match reliable.recv().await? {
            NetMsg::Welcome { participant } => participant,
            NetMsg::Disconnect { reason } => anyhow::bail!("server refused connection: {reason}"),
            other => anyhow::bail!("expected Welcome, got {}", other.kind()),
        };

        info!(%participant, "Connected to server");

        let mut world = ReplicaWorld::new(cfg.motion.clone());
        world.apply(NetMsg::Welcome { participant });

        let (reader, writer) = reliable.into_split();
        let (tx, inbound) = mpsc::channel(256);
        let reader = spawn_reader(reader, tx);

        Ok(Self {
            participant,
            state: ClientState::Connected,
            world,
            cfg: cfg.clone(),
            navmesh,
            writer,
            inbound,
            reader,
            unreliable,
        })
    }

    /// Applies every reliable message that has arrived. Returns how many.
    pub fn poll_reliable(&mut self) -> usize {
        let mut n = 0;
        while let Ok(inbound) = self.inbound.try_recv() {
            n += 1;
            match inbound {
                Inbound::Msg(NetMsg::Disconnect { reason }) => {
                    info!(%reason, "Disconnected from server");
                    self.state = ClientState::Disconnected;
                }
                Inbound::Msg(msg) => self.world.apply(msg),
                Inbound::Closed(reason) => {
                    warn!(%reason, "Reliable connection closed");
                    self.state = ClientState::Disconnected;
                }
            }
        }
        n
    }

    /// Waits up to `timeout` for one snapshot datagram and applies it.
    ///
    /// Datagrams that do not decode are dropped; only socket failures are
    /// errors.
    pub async fn recv_snapshot(&mut self, timeout: Duration) -> anyhow::Result<bool> {
        let Some(datagram) = self.unreliable.recv_raw_timeout(timeout).await? else {
            return Ok(false);
        };
        match decode_from_bytes(&datagram) {
            Ok(msg @ NetMsg::Snapshot(_)) => {
                self.world.apply(msg);
                Ok(true)
            }
            Ok(other) => {
                debug!(kind = other.kind(), "Unexpected UDP message");
                Ok(false)
            }
            Err(e) => {
                warn!(len = datagram.len(), error = %e, "Dropping malformed datagram");
                Ok(false)
            }
        }
    }

    /// Asks the server to move this participant's entity toward `picked`.
    ///
    /// Returns the snapped point that was sent, or `None` if the pick was
    /// not walkable and nothing was sent. The replica only shows the
    /// destination once the authority accepts it.
    pub async fn request_destination(&mut self, picked: Vec3) -> anyhow::Result<Option<Vec3>> {
        let Ok(point) = pick_destination(&self.navmesh, picked, self.cfg.motion.pick_radius) else {
            return Ok(None);
        };
        self.writer.send(&destination_command(point)).await?;
        debug!(?point, "Destination sent");
        Ok(Some(point))
    }

    /// Advances interpolation and link replays.
    pub fn render(&mut self, dt: f32) {
        self.world.render(dt);
    }

    /// Says goodbye and stops reading.
    pub async fn disconnect(&mut self, reason: &str) -> anyhow::Result<()> {
        if self.state == ClientState::Disconnected {
            return Ok(());
        }
        self.state = ClientState::Disconnected;
        self.reader.abort();
        self.writer
            .send(&NetMsg::Disconnect {
                reason: reason.to_string(),
            })
            .await
    }

    /// Executes a console command.
    pub async fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&cmd) = tokens.first() else {
            return Ok(Vec::new());
        };

        match cmd {
            "goto" => {
                let coords: Result<Vec<f32>, _> =
                    tokens[1..].iter().map(|t| t.parse::<f32>()).collect();
                let Ok(&[x, y, z]) = coords.as_deref() else {
                    return Ok(vec!["Usage: goto <x> <y> <z>".to_string()]);
                };
                match self.request_destination(Vec3::new(x, y, z)).await? {
                    Some(p) => Ok(vec![format!("Moving to ({:.2}, {:.2}, {:.2})", p.x, p.y, p.z)]),
                    None => Ok(vec!["That point is not walkable".to_string()]),
                }
            }
            "status" => {
                let mut out = Vec::new();
                out.push(format!("State: {:?}", self.state));
                out.push(format!("Participant: {}", self.participant));
                out.push(format!("Last snapshot tick: {:?}", self.world.last_snapshot_tick()));
                match self.world.token_holder() {
                    Some(h) => out.push(format!("Token holder: {h}")),
                    None => out.push("Token holder: none".to_string()),
                }
                out.push(format!("Holding token: {}", self.world.token_visible()));
                for e in self.world.entities() {
                    let t = e.render_transform();
                    out.push(format!(
                        "  {}: pos=({:.2}, {:.2}, {:.2}) dest={:?} link={}",
                        e.id(),
                        t.position.x,
                        t.position.y,
                        t.position.z,
                        e.destination(),
                        e.is_replaying_link(),
                    ));
                }
                Ok(out)
            }
            "quit" | "exit" => {
                self.disconnect("client quit").await?;
                Ok(vec!["Bye".to_string()])
            }
            other => Ok(vec![format!("Unknown command: {other} (try goto, status, quit)")]),
        }
    }
}

fn spawn_reader(mut reader: ReliableReader, tx: mpsc::Sender<Inbound>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match reader.recv().await {
                Ok(msg) => {
                    if tx.send(Inbound::Msg(msg)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Inbound::Closed(format!("{e:#}"))).await;
                    break;
                }
            }
        }
    })
}
