//! Server implementation.
//!
//! An authoritative fixed-timestep loop around [`AuthoritySession`]:
//! - Console commands (start, status, quit)
//! - Client handshakes on their own tasks, then per-connection reader tasks
//! - Reliable command/notification delivery over TCP
//! - Snapshot broadcast over UDP
//!
//! Determinism notes:
//! - Keep simulation in a fixed timestep.
//! - The token relay is the only wall-clock consumer; it reads session
//!   elapsed time, never the tick count.
//! - Use stable ordering when iterating collections.

use anyhow::Context;
use hotpotato_shared::{
    config::SessionConfig,
    navmesh::RegionNavMesh,
    net::{NetMsg, ReliableConn, ReliableListener, ReliableReader, ReliableWriter, PROTOCOL_VERSION},
    participant::{ParticipantId, ParticipantSet, Role},
};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    collections::{BTreeMap, BTreeSet},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};
use tokio::{
    net::UdpSocket,
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::session::AuthoritySession;

/// Connected client state.
struct ClientConn {
    writer: ReliableWriter,
    udp_peer: SocketAddr,
    reader: JoinHandle<()>,
}

/// How long a new connection may take to say hello.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// A connection that finished the handshake and is waiting to join.
struct Handshake {
    id: ParticipantId,
    reader: ReliableReader,
    writer: ReliableWriter,
    udp_peer: SocketAddr,
}

/// What handshake and reader tasks hand to the loop.
enum Inbound {
    Joined(Handshake),
    Msg(ParticipantId, NetMsg),
    Closed(ParticipantId, String),
}

/// Server state enum for the session flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerState {
    /// Accepting players; the token relay has not started.
    Lobby,
    /// Token relay running.
    Running,
}

/// Game server.
pub struct GameServer {
    pub cfg: SessionConfig,
    session: AuthoritySession,
    clients: BTreeMap<ParticipantId, ClientConn>,

    tcp: ReliableListener,
    udp: UdpSocket,

    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: mpsc::Receiver<Inbound>,

    /// Origin of the session clock.
    started_at: Instant,
    quit: bool,

    /// Channel for console commands from stdin.
    console_rx: Option<mpsc::Receiver<String>>,
}

impl GameServer {
    /// Creates a new server with the given config.
    ///
    /// TCP binds `cfg.server_addr`; UDP binds the same port TCP ended up on.
    pub async fn new(cfg: SessionConfig) -> anyhow::Result<Self> {
        cfg.validate().context("invalid config")?;
        let mesh = match &cfg.navmesh {
            Some(path) => RegionNavMesh::load(path)?,
            None => {
                info!("No navmesh configured, using built-in demo arena");
                RegionNavMesh::demo()
            }
        };

        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let tcp = ReliableListener::bind(addr).await?;
        let udp = UdpSocket::bind(tcp.local_addr()?)
            .await
            .context("udp bind")?;

        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let session = AuthoritySession::with_navmesh(cfg.clone(), mesh, StdRng::from_entropy());

        let mut server = Self {
            cfg,
            session,
            clients: BTreeMap::new(),
            tcp,
            udp,
            inbound_tx,
            inbound_rx,
            started_at: Instant::now(),
            quit: false,
            console_rx: None,
        };
        if server.cfg.autostart {
            server.start_relay();
        }
        Ok(server)
    }

    /// Sets the console input receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    /// Returns the local address (after binding).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    /// Returns the current server state.
    pub fn state(&self) -> ServerState {
        if self.session.is_started() {
            ServerState::Running
        } else {
            ServerState::Lobby
        }
    }

    pub fn session(&self) -> &AuthoritySession {
        &self.session
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// True once `quit` was entered on the console.
    pub fn should_quit(&self) -> bool {
        self.quit
    }

    /// Elapsed time on the session clock.
    pub fn session_time(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Accepts exactly one client (handshake + world state).
    pub async fn accept_one(&mut self) -> anyhow::Result<ParticipantId> {
        let (conn, peer) = self.tcp.accept().await?;
        let handshake = handshake(conn, peer).await?;
        let id = self.admit(handshake);
        self.flush().await?;
        Ok(id)
    }

    /// Accepts a connection if one arrives within `timeout`.
    ///
    /// The handshake runs on its own task, so a slow or silent peer never
    /// holds up the tick. The client joins on a later [`GameServer::step`].
    pub async fn try_accept(&mut self, timeout: Duration) -> anyhow::Result<bool> {
        let (conn, peer) = match tokio::time::timeout(timeout, self.tcp.accept()).await {
            Ok(accepted) => accepted?,
            Err(_) => return Ok(false), // Timeout
        };
        let tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            match handshake(conn, peer).await {
                Ok(done) => {
                    let _ = tx.send(Inbound::Joined(done)).await;
                }
                Err(e) => warn!(%peer, error = %e, "Handshake failed"),
            }
        });
        Ok(true)
    }

    fn admit(&mut self, handshake: Handshake) -> ParticipantId {
        let Handshake {
            id,
            reader,
            writer,
            udp_peer,
        } = handshake;
        let reader = spawn_reader(id, reader, self.inbound_tx.clone());
        self.clients.insert(
            id,
            ClientConn {
                writer,
                udp_peer,
                reader,
            },
        );
        info!(participant = %id, %udp_peer, "Client connected");
        self.session.join(id);
        id
    }

    /// Runs the server for a number of ticks.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> anyhow::Result<()> {
        let dt = Duration::from_secs_f32(self.cfg.tick_dt());
        let mut next = Instant::now();

        for _ in 0..ticks {
            next += dt;
            self.step(dt.as_secs_f32()).await?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    /// Executes one fixed simulation step.
    pub async fn step(&mut self, dt_sec: f32) -> anyhow::Result<()> {
        self.process_console_commands();
        self.recv_commands();
        self.session.tick(dt_sec);
        let now = self.session_time();
        // Outcome is logged by the relay.
        let _ = self.session.poll_relay(now);
        self.flush().await
    }

    fn process_console_commands(&mut self) {
        // Collect lines first to avoid borrow conflict
        let lines: Vec<String> = if let Some(ref mut rx) = self.console_rx {
            let mut collected = Vec::new();
            while let Ok(line) = rx.try_recv() {
                collected.push(line);
            }
            collected
        } else {
            Vec::new()
        };

        for line in lines {
            for out in self.exec_console(&line) {
                println!("{out}");
            }
        }
    }

    /// Executes a console command.
    pub fn exec_console(&mut self, line: &str) -> Vec<String> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&cmd) = tokens.first() else {
            return Vec::new();
        };

        match cmd {
            "start" => vec![self.start_relay().to_string()],
            "status" => {
                let mut out = Vec::new();
                out.push(format!("Server state: {:?}", self.state()));
                out.push(format!("Tick: {}", self.session.tick_count()));
                out.push(format!("Session time: {:.1}s", self.session_time().as_secs_f32()));
                match self.session.token_holder() {
                    Some(holder) => out.push(format!("Token holder: {holder}")),
                    None => out.push("Token holder: none".to_string()),
                }
                if let Some(due) = self.session.relay().schedule().due() {
                    out.push(format!("Next transfer at: {:.1}s", due.as_secs_f32()));
                }
                out.push(format!("Clients: {}", self.clients.len()));
                for (id, client) in &self.clients {
                    let entity = self.session.entity(*id);
                    out.push(format!(
                        "  {}: udp={} pos={:?} state={} off_mesh={}",
                        id,
                        client.udp_peer,
                        entity.map(|e| e.position()),
                        entity.map_or("none", |e| e.path_state().name()),
                        entity.is_some_and(|e| e.is_off_mesh()),
                    ));
                }
                out
            }
            "quit" | "exit" => {
                info!("Server shutting down");
                self.quit = true;
                vec!["Shutting down".to_string()]
            }
            other => vec![format!("Unknown command: {other} (try start, status, quit)")],
        }
    }

    fn start_relay(&mut self) -> &'static str {
        let now = self.session_time();
        match self.session.start_relay(Role::Authority, now) {
            Ok(true) => "Token relay started",
            Ok(false) => "Token relay already running",
            Err(e) => {
                warn!(error = %e, "Failed to start token relay");
                "Failed to start token relay"
            }
        }
    }

    fn recv_commands(&mut self) {
        while let Ok(inbound) = self.inbound_rx.try_recv() {
            match inbound {
                Inbound::Joined(handshake) => {
                    self.admit(handshake);
                }
                Inbound::Msg(id, msg) => {
                    if !self.clients.contains_key(&id) {
                        continue;
                    }
                    if let Err(e) = self.session.handle_message(id, msg) {
                        debug!(participant = %id, error = %e, "Command not applied");
                    }
                    if !self.session.roster().contains(id) {
                        self.drop_client(id);
                    }
                }
                Inbound::Closed(id, reason) => self.disconnect(id, &reason),
            }
        }
    }

    /// Drops a client and despawns its entity.
    pub fn disconnect(&mut self, id: ParticipantId, reason: &str) {
        if self.drop_client(id) {
            info!(participant = %id, %reason, "Client disconnected");
        }
        self.session.leave(id);
    }

    fn drop_client(&mut self, id: ParticipantId) -> bool {
        match self.clients.remove(&id) {
            Some(c) => {
                c.reader.abort();
                true
            }
            None => false,
        }
    }

    /// Writes everything the session queued since the last flush.
    async fn flush(&mut self) -> anyhow::Result<()> {
        let mut failed = BTreeSet::new();
        for (to, msg) in self.session.outbox_mut().drain_reliable() {
            if failed.contains(&to) {
                continue;
            }
            let Some(client) = self.clients.get_mut(&to) else {
                continue;
            };
            if let Err(e) = client.writer.send(&msg).await {
                warn!(participant = %to, kind = msg.kind(), error = %e, "Reliable send failed");
                failed.insert(to);
            }
        }

        for msg in self.session.outbox_mut().drain_broadcast() {
            let payload = serde_json::to_vec(&msg).context("serialize snapshot")?;
            for c in self.clients.values() {
                let _ = self.udp.send_to(&payload, c.udp_peer).await;
            }
        }

        for id in failed {
            self.disconnect(id, "write failed");
        }
        Ok(())
    }

    /// Tells every client the server is going away and drops them.
    pub async fn shutdown(&mut self, reason: &str) {
        let msg = NetMsg::Disconnect {
            reason: reason.to_string(),
        };
        for (id, mut client) in std::mem::take(&mut self.clients) {
            let _ = client.writer.send(&msg).await;
            client.reader.abort();
            self.session.leave(id);
        }
        self.session.outbox_mut().drain_reliable();
    }
}

/// Hello, then the UDP port, then Welcome. Each read is bounded by
/// [`HANDSHAKE_TIMEOUT`].
async fn handshake(mut conn: ReliableConn, peer: SocketAddr) -> anyhow::Result<Handshake> {
    match recv_handshake(&mut conn, peer).await? {
        NetMsg::Hello { protocol } if protocol == PROTOCOL_VERSION => {}
        NetMsg::Hello { protocol } => {
            let reason = format!("protocol {protocol} unsupported, expected {PROTOCOL_VERSION}");
            let _ = conn.send(&NetMsg::Disconnect { reason: reason.clone() }).await;
            anyhow::bail!("refused {peer}: {reason}");
        }
        other => anyhow::bail!("unexpected handshake msg: {}", other.kind()),
    }
    let client_udp_port = match recv_handshake(&mut conn, peer).await? {
        NetMsg::UdpHello { client_udp_port } => client_udp_port,
        other => anyhow::bail!("expected UdpHello, got {}", other.kind()),
    };

    let id = ParticipantId::new_unique();
    conn.send(&NetMsg::Welcome { participant: id }).await?;

    let (reader, writer) = conn.into_split();
    Ok(Handshake {
        id,
        reader,
        writer,
        udp_peer: SocketAddr::new(peer.ip(), client_udp_port),
    })
}

async fn recv_handshake(conn: &mut ReliableConn, peer: SocketAddr) -> anyhow::Result<NetMsg> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.recv())
        .await
        .with_context(|| format!("handshake with {peer} timed out"))?
}

fn spawn_reader(
    id: ParticipantId,
    mut reader: ReliableReader,
    tx: mpsc::Sender<Inbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match reader.recv().await {
                Ok(msg) => {
                    if tx.send(Inbound::Msg(id, msg)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Inbound::Closed(id, format!("{e:#}"))).await;
                    break;
                }
            }
        }
    })
}

/// Helper for tests: bind to an ephemeral port.
pub async fn bind_ephemeral(cfg: SessionConfig) -> anyhow::Result<(GameServer, SessionConfig)> {
    let cfg = SessionConfig {
        server_addr: format!("{}:{}", IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        ..cfg
    };
    let mut server = GameServer::new(cfg).await?;
    server.cfg.server_addr = server.local_addr()?.to_string();
    let cfg = server.cfg.clone();
    Ok((server, cfg))
}
