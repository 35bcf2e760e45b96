//! Full socket-based integration tests for client ↔ server communication.

use std::net::SocketAddr;
use std::time::Duration;

use hotpotato_client::GameClient;
use hotpotato_server::server::bind_ephemeral;
use hotpotato_shared::config::SessionConfig;
use hotpotato_shared::math::Vec3;
use hotpotato_shared::net::{
    decode_from_bytes, encode_to_bytes, NetMsg, ReliableConn, ReliableListener, Snapshot,
    PROTOCOL_VERSION,
};
use hotpotato_shared::participant::ParticipantId;
use hotpotato_tests::init_tracing;
use tokio::net::{TcpStream, UdpSocket};

/// Unit-style test: handshake messages roundtrip correctly.
#[test]
fn protocol_messages_roundtrip() -> anyhow::Result<()> {
    let hello = NetMsg::Hello {
        protocol: PROTOCOL_VERSION,
    };
    assert_eq!(decode_from_bytes(&encode_to_bytes(&hello)?)?, hello);

    let udp_hello = NetMsg::UdpHello {
        client_udp_port: 50000,
    };
    assert_eq!(decode_from_bytes(&encode_to_bytes(&udp_hello)?)?, udp_hello);

    let welcome = NetMsg::Welcome {
        participant: ParticipantId(1),
    };
    assert_eq!(decode_from_bytes(&encode_to_bytes(&welcome)?)?, welcome);

    Ok(())
}

/// Full integration: spawn server, connect client, move, receive snapshots.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_server_full_roundtrip() -> anyhow::Result<()> {
    init_tracing();

    let (mut server, cfg) = bind_ephemeral(SessionConfig::default()).await?;
    let client_cfg = cfg.clone();

    // Spawn server accept + step loop in background.
    let server_handle = tokio::spawn(async move {
        let id = server.accept_one().await?;
        for _ in 0..90 {
            server.step(cfg.tick_dt()).await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let position = server
            .session()
            .entity(id)
            .map(|e| e.position())
            .ok_or_else(|| anyhow::anyhow!("entity gone"))?;
        Ok::<_, anyhow::Error>((id, position))
    });

    let mut client = GameClient::connect(&client_cfg).await?;

    // Wait for our own spawn to arrive before commanding.
    for _ in 0..200 {
        client.poll_reliable();
        if client.world.entity(client.participant).is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(client.world.entity(client.participant).is_some());

    let sent = client
        .request_destination(Vec3::new(2.0, 0.0, -4.0))
        .await?
        .expect("walkable pick");
    // Nothing is shown until the authority accepts.
    assert_eq!(client.world.destination(client.participant), None);

    let mut accepted = false;
    while !server_handle.is_finished() {
        client.poll_reliable();
        accepted |= client.world.destination(client.participant) == Some(sent);
        client.recv_snapshot(Duration::from_millis(5)).await?;
        client.render(1.0 / 60.0);
    }
    client.poll_reliable();
    assert!(accepted);
    // Arrival clears it again.
    assert_eq!(client.world.destination(client.participant), None);
    let (id, authority_pos) = server_handle.await??;
    assert_eq!(id, client.participant);

    assert!(client.world.last_snapshot_tick().is_some());
    let mirrored = client.world.entity(id).expect("own entity").target().position;
    assert!(mirrored.x > -3.5, "entity never moved: {mirrored:?}");
    assert!(authority_pos.distance(sent) <= client_cfg.motion.arrival_radius + 1e-3);

    Ok(())
}

/// A client speaking another protocol version is refused with a reason.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn protocol_mismatch_is_refused() -> anyhow::Result<()> {
    init_tracing();

    let (mut server, cfg) = bind_ephemeral(SessionConfig::default()).await?;
    let server_handle = tokio::spawn(async move { server.accept_one().await.is_err() });

    let mut conn = ReliableConn::connect(cfg.server_addr.parse()?).await?;
    conn.send(&NetMsg::Hello {
        protocol: PROTOCOL_VERSION + 1,
    })
    .await?;
    assert!(matches!(conn.recv().await?, NetMsg::Disconnect { .. }));
    assert!(server_handle.await?);
    Ok(())
}

/// Authority-only messages from a client change nothing on the server.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_cannot_start_the_relay() -> anyhow::Result<()> {
    init_tracing();

    let (mut server, cfg) = bind_ephemeral(SessionConfig::default()).await?;
    let server_handle = tokio::spawn(async move {
        server.accept_one().await?;
        for _ in 0..20 {
            server.step(1.0 / 30.0).await?;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok::<_, anyhow::Error>((server.session().is_started(), server.client_count()))
    });

    let mut conn = ReliableConn::connect(cfg.server_addr.parse()?).await?;
    conn.send(&NetMsg::Hello {
        protocol: PROTOCOL_VERSION,
    })
    .await?;
    conn.send(&NetMsg::UdpHello {
        client_udp_port: 9,
    })
    .await?;
    assert!(matches!(conn.recv().await?, NetMsg::Welcome { .. }));
    conn.send(&NetMsg::StartSession).await?;
    conn.send(&NetMsg::TokenHolder {
        holder: ParticipantId(1),
    })
    .await?;

    let (started, clients) = server_handle.await??;
    assert!(!started);
    assert_eq!(clients, 1);
    Ok(())
}

/// A peer that connects and never says hello does not hold up the tick loop.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_connection_does_not_stall_ticks() -> anyhow::Result<()> {
    init_tracing();

    let (mut server, cfg) = bind_ephemeral(SessionConfig::default()).await?;
    let _silent = TcpStream::connect(cfg.server_addr.parse::<SocketAddr>()?).await?;

    let ran = tokio::time::timeout(Duration::from_secs(2), async {
        let mut accepted = false;
        for _ in 0..10 {
            accepted |= server.try_accept(Duration::from_millis(1)).await?;
            server.step(cfg.tick_dt()).await?;
        }
        Ok::<_, anyhow::Error>(accepted)
    })
    .await;

    let accepted = ran.expect("tick loop stalled on a silent peer")?;
    assert!(accepted);
    assert_eq!(server.session().tick_count(), 10);
    assert_eq!(server.client_count(), 0);
    Ok(())
}

/// Clients accepted by the polling loop join once their handshake completes.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn polled_accept_joins_after_handshake() -> anyhow::Result<()> {
    init_tracing();

    let (mut server, cfg) = bind_ephemeral(SessionConfig::default()).await?;
    let client_cfg = cfg.clone();
    let client = tokio::spawn(async move { GameClient::connect(&client_cfg).await });

    for _ in 0..400 {
        server.try_accept(Duration::from_millis(1)).await?;
        server.step(cfg.tick_dt()).await?;
        if server.client_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(server.client_count(), 1);

    let client = client.await??;
    assert!(server.session().entity(client.participant).is_some());
    Ok(())
}

/// A client that says goodbye is dropped from the server and the session.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn goodbye_drops_the_client() -> anyhow::Result<()> {
    init_tracing();

    let (mut server, cfg) = bind_ephemeral(SessionConfig::default()).await?;
    let mut conn = ReliableConn::connect(cfg.server_addr.parse()?).await?;
    conn.send(&NetMsg::Hello {
        protocol: PROTOCOL_VERSION,
    })
    .await?;
    conn.send(&NetMsg::UdpHello {
        client_udp_port: 9,
    })
    .await?;

    let id = server.accept_one().await?;
    assert!(matches!(conn.recv().await?, NetMsg::Welcome { participant } if participant == id));
    conn.send(&NetMsg::Disconnect {
        reason: "bye".to_string(),
    })
    .await?;

    for _ in 0..200 {
        server.step(cfg.tick_dt()).await?;
        if server.client_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(server.client_count(), 0);
    assert!(server.session().entity(id).is_none());
    Ok(())
}

/// Garbage on the snapshot port is dropped and the next good snapshot applies.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_datagrams_are_dropped() -> anyhow::Result<()> {
    init_tracing();

    // Hand-rolled server: handshake, then raw datagrams.
    let listener = ReliableListener::bind("127.0.0.1:0".parse()?).await?;
    let addr = listener.local_addr()?;
    let udp = UdpSocket::bind(addr).await?;
    let cfg = SessionConfig {
        server_addr: addr.to_string(),
        ..SessionConfig::default()
    };

    let fake = tokio::spawn(async move {
        let (mut conn, peer) = listener.accept().await?;
        conn.recv().await?;
        let port = match conn.recv().await? {
            NetMsg::UdpHello { client_udp_port } => client_udp_port,
            other => anyhow::bail!("expected UdpHello, got {}", other.kind()),
        };
        conn.send(&NetMsg::Welcome {
            participant: ParticipantId(77),
        })
        .await?;

        let to = SocketAddr::new(peer.ip(), port);
        udp.send_to(b"\x00not json", to).await?;
        udp.send_to(br#"{"Snapshot":"#, to).await?;
        let snap = encode_to_bytes(&NetMsg::Snapshot(Snapshot {
            tick: 7,
            entities: Vec::new(),
        }))?;
        udp.send_to(&snap, to).await?;
        Ok::<_, anyhow::Error>(conn)
    });

    let mut client = GameClient::connect(&cfg).await?;
    let mut applied = false;
    for _ in 0..40 {
        if client.recv_snapshot(Duration::from_millis(50)).await? {
            applied = true;
            break;
        }
    }
    assert!(applied);
    assert_eq!(client.world.last_snapshot_tick(), Some(7));

    let _conn = fake.await??;
    Ok(())
}
