use hotpotato_server::server::{bind_ephemeral, ServerState};
use hotpotato_shared::config::SessionConfig;

/// Smoke test: server can run a few ticks without panicking.
#[tokio::test]
async fn server_runs_few_ticks() -> anyhow::Result<()> {
    let (mut server, _cfg) = bind_ephemeral(SessionConfig::default()).await?;
    server.run_for_ticks(3).await?;
    assert_eq!(server.session().tick_count(), 3);
    assert_eq!(server.state(), ServerState::Lobby);
    Ok(())
}

#[tokio::test]
async fn console_start_status_quit() -> anyhow::Result<()> {
    let (mut server, _cfg) = bind_ephemeral(SessionConfig::default()).await?;

    assert_eq!(server.exec_console("start"), vec!["Token relay started"]);
    assert_eq!(server.exec_console("start"), vec!["Token relay already running"]);
    assert_eq!(server.state(), ServerState::Running);

    let status = server.exec_console("status");
    assert_eq!(status[0], "Server state: Running");
    assert!(status.iter().any(|l| l == "Token holder: none"));
    assert!(status.iter().any(|l| l.starts_with("Next transfer at:")));

    assert!(server.exec_console("dance")[0].starts_with("Unknown command"));
    assert!(!server.should_quit());
    server.exec_console("quit");
    assert!(server.should_quit());
    Ok(())
}

#[tokio::test]
async fn autostart_skips_the_lobby() -> anyhow::Result<()> {
    let cfg = SessionConfig {
        autostart: true,
        ..SessionConfig::default()
    };
    let (server, _cfg) = bind_ephemeral(cfg).await?;
    assert_eq!(server.state(), ServerState::Running);
    Ok(())
}
