//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p hotpotato_server -- [--config session.json] [--addr 127.0.0.1:40000]
//!       [--tick-hz 30] [--navmesh arena.json] [--min-interval 10] [--max-interval 20]
//!       [--autostart]
//!
//! The server accepts client connections, runs the fixed timestep simulation,
//! broadcasts snapshots and, once started, passes the token around.
//!
//! Console commands:
//!   start   - Start the token relay
//!   status  - Show server status
//!   quit    - Shutdown server

use std::env;
use std::io::{BufRead, Write};

use anyhow::Context;
use hotpotato_server::server::GameServer;
use hotpotato_shared::config::SessionConfig;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

fn parse_args() -> anyhow::Result<SessionConfig> {
    let args: Vec<String> = env::args().collect();

    // Config file first so flags override it regardless of order.
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => SessionConfig::from_file(&args[i + 1])?,
        _ => SessionConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => i += 2,
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().context("--tick-hz")?;
                i += 2;
            }
            "--navmesh" if i + 1 < args.len() => {
                cfg.navmesh = Some(args[i + 1].clone());
                i += 2;
            }
            "--min-interval" if i + 1 < args.len() => {
                cfg.token.min_interval = args[i + 1].parse().context("--min-interval")?;
                i += 2;
            }
            "--max-interval" if i + 1 < args.len() => {
                cfg.token.max_interval = args[i + 1].parse().context("--max-interval")?;
                i += 2;
            }
            "--autostart" => {
                cfg.autostart = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(
        addr = %cfg.server_addr,
        tick_hz = cfg.tick_hz,
        navmesh = ?cfg.navmesh,
        min_interval = cfg.token.min_interval,
        max_interval = cfg.token.max_interval,
        autostart = cfg.autostart,
        "Starting server"
    );

    let mut server = GameServer::new(cfg.clone())
        .await
        .context("create server")?;
    let local = server.local_addr()?;
    info!(%local, "Server listening");

    // Set up console input channel.
    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    server.set_console_input(console_rx);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'start' to start passing the token, 'status' for info, 'quit' to exit.");
    println!();

    // Main server loop.
    let tick_interval = std::time::Duration::from_secs_f32(cfg.tick_dt());
    let mut next_tick = tokio::time::Instant::now();

    while !server.should_quit() {
        // Accept new clients (non-blocking); they join once their handshake completes.
        match server.try_accept(std::time::Duration::from_millis(1)).await {
            Ok(true) => debug!("Connection accepted, handshaking"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Accept failed"),
        }

        server.step(tick_interval.as_secs_f32()).await?;

        // Wait for next tick.
        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }

    server.shutdown("server shutting down").await;
    Ok(())
}
