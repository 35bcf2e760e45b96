//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p hotpotato_client -- [--config session.json] [--addr 127.0.0.1:40000]
//!       [--navmesh arena.json]
//!
//! The client connects to the server, mirrors the session and lets the
//! player send their avatar somewhere.
//!
//! Console commands:
//!   goto <x> <y> <z> - Move your avatar (snapped onto the navmesh)
//!   status           - Show client status
//!   quit             - Exit client

use std::env;
use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::Context;
use hotpotato_client::client::{ClientState, GameClient};
use hotpotato_shared::config::SessionConfig;
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<SessionConfig> {
    let args: Vec<String> = env::args().collect();

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
            "--navmesh" if i + 1 < args.len() => {
                cfg.navmesh = Some(args[i + 1].clone());
                i += 2;
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
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(server = %cfg.server_addr, navmesh = ?cfg.navmesh, "Starting client");

    let mut client = GameClient::connect(&cfg).await.context("connect")?;

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

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

    println!("Client connected. Type 'goto X Y Z' to move, 'status' for info, 'quit' to exit.");
    println!();

    let frame = Duration::from_secs_f32(1.0 / 60.0);
    let mut holding = false;

    loop {
        // Process console commands.
        while let Ok(line) = console_rx.try_recv() {
            match client.exec_console(&line).await {
                Ok(output) => {
                    for line in output {
                        println!("{line}");
                    }
                }
                Err(e) => println!("Error: {e:#}"),
            }
        }

        client.poll_reliable();

        if client.state == ClientState::Disconnected {
            println!("Disconnected from server.");
            break;
        }

        // Drain whatever snapshots are waiting, then draw a frame.
        let started = tokio::time::Instant::now();
        while client.recv_snapshot(Duration::from_millis(1)).await? {}
        client.render(frame.as_secs_f32());

        if client.world.token_visible() != holding {
            holding = client.world.token_visible();
            if holding {
                println!("You have the bomb! Wait for it to pass...");
            } else {
                println!("The bomb has moved on.");
            }
        }

        tokio::time::sleep(frame.saturating_sub(started.elapsed())).await;
    }

    Ok(())
}
