//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p arena_server -- [--addr 127.0.0.1:40000] [--tick-hz 60] [--config net.json]
//!
//! The server listens for client connections, runs a fixed timestep arena,
//! and replicates gobs to every client that joined it. Each joining client
//! gets a ship it owns.
//!
//! Console commands:
//!   start   - Start a new arena instance
//!   status  - Show server status
//!   quit    - Shutdown server

use std::env;
use std::io::{BufRead, Write};
use std::time::{Duration, Instant};

use anyhow::Context;
use arena_server::ArenaServer;
use arena_shared::{
    config::NetConfig,
    event::NetEvent,
    gob::Simulation,
    gobs::{default_registry, Ship},
    world::{GobWorld, NewGob},
};
use tokio::sync::mpsc;
use tracing::{info, warn};

fn handle_events(server: &mut ArenaServer) {
    for event in server.drain_events() {
        match event {
            NetEvent::ClientReady { connection } => {
                let ship = Ship {
                    pilot: format!("pilot-{}", connection.0),
                    ..Default::default()
                };
                let id = server
                    .world_mut()
                    .spawn(NewGob::new(Box::new(ship)).with_owner(connection));
                info!(connection = ?connection, gob = ?id, "Ship spawned");
            }
            NetEvent::Disconnected { connection, reason } => {
                let world: &mut GobWorld = server.world_mut();
                for id in world.owned_by(connection) {
                    world.remove(id);
                }
                info!(connection = ?connection, reason = %reason, "Client left");
            }
            other => info!(event = ?other, "Server event"),
        }
    }
}

fn exec_console(server: &mut ArenaServer, line: &str) -> anyhow::Result<Vec<String>> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(command) = tokens.first() else {
        return Ok(Vec::new());
    };
    match *command {
        "start" => {
            let arena_id = server.start_arena();
            Ok(vec![format!("Arena {arena_id} started")])
        }
        "status" => {
            let status = serde_json::to_string_pretty(&server.status()).context("serialize status")?;
            Ok(status.lines().map(str::to_string).collect())
        }
        "quit" | "exit" => {
            info!("Server shutting down");
            std::process::exit(0);
        }
        other => Ok(vec![format!("Unknown command: {other}")]),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = NetConfig::from_args(env::args().skip(1))?;
    info!(addr = %cfg.server_addr, tick_hz = cfg.tick_hz, "Starting server");

    let mut server = ArenaServer::bind(cfg.clone(), default_registry(), GobWorld::new())
        .await
        .context("create server")?;
    let local = server.local_addr()?;
    info!(%local, "Server listening");
    server.start_arena();

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
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Server ready. Type 'start' for a new arena, 'status' for info, 'quit' to exit.");
    println!();

    // Main server loop.
    let tick_interval = cfg.frame_duration();
    let mut next_tick = tokio::time::Instant::now();

    loop {
        // Accept new clients (non-blocking).
        if let Err(e) = server.try_accept(Duration::from_millis(1)).await {
            warn!(error = %e, "Accept failed");
        }

        while let Ok(line) = console_rx.try_recv() {
            match exec_console(&mut server, &line) {
                Ok(output) => {
                    for line in output {
                        println!("{}", line);
                    }
                }
                Err(e) => println!("Error: {}", e),
            }
        }

        server.step(Instant::now())?;
        handle_events(&mut server);

        // Wait for next tick.
        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }
}
