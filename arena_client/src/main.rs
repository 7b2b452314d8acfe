//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p arena_client -- [--addr 127.0.0.1:40000] [--tick-hz 60] [--config net.json]
//!
//! The client connects to the server, joins the running arena and steers
//! the ship the server spawns for it.
//!
//! Console commands:
//!   hold <buttons..>  - Hold buttons: forward back left right fire1 fire2 extra
//!   release           - Release all buttons
//!   status            - Show client status
//!   disconnect        - Leave the server
//!   quit              - Exit client

use std::env;
use std::io::{BufRead, Write};
use std::time::Instant;

use anyhow::Context;
use arena_client::{client::ArenaClient, input::InputState};
use arena_shared::{config::NetConfig, event::NetEvent, gobs::default_registry, world::GobWorld};
use tokio::sync::mpsc;
use tracing::info;

fn exec_console(client: &mut ArenaClient, input: &mut InputState, line: &str) -> Vec<String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(command) = tokens.first() else {
        return Vec::new();
    };
    match *command {
        "hold" => {
            let mut held = InputState::default();
            for button in &tokens[1..] {
                match *button {
                    "forward" => held.forward = true,
                    "back" => held.back = true,
                    "left" => held.left = true,
                    "right" => held.right = true,
                    "fire1" => held.fire1 = true,
                    "fire2" => held.fire2 = true,
                    "extra" => held.extra = true,
                    other => return vec![format!("Unknown button: {other}")],
                }
            }
            *input = held;
            Vec::new()
        }
        "release" => {
            *input = InputState::default();
            Vec::new()
        }
        "status" => {
            let mut out = vec![
                format!("Connected: {}", client.is_connected()),
                format!("Connection ID: {:?}", client.connection_id()),
                format!("Arena: {} (running: {})", client.arena_id(), client.is_running()),
                format!("Frame: {}", client.frame()),
                format!("Gobs mirrored: {}", client.world().len()),
                format!("Own gobs: {:?}", client.own_gobs()),
            ];
            if let Some(conn) = client.server_connection() {
                out.push(format!("RTT: {:?}", conn.clock().rtt()));
                out.push(format!("Frame offset: {}", conn.clock().frame_offset()));
            }
            out
        }
        "disconnect" => {
            client.disconnect("player left");
            vec!["Disconnecting".to_string()]
        }
        "quit" | "exit" => {
            client.disconnect("client quit");
            std::process::exit(0);
        }
        other => vec![format!("Unknown command: {other}")],
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
    info!(server = %cfg.server_addr, tick_hz = cfg.tick_hz, "Starting client");

    let mut client = ArenaClient::connect(cfg.clone(), default_registry(), GobWorld::new())
        .await
        .context("connect")?;

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

    println!("Client started. Type 'hold forward' to fly, 'status' for info, 'quit' to exit.");
    println!();

    let tick_interval = cfg.frame_duration();
    let mut next_tick = tokio::time::Instant::now();
    let mut input = InputState::default();

    loop {
        while let Ok(line) = console_rx.try_recv() {
            for line in exec_console(&mut client, &mut input, &line) {
                println!("{}", line);
            }
        }

        for ship in client.own_gobs() {
            client.set_controls(ship, input.to_controls());
        }
        client.step(Instant::now())?;

        let mut disconnected = false;
        for event in client.drain_events() {
            match event {
                NetEvent::Disconnected { reason, .. } => {
                    println!("Disconnected from server: {reason}");
                    disconnected = true;
                }
                other => info!(event = ?other, "Client event"),
            }
        }
        if disconnected {
            break;
        }

        next_tick += tick_interval;
        tokio::time::sleep_until(next_tick).await;
    }

    Ok(())
}
