//! Full socket-based integration tests for client ↔ server communication.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use arena_client::{client::wait_connected, ArenaClient};
use arena_server::server::bind_ephemeral;
use arena_shared::{
    event::NetEvent,
    gob::Simulation,
    gobs::{default_registry, Ship},
    protocol::ControlState,
    world::{GobWorld, NewGob},
};

/// Full integration: spawn server, connect client, join the arena and steer
/// the ship the server hands out.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_server_full_roundtrip() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();

    // Bind server to ephemeral port.
    let (mut server, cfg) = bind_ephemeral(64).await?;
    server.start_arena();
    let done = Arc::new(AtomicBool::new(false));

    // Spawn server accept + step loop in background.
    let server_done = done.clone();
    let server_handle = tokio::spawn(async move {
        let tick = server.context().cfg.frame_duration();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !server_done.load(Ordering::SeqCst) && tokio::time::Instant::now() < deadline {
            server.try_accept(Duration::from_millis(1)).await?;
            server.step(Instant::now())?;
            for event in server.drain_events() {
                if let NetEvent::ClientReady { connection } = event {
                    server
                        .world_mut()
                        .spawn(NewGob::new(Box::new(Ship::default())).with_owner(connection));
                }
            }
            tokio::time::sleep(tick).await;
        }
        Ok::<_, anyhow::Error>(server)
    });

    // Connect client.
    let mut client = ArenaClient::connect(cfg.clone(), default_registry(), GobWorld::new()).await?;
    wait_connected(&mut client, Duration::from_secs(5)).await?;
    assert!(client.connection_id().is_some());

    // Wait for the arena and our ship.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.own_gobs().is_empty() {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "no ship within 5s");
        client.step(Instant::now())?;
        tokio::time::sleep(cfg.frame_duration()).await;
    }
    let ship = client.own_gobs()[0];
    assert!(client.is_running());
    assert_eq!(client.arena_id(), 1);

    client.set_controls(
        ship,
        ControlState {
            thrust: 1.0,
            ..Default::default()
        },
    );
    client.run_for_ticks(20).await?;

    done.store(true, Ordering::SeqCst);
    let server = server_handle.await??;

    let on_server = server.world().body::<Ship>(ship).expect("ship on server");
    assert_eq!(on_server.controls.thrust, 1.0);
    assert_eq!(server.world().owner_of(ship), Some(client.connection_id()));
    Ok(())
}
