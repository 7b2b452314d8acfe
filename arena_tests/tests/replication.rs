//! Replication behaviour seen from the wire.

use arena_shared::{
    gob::{GobId, GobRecord, MoveType, Simulation},
    gobs::Bullet,
    math::Vec2,
    world::DEFAULT_UPDATE_PERIOD,
};
use arena_tests::{init_tracing, test_config, Harness};

fn bullet(id: u32) -> GobRecord {
    GobRecord {
        id: GobId(id),
        layer: 0,
        owner: None,
        relevant: true,
        move_type: MoveType::Dynamic,
        update_period: DEFAULT_UPDATE_PERIOD,
        force_resend: false,
        birth_frame: 0,
        body: Box::new(Bullet {
            vel: Vec2::new(1.0, 0.0),
            ..Default::default()
        }),
    }
}

/// Harness whose server spawns nothing on its own.
fn quiet_harness() -> Harness {
    let mut h = Harness::new(test_config());
    h.spawn_ships = false;
    h
}

#[test]
fn creation_is_announced_once() -> anyhow::Result<()> {
    init_tracing();
    let mut h = quiet_harness();
    let c1 = h.add_joined_peer()?;
    h.tick()?;
    assert!(h.server.replication().is_replicating_to(h.peers[c1].server_side));

    h.server.world_mut().insert_gob(bullet(5))?;
    h.tick()?;
    assert_eq!(h.peers[c1].creations_of(GobId(5)), 1);

    h.run(100)?;
    assert_eq!(h.peers[c1].creations_of(GobId(5)), 1);
    assert!(h.peers[c1].updates_of(GobId(5)) > 0);
    Ok(())
}

#[test]
fn deletion_reaches_every_connection_and_is_final() -> anyhow::Result<()> {
    init_tracing();
    let mut h = quiet_harness();
    let peers = [h.add_joined_peer()?, h.add_joined_peer()?, h.add_joined_peer()?];
    h.tick()?;
    h.server.world_mut().insert_gob(bullet(7))?;
    h.tick()?;
    for &p in &peers {
        assert_eq!(h.peers[p].creations_of(GobId(7)), 1);
    }

    // Remove off the deletion cadence so the batch stays pending a while.
    h.tick()?;
    h.server.world_mut().remove(GobId(7));
    h.run(10)?;
    h.run(50)?;

    for &p in &peers {
        assert_eq!(h.peers[p].deletions_of(GobId(7)), 1);
        assert_eq!(h.peers[p].creations_of(GobId(7)), 1);
    }
    assert!(h.server.replication().pending_deletions().is_empty());
    Ok(())
}

#[test]
fn announcements_respect_batch_cap() -> anyhow::Result<()> {
    let mut cfg = test_config();
    cfg.announce_batch_cap = 4;
    let mut h = Harness::new(cfg);
    h.spawn_ships = false;
    let p = h.add_joined_peer()?;
    h.tick()?;
    for id in 1..=10 {
        h.server.world_mut().insert_gob(bullet(id))?;
    }

    h.tick()?;
    let announced = |h: &Harness| {
        (1..=10)
            .filter(|id| h.peers[p].creations_of(GobId(*id)) == 1)
            .count()
    };
    assert_eq!(announced(&h), 4);
    h.tick()?;
    assert_eq!(announced(&h), 8);
    h.tick()?;
    assert_eq!(announced(&h), 10);
    Ok(())
}

#[test]
fn updates_are_throttled_by_period() -> anyhow::Result<()> {
    let mut h = quiet_harness();
    let p = h.add_joined_peer()?;
    h.tick()?;
    h.server.world_mut().insert_gob(bullet(3))?;
    h.tick()?;

    let ticks = 60;
    h.run(ticks)?;
    let period_ticks = (DEFAULT_UPDATE_PERIOD.as_secs_f64() / h.cfg.frame_duration().as_secs_f64()).ceil() as usize;
    let updates = h.peers[p].updates_of(GobId(3));
    assert!(updates >= 1);
    assert!(
        updates <= ticks as usize / period_ticks + 1,
        "{updates} updates in {ticks} ticks"
    );
    Ok(())
}

#[test]
fn late_joiner_gets_existing_gobs() -> anyhow::Result<()> {
    let mut h = quiet_harness();
    h.server.world_mut().insert_gob(bullet(2))?;
    h.run(5)?;
    let p = h.add_joined_peer()?;
    h.run(2)?;
    assert_eq!(h.peers[p].creations_of(GobId(2)), 1);
    Ok(())
}

/// Lets the arena run `warmup` ticks, joins a client, then announces a
/// moving bullet and checks the mirror's age.
fn check_mirror_birth(warmup: u32) -> anyhow::Result<()> {
    let mut h = quiet_harness();
    h.run(warmup)?;
    let c = h.add_client();
    let joined = h.run_until(20, |h| h.clients[c].is_running())?;
    assert!(joined);
    h.run(5)?;

    h.server.world_mut().insert_gob(bullet(9))?;
    h.tick()?;
    let announced_at = h.server.frame();
    let record = h.clients[c].world().get(GobId(9)).expect("mirrored");
    assert!(
        (record.birth_frame - announced_at).abs() <= 1,
        "born {} announced {announced_at}",
        record.birth_frame
    );
    // One unit per frame: extrapolated by its age, not by the arena's.
    let mirrored = h.clients[c].world().body::<Bullet>(GobId(9)).expect("bullet");
    assert!(mirrored.pos.x < 5.0, "pos.x {}", mirrored.pos.x);
    Ok(())
}

#[test]
fn mirrors_are_born_at_the_announcing_frame() -> anyhow::Result<()> {
    check_mirror_birth(0)
}

#[test]
fn late_joiner_mirrors_are_born_at_the_announcing_frame() -> anyhow::Result<()> {
    init_tracing();
    check_mirror_birth(300)
}
