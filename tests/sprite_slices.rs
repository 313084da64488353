use framejobs::JobSystem;
use framejobs::sprite::{FrameEnv, SpawnRequest, SpriteKind, SpriteSystem};
use glam::{Mat4, Vec3};

fn spawn(kind: SpriteKind, i: usize) -> SpawnRequest {
    SpawnRequest {
        kind,
        position: Vec3::new(i as f32, 1.0, 2.0),
        velocity: Vec3::new(1.0, 0.0, 0.0),
        color: [1.0, 1.0, 1.0],
        size: 1.0,
        opacity: 1.0,
    }
}

fn env() -> FrameEnv {
    FrameEnv {
        multiplier: 0.1,
        wind: Vec3::new(0.0, 0.0, 0.5),
        viewer: Vec3::new(0.0, 1.0, -10.0),
        view: Mat4::from_translation(Vec3::new(0.0, 0.0, -3.0)),
        ..FrameEnv::default()
    }
}

/// Kinds whose update does not roll dice.
const DETERMINISTIC: [SpriteKind; 6] = [
    SpriteKind::Cloud,
    SpriteKind::CloudImpact,
    SpriteKind::Smoke,
    SpriteKind::Snow,
    SpriteKind::Breath,
    SpriteKind::Splinter,
];

#[test]
fn test_parallel_pass_matches_serial_pass() {
    let jobs = JobSystem::new(3);
    let mut parallel = SpriteSystem::new(500);
    let mut serial = SpriteSystem::new(500);
    for i in 0..240 {
        let kind = DETERMINISTIC[i % DETERMINISTIC.len()];
        parallel.make_sprite(spawn(kind, i));
        serial.make_sprite(spawn(kind, i));
    }

    for _frame in 0..12 {
        let frame = parallel.submit_animation(&jobs, env());
        assert_eq!(frame.len(), 3);
        parallel.finish_animation(&jobs, frame, true);
        serial.animate(&env());
    }

    assert_eq!(parallel.sprites(), serial.sprites());
    jobs.kill_workers();
}

#[test]
fn test_dead_sprites_removed_after_join() {
    let jobs = JobSystem::new(2);
    let mut sprites = SpriteSystem::new(100);
    for i in 0..30 {
        let sprite = sprites.make_sprite(spawn(SpriteKind::Cloud, i)).unwrap();
        // Every other cloud fades out on the first frame.
        if i % 2 == 0 {
            sprite.opacity = 0.01;
        }
    }

    let frame = sprites.submit_animation(&jobs, env());
    assert!(sprites.is_empty(), "sprites are handed to the jobs during a pass");
    sprites.finish_animation(&jobs, frame, false);

    assert_eq!(sprites.len(), 15);
    for sprite in sprites.sprites() {
        assert!(sprite.alive);
        assert!((sprite.position.x - sprite.old_position.x).abs() < 1e-6);
    }
    jobs.kill_workers();
}

#[test]
fn test_spawns_during_pass_are_queued() {
    let jobs = JobSystem::new(2);
    let mut sprites = SpriteSystem::new(8);
    for i in 0..6 {
        sprites.make_sprite(spawn(SpriteKind::Breath, i));
    }

    let frame = sprites.submit_animation(&jobs, env());
    for i in 0..4 {
        assert!(sprites.make_sprite(spawn(SpriteKind::Cloud, i)).is_none());
    }
    sprites.finish_animation(&jobs, frame, true);

    // Capacity caps the queued sprites.
    assert_eq!(sprites.len(), 8);
    let clouds = sprites
        .sprites()
        .iter()
        .filter(|s| s.kind == SpriteKind::Cloud)
        .count();
    assert_eq!(clouds, 2);
    jobs.kill_workers();
}

#[test]
fn test_flames_burn_out_over_frames() {
    let jobs = JobSystem::new(2);
    let mut sprites = SpriteSystem::new(1000);
    for i in 0..60 {
        sprites.make_sprite(spawn(SpriteKind::Flame, i));
    }

    let mut smoke_seen = 0;
    for _frame in 0..40 {
        let frame = sprites.submit_animation(&jobs, env());
        sprites.finish_animation(&jobs, frame, true);
        let smoke = sprites
            .sprites()
            .iter()
            .filter(|s| s.kind == SpriteKind::Smoke)
            .count();
        smoke_seen = smoke_seen.max(smoke);
    }

    // Some flames leave smoke behind; everything has faded by now.
    assert!(smoke_seen > 0);
    assert!(sprites.is_empty());
    jobs.kill_workers();
}
