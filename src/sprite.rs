//! Particle sprites and their per-frame animation producer.
//!
//! Each frame the live sprites are split into three slices and animated by
//! jobs that share one read-only [`FrameEnv`] snapshot. Sprites that die are
//! only marked; they are removed on the main thread once every slice was
//! joined. Sprites spawned by other sprites (smoke from flames) go through a
//! queue and are appended at the same point.

use crate::job::{Execute, JobHandle};
use crate::job_system::JobSystem;
use crate::slice::{DisjointBuffer, ranges_of};
use crossbeam::queue::SegQueue;
use glam::{Mat3, Mat4, Vec3};
use std::ops::RangeInclusive;
use std::sync::Arc;

const ANIMATION_SLICES: usize = 3;
/// Half the edge of the box snow wraps around.
const SNOW_EXTENT: f32 = 6.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpriteKind {
    Cloud,
    Blood,
    Flame,
    Smoke,
    WeaponFlame,
    CloudImpact,
    Snow,
    WeaponShine,
    BloodFlame,
    Breath,
    Splinter,
}

impl SpriteKind {
    fn is_flame_like(self) -> bool {
        matches!(
            self,
            SpriteKind::Flame | SpriteKind::WeaponFlame | SpriteKind::WeaponShine | SpriteKind::BloodFlame
        )
    }

    /// Billboards nudged towards the viewer so they are not clipped by geometry.
    fn faces_viewer(self) -> bool {
        matches!(self, SpriteKind::Flame | SpriteKind::WeaponFlame | SpriteKind::WeaponShine)
    }

    fn emits_smoke(self) -> bool {
        matches!(self, SpriteKind::Flame | SpriteKind::WeaponFlame)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sprite {
    pub kind: SpriteKind,
    pub position: Vec3,
    pub old_position: Vec3,
    pub velocity: Vec3,
    pub size: f32,
    pub initial_size: f32,
    pub special: i32,
    pub color: [f32; 3],
    pub opacity: f32,
    pub rotation: f32,
    pub alive_time: f32,
    pub speed: f32,
    pub rotate_speed: f32,
    pub alive: bool,
    /// View-space position used for drawing, refreshed by every animation pass.
    pub rpoint: Vec3,
}

impl Sprite {
    pub fn new(spawn: SpawnRequest) -> Sprite {
        Sprite {
            kind: spawn.kind,
            position: spawn.position,
            old_position: spawn.position,
            velocity: spawn.velocity,
            size: spawn.size,
            initial_size: spawn.size,
            special: 0,
            color: spawn.color,
            opacity: spawn.opacity,
            rotation: 0.0,
            alive_time: 0.0,
            speed: 1.0,
            rotate_speed: 0.0,
            alive: true,
            rpoint: spawn.position,
        }
    }

    /// Advances the sprite by one frame. Returns false once it died.
    fn animate(&mut self, env: &FrameEnv, check: bool, spawns: &SegQueue<SpawnRequest>) -> bool {
        let mut mult = env.multiplier;
        let kind = self.kind;

        if kind != SpriteKind::Snow {
            self.position += self.velocity * mult;
            self.velocity += env.wind * mult;
        }
        if matches!(kind, SpriteKind::Flame | SpriteKind::Smoke) {
            self.position += env.wind * mult / 2.0;
        }
        if kind.is_flame_like() {
            mult *= self.speed * 0.7;
        }
        self.alive_time += mult;

        match kind {
            SpriteKind::Cloud | SpriteKind::CloudImpact => {
                self.opacity -= mult / 2.0;
                self.size += mult / 2.0;
                self.velocity.y += env.gravity * mult * 0.25;
            }
            SpriteKind::Breath => {
                self.opacity -= mult / 2.0;
                self.size += mult / 2.0;
                if self.velocity.length() <= mult {
                    self.velocity = Vec3::ZERO;
                } else {
                    self.velocity -= self.velocity.normalize() * mult;
                }
            }
            SpriteKind::Snow => {
                self.size -= mult / 120.0;
                self.rotation += mult * 360.0;
                self.position.y -= mult;
                self.position += env.wind * mult;
                let center = env.viewer + env.viewer_facing * SNOW_EXTENT;
                self.position = wrap_around(self.position, center);
            }
            SpriteKind::Blood => {
                self.rotation += mult * 100.0;
                self.velocity.y += env.gravity * mult;
            }
            SpriteKind::Splinter => {
                self.rotation += self.rotate_speed * mult;
                self.opacity -= mult / 2.0;
                match self.special {
                    0 | 2 | 3 => self.velocity.y += env.gravity * mult,
                    1 => self.velocity.y += env.gravity * mult * 0.5,
                    _ => {}
                }
            }
            SpriteKind::Flame | SpriteKind::WeaponFlame | SpriteKind::WeaponShine | SpriteKind::BloodFlame => {
                let fade = mult * 5.0 / 4.0;
                self.rotation += mult * self.rotate_speed;
                self.opacity -= fade;
                let crossed_half = self.opacity < 0.5 && self.opacity + fade >= 0.5;
                if kind.emits_smoke() && crossed_half && self.rolls_smoke() {
                    spawns.push(SpawnRequest {
                        kind: SpriteKind::Smoke,
                        position: self.position,
                        velocity: self.velocity,
                        color: [0.9, 0.9, 0.6],
                        size: self.size * 1.2,
                        opacity: 0.4,
                    });
                }
                if kind == SpriteKind::Flame && self.alive_time > 0.14 {
                    self.velocity = Vec3::new(0.0, 1.5, 0.0);
                }
            }
            SpriteKind::Smoke => {
                self.opacity -= mult / 3.0 / self.initial_size;
                for channel in &mut self.color {
                    *channel = (*channel - mult).max(0.6);
                }
                self.size += mult;
                self.velocity = Vec3::new(0.0, 1.5, 0.0);
                self.rotation += mult * self.rotate_speed / 5.0;
            }
        }

        if self.opacity <= 0.0 || self.size <= 0.0 {
            self.alive = false;
            return false;
        }

        self.rpoint = env.view.transform_point3(self.position + self.draw_offset(env.viewer));
        if check {
            self.old_position = self.position;
        }
        true
    }

    fn rolls_smoke(&self) -> bool {
        rand::random_ratio(1, 4) || (self.initial_size > 2.0 && rand::random_ratio(1, 2))
    }

    /// Offset from `position` to the drawn point, before the view transform.
    fn draw_offset(&self, viewer: Vec3) -> Vec3 {
        let mut offset = Vec3::ZERO;
        if self.kind.faces_viewer() {
            offset += (viewer - self.position).normalize_or_zero() * self.size / 4.0;
        }
        if self.kind == SpriteKind::Snow {
            offset += Mat3::from_rotation_z((self.rotation * 0.2).to_radians()) * Vec3::X;
        }
        offset
    }
}

/// Keeps `position` inside the box of half-extent [`SNOW_EXTENT`] around `center`.
fn wrap_around(mut position: Vec3, center: Vec3) -> Vec3 {
    for axis in 0..3 {
        if position[axis] < center[axis] - SNOW_EXTENT {
            position[axis] += 2.0 * SNOW_EXTENT;
        }
        if position[axis] > center[axis] + SNOW_EXTENT {
            position[axis] -= 2.0 * SNOW_EXTENT;
        }
    }
    position
}

/// Parameters of a sprite to create.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpawnRequest {
    pub kind: SpriteKind,
    pub position: Vec3,
    pub velocity: Vec3,
    pub color: [f32; 3],
    pub size: f32,
    pub opacity: f32,
}

/// Read-only state every animation slice of one frame sees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameEnv {
    /// Frame time scale.
    pub multiplier: f32,
    pub wind: Vec3,
    pub gravity: f32,
    pub viewer: Vec3,
    pub viewer_facing: Vec3,
    /// Model-view matrix captured when the frame's jobs were submitted.
    pub view: Mat4,
}

impl Default for FrameEnv {
    fn default() -> Self {
        FrameEnv {
            multiplier: 0.0,
            wind: Vec3::ZERO,
            gravity: -10.0,
            viewer: Vec3::ZERO,
            viewer_facing: Vec3::Z,
            view: Mat4::IDENTITY,
        }
    }
}

/// Slices of one animation pass. Hand back to [`SpriteSystem::finish_animation`].
#[derive(Debug)]
#[must_use = "an animation pass must be finished"]
pub struct SpriteFrame {
    handles: Vec<JobHandle>,
}

impl SpriteFrame {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// The fixed-capacity sprite store.
pub struct SpriteSystem {
    sprites: Vec<Sprite>,
    capacity: usize,
    check_delay: f32,
    spawns: Arc<SegQueue<SpawnRequest>>,
    in_flight: Option<Arc<DisjointBuffer<Sprite>>>,
}

impl SpriteSystem {
    pub fn new(capacity: usize) -> Self {
        SpriteSystem {
            sprites: Vec::with_capacity(capacity),
            capacity,
            check_delay: 0.0,
            spawns: Arc::new(SegQueue::new()),
            in_flight: None,
        }
    }

    pub fn len(&self) -> usize {
        self.sprites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sprites.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The live sprites. Empty while an animation pass is in flight.
    pub fn sprites(&self) -> &[Sprite] {
        &self.sprites
    }

    /// Adds a sprite. Returns `None` when the store is full, or while a pass is
    /// in flight (the sprite is then queued and added when the pass finishes).
    pub fn make_sprite(&mut self, spawn: SpawnRequest) -> Option<&mut Sprite> {
        if self.in_flight.is_some() {
            self.spawns.push(spawn);
            return None;
        }
        if self.sprites.len() >= self.capacity {
            return None;
        }
        self.sprites.push(Sprite::new(spawn));
        self.sprites.last_mut()
    }

    pub fn delete_sprites(&mut self) {
        self.sprites.clear();
    }

    /// Whether this frame updates `old_position` (ten times per time unit).
    fn next_check(&mut self, multiplier: f32) -> bool {
        self.check_delay -= multiplier * 10.0;
        if self.check_delay <= 0.0 {
            self.check_delay = 1.0;
            true
        } else {
            false
        }
    }

    /// Submits one animation job per slice of about a third of the sprites.
    pub fn submit_animation(&mut self, jobs: &JobSystem, env: FrameEnv) -> SpriteFrame {
        if self.in_flight.is_some() {
            log::warn!("sprite animation submitted while the previous pass is in flight");
            return SpriteFrame { handles: Vec::new() };
        }
        let check = self.next_check(env.multiplier);
        let count = self.sprites.len();
        let buffer = Arc::new(DisjointBuffer::new(std::mem::take(&mut self.sprites)));
        let env = Arc::new(env);

        let handles = ranges_of(count, count.div_ceil(ANIMATION_SLICES))
            .into_iter()
            .map(|range| {
                jobs.submit(AnimateSprites {
                    sprites: Arc::clone(&buffer),
                    range,
                    env: Arc::clone(&env),
                    check,
                    spawns: Arc::clone(&self.spawns),
                })
            })
            .collect();
        self.in_flight = Some(buffer);
        SpriteFrame { handles }
    }

    /// Joins every slice, drops dead sprites and applies queued spawns.
    pub fn finish_animation(&mut self, jobs: &JobSystem, frame: SpriteFrame, help: bool) {
        jobs.join_all(frame.handles, help);
        let Some(buffer) = self.in_flight.take() else {
            return;
        };
        let sprites = match Arc::try_unwrap(buffer) {
            Ok(buffer) => buffer.into_vec(),
            Err(buffer) => {
                // Some slice of this pass was not in `frame`; finish with the frame that holds it.
                log::error!("sprite pass still has unjoined slices; keeping its buffer");
                self.in_flight = Some(buffer);
                return;
            }
        };
        self.sprites = sprites;
        self.compact();
    }

    /// Animates every sprite on the calling thread.
    pub fn animate(&mut self, env: &FrameEnv) {
        let check = self.next_check(env.multiplier);
        for sprite in &mut self.sprites {
            sprite.animate(env, check, &self.spawns);
        }
        self.compact();
    }

    fn compact(&mut self) {
        self.sprites.retain(|sprite| sprite.alive);
        while let Some(spawn) = self.spawns.pop() {
            if self.sprites.len() < self.capacity {
                self.sprites.push(Sprite::new(spawn));
            }
        }
    }
}

struct AnimateSprites {
    sprites: Arc<DisjointBuffer<Sprite>>,
    range: RangeInclusive<usize>,
    env: Arc<FrameEnv>,
    check: bool,
    spawns: Arc<SegQueue<SpawnRequest>>,
}

impl Execute for AnimateSprites {
    fn execute(self: Box<Self>) {
        // Safety: the slices of one pass cover disjoint ranges and the store
        // does not touch the buffer until every slice was joined.
        let sprites = unsafe { self.sprites.slice_mut(self.range.clone()) };
        for sprite in sprites.iter_mut().filter(|s| s.alive) {
            sprite.animate(&self.env, self.check, &self.spawns);
        }
    }

    fn name(&self) -> &'static str {
        "animate_sprites"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn(kind: SpriteKind, position: Vec3) -> SpawnRequest {
        SpawnRequest {
            kind,
            position,
            velocity: Vec3::ZERO,
            color: [1.0, 1.0, 1.0],
            size: 1.0,
            opacity: 1.0,
        }
    }

    fn env(multiplier: f32) -> FrameEnv {
        FrameEnv {
            multiplier,
            ..FrameEnv::default()
        }
    }

    #[test]
    fn test_cloud_fades_and_grows() {
        let mut sprite = Sprite::new(spawn(SpriteKind::Cloud, Vec3::ZERO));
        let queue = SegQueue::new();
        assert!(sprite.animate(&env(0.1), false, &queue));
        assert!((sprite.opacity - 0.95).abs() < 1e-6);
        assert!((sprite.size - 1.05).abs() < 1e-6);
        assert!(sprite.velocity.y < 0.0);
    }

    #[test]
    fn test_snow_wraps_around_viewer() {
        let mut sprite = Sprite::new(spawn(SpriteKind::Snow, Vec3::new(0.0, 0.0, -0.5)));
        let queue = SegQueue::new();
        // The wrap box is centred 6 units in front of the viewer (+z).
        sprite.animate(&env(0.01), false, &queue);
        assert!((sprite.position.z - 11.5).abs() < 1e-4);
        assert!(sprite.position.y < 0.0);
    }

    #[test]
    fn test_breath_slows_down() {
        let mut sprite = Sprite::new(SpawnRequest {
            velocity: Vec3::new(0.05, 0.0, 0.0),
            ..spawn(SpriteKind::Breath, Vec3::ZERO)
        });
        let queue = SegQueue::new();
        sprite.animate(&env(0.1), false, &queue);
        assert_eq!(sprite.velocity, Vec3::ZERO);
    }

    #[test]
    fn test_flame_rpoint_moves_towards_viewer() {
        let mut sprite = Sprite::new(SpawnRequest {
            size: 4.0,
            ..spawn(SpriteKind::WeaponShine, Vec3::new(0.0, 0.0, 10.0))
        });
        let queue = SegQueue::new();
        sprite.animate(&env(0.01), false, &queue);
        // Viewer at the origin: one unit (size / 4) closer.
        assert!((sprite.rpoint - Vec3::new(0.0, 0.0, 9.0)).length() < 1e-4);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_old_position_follows_check() {
        let mut sprite = Sprite::new(SpawnRequest {
            velocity: Vec3::X,
            ..spawn(SpriteKind::Blood, Vec3::ZERO)
        });
        let queue = SegQueue::new();
        sprite.animate(&env(0.1), false, &queue);
        assert_eq!(sprite.old_position, Vec3::ZERO);
        sprite.animate(&env(0.1), true, &queue);
        assert_eq!(sprite.old_position, sprite.position);
    }

    #[test]
    fn test_capacity_limits_make_sprite() {
        let mut system = SpriteSystem::new(2);
        assert!(system.make_sprite(spawn(SpriteKind::Cloud, Vec3::ZERO)).is_some());
        let second = system.make_sprite(spawn(SpriteKind::Splinter, Vec3::ZERO)).unwrap();
        second.special = 1;
        assert!(system.make_sprite(spawn(SpriteKind::Cloud, Vec3::ZERO)).is_none());
        assert_eq!(system.sprites()[1].special, 1);
    }

    #[test]
    fn test_animation_slices_and_compaction() {
        let jobs = JobSystem::new(2);
        let mut system = SpriteSystem::new(64);
        for i in 0..10 {
            let mut request = spawn(SpriteKind::Cloud, Vec3::new(i as f32, 0.0, 0.0));
            // Every other sprite is about to fade out.
            request.opacity = if i % 2 == 0 { 0.01 } else { 1.0 };
            system.make_sprite(request);
        }

        let frame = system.submit_animation(&jobs, env(0.1));
        assert_eq!(frame.len(), 3);
        assert!(system.sprites().is_empty());
        assert!(system.make_sprite(spawn(SpriteKind::Smoke, Vec3::ZERO)).is_none());

        system.finish_animation(&jobs, frame, true);
        assert_eq!(system.len(), 6);
        assert!(system.sprites()[..5].iter().all(|s| s.kind == SpriteKind::Cloud && s.alive));
        assert_eq!(system.sprites()[5].kind, SpriteKind::Smoke);
        jobs.kill_workers();
    }

    #[test]
    fn test_finishing_the_wrong_frame_keeps_the_pass() {
        let jobs = JobSystem::init(crate::SchedulerConfig::default()).unwrap();
        let mut system = SpriteSystem::new(16);
        for i in 0..10 {
            system.make_sprite(spawn(SpriteKind::Cloud, Vec3::new(i as f32, 0.0, 0.0)));
        }

        // No workers, so every slice is still queued and holds the buffer.
        let frame = system.submit_animation(&jobs, env(0.1));
        system.finish_animation(&jobs, SpriteFrame { handles: Vec::new() }, false);
        assert!(system.is_empty());
        assert!(system.make_sprite(spawn(SpriteKind::Smoke, Vec3::ZERO)).is_none());
        assert!(system.submit_animation(&jobs, env(0.1)).is_empty());

        system.finish_animation(&jobs, frame, true);
        assert_eq!(system.len(), 11);
        assert_eq!(system.sprites()[10].kind, SpriteKind::Smoke);
        assert_eq!(jobs.live_jobs(), 0);
    }

    #[test]
    fn test_empty_pass() {
        let jobs = JobSystem::new(1);
        let mut system = SpriteSystem::new(4);
        let frame = system.submit_animation(&jobs, env(0.1));
        assert!(frame.is_empty());
        system.finish_animation(&jobs, frame, false);
        assert!(system.is_empty());
        jobs.kill_workers();
    }
}
