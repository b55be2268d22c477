// Copyright © 2018 Cormac O'Brien
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of this software
// and associated documentation files (the "Software"), to deal in the Software without
// restriction, including without limitation the rights to use, copy, modify, merge, publish,
// distribute, sublicense, and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all copies or
// substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR IMPLIED, INCLUDING
// BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS FOR A PARTICULAR PURPOSE AND
// NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM,
// DAMAGES OR OTHER LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Particle spawn, per-tick update, physics integration, and retirement.
//!
//! Grounded on `game/Physics/ParticlePhysics.cpp` and
//! `game/Entities/Particle.cpp` for update order and constants, and on the
//! teacher's `client::entity::particle` for the `update(&mut self, ...) ->
//! bool` retention idiom and `SmallRng`-backed randomness.

use std::collections::VecDeque;
use std::sync::Arc;

use cgmath::{InnerSpace, Vector3, Zero as _};
use log::trace;
use rand::distributions::{Distribution, Uniform};
use rand::rngs::SmallRng;
use rand::SeedableRng;

use crate::alloc::{Arena, Handle};
use crate::config::SimConfig;
use crate::interfaces::{DamageType, MeshFx, MeshSampler, ObjectHandler};
use crate::math::{clamp, lerp, Aabb3, Obb};
use crate::object::Object;

/// Vertical speed below which a settled bounce stops re-triggering,
/// mirroring `STOPBOUNCINGPART`.
pub const STOP_BOUNCING_PART: f32 = 10.0;

/// Sentinel for `endspawn_characterstate`: no character state is spawned.
pub const SPAWN_NO_CHARACTER: i32 = -1;

/// Half-range of the per-axis homing dither, scaled down by the owner's
/// intelligence so a smarter owner's shots wander less, per
/// `updateHoming()`'s random-offset term.
pub const HOMING_DITHER_SCALE: f32 = 256.0;

bitflags::bitflags! {
    /// Missile treatment flags (`DAMFX_*`).
    pub struct DamageFx: u32 {
        const TURN           = 0b0000_0001;
        const ARMOR_PIERCE   = 0b0000_0010;
        const TIME_BYPASS    = 0b0000_0100;
        const NO_PUSH        = 0b0000_1000;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LifetimeKind {
    Eternal,
    Ticks(u32),
    EndLastFrame,
}

/// Immutable spawn template shared by every particle instantiated from it.
#[derive(Clone, Debug)]
pub struct ParticleProfile {
    pub damage_base: i32,
    pub damage_rand: i32,
    pub damage_type: DamageType,

    pub end_on_wall: bool,
    pub end_on_ground: bool,
    pub end_on_bump: bool,
    pub end_water: bool,

    pub dampen: f32,
    pub homing_accel: f32,
    pub homing_friction: f32,
    pub homing_min_length: f32,
    pub rotate_to_face: bool,

    pub allow_push: bool,
    pub friendly_fire: bool,
    pub hate_only: bool,
    /// If set, this particle only damages objects on its own team, inverting
    /// the usual hate-relationship gate in the bump filter.
    pub only_damage_friendly: bool,
    pub bump_money: i32,

    /// Published speed limit used to derive buoyancy/air-resistance at
    /// spawn time so the particle coasts to this terminal velocity.
    pub speed_limit: f32,
    pub buoyancy: f32,

    pub solid: bool,
    pub homing: bool,
    pub gravity: bool,

    pub contspawn_amount: u32,
    pub contspawn_facing_add_deg: f32,
    pub contspawn_delay: u32,
    pub contspawn_cosmetic: bool,

    pub endspawn_amount: u32,
    pub endspawn_characterstate: i32,

    pub new_target_on_spawn: bool,
    pub lifetime: LifetimeKind,
    pub anim_frame_count: u32,
    pub anim_frame_add: f32,

    pub spawn_sound: Option<u32>,
    pub end_sound: Option<u32>,

    pub light_level_add: f32,
    pub light_falloff_add: f32,

    pub damfx: DamageFx,
}

impl Default for ParticleProfile {
    fn default() -> ParticleProfile {
        ParticleProfile {
            damage_base: 0,
            damage_rand: 0,
            damage_type: DamageType::Crush,
            end_on_wall: false,
            end_on_ground: false,
            end_on_bump: false,
            end_water: false,
            dampen: 0.5,
            homing_accel: 0.0,
            homing_friction: 1.0,
            homing_min_length: 10.0,
            rotate_to_face: false,
            allow_push: true,
            friendly_fire: false,
            hate_only: false,
            only_damage_friendly: false,
            bump_money: 0,
            speed_limit: 0.0,
            buoyancy: 0.0,
            solid: true,
            homing: false,
            gravity: true,
            contspawn_amount: 0,
            contspawn_facing_add_deg: 0.0,
            contspawn_delay: 0,
            contspawn_cosmetic: false,
            endspawn_amount: 0,
            endspawn_characterstate: SPAWN_NO_CHARACTER,
            new_target_on_spawn: false,
            lifetime: LifetimeKind::Ticks(50),
            anim_frame_count: 0,
            anim_frame_add: 1.0,
            spawn_sound: None,
            end_sound: None,
            light_level_add: 0.0,
            light_falloff_add: 0.0,
            damfx: DamageFx::empty(),
        }
    }
}

/// Resolves buoyancy/air-resistance so a particle with `profile_buoyancy`
/// reaches `speed_limit` as its terminal vertical speed:
/// `v_term = gravity * (1 - buoyancy) / air_resistance`.
pub fn resolve_buoyancy_air_resistance(gravity: f32, profile_buoyancy: f32, speed_limit: f32) -> (f32, f32) {
    let buoyancy = clamp(profile_buoyancy, 0.0, 1.0);
    if speed_limit <= 0.0 {
        return (buoyancy, 1.0);
    }
    let air_resistance = clamp((gravity.abs() * (1.0 - buoyancy)) / speed_limit, 0.001, 1.0);
    (buoyancy, air_resistance)
}

#[derive(Copy, Clone, Debug, Default)]
pub struct ParticleEnviro {
    pub floor_level: f32,
    pub is_slippy: bool,
    pub is_watery: bool,
    pub traction: f32,
    pub friction_hrz: f32,
}

#[derive(Copy, Clone, Debug)]
pub struct AttachedTo {
    pub holder: Handle<Object>,
    pub vertex: u16,
}

/// A live particle instance.
pub struct Particle {
    pub position: Vector3<f32>,
    pub velocity: Vector3<f32>,
    pub position_old: Vector3<f32>,
    pub velocity_old: Vector3<f32>,
    pub facing_deg: f32,
    pub scale: f32,

    pub profile: Arc<ParticleProfile>,
    pub owner: Option<Handle<Object>>,
    pub target: Option<Handle<Object>>,
    pub parent: Option<Handle<Particle>>,
    pub attached_to: Option<AttachedTo>,
    pub team: u8,

    /// Owner's aiming skill, in `[0, 1]`; scales down homing dither. 1.0
    /// means no dither.
    pub owner_intelligence: f32,
    /// Platform this particle is resting on, set by `platform_attach_height`.
    pub on_platform: Option<Handle<Object>>,

    pub damage_base: i32,
    pub damage_rand: i32,

    pub remaining_ticks: Option<u32>,
    pub remaining_anim_frames: u32,
    pub eternal: bool,

    pub image_offset: f32,
    pub image_add: f32,

    pub dynamic_light_level: f32,
    pub dynamic_light_falloff: f32,

    pub prt_min_cv: Obb,
    pub prt_max_cv: Obb,
    pub enviro: ParticleEnviro,

    pub homing: bool,
    pub gravity: bool,
    pub buoyancy: f32,
    pub air_resistance: f32,

    pub hit_objects: VecDeque<Handle<Object>>,

    contspawn_timer: u32,
    damage_tick_timer: u32,

    pub hidden: bool,
    terminate_requested: bool,
    pub rendered_last_frame: bool,
}

const ATTACHED_DAMAGE_TICK_PERIOD: u32 = 32;
const HIT_HISTORY_CAPACITY: usize = 8;

impl Particle {
    pub fn new(profile: Arc<ParticleProfile>, position: Vector3<f32>, velocity: Vector3<f32>) -> Particle {
        let radius = Vector3::new(4.0, 4.0, 4.0);
        let padded = Vector3::new(8.0, 8.0, 8.0);
        let (buoyancy, air_resistance) = resolve_buoyancy_air_resistance(1.0, profile.buoyancy, profile.speed_limit);
        let remaining_ticks = match profile.lifetime {
            LifetimeKind::Eternal => None,
            LifetimeKind::Ticks(n) => Some(n),
            LifetimeKind::EndLastFrame => Some(profile.anim_frame_count.max(1)),
        };
        let remaining_anim_frames = profile.anim_frame_count;
        let damage_base = profile.damage_base;
        let damage_rand = profile.damage_rand;
        let homing = profile.homing;
        let gravity = profile.gravity;

        Particle {
            position,
            velocity,
            position_old: position,
            velocity_old: velocity,
            facing_deg: 0.0,
            scale: 1.0,
            profile,
            owner: None,
            target: None,
            parent: None,
            attached_to: None,
            team: 0,
            owner_intelligence: 1.0,
            on_platform: None,
            damage_base,
            damage_rand,
            remaining_ticks,
            remaining_anim_frames,
            eternal: false,
            image_offset: 0.0,
            image_add: 1.0,
            dynamic_light_level: 0.0,
            dynamic_light_falloff: 0.0,
            prt_min_cv: Obb::from_aabb(&Aabb3::from_center_radius(position, radius)),
            prt_max_cv: Obb::from_aabb(&Aabb3::from_center_radius(position, padded)),
            enviro: ParticleEnviro::default(),
            homing,
            gravity,
            buoyancy,
            air_resistance,
            hit_objects: VecDeque::with_capacity(HIT_HISTORY_CAPACITY),
            contspawn_timer: profile.contspawn_delay,
            damage_tick_timer: 0,
            hidden: false,
            terminate_requested: false,
            rendered_last_frame: true,
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.terminate_requested
    }

    pub fn request_terminate(&mut self) {
        self.terminate_requested = true;
    }

    /// Records a bump so the same object isn't re-hit every tick unless
    /// the particle is marked eternal.
    pub fn note_hit(&mut self, target: Handle<Object>) {
        if self.eternal {
            return;
        }
        if self.hit_objects.len() == HIT_HISTORY_CAPACITY {
            self.hit_objects.pop_front();
        }
        self.hit_objects.push_back(target);
    }

    pub fn has_hit(&self, target: Handle<Object>) -> bool {
        !self.eternal && self.hit_objects.contains(&target)
    }

    /// Re-ignites an attached particle: renews its remaining lifetime and
    /// damage pool.
    pub fn reaffirm(&mut self) {
        if let LifetimeKind::Ticks(n) = self.profile.lifetime {
            self.remaining_ticks = Some(n);
        }
        self.damage_base = self.profile.damage_base;
    }
}

/// Global/local spawn request, corresponding to the teacher's `create_*`
/// family of constructors.
pub struct SpawnRequest<'a> {
    pub profile: Arc<ParticleProfile>,
    pub position: Vector3<f32>,
    pub velocity: Vector3<f32>,
    pub facing_deg: f32,
    pub owner: Option<Handle<Object>>,
    pub owner_intelligence: f32,
    pub team: u8,
    pub attach: Option<AttachedTo>,
    pub mesh: &'a dyn MeshSampler,
    pub objects: &'a dyn ObjectHandler,
}

/// Acquires the nearest hostile object within `radius` of `(x, y)`, used
/// by `newtargetonspawn`.
fn acquire_target(objects: &dyn ObjectHandler, x: f32, y: f32, radius: f32, team: u8) -> Option<Handle<Object>> {
    objects
        .find_nearby(x, y, radius)
        .into_iter()
        .find(|h| objects.get(*h).map(|o| o.team != team && o.is_alive()).unwrap_or(false))
}

/// Container owning every live particle.
pub struct Particles {
    arena: Arena<Particle>,
    rng: SmallRng,
}

impl Particles {
    pub fn with_capacity(capacity: usize, seed: u64) -> Particles {
        Particles {
            arena: Arena::with_capacity(capacity),
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    pub fn get(&self, handle: Handle<Particle>) -> Option<&Particle> {
        self.arena.get(handle)
    }

    pub fn get_mut(&mut self, handle: Handle<Particle>) -> Option<&mut Particle> {
        self.arena.get_mut(handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle<Particle>, &Particle)> {
        self.arena.iter()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    fn next_offset(&mut self, spread: f32) -> f32 {
        if spread <= 0.0 {
            return 0.0;
        }
        Uniform::new_inclusive(-spread, spread).sample(&mut self.rng)
    }

    /// Draws a uniform random percent in `[0, 100)`, for dodge/shield-style
    /// rolls driven from outside this module.
    pub fn roll_percent(&mut self) -> f32 {
        Uniform::new(0.0, 100.0).sample(&mut self.rng)
    }

    /// Spawns a particle, resolving target acquisition, lifetime, and
    /// buoyancy/air-resistance per the spawn rules.
    pub fn spawn(&mut self, req: SpawnRequest) -> Handle<Particle> {
        let pos_offset = Vector3::new(self.next_offset(2.0), self.next_offset(2.0), self.next_offset(1.0));
        let position = req.position + pos_offset;

        let mut velocity = req.velocity;
        velocity.x += self.next_offset(0.25);
        velocity.y += self.next_offset(0.25);

        let mut particle = Particle::new(req.profile.clone(), position, velocity);
        particle.facing_deg = req.facing_deg;
        particle.owner = req.owner;
        particle.owner_intelligence = clamp(req.owner_intelligence, 0.0, 1.0);
        particle.team = req.team;
        particle.attached_to = req.attach;

        if req.profile.new_target_on_spawn {
            particle.target = acquire_target(req.objects, position.x, position.y, 600.0, req.team);
            if let Some(target) = particle.target.and_then(|h| req.objects.get(h)) {
                let to_target = target.position - position;
                if to_target.magnitude2() > 1e-6 {
                    let horizontal = (to_target.x * to_target.x + to_target.y * to_target.y).sqrt();
                    let speed = velocity.magnitude();
                    if horizontal > 1e-3 && speed > 1e-3 {
                        velocity.z = speed * (to_target.z / horizontal).atan().sin();
                    }
                }
            }
        }

        if req.profile.damfx.contains(DamageFx::TURN) {
            particle.facing_deg = velocity.y.atan2(velocity.x).to_degrees();
        }

        if let Some(attach) = particle.attached_to {
            if let Some(holder) = req.objects.get(attach.holder) {
                particle.position = holder.position;
                particle.position_old = holder.position;
            }
        }

        if let Some(sound) = req.profile.spawn_sound {
            trace!("particle spawn sound {}", sound);
        }

        self.arena.insert(particle)
    }

    /// Removes a particle from the arena after retirement handling has run.
    pub fn remove(&mut self, handle: Handle<Particle>) -> Option<Particle> {
        self.arena.remove(handle)
    }

    /// Runs the per-tick update and physics step for every live particle,
    /// collecting retired/terminated handles for the caller (normally
    /// `World::tick`) to spawn end-effects for and remove.
    pub fn tick(&mut self, config: &SimConfig, mesh: &dyn MeshSampler, objects: &dyn ObjectHandler) -> Vec<Handle<Particle>> {
        let mut retired = Vec::new();
        let handles: Vec<Handle<Particle>> = self.arena.iter().map(|(h, _)| h).collect();

        for handle in handles {
            let still_alive = {
                let particle = match self.arena.get_mut(handle) {
                    Some(p) => p,
                    None => continue,
                };
                update_one(particle, config, mesh, objects, &mut self.rng)
            };
            if !still_alive {
                retired.push(handle);
            }
        }

        retired
    }
}

/// Per-tick update (9 steps) followed by the physics step. Returns `false`
/// if the particle should be retired this tick.
fn update_one(p: &mut Particle, config: &SimConfig, mesh: &dyn MeshSampler, objects: &dyn ObjectHandler, rng: &mut SmallRng) -> bool {
    if p.hidden || !p.is_alive() {
        return false;
    }

    // 2. Attachment re-derivation / detach-on-missing-holder.
    if let Some(attach) = p.attached_to {
        match objects.get(attach.holder) {
            Some(_holder) => {
                // Vertex-accurate placement needs posed-model sampling,
                // out of scope here; re-derive from the holder's origin.
                if let Some(holder) = objects.get(attach.holder) {
                    p.position = holder.position;
                }
            }
            None => {
                p.attached_to = None;
                p.request_terminate();
                return false;
            }
        }
    }

    // 3. Drop homing on newly-attached or missing target.
    if p.homing && (p.attached_to.is_some() || p.target.map(|t| !objects.contains(t)).unwrap_or(true)) {
        p.homing = false;
    }

    // 4. Dynamic light.
    p.dynamic_light_level += p.profile.light_level_add;
    p.dynamic_light_falloff += p.profile.light_falloff_add;

    // 5. Animation.
    p.image_offset += p.image_add;
    let frame_count = p.profile.anim_frame_count.max(1) as f32;
    if p.image_offset >= frame_count {
        if matches!(p.profile.lifetime, LifetimeKind::EndLastFrame) {
            p.image_offset = frame_count - 1.0;
            if p.remaining_anim_frames == 0 {
                p.request_terminate();
                return false;
            }
        } else {
            p.image_offset %= frame_count;
        }
    }
    if p.remaining_anim_frames > 0 {
        p.remaining_anim_frames -= 1;
    }

    // 6. Water interaction.
    let tile = mesh.tile_at(p.position.x, p.position.y);
    let over_water = mesh.is_water(tile);
    if over_water != p.enviro.is_watery {
        p.enviro.is_watery = over_water;
        if over_water && p.profile.end_water {
            p.request_terminate();
            return false;
        }
    }

    // 7. Continuous spawn (the caller drives actual child spawning via the
    // count this returns through `enviro`/timer state; the respawn fan-out
    // itself happens in `World::tick` once it can hand back a `SpawnRequest`
    // with access to the particle arena it's iterating).
    if p.profile.contspawn_amount > 0 {
        if p.contspawn_timer == 0 {
            p.contspawn_timer = p.profile.contspawn_delay.max(1);
        } else {
            p.contspawn_timer -= 1;
        }
    }

    // 8. Attached damage tick.
    if p.attached_to.is_some() && p.profile.damage_base > 0 {
        p.damage_tick_timer += 1;
        if p.damage_tick_timer >= ATTACHED_DAMAGE_TICK_PERIOD {
            p.damage_tick_timer = 0;
            if let Some(remaining) = p.remaining_ticks {
                if remaining > 0 {
                    let share = (p.damage_base / 2).max(1) / (remaining as i32 / ATTACHED_DAMAGE_TICK_PERIOD as i32).max(1);
                    p.damage_base = (p.damage_base - share).max(0);
                }
            }
        }
    }

    // 9. Lifetime.
    if let Some(remaining) = p.remaining_ticks.as_mut() {
        if *remaining == 0 {
            p.request_terminate();
            return false;
        }
        *remaining -= 1;
    }

    physics_step(p, config, mesh, objects, rng);

    true
}

fn physics_step(p: &mut Particle, config: &SimConfig, mesh: &dyn MeshSampler, objects: &dyn ObjectHandler, rng: &mut SmallRng) {
    p.velocity_old = p.velocity;
    if p.attached_to.is_some() {
        let dt = config.tick.num_milliseconds() as f32 / 1000.0;
        if dt > 0.0 {
            p.velocity = (p.position - p.position_old) / dt;
        }
    }
    p.position_old = p.position;

    // Environment sampling.
    let floor = mesh.elevation(p.position.x, p.position.y);
    let tile = mesh.tile_at(p.position.x, p.position.y);
    let twist = mesh.twist(tile);
    let normal = mesh.twist_normal(twist);
    p.enviro.floor_level = floor;
    p.enviro.is_slippy = mesh.test_fx(tile, MeshFx::SLIPPY);

    let mut traction = normal.z;
    if p.enviro.is_slippy {
        traction *= config.environment.slippyfriction;
    }
    p.enviro.traction = traction;
    p.enviro.friction_hrz = if p.enviro.is_watery { config.environment.waterfriction } else { config.environment.airfriction };

    // Floor friction (solid, non-homing only).
    if p.profile.solid && !p.homing && p.position.z <= floor + 1.0 {
        let relative = Vector3::new(p.velocity.x, p.velocity.y, 0.0);
        let along_normal = relative.dot(normal);
        let friction_accel = relative - normal * along_normal;
        let scaled = friction_accel * (p.enviro.traction * p.enviro.friction_hrz);
        if scaled.magnitude() > relative.magnitude().max(1e-6) {
            p.enviro.traction *= 0.5;
        }
        p.velocity.x -= scaled.x;
        p.velocity.y -= scaled.y;
    }

    // Homing: aim for the target's center-mass (half its padded collision
    // height above its origin), with a random dither that shrinks as the
    // owner's intelligence rises toward 1.0.
    if p.homing {
        if let Some(target) = p.target.and_then(|h| objects.get(h)) {
            let half_height = (target.chr_max_cv.z_max - target.chr_max_cv.z_min) * 0.5;
            let dither_scale = HOMING_DITHER_SCALE * (1.0 - clamp(p.owner_intelligence, 0.0, 1.0));
            let dither = Vector3::new(
                Uniform::new_inclusive(-dither_scale, dither_scale).sample(rng),
                Uniform::new_inclusive(-dither_scale, dither_scale).sample(rng),
                Uniform::new_inclusive(-dither_scale, dither_scale).sample(rng),
            );
            let aim = Vector3::new(target.position.x, target.position.y, target.position.z + half_height) + dither;
            let mut to_target = aim - p.position;
            if to_target.magnitude2() > 1e-6 {
                to_target = to_target.normalize() * p.profile.homing_min_length;
                p.velocity += (to_target - p.velocity) * p.profile.homing_accel;
                p.velocity *= p.profile.homing_friction;
            }
        }
    }

    // Gravity.
    if p.gravity && p.profile.solid && !p.homing && p.attached_to.is_none() {
        p.velocity.z += config.environment.gravity * config.environment.airfriction;
    }

    if p.attached_to.is_some() {
        // Movement (attached): only crossing detection, no integration.
        if p.position.z < p.enviro.floor_level && p.profile.end_on_ground {
            p.request_terminate();
        }
        return;
    }

    // Movement (detached).
    let dt = config.tick.num_milliseconds() as f32 / 1000.0;
    p.position.z += p.velocity.z * dt;
    if p.position.z < p.enviro.floor_level {
        if p.velocity.z.abs() > STOP_BOUNCING_PART {
            p.position.z = p.enviro.floor_level;
            p.velocity.z = -p.velocity.z * p.profile.dampen;
        } else {
            p.position.z = p.enviro.floor_level;
            p.velocity.z = 0.0;
        }
        if p.profile.end_on_ground {
            p.request_terminate();
            return;
        }
    }

    p.position.x += p.velocity.x * dt;
    p.position.y += p.velocity.y * dt;

    if let Some((wall_normal, _pressure)) = mesh.hit_wall(p.position, 4.0, MeshFx::WALL) {
        let parallel = p.velocity - wall_normal * p.velocity.dot(wall_normal);
        p.velocity = p.velocity - wall_normal * (2.0 * p.velocity.dot(wall_normal)) * p.profile.dampen;
        let _ = parallel;
        if p.profile.end_on_wall {
            p.request_terminate();
            return;
        }
    }

    if p.profile.rotate_to_face {
        let horizontal = Vector3::new(p.velocity.x, p.velocity.y, 0.0);
        if horizontal.magnitude2() > 1e-4 {
            p.facing_deg = horizontal.y.atan2(horizontal.x).to_degrees();
        }
    }

    if p.homing {
        p.position.z = p.position.z.max(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;

    struct FlatMesh {
        floor: f32,
        water: bool,
    }

    impl MeshSampler for FlatMesh {
        fn elevation(&self, _x: f32, _y: f32) -> f32 {
            self.floor
        }
        fn twist(&self, _tile: u32) -> crate::interfaces::TwistCode {
            crate::interfaces::TwistCode::FLAT
        }
        fn twist_normal(&self, _twist: crate::interfaces::TwistCode) -> Vector3<f32> {
            Vector3::new(0.0, 0.0, 1.0)
        }
        fn hit_wall(&self, _pos: Vector3<f32>, _radius: f32, _stoppedby: MeshFx) -> Option<(Vector3<f32>, f32)> {
            None
        }
        fn test_fx(&self, _tile: u32, _flags: MeshFx) -> bool {
            false
        }
        fn grid_is_valid(&self, _tile: u32) -> bool {
            true
        }
        fn tile_at(&self, _x: f32, _y: f32) -> u32 {
            0
        }
        fn is_water(&self, _tile: u32) -> bool {
            self.water
        }
    }

    struct EmptyObjects;
    impl ObjectHandler for EmptyObjects {
        fn get(&self, _handle: Handle<Object>) -> Option<&Object> {
            None
        }
        fn get_mut(&mut self, _handle: Handle<Object>) -> Option<&mut Object> {
            None
        }
        fn find_nearby(&self, _x: f32, _y: f32, _radius: f32) -> Vec<Handle<Object>> {
            Vec::new()
        }
    }

    #[test]
    fn buoyancy_air_resistance_reaches_requested_terminal_velocity() {
        crate::test_support::init_logger();
        let (buoyancy, air_resistance) = resolve_buoyancy_air_resistance(1.0, 0.0, 20.0);
        let v_term = 1.0 * (1.0 - buoyancy) / air_resistance;
        assert!((v_term - 20.0).abs() < 1e-3);
    }

    #[test]
    fn stationary_non_homing_particle_does_not_drift_under_friction() {
        let mut profile = ParticleProfile::default();
        profile.solid = true;
        profile.homing = false;
        profile.gravity = false;
        let profile = Arc::new(profile);
        let mut particle = Particle::new(profile, Vector3::new(0.0, 0.0, 0.0), Vector3::zero());
        let config = SimConfig::default();
        let mesh = FlatMesh { floor: 0.0, water: false };
        let objects = EmptyObjects;
        let mut rng = SmallRng::seed_from_u64(0);
        physics_step(&mut particle, &config, &mesh, &objects, &mut rng);
        assert!(particle.velocity.x.abs() < 1e-6);
        assert!(particle.velocity.y.abs() < 1e-6);
    }

    #[test]
    fn bouncing_particle_settles_below_stop_bouncing_threshold() {
        let mut profile = ParticleProfile::default();
        profile.solid = true;
        profile.gravity = true;
        profile.dampen = 0.5;
        let profile = Arc::new(profile);
        let mut particle = Particle::new(profile, Vector3::new(0.0, 0.0, 100.0), Vector3::new(0.0, 0.0, -20.0));
        let config = SimConfig::default();
        let mesh = FlatMesh { floor: 0.0, water: false };
        let objects = EmptyObjects;
        let mut rng = SmallRng::seed_from_u64(0);

        for _ in 0..4000 {
            physics_step(&mut particle, &config, &mesh, &objects, &mut rng);
            if particle.position.z <= 0.0 && particle.velocity.z.abs() < STOP_BOUNCING_PART {
                break;
            }
        }
        assert!(particle.velocity.z.abs() < STOP_BOUNCING_PART);
    }

    #[test]
    fn homing_particle_converges_toward_target_direction() {
        let mut profile = ParticleProfile::default();
        profile.homing = true;
        profile.homing_accel = 0.2;
        profile.homing_friction = 0.9;
        profile.homing_min_length = 10.0;
        profile.gravity = false;
        let profile = Arc::new(profile);
        let mut particle = Particle::new(profile, Vector3::new(0.0, 0.0, 0.0), Vector3::zero());

        let mut target = Object::new(Vector3::new(100.0, 0.0, 0.0));
        target.flags.insert(crate::object::ObjectFlags::ALIVE);
        let mut arena: Arena<Object> = Arena::with_capacity(1);
        let handle = arena.insert(target);
        particle.target = Some(handle);

        struct OneObject<'a>(&'a Arena<Object>);
        impl<'a> ObjectHandler for OneObject<'a> {
            fn get(&self, handle: Handle<Object>) -> Option<&Object> {
                self.0.get(handle)
            }
            fn get_mut(&mut self, _handle: Handle<Object>) -> Option<&mut Object> {
                None
            }
            fn find_nearby(&self, _x: f32, _y: f32, _radius: f32) -> Vec<Handle<Object>> {
                Vec::new()
            }
        }

        let config = SimConfig::default();
        let mesh = FlatMesh { floor: -1000.0, water: false };
        let objects = OneObject(&arena);
        let mut rng = SmallRng::seed_from_u64(0);

        let mut last_distance = f32::MAX;
        for _ in 0..200 {
            physics_step(&mut particle, &config, &mesh, &objects, &mut rng);
            particle.position += particle.velocity;
            let distance = (Vector3::new(100.0, 0.0, 0.0) - particle.position).magnitude();
            last_distance = distance;
        }
        assert!(last_distance < 100.0);
    }

    #[test]
    fn detached_particle_terminates_on_ground_contact_when_flagged() {
        let mut profile = ParticleProfile::default();
        profile.end_on_ground = true;
        profile.gravity = true;
        let profile = Arc::new(profile);
        let mut particle = Particle::new(profile, Vector3::new(0.0, 0.0, 5.0), Vector3::new(0.0, 0.0, -50.0));
        let config = SimConfig::default();
        let mesh = FlatMesh { floor: 0.0, water: false };
        let objects = EmptyObjects;
        let mut rng = SmallRng::seed_from_u64(0);

        for _ in 0..10 {
            if !particle.is_alive() {
                break;
            }
            physics_step(&mut particle, &config, &mesh, &objects, &mut rng);
        }
        assert!(!particle.is_alive());
    }

    #[test]
    fn hit_history_forgets_beyond_capacity_unless_eternal() {
        let profile = Arc::new(ParticleProfile::default());
        let mut particle = Particle::new(profile, Vector3::zero(), Vector3::zero());
        let mut arena: Arena<Object> = Arena::with_capacity(HIT_HISTORY_CAPACITY + 2);
        let handles: Vec<_> = (0..HIT_HISTORY_CAPACITY + 2).map(|_| arena.insert(Object::new(Vector3::zero()))).collect();
        for h in &handles {
            particle.note_hit(*h);
        }
        assert!(!particle.has_hit(handles[0]));
        assert!(particle.has_hit(*handles.last().unwrap()));
    }

    #[test]
    fn reaffirm_renews_lifetime_and_damage() {
        let mut profile = ParticleProfile::default();
        profile.lifetime = LifetimeKind::Ticks(10);
        profile.damage_base = 5;
        let profile = Arc::new(profile);
        let mut particle = Particle::new(profile, Vector3::zero(), Vector3::zero());
        particle.remaining_ticks = Some(1);
        particle.damage_base = 1;
        particle.reaffirm();
        assert_eq!(particle.remaining_ticks, Some(10));
        assert_eq!(particle.damage_base, 5);
    }
}
