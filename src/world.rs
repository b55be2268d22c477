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

//! Top-level simulation state, tying the BSP index, particle system, object
//! table, and collision resolver together behind one fixed-tick `tick()`
//! entry point.
//!
//! Grounded on the teacher's `server::world::World`/`server::Server` for the
//! shape of a single-threaded, synchronously-ticked owner of every
//! subsystem (no singletons; every collaborator is a named field).

use std::collections::VecDeque;
use std::sync::Arc;

use cgmath::Vector3;
use log::debug;

use crate::alloc::{Arena, Handle};
use crate::bsp::{BspTree, LeafKind};
use crate::collision;
use crate::config::SimConfig;
use crate::error::SimResult;
use crate::interfaces::{AudioSink, BillboardSink, DamageSystem, MeshSampler, ObjectHandler};
use crate::math::Aabb3;
use crate::object::matrix_cache::{self, GripSource};
use crate::object::{animation, Object, ObjectFlags};
use crate::particle::{DamageFx, Particle, ParticleProfile, Particles, SpawnRequest, SPAWN_NO_CHARACTER};

/// Root bound the spatial indices start with before anything has been
/// inserted to derive a tighter one from.
fn default_world_bound() -> Aabb3 {
    let half = Vector3::new(8192.0, 8192.0, 8192.0);
    Aabb3::new(-half, half)
}

/// Everything the simulation owns. A host embeds this crate by building a
/// `World` with concrete collaborator implementations and calling `tick()`
/// once per fixed-rate step.
pub struct World<M, O, D, A, B>
where
    M: MeshSampler,
    O: ObjectHandler,
    D: DamageSystem,
    A: AudioSink,
    B: BillboardSink,
{
    pub config: SimConfig,

    pub objects: Arena<Object>,
    pub particles: Particles,

    pub object_bsp: BspTree<Handle<Object>>,
    pub particle_bsp: BspTree<Handle<Particle>>,

    pub mesh: M,
    pub object_handler: O,
    pub damage: D,
    pub audio: A,
    pub billboards: B,

    pending_spawns: VecDeque<PendingSpawn>,
    ticks_run: u64,
}

struct PendingSpawn {
    profile: Arc<ParticleProfile>,
    position: Vector3<f32>,
    velocity: Vector3<f32>,
    owner: Option<Handle<Object>>,
    team: u8,
}

impl<M, O, D, A, B> World<M, O, D, A, B>
where
    M: MeshSampler,
    O: ObjectHandler,
    D: DamageSystem,
    A: AudioSink,
    B: BillboardSink,
{
    pub fn new(config: SimConfig, mesh: M, object_handler: O, damage: D, audio: A, billboards: B) -> SimResult<World<M, O, D, A, B>> {
        let bound = default_world_bound();
        let object_bsp = BspTree::new(config.bsp_dim, config.bsp_max_depth, bound)?;
        let particle_bsp = BspTree::new(config.bsp_dim, config.bsp_max_depth, bound)?;
        let particles = Particles::with_capacity(512, config.rng_seed);

        Ok(World {
            config,
            objects: Arena::with_capacity(256),
            particles,
            object_bsp,
            particle_bsp,
            mesh,
            object_handler,
            damage,
            audio,
            billboards,
            pending_spawns: VecDeque::new(),
            ticks_run: 0,
        })
    }

    pub fn ticks_run(&self) -> u64 {
        self.ticks_run
    }

    /// Advances the simulation by one fixed tick (`config.tick` long):
    /// particle physics, object animation, matrix cache refresh, spatial
    /// index rebuild, collision resolution, then the deferred particle
    /// fan-out (continuous/end spawns) those steps queued up.
    pub fn tick(&mut self) -> SimResult<()> {
        self.tick_particles();
        self.tick_animation();
        self.tick_matrix_cache();
        self.rebuild_spatial_index()?;
        self.resolve_collisions();
        self.drain_pending_spawns();

        self.ticks_run += 1;
        debug!("tick {} complete: {} objects, {} particles", self.ticks_run, self.objects.len(), self.particles.len());
        Ok(())
    }

    fn tick_particles(&mut self) {
        let retired = self.particles.tick(&self.config, &self.mesh, &self.object_handler);
        for handle in retired {
            self.retire_particle(handle);
        }
    }

    fn retire_particle(&mut self, handle: Handle<Particle>) {
        let retirement = self.particles.get(handle).map(|p| (p.profile.clone(), p.position, p.velocity, p.owner, p.team));
        if let Some((profile, position, velocity, owner, team)) = retirement {
            for _ in 0..profile.endspawn_amount {
                self.pending_spawns.push_back(PendingSpawn {
                    profile: profile.clone(),
                    position,
                    velocity,
                    owner,
                    team,
                });
            }
            if profile.endspawn_characterstate != SPAWN_NO_CHARACTER {
                self.object_handler.spawn_character_state(profile.endspawn_characterstate, position);
            }
            if let Some(sound) = profile.end_sound {
                self.audio.play_sound(position, sound);
            }
        }
        self.particles.remove(handle);
    }

    fn drain_pending_spawns(&mut self) {
        while let Some(spawn) = self.pending_spawns.pop_front() {
            let req = SpawnRequest {
                profile: spawn.profile,
                position: spawn.position,
                velocity: spawn.velocity,
                facing_deg: 0.0,
                owner: spawn.owner,
                // Aiming skill is a content/AI concern with no counterpart on
                // `Object`; continuous/end spawns dither at full accuracy.
                owner_intelligence: 1.0,
                team: spawn.team,
                attach: None,
                mesh: &self.mesh,
                objects: &self.object_handler,
            };
            self.particles.spawn(req);
        }
    }

    fn tick_animation(&mut self) {
        let source = NullActionSource;
        let handles: Vec<Handle<Object>> = self.objects.iter().map(|(h, _)| h).collect();
        for handle in handles {
            let bore_sample = self.particles.roll_percent() / 100.0;
            if let Some(obj) = self.objects.get_mut(handle) {
                let mut events = Vec::new();
                let is_ridden = obj.flags.contains(ObjectFlags::MOUNT);
                obj.animation.tick(&source, is_ridden, &mut events);

                let horizontal_speed = (obj.velocity.x * obj.velocity.x + obj.velocity.y * obj.velocity.y).sqrt();
                let rate_input = animation::RateSelectionInput {
                    is_attacking: false,
                    mount_rate: None,
                    mount_is_scenery: false,
                    is_grounded: !obj.flags.contains(ObjectFlags::FLYING),
                    is_flying: obj.flags.contains(ObjectFlags::FLYING),
                    is_stealthed: obj.flags.contains(ObjectFlags::STEALTHED),
                    is_slippy: false,
                    scale: obj.scale,
                    actual_horizontal_speed: horizontal_speed,
                    desired_horizontal_speed: 0.0,
                };
                if let Some(new_action) = animation::select_rate(&mut obj.animation, &rate_input, &source, &mut obj.bore_timer, bore_sample) {
                    obj.animation.action = new_action;
                }

                for event in events {
                    debug!("object {:?} frame event {:?}", handle, event);
                }
            }
        }
    }

    /// Recomputes each object's matrix cache from its (pre-tick) holder in
    /// two passes, so a borrow of the holder never overlaps the mutable
    /// borrow that later applies the cache to its own slot.
    fn tick_matrix_cache(&mut self) {
        let grips = NullGripSource;
        let handles: Vec<Handle<Object>> = self.objects.iter().map(|(h, _)| h).collect();

        let mut updates = Vec::new();
        for handle in &handles {
            let obj = match self.objects.get(*handle) {
                Some(o) => o,
                None => continue,
            };
            let holder_pair = obj.attached_to.and_then(|a| self.objects.get(a.holder).map(|holder| (a.holder, holder)));
            let new_cache = matrix_cache::build_matrix_cache(obj, holder_pair, &grips);
            if matrix_cache::needs_update(&new_cache, &obj.matrix_cache) {
                let is_weapon = new_cache.type_bits.contains(matrix_cache::MatrixKind::WEAPON);
                updates.push((*handle, new_cache, is_weapon));
            }
        }

        for (handle, cache, is_weapon) in updates {
            if is_weapon {
                // Without a model system we cannot resolve real grip vertex
                // world positions; `apply_one_weapon_matrix` falls back to
                // the hybrid character-matrix path when given none.
                let grip_points: Vec<Vector3<f32>> = Vec::new();
                if let Some(obj) = self.objects.get_mut(handle) {
                    matrix_cache::apply_one_weapon_matrix(obj, &cache, &grip_points);
                }
            } else if let Some(obj) = self.objects.get_mut(handle) {
                matrix_cache::apply_one_character_matrix(obj, &cache);
            }
        }
    }

    /// A from-scratch rebuild every tick keeps the index consistent with
    /// moved leaves without needing per-object remove/reinsert tracking,
    /// matching the teacher's `AreaNode` rebuild-per-frame approach.
    fn rebuild_spatial_index(&mut self) -> SimResult<()> {
        let object_bound = self.object_bsp.bounds().unwrap_or_else(default_world_bound);
        let mut object_bsp = BspTree::new(self.config.bsp_dim, self.config.bsp_max_depth, object_bound)?;
        for (handle, obj) in self.objects.iter() {
            object_bsp.insert_leaf(handle, obj.chr_max_cv.to_aabb(), LeafKind::Object);
        }
        self.object_bsp = object_bsp;

        let particle_bound = self.particle_bsp.bounds().unwrap_or_else(default_world_bound);
        let mut particle_bsp = BspTree::new(self.config.bsp_dim, self.config.bsp_max_depth, particle_bound)?;
        for (handle, prt) in self.particles.iter() {
            particle_bsp.insert_leaf(handle, prt.prt_max_cv.to_aabb(), LeafKind::Particle);
        }
        self.particle_bsp = particle_bsp;

        Ok(())
    }

    fn resolve_collisions(&mut self) {
        let object_handles: Vec<Handle<Object>> = self.objects.iter().map(|(h, _)| h).collect();
        for obj_handle in object_handles {
            let aabb = match self.objects.get(obj_handle) {
                Some(o) => o.chr_max_cv.to_aabb(),
                None => continue,
            };
            let leaves = self.particle_bsp.collide(&aabb);
            let prt_handles: Vec<Handle<Particle>> = leaves.iter().filter_map(|&leaf| self.particle_bsp.get(leaf).copied()).collect();
            for prt_handle in prt_handles {
                self.resolve_one(obj_handle, prt_handle);
            }
        }
    }

    fn resolve_one(&mut self, obj_handle: Handle<Object>, prt_handle: Handle<Particle>) {
        let targets_this_object = self.particles.get(prt_handle).and_then(|p| p.attached_to).map(|a| a.holder) == Some(obj_handle);
        if targets_this_object {
            return;
        }

        let obj_alive = self.objects.get(obj_handle).map(|o| o.is_alive()).unwrap_or(false);
        if !obj_alive {
            return;
        }

        self.try_platform_attach(obj_handle, prt_handle);

        let dt = self.config.tick.num_milliseconds() as f32 / 1000.0;

        let contact = {
            let obj = match self.objects.get(obj_handle) {
                Some(o) => o,
                None => return,
            };
            let prt = match self.particles.get(prt_handle) {
                Some(p) => p,
                None => return,
            };
            collision::classify(obj, obj.velocity, prt, prt.velocity, -1.0, -1.0, dt, obj.flags.contains(ObjectFlags::PLATFORM))
        };
        let contact = match contact {
            Some(c) => c,
            None => return,
        };

        let (profile, prt_velocity, prt_team, prt_owner, damage_base) = match self.particles.get(prt_handle) {
            Some(p) => (p.profile.clone(), p.velocity, p.team, p.owner, p.damage_base),
            None => return,
        };

        // Ignite/reaffirm is independent of the bump filter and of damage:
        // it only cares whether the object's reaffirm type matches.
        let reaffirm_type = self.objects.get(obj_handle).and_then(|o| o.reaffirm_damage_type);
        if collision::should_reaffirm(reaffirm_type, profile.damage_type) {
            self.reaffirm_attached(obj_handle);
        }

        let bumps = {
            let obj = match self.objects.get(obj_handle) {
                Some(o) => o,
                None => return,
            };
            let prt = match self.particles.get(prt_handle) {
                Some(p) => p,
                None => return,
            };
            collision::bump_filter(obj, obj_handle, prt, &prt.profile)
        };
        if !bumps {
            return;
        }

        let protected = self.objects.get(obj_handle).map(|o| collision::is_protected(o, false, false)).unwrap_or(false);
        if protected {
            let result = {
                let obj = match self.objects.get(obj_handle) {
                    Some(o) => o,
                    None => return,
                };
                collision::deflect(&contact, prt_velocity, obj.velocity, collision::DeflectKind::Deflect)
            };
            if let Some(prt) = self.particles.get_mut(prt_handle) {
                prt.velocity = result.new_velocity;
                if result.disable_homing {
                    prt.homing = false;
                }
                prt.note_hit(obj_handle);
            }
            return;
        }

        let roll = self.particles.roll_percent();
        let dodged = {
            let obj = match self.objects.get(obj_handle) {
                Some(o) => o,
                None => return,
            };
            collision::dodge_check(obj.agility, 0.0, roll)
        };
        if dodged {
            if let Some(prt) = self.particles.get_mut(prt_handle) {
                prt.note_hit(obj_handle);
            }
            return;
        }

        let damage = collision::compute_damage(
            damage_base,
            0,
            &collision::DamageContext {
                vulnerable: false,
                modifier: 1.0,
                armor_piercing: profile.damfx.contains(DamageFx::ARMOR_PIERCE),
                time_bypass: profile.damfx.contains(DamageFx::TIME_BYPASS),
                friendly_fire: profile.friendly_fire,
            },
        );

        self.damage.damage(
            obj_handle,
            contact.normal,
            damage,
            0,
            profile.damage_type,
            prt_team,
            prt_owner,
            profile.damfx.contains(DamageFx::ARMOR_PIERCE),
            profile.damfx.contains(DamageFx::TIME_BYPASS),
            profile.friendly_fire,
        );

        let (target_might, target_mass) = self.objects.get(obj_handle).map(|o| (o.might, o.mass)).unwrap_or((10.0, 1.0));
        let attacker_might = prt_owner.and_then(|o| self.objects.get(o)).map(|o| o.might).unwrap_or(10.0);
        let factor = collision::knockback_factor(attacker_might, target_might, target_mass, profile.damage_type, 0.0);
        if let Some(obj) = self.objects.get_mut(obj_handle) {
            collision::apply_knockback(&mut obj.velocity, prt_velocity, factor, false, &profile);
        }

        if let Some(prt) = self.particles.get_mut(prt_handle) {
            prt.note_hit(obj_handle);
            if prt.profile.end_on_bump {
                prt.request_terminate();
            }
        }
    }

    /// Platform detection: attaches `prt` to `obj`'s top face when `obj` is
    /// a platform and the particle's padded CV rests close enough to it.
    fn try_platform_attach(&mut self, obj_handle: Handle<Object>, prt_handle: Handle<Particle>) {
        let is_platform = self.objects.get(obj_handle).map(|o| o.flags.contains(ObjectFlags::PLATFORM)).unwrap_or(false);
        if !is_platform {
            return;
        }
        let attach = {
            let obj = match self.objects.get(obj_handle) {
                Some(o) => o,
                None => return,
            };
            let prt = match self.particles.get(prt_handle) {
                Some(p) => p,
                None => return,
            };
            collision::platform_attach_height(&prt.prt_max_cv, &obj.chr_max_cv)
        };
        if let Some(top) = attach {
            if let Some(prt) = self.particles.get_mut(prt_handle) {
                prt.position.z = top;
                prt.on_platform = Some(obj_handle);
            }
        }
    }

    /// Renews every particle attached to `holder`, mirroring the original's
    /// reaffirm-on-bump side effect.
    fn reaffirm_attached(&mut self, holder: Handle<Object>) {
        let handles: Vec<Handle<Particle>> = self.particles.iter().filter(|(_, p)| p.attached_to.map(|a| a.holder) == Some(holder)).map(|(h, _)| h).collect();
        for handle in handles {
            if let Some(prt) = self.particles.get_mut(handle) {
                prt.reaffirm();
            }
        }
    }
}

/// Stand-in `ActionSource` used when a host hasn't wired a real model crate
/// in: every action is a single frozen frame with no frame-FX.
struct NullActionSource;
impl animation::ActionSource for NullActionSource {
    fn action(&self, id: animation::ActionId) -> animation::ActionDef {
        animation::ActionDef {
            id,
            first_frame: 0,
            last_frame: 0,
            family: animation::ActionFamily::Other,
            freeze_at_last_frame: true,
            loop_animation: false,
            next_action: id,
        }
    }
    fn frame_fx(&self, _action: animation::ActionId, _frame: u32) -> animation::FrameFx {
        animation::FrameFx::empty()
    }
}

/// Stand-in `GripSource` used when a host hasn't wired a real model crate
/// in: reports no vertices, forcing the hybrid character-matrix weapon
/// fallback in `apply_one_weapon_matrix`.
struct NullGripSource;
impl GripSource for NullGripSource {
    fn vertex_count(&self, _holder: Handle<Object>) -> u16 {
        0
    }
    fn vertex_world_position(&self, _holder: Handle<Object>, _index: u16) -> Option<Vector3<f32>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{BillboardFlags, DamageType, MeshFx, TwistCode};
    use crate::particle::LifetimeKind;
    use cgmath::Zero;

    struct FlatMesh;
    impl MeshSampler for FlatMesh {
        fn elevation(&self, _x: f32, _y: f32) -> f32 {
            0.0
        }
        fn twist(&self, _tile: u32) -> TwistCode {
            TwistCode::FLAT
        }
        fn twist_normal(&self, _twist: TwistCode) -> Vector3<f32> {
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
            false
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

    struct NullDamage;
    impl DamageSystem for NullDamage {
        fn damage(
            &mut self,
            _target: Handle<Object>,
            _direction: Vector3<f32>,
            _base: i32,
            _rand: i32,
            _kind: DamageType,
            _team: u8,
            _owner: Option<Handle<Object>>,
            _armor_piercing: bool,
            _time_bypass: bool,
            _friendly_fire: bool,
        ) -> i32 {
            0
        }
    }

    struct NullAudio;
    impl AudioSink for NullAudio {
        fn play_sound(&mut self, _pos: Vector3<f32>, _sound_id: u32) {}
    }

    struct NullBillboards;
    impl BillboardSink for NullBillboards {
        fn make_billboard(&mut self, _obj: Handle<Object>, _text: &str, _color: [f32; 4], _tint: [f32; 4], _lifetime_seconds: f32, _flags: BillboardFlags) {}
    }

    fn make_world() -> World<FlatMesh, EmptyObjects, NullDamage, NullAudio, NullBillboards> {
        World::new(SimConfig::default(), FlatMesh, EmptyObjects, NullDamage, NullAudio, NullBillboards).unwrap()
    }

    #[test]
    fn empty_world_ticks_without_panicking() {
        crate::test_support::init_logger();
        let mut world = make_world();
        world.tick().unwrap();
        assert_eq!(world.ticks_run(), 1);
    }

    #[test]
    fn object_insertion_survives_a_tick() {
        let mut world = make_world();
        let handle = world.objects.insert(Object::new(Vector3::new(0.0, 0.0, 0.0)));
        world.tick().unwrap();
        assert!(world.objects.get(handle).is_some());
    }

    #[test]
    fn particle_bump_is_recorded_and_terminates_an_end_on_bump_particle() {
        let mut world = make_world();

        let mut target = Object::new(Vector3::new(0.0, 0.0, 0.0));
        target.team = 0;
        target.agility = 0.0;
        let obj_handle = world.objects.insert(target);

        let mut profile = ParticleProfile::default();
        profile.damage_base = 10;
        profile.solid = false;
        profile.gravity = false;
        profile.end_on_bump = true;
        profile.lifetime = LifetimeKind::Ticks(10);
        let profile = Arc::new(profile);

        let req = SpawnRequest {
            profile,
            position: Vector3::new(0.0, 0.0, 0.0),
            velocity: Vector3::zero(),
            facing_deg: 0.0,
            owner: None,
            owner_intelligence: 1.0,
            team: 1,
            attach: None,
            mesh: &world.mesh,
            objects: &world.object_handler,
        };
        let prt_handle = world.particles.spawn(req);

        world.tick().unwrap();

        assert!(world.particles.get(prt_handle).map(|p| p.has_hit(obj_handle)).unwrap_or(false));
        assert!(world.particles.get(prt_handle).map(|p| !p.is_alive()).unwrap_or(false));
    }

    #[test]
    fn particle_spatial_index_finds_a_nearby_particle() {
        let mut world = make_world();
        let mut profile = ParticleProfile::default();
        profile.solid = false;
        profile.gravity = false;
        profile.lifetime = LifetimeKind::Ticks(100);
        let profile = Arc::new(profile);

        let req = SpawnRequest {
            profile,
            position: Vector3::new(10.0, 0.0, 0.0),
            velocity: Vector3::zero(),
            facing_deg: 0.0,
            owner: None,
            owner_intelligence: 1.0,
            team: 0,
            attach: None,
            mesh: &world.mesh,
            objects: &world.object_handler,
        };
        world.particles.spawn(req);
        world.rebuild_spatial_index().unwrap();

        let query = Aabb3::from_center_radius(Vector3::new(10.0, 0.0, 0.0), Vector3::new(20.0, 20.0, 20.0));
        let hits = world.particle_bsp.collide(&query);
        assert_eq!(hits.len(), 1);
    }
}
