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

//! Character↔particle collision resolution: geometric classification, bump
//! filtering, deflection, damage, and knockback.
//!
//! Grounded on `game/Physics/particle_collision.c` for classification order
//! and response rules, and on the teacher's `server::world::phys` for the
//! Rust idiom of returning a velocity/flags response from a collision
//! function rather than mutating through global state.

use cgmath::{InnerSpace, Vector3, Zero as _};

use crate::alloc::Handle;
use crate::interfaces::DamageType;
use crate::math::Obb;
use crate::object::{Object, ObjectFlags};
use crate::particle::{DamageFx, Particle, ParticleProfile};

/// Velocity clamp applied after knockback, per `MAX_KNOCKBACK_VELOCITY`.
pub const MAX_KNOCKBACK_VELOCITY: f32 = 40.0;

/// Z-tolerance for platform attachment, per `PLATTOLERANCE`.
pub const PLAT_TOLERANCE: f32 = 50.0;

/// Sentinel team id meaning "no team" / "hates nothing, hated by nothing",
/// per the original's `TEAM_NULL`-equivalent handling in the bump filter.
pub const NEUTRAL_TEAM: u8 = u8::MAX;

bitflags::bitflags! {
    pub struct CollisionFlags: u32 {
        const IMPACT    = 0b0000_0001;
        const PRESSURE  = 0b0000_0010;
        const COLLISION = 0b0000_0100;
        const MIN_CV    = 0b0000_1000;
        const MAX_CV    = 0b0001_0000;
    }
}

/// Result of the geometric classification step: a contact normal, overlap
/// depth, and the flags describing how it was derived.
#[derive(Copy, Clone, Debug)]
pub struct Contact {
    pub normal: Vector3<f32>,
    pub depth: f32,
    pub flags: CollisionFlags,
}

/// Smallest-penetration-axis estimate between two AABBs, used when swept
/// times are degenerate (`t_min <= 0` or out of range).
fn pressure_overlap(a: &crate::math::Aabb3, b: &crate::math::Aabb3) -> Option<(Vector3<f32>, f32)> {
    if !a.overlaps(b) {
        return None;
    }
    let dx = (a.max.x.min(b.max.x) - a.min.x.max(b.min.x)).max(0.0);
    let dy = (a.max.y.min(b.max.y) - a.min.y.max(b.min.y)).max(0.0);
    let dz = (a.max.z.min(b.max.z) - a.min.z.max(b.min.z)).max(0.0);

    let candidates = [
        (Vector3::new(1.0, 0.0, 0.0), dx),
        (Vector3::new(0.0, 1.0, 0.0), dy),
        (Vector3::new(0.0, 0.0, 1.0), dz),
    ];
    candidates
        .iter()
        .filter(|(_, d)| *d > 0.0)
        .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
        .map(|(n, d)| (*n, *d))
}

/// Swept separating-axis estimate: expands both boxes by their relative
/// motion over the first 10% of `[t_min, t_max]` and falls back to the
/// pressure estimate against the expanded boxes.
fn swept_overlap(a: &crate::math::Aabb3, a_vel: Vector3<f32>, b: &crate::math::Aabb3, b_vel: Vector3<f32>, dt: f32) -> Option<(Vector3<f32>, f32)> {
    let step = dt * 0.1;
    let a_swept = a.swept(a_vel, step);
    let b_swept = b.swept(b_vel, step);
    pressure_overlap(&a_swept, &b_swept)
}

/// Geometric classification (spec.md §4.4 step 1-3). `t_min`/`t_max` are the
/// swept-collision time interval from the physics integrator; `platform`
/// widens the distance metric for platform-like objects so resting contact
/// is stable.
pub fn classify(obj: &Object, obj_vel: Vector3<f32>, prt: &Particle, prt_vel: Vector3<f32>, t_min: f32, t_max: f32, dt: f32, platform: bool) -> Option<Contact> {
    let use_swept = t_min > 0.0 && t_max >= t_min;

    let try_cv = |obj_cv: &Obb, prt_cv: &Obb, flag: CollisionFlags| -> Option<Contact> {
        let a = obj_cv.to_aabb();
        let b = prt_cv.to_aabb();
        let (normal, depth, is_pressure) = if use_swept {
            swept_overlap(&a, obj_vel, &b, prt_vel, dt).map(|(n, d)| (n, d, false))?
        } else {
            pressure_overlap(&a, &b).map(|(n, d)| (n, d, true))?
        };

        let depth = if platform { depth.powf(2.0).sqrt() } else { depth };

        let mut flags = flag | CollisionFlags::IMPACT;
        flags.insert(if is_pressure { CollisionFlags::PRESSURE } else { CollisionFlags::COLLISION });

        let mut normal = normal;
        if flag == CollisionFlags::MAX_CV {
            normal.z = 0.0;
        }
        Some(Contact { normal, depth, flags })
    };

    try_cv(&obj.chr_min_cv, &prt.prt_min_cv, CollisionFlags::MIN_CV).or_else(|| try_cv(&obj.chr_max_cv, &prt.prt_max_cv, CollisionFlags::MAX_CV))
}

/// Whether `prt` bumps `obj`, per `particle_collision.c`'s per-field bump
/// filter: hate/team relationship first, then the three independent
/// `only_damage_hate` / `only_damage_friendly` / `friendly_fire` switches.
pub fn bump_filter(obj: &Object, obj_handle: Handle<Object>, prt: &Particle, profile: &ParticleProfile) -> bool {
    if prt.has_hit(obj_handle) {
        return false;
    }

    let max_damage = profile.damage_base.abs() + profile.damage_rand.abs();
    let prt_hates_chr = prt.team != obj.team;
    let prt_belongs_to_chr = prt.owner == Some(obj_handle);
    let prt_attacks_chr = (prt_hates_chr || (obj.team != NEUTRAL_TEAM && prt.team == NEUTRAL_TEAM)) && max_damage > 0;

    let valid_onlydamagehate = prt_hates_chr && profile.hate_only;
    let valid_onlydamagefriendly =
        (profile.only_damage_friendly && prt.team == obj.team) || (!profile.only_damage_friendly && prt_attacks_chr);
    let valid_friendlyfire = (profile.friendly_fire && !prt_hates_chr && !prt_belongs_to_chr) || (!profile.friendly_fire && prt_attacks_chr);

    valid_friendlyfire || valid_onlydamagefriendly || valid_onlydamagehate
}

/// Response to a deflected hit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeflectKind {
    Deflect,
    Reflect,
    ShieldBlock,
}

pub struct DeflectResult {
    pub kind: DeflectKind,
    pub new_velocity: Vector3<f32>,
    pub disable_homing: bool,
}

/// Deflection step: applied when the particle would damage an invincible,
/// time-blocked, or missile-treatment-protected target.
pub fn deflect(contact: &Contact, prt_velocity: Vector3<f32>, obj_velocity: Vector3<f32>, kind: DeflectKind) -> DeflectResult {
    let v_diff = obj_velocity - prt_velocity;
    let v_para = contact.normal * v_diff.dot(contact.normal);

    let new_velocity = match kind {
        DeflectKind::Deflect | DeflectKind::ShieldBlock => prt_velocity + v_para * 2.0,
        DeflectKind::Reflect => prt_velocity + v_diff * 2.0,
    };

    DeflectResult {
        kind,
        new_velocity,
        disable_homing: kind == DeflectKind::Deflect,
    }
}

/// Shield block roll: `true` means the block succeeds and no damage is
/// taken. `roll` is a caller-supplied random percent in `[0, 100)`.
pub fn shield_block_check(shield_rating: f32, defender_might: f32, attacker_might: f32, roll: f32) -> bool {
    let chance = (shield_rating + defender_might - attacker_might).max(0.0).min(100.0);
    roll < chance
}

/// Inputs to damage computation that the caller (who owns enchant/perk
/// state, out of scope here) resolves before calling [`compute_damage`].
pub struct DamageContext {
    pub vulnerable: bool,
    pub modifier: f32,
    pub armor_piercing: bool,
    pub time_bypass: bool,
    pub friendly_fire: bool,
}

/// Computes the final damage amount from a base/rand roll and modifiers,
/// per spec.md §4.4's damage step (perk-tree modifiers themselves are a
/// content-layer concern left to the caller via `ctx.modifier`).
pub fn compute_damage(base: i32, rand_roll: i32, ctx: &DamageContext) -> i32 {
    let mut damage = (base + rand_roll) as f32;
    if ctx.vulnerable {
        damage *= 2.0;
    }
    damage *= ctx.modifier.max(0.0);
    damage.round() as i32
}

/// Dodge roll: Agility-derived chance to avoid damage+knockback entirely.
pub fn dodge_check(agility: f32, flat_bonus: f32, roll: f32) -> bool {
    let chance = (agility * 2.0 + flat_bonus).max(0.0).min(95.0);
    roll < chance
}

/// Knockback factor, before velocity scaling, per spec.md §4.4.
pub fn knockback_factor(attacker_might: f32, target_might: f32, target_mass: f32, damage_type: DamageType, perk_bonus: f32) -> f32 {
    let attacker_term = 1.0 + (attacker_might - 10.0) * if attacker_might >= 10.0 { 0.02 } else { 0.10 };
    let mass_ratio = if target_mass > 0.0 { (target_might / target_mass).max(0.1) } else { 1.0 };
    let type_scale = match damage_type {
        DamageType::Crush => 1.0,
        DamageType::Poke => 0.5,
        _ => std::f32::consts::FRAC_1_SQRT_2,
    };
    let factor = attacker_term * mass_ratio.recip().max(0.1) * type_scale * (1.0 + perk_bonus);
    factor.max(0.0).min(3.0)
}

/// Applies knockback to `obj`'s velocity accumulator, respecting the
/// `allow_push`/no-push flags and the velocity cap.
pub fn apply_knockback(obj_velocity: &mut Vector3<f32>, prt_velocity: Vector3<f32>, factor: f32, ignores_knockback: bool, profile: &ParticleProfile) {
    if ignores_knockback || !profile.allow_push || profile.damfx.contains(DamageFx::NO_PUSH) {
        return;
    }
    let mut kb = prt_velocity * factor;
    if kb.magnitude() > MAX_KNOCKBACK_VELOCITY {
        kb = kb.normalize() * MAX_KNOCKBACK_VELOCITY;
    }
    *obj_velocity += kb;
}

/// Whether `obj` should reaffirm (re-ignite) its attached particles because
/// its reaffirm damage type matches the bumping particle's.
pub fn should_reaffirm(obj_reaffirm_type: Option<DamageType>, prt_damage_type: DamageType) -> bool {
    obj_reaffirm_type == Some(prt_damage_type)
}

/// Platform detection: whether a particle's padded CV overlaps a platform
/// object's top face closely enough to attach (spec.md §4.4 "Platform
/// detection").
pub fn platform_attach_height(prt_cv: &Obb, platform_cv: &Obb) -> Option<f32> {
    if !prt_cv.overlaps(platform_cv) {
        return None;
    }
    let top = platform_cv.z_max;
    if (prt_cv.z_min - top).abs() <= PLAT_TOLERANCE {
        Some(top)
    } else {
        None
    }
}

/// Whether `obj` is currently protected from taking damage at all (used to
/// decide whether to run [`deflect`] instead of [`compute_damage`]).
pub fn is_protected(obj: &Object, time_blocked: bool, missile_treatment: bool) -> bool {
    obj.flags.contains(ObjectFlags::INVINCIBLE) || time_blocked || missile_treatment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Aabb3;
    use crate::object::Object;
    use crate::particle::{LifetimeKind, Particle};
    use std::sync::Arc;

    fn make_profile() -> ParticleProfile {
        let mut p = ParticleProfile::default();
        p.damage_base = 10;
        p.lifetime = LifetimeKind::Ticks(10);
        p
    }

    #[test]
    fn pressure_overlap_picks_smallest_nonzero_axis() {
        let a = Aabb3::new(Vector3::new(-1.0, -1.0, -1.0), Vector3::new(1.0, 1.0, 1.0));
        let b = Aabb3::new(Vector3::new(0.5, -1.0, -1.0), Vector3::new(2.0, 1.0, 1.0));
        let (normal, depth) = pressure_overlap(&a, &b).unwrap();
        assert_eq!(normal, Vector3::new(1.0, 0.0, 0.0));
        assert!((depth - 0.5).abs() < 1e-5);
    }

    #[test]
    fn classify_falls_back_from_min_to_max_cv() {
        let mut obj = Object::new(Vector3::new(0.0, 0.0, 0.0));
        obj.chr_min_cv = Obb::from_aabb(&Aabb3::from_center_radius(Vector3::zero(), Vector3::new(1.0, 1.0, 1.0)));
        obj.chr_max_cv = Obb::from_aabb(&Aabb3::from_center_radius(Vector3::zero(), Vector3::new(50.0, 50.0, 50.0)));

        let profile = Arc::new(make_profile());
        let prt = Particle::new(profile, Vector3::new(20.0, 0.0, 0.0), Vector3::zero());

        let contact = classify(&obj, Vector3::zero(), &prt, Vector3::zero(), -1.0, -1.0, 0.02, false);
        assert!(contact.is_some());
        assert!(contact.unwrap().flags.contains(CollisionFlags::MAX_CV));
    }

    #[test]
    fn bump_filter_allows_hostile_damaging_particle() {
        let mut arena: crate::alloc::Arena<Object> = crate::alloc::Arena::with_capacity(1);
        let mut obj = Object::new(Vector3::zero());
        obj.team = 0;
        let handle = arena.insert(obj);
        let obj = arena.get(handle).unwrap();

        let mut profile = make_profile();
        profile.friendly_fire = false;
        let profile = Arc::new(profile);
        let mut prt = Particle::new(profile.clone(), Vector3::zero(), Vector3::zero());
        prt.team = 1;
        assert!(bump_filter(obj, handle, &prt, &profile));
    }

    #[test]
    fn bump_filter_rejects_already_hit_object() {
        let mut arena: crate::alloc::Arena<Object> = crate::alloc::Arena::with_capacity(1);
        let mut seed = Object::new(Vector3::zero());
        seed.team = 0;
        let handle = arena.insert(seed);
        let obj = arena.get(handle).unwrap();

        let profile = Arc::new(make_profile());
        let mut prt = Particle::new(profile.clone(), Vector3::zero(), Vector3::zero());
        prt.team = 1;
        prt.note_hit(handle);
        assert!(!bump_filter(obj, handle, &prt, &profile));
    }

    #[test]
    fn knockback_is_clamped_to_max_velocity() {
        let mut obj_velocity = Vector3::zero();
        let prt_velocity = Vector3::new(1000.0, 0.0, 0.0);
        let profile = make_profile();
        apply_knockback(&mut obj_velocity, prt_velocity, 3.0, false, &profile);
        assert!(obj_velocity.magnitude() <= MAX_KNOCKBACK_VELOCITY + 1e-3);
    }

    #[test]
    fn dodge_check_never_exceeds_cap() {
        assert!(!dodge_check(1000.0, 1000.0, 94.99));
        assert!(dodge_check(1000.0, 1000.0, -1.0));
    }
}
