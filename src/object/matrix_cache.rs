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

//! World-matrix derivation: caches the inputs that last produced an
//! object's world matrix, so a holder-chain walk can detect when a
//! recompute is actually necessary instead of doing one every tick.
//!
//! Grounded on `CharacterMatrix.c`'s `matrix_cache_t`, `chr_get_matrix_cache`,
//! `matrix_cache_needs_update`, `apply_one_character_matrix`,
//! `apply_one_weapon_matrix`, and `chr_update_matrix`.

use cgmath::{Matrix4, SquareMatrix as _, Vector3, Zero as _};

use crate::alloc::Handle;
use crate::math::Angles;

use super::{slot_to_grip_offset, Object, ObjectFlags, Slot, GRIP_VERTS};

bitflags::bitflags! {
    #[derive(Default)]
    pub struct MatrixKind: u8 {
        const CHARACTER = 0b01;
        const WEAPON    = 0b10;
    }
}

/// Supplies posed vertex positions for grip resolution. Actual mesh/skin
/// data lives outside this crate; a host wires its model system in through
/// this trait the same way it wires mesh and damage systems in through
/// [`crate::interfaces`].
pub trait GripSource {
    /// Vertex count of the posed model backing `holder`, or 0 if unknown.
    fn vertex_count(&self, holder: Handle<Object>) -> u16;

    /// World-space position of vertex `index` on `holder`'s posed model.
    fn vertex_world_position(&self, holder: Handle<Object>, index: u16) -> Option<Vector3<f32>>;
}

pub const GRIP_VERT_SENTINEL: u16 = 0xFFFF;

/// Fills a four-vertex grip index array from a mount's vertex count,
/// mirroring `get_grip_verts`.
pub fn get_grip_verts(source: &dyn GripSource, holder: Handle<Object>, vrt_offset: u16) -> [u16; GRIP_VERTS] {
    let mut verts = [GRIP_VERT_SENTINEL; GRIP_VERTS];
    let vertex_count = source.vertex_count(holder);
    if vertex_count == 0 {
        return verts;
    }

    let tnc = vertex_count as i32 - vrt_offset as i32;
    if tnc < 0 {
        verts[0] = 0;
        return verts;
    }

    for (i, slot) in verts.iter_mut().enumerate() {
        let candidate = tnc + i as i32;
        if candidate < vertex_count as i32 {
            *slot = candidate as u16;
        }
    }
    verts
}

/// The data that was used to produce an object's current world matrix.
/// Two caches with matching `type_bits`-relevant fields would produce the
/// same matrix, which is what [`needs_update`] tests for.
#[derive(Clone, Debug)]
pub struct MatrixCache {
    pub valid: bool,
    pub matrix_valid: bool,
    pub type_bits: MatrixKind,

    // MAT_WEAPON fields.
    pub grip_holder: Option<Handle<Object>>,
    pub grip_slot: Slot,
    pub grip_verts: [u16; GRIP_VERTS],
    pub grip_scale: Vector3<f32>,

    // MAT_CHARACTER fields.
    pub rotate: Angles,
    pub pos: Vector3<f32>,

    // Shared.
    pub self_scale: Vector3<f32>,
}

impl Default for MatrixCache {
    fn default() -> MatrixCache {
        MatrixCache {
            valid: false,
            matrix_valid: false,
            type_bits: MatrixKind::empty(),
            grip_holder: None,
            grip_slot: Slot::Left,
            grip_verts: [GRIP_VERT_SENTINEL; GRIP_VERTS],
            grip_scale: Vector3::new(1.0, 1.0, 1.0),
            rotate: Angles::zero(),
            pos: Vector3::zero(),
            self_scale: Vector3::new(1.0, 1.0, 1.0),
        }
    }
}

impl PartialEq for MatrixCache {
    fn eq(&self, rhs: &MatrixCache) -> bool {
        if !self.valid || !rhs.valid {
            return false;
        }
        if self.type_bits != rhs.type_bits {
            return false;
        }

        if self.type_bits.contains(MatrixKind::WEAPON) {
            if self.grip_holder != rhs.grip_holder || self.grip_slot != rhs.grip_slot || self.grip_verts != rhs.grip_verts || self.grip_scale != rhs.grip_scale {
                return false;
            }
        }

        if self.type_bits.contains(MatrixKind::CHARACTER) && (self.rotate != rhs.rotate || self.pos != rhs.pos) {
            return false;
        }

        if !self.type_bits.is_empty() && self.self_scale != rhs.self_scale {
            return false;
        }

        true
    }
}

/// Per-vertex pose cache for a posed model, tracking which interpolated
/// frame pair and lip the currently cached vertex buffer was built for.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct VertexListCache {
    pub valid: bool,
    pub src: u32,
    pub tgt: u32,
    pub flip: f32,
    pub vmin: i32,
    pub vmax: i32,
}

/// Whether a posed-vertex resample is needed for the given frame pair, lip,
/// and requested vertex range, mirroring the skinning update's
/// `needs_update(vmin, vmax)` check. Returns `None` when the cache already
/// covers the request (no resample needed), or `Some` with the cache state
/// to write back — the union of old and new ranges if the animation state
/// hasn't changed, or the new range alone if it has.
pub fn vertex_list_needs_update(cache: &VertexListCache, src: u32, tgt: u32, flip: f32, vmin: i32, vmax: i32) -> Option<VertexListCache> {
    let same_frame = cache.valid && cache.src == src && cache.tgt == tgt;

    if same_frame && (cache.flip - flip).abs() <= super::animation::FLIP_TOLERANCE && vmin >= cache.vmin && vmax <= cache.vmax {
        return None;
    }

    let (new_vmin, new_vmax) = if same_frame { (cache.vmin.min(vmin), cache.vmax.max(vmax)) } else { (vmin, vmax) };

    Some(VertexListCache {
        valid: true,
        src,
        tgt,
        flip,
        vmin: new_vmin,
        vmax: new_vmax,
    })
}

/// Floor-reflection matrix: negates the z row's x/y contributions and maps
/// translation-Z to `2*floor - z`, so posing a model with this matrix
/// instead of the main one renders its mirror image across `floor`.
pub fn reflection_matrix(main: &Matrix4<f32>, floor: f32) -> Matrix4<f32> {
    let mut m = *main;
    m.x.z = -m.x.z;
    m.y.z = -m.y.z;
    m.w.z = 2.0 * floor - m.w.z;
    m
}

/// Computes the matrix cache that *should* describe `obj` right now,
/// mirroring `chr_get_matrix_cache`. Overlay characters are out of scope;
/// every object is its own `MAT_CHARACTER` target.
pub fn build_matrix_cache(obj: &Object, holder: Option<(Handle<Object>, &Object)>, source: &dyn GripSource) -> MatrixCache {
    let mut mc = MatrixCache {
        self_scale: Vector3::new(obj.scale, obj.scale, obj.scale),
        ..MatrixCache::default()
    };

    let mut target = obj;

    if let Some((holder_handle, holder_obj)) = holder {
        if holder_obj.matrix_cache.matrix_valid {
            mc.valid = true;
            mc.type_bits.insert(MatrixKind::WEAPON);
            mc.grip_holder = Some(holder_handle);
            mc.grip_slot = obj.attached_to.map(|a| a.slot).unwrap_or(Slot::Left);
            mc.grip_verts = get_grip_verts(source, holder_handle, slot_to_grip_offset(mc.grip_slot));
            target = holder_obj;
        }
    }

    mc.valid = true;
    mc.type_bits.insert(MatrixKind::CHARACTER);
    mc.rotate = target.facing;
    mc.pos = target.position;
    mc.grip_scale = Vector3::new(target.scale, target.scale, target.scale);

    mc
}

/// Whether `new_cache` differs from `current` in a way that changes the
/// matrix it would produce, mirroring `matrix_cache_needs_update`.
pub fn needs_update(new_cache: &MatrixCache, current: &MatrixCache) -> bool {
    new_cache != current
}

fn scale_rotate_translate(scale: Vector3<f32>, angles: Angles, pos: Vector3<f32>, body_fixed: bool) -> Matrix4<f32> {
    let rot3 = if body_fixed { angles.mat3_body_fixed() } else { angles.mat3_world_fixed() };
    let mut m = Matrix4::from_nonuniform_scale(scale.x, scale.y, scale.z);
    let rot4 = Matrix4::from(rot3);
    m = rot4 * m;
    m.w.x = pos.x;
    m.w.y = pos.y;
    m.w.z = pos.z;
    m
}

/// Applies a `MAT_CHARACTER` cache to `obj`, mirroring
/// `apply_one_character_matrix`.
pub fn apply_one_character_matrix(obj: &mut Object, mc: &MatrixCache) -> bool {
    if !mc.type_bits.contains(MatrixKind::CHARACTER) {
        return false;
    }

    obj.matrix_cache.matrix_valid = false;

    let body_fixed = !obj.flags.contains(ObjectFlags::STICKY_BUTT);
    obj.world_matrix = scale_rotate_translate(mc.self_scale, mc.rotate, mc.pos, body_fixed);

    obj.matrix_cache = mc.clone();
    obj.matrix_cache.matrix_valid = true;
    true
}

fn matrix_from_four_points(p: [Vector3<f32>; GRIP_VERTS], scale: f32) -> Matrix4<f32> {
    let forward = (p[1] - p[0]);
    let forward = if forward.is_zero() { Vector3::new(1.0, 0.0, 0.0) } else { forward };
    let up = (p[2] - p[0]);
    let up = if up.is_zero() { Vector3::new(0.0, 0.0, 1.0) } else { up };

    let forward = cgmath::InnerSpace::normalize(forward);
    let mut right = cgmath::InnerSpace::cross(up, forward);
    if right.is_zero() {
        right = Vector3::new(0.0, 1.0, 0.0);
    }
    let right = cgmath::InnerSpace::normalize(right);
    let up = cgmath::InnerSpace::normalize(cgmath::InnerSpace::cross(forward, right));

    let mut m = Matrix4::from_cols(
        (right * scale).extend(0.0),
        (up * scale).extend(0.0),
        (forward * scale).extend(0.0),
        p[3].extend(1.0),
    );
    m.w.w = 1.0;
    m
}

/// Applies a `MAT_WEAPON` cache to `weapon`, mirroring
/// `apply_one_weapon_matrix`. `holder` must already have an up-to-date
/// world matrix; `grip_points` are the (already world-space) grip vertex
/// positions resolved via [`GripSource`].
pub fn apply_one_weapon_matrix(weapon: &mut Object, mc: &MatrixCache, grip_points: &[Vector3<f32>]) -> bool {
    if !mc.type_bits.contains(MatrixKind::WEAPON) {
        return false;
    }

    weapon.matrix_cache.matrix_valid = false;

    if grip_points.len() == GRIP_VERTS {
        let mut p = [Vector3::zero(); GRIP_VERTS];
        p.copy_from_slice(grip_points);
        weapon.world_matrix = matrix_from_four_points(p, mc.self_scale.z);
        weapon.position = p[3];
        weapon.matrix_cache = mc.clone();
        weapon.matrix_cache.matrix_valid = true;
        true
    } else if !grip_points.is_empty() {
        weapon.position = grip_points[0];
        let mut hybrid = mc.clone();
        hybrid.type_bits.insert(MatrixKind::CHARACTER);
        hybrid.rotate = weapon.facing;
        hybrid.pos = weapon.position;
        apply_one_character_matrix(weapon, &hybrid)
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Arena;

    struct NoGrips;
    impl GripSource for NoGrips {
        fn vertex_count(&self, _holder: Handle<Object>) -> u16 {
            0
        }
        fn vertex_world_position(&self, _holder: Handle<Object>, _index: u16) -> Option<Vector3<f32>> {
            None
        }
    }

    #[test]
    fn cache_without_holder_is_character_only() {
        let obj = Object::new(Vector3::new(1.0, 2.0, 3.0));
        let mc = build_matrix_cache(&obj, None, &NoGrips);
        assert!(mc.type_bits.contains(MatrixKind::CHARACTER));
        assert!(!mc.type_bits.contains(MatrixKind::WEAPON));
        assert_eq!(mc.pos, obj.position);
    }

    #[test]
    fn identical_caches_do_not_need_update() {
        let obj = Object::new(Vector3::new(0.0, 0.0, 0.0));
        let a = build_matrix_cache(&obj, None, &NoGrips);
        let b = a.clone();
        assert!(!needs_update(&a, &b));
    }

    #[test]
    fn moved_object_requires_an_update() {
        let mut arena: Arena<Object> = Arena::with_capacity(2);
        let _ = arena.insert(Object::new(Vector3::zero()));
        let mut obj = Object::new(Vector3::zero());
        let before = build_matrix_cache(&obj, None, &NoGrips);
        obj.position = Vector3::new(5.0, 0.0, 0.0);
        let after = build_matrix_cache(&obj, None, &NoGrips);
        assert!(needs_update(&after, &before));
    }

    #[test]
    fn applying_character_matrix_marks_cache_valid() {
        let mut obj = Object::new(Vector3::new(0.0, 0.0, 0.0));
        let mc = build_matrix_cache(&obj, None, &NoGrips);
        assert!(apply_one_character_matrix(&mut obj, &mc));
        assert!(obj.matrix_cache.matrix_valid);
    }

    #[test]
    fn vertex_cache_skips_update_when_range_already_covered() {
        let cache = VertexListCache { valid: true, src: 1, tgt: 2, flip: 0.5, vmin: 0, vmax: 10 };
        assert_eq!(vertex_list_needs_update(&cache, 1, 2, 0.5, 2, 8), None);
    }

    #[test]
    fn vertex_cache_unions_range_on_partial_overlap() {
        let cache = VertexListCache { valid: true, src: 1, tgt: 2, flip: 0.5, vmin: 0, vmax: 10 };
        let updated = vertex_list_needs_update(&cache, 1, 2, 0.5, 5, 15).unwrap();
        assert_eq!((updated.vmin, updated.vmax), (0, 15));
    }

    #[test]
    fn vertex_cache_replaces_range_on_animation_change() {
        let cache = VertexListCache { valid: true, src: 1, tgt: 2, flip: 0.5, vmin: 0, vmax: 10 };
        let updated = vertex_list_needs_update(&cache, 3, 4, 0.0, 5, 15).unwrap();
        assert_eq!((updated.src, updated.tgt, updated.vmin, updated.vmax), (3, 4, 5, 15));
    }

    #[test]
    fn reflection_matrix_mirrors_translation_across_floor() {
        let mut main = Matrix4::identity();
        main.w.z = 12.0;
        let reflected = reflection_matrix(&main, 4.0);
        assert_eq!(reflected.w.z, -4.0);
        assert_eq!(reflected.x.z, 0.0);
        assert_eq!(reflected.y.z, 0.0);
    }
}
