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

//! Character/actor state: authoritative transform, collision volumes, and
//! the animation/matrix-cache pipeline that derives a world matrix from
//! them.

pub mod animation;
pub mod matrix_cache;

use cgmath::{Matrix4, SquareMatrix as _, Vector3, Zero as _};

use crate::alloc::Handle;
use crate::interfaces::DamageType;
use crate::math::{Angles, Obb};

pub use animation::AnimationState;
pub use matrix_cache::{MatrixCache, VertexListCache};

bitflags::bitflags! {
    #[derive(Default)]
    pub struct ObjectFlags: u32 {
        const ALIVE       = 0b0000_0000_0001;
        const HIDDEN      = 0b0000_0000_0010;
        const FLYING      = 0b0000_0000_0100;
        const ATTACHED    = 0b0000_0000_1000;
        const PLATFORM    = 0b0000_0001_0000;
        const MOUNT       = 0b0000_0010_0000;
        const STEALTHED   = 0b0000_0100_0000;
        const INVINCIBLE  = 0b0000_1000_0000;
        const STICKY_BUTT = 0b0001_0000_0000;
    }
}

/// Left/right hand attachment slots, mirroring `SLOT_COUNT` in the
/// original source.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Slot {
    Left,
    Right,
}

pub const GRIP_VERTS: usize = 4;

/// Vertex-grip offset a slot maps to, used to derive the four grip vertex
/// indices for weapon matrix construction (`slot_to_grip_offset` in the
/// original source).
pub fn slot_to_grip_offset(slot: Slot) -> u16 {
    match slot {
        Slot::Left => GRIP_VERTS as u16,
        Slot::Right => (2 * GRIP_VERTS) as u16,
    }
}

/// What an object is currently attached to, and where.
#[derive(Copy, Clone, Debug)]
pub struct Attachment {
    pub holder: Handle<Object>,
    pub slot: Slot,
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Holding {
    pub left: Option<Handle<Object>>,
    pub right: Option<Handle<Object>>,
}

/// A live character/actor.
pub struct Object {
    pub position: Vector3<f32>,
    pub velocity: Vector3<f32>,
    pub position_old: Vector3<f32>,
    pub velocity_old: Vector3<f32>,
    pub facing: Angles,
    pub scale: f32,
    pub team: u8,

    pub hitpoints: i32,
    pub hitpoints_max: i32,
    pub mana: i32,
    pub mana_max: i32,

    /// Attacker-side knockback scaling; see `collision::knockback_factor`.
    pub might: f32,
    /// Defender-side dodge scaling; see `collision::dodge_check`.
    pub agility: f32,
    /// Defender-side knockback scaling; see `collision::knockback_factor`.
    pub mass: f32,
    /// If set, a bump from a particle of this damage type reaffirms (renews)
    /// every particle attached to this object.
    pub reaffirm_damage_type: Option<DamageType>,

    pub flags: ObjectFlags,

    pub attached_to: Option<Attachment>,
    pub holding: Holding,

    /// Tight collision volume.
    pub chr_min_cv: Obb,
    /// Padded collision volume.
    pub chr_max_cv: Obb,

    pub animation: AnimationState,
    pub matrix_cache: MatrixCache,
    pub vertex_list_cache: VertexListCache,

    /// Derived world transform; valid iff `matrix_cache.valid` and every
    /// holder ancestor's matrix is also valid.
    pub world_matrix: Matrix4<f32>,

    pub bore_timer: i32,
}

impl Object {
    pub fn new(position: Vector3<f32>) -> Object {
        Object {
            position,
            velocity: Vector3::zero(),
            position_old: position,
            velocity_old: Vector3::zero(),
            facing: Angles::zero(),
            scale: 1.0,
            team: 0,
            hitpoints: 1,
            hitpoints_max: 1,
            mana: 0,
            mana_max: 0,
            might: 10.0,
            agility: 10.0,
            mass: 1.0,
            reaffirm_damage_type: None,
            flags: ObjectFlags::ALIVE,
            attached_to: None,
            holding: Holding::default(),
            chr_min_cv: Obb::from_aabb(&crate::math::Aabb3::from_center_radius(position, Vector3::new(8.0, 8.0, 20.0))),
            chr_max_cv: Obb::from_aabb(&crate::math::Aabb3::from_center_radius(position, Vector3::new(16.0, 16.0, 40.0))),
            animation: AnimationState::new(),
            matrix_cache: MatrixCache::default(),
            vertex_list_cache: VertexListCache::default(),
            world_matrix: Matrix4::identity(),
            bore_timer: 0,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.flags.contains(ObjectFlags::ALIVE)
    }

    pub fn is_held(&self) -> bool {
        self.attached_to.is_some()
    }

    /// Host-driven skinning hook: checks whether posed vertices in
    /// `[vmin, vmax]` need resampling for the object's current animation
    /// state, updating `vertex_list_cache` if so. Returns `true` when the
    /// host should recompute posed vertex data before reading it; actual
    /// vertex interpolation is a model/render concern outside this crate.
    pub fn refresh_vertex_cache(&mut self, vmin: i32, vmax: i32) -> bool {
        match matrix_cache::vertex_list_needs_update(&self.vertex_list_cache, self.animation.src, self.animation.tgt, self.animation.flip, vmin, vmax) {
            Some(updated) => {
                self.vertex_list_cache = updated;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_object_needs_a_vertex_cache_refresh() {
        let mut obj = Object::new(Vector3::zero());
        assert!(obj.refresh_vertex_cache(0, 10));
        assert!(obj.vertex_list_cache.valid);
    }

    #[test]
    fn unchanged_animation_state_skips_a_covered_refresh() {
        let mut obj = Object::new(Vector3::zero());
        assert!(obj.refresh_vertex_cache(0, 10));
        assert!(!obj.refresh_vertex_cache(2, 8));
    }
}
