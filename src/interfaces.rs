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

//! Contracts for the systems surrounding the simulation core: mesh sampling,
//! object lookup, damage application, audio and billboard side effects.
//!
//! None of these are implemented here; a host embeds the crate by providing
//! types implementing these traits. This keeps renderer, asset loader,
//! scripting VM, and networking entirely out of this crate, matching the
//! collaborator boundary the original engine draws around its own
//! equivalents.

use cgmath::Vector3;

use crate::alloc::Handle;
use crate::object::Object;

bitflags::bitflags! {
    /// Mesh tile flags tested by `hit_wall`/`test_wall`/`test_fx`.
    pub struct MeshFx: u32 {
        const IMPASS = 0b0000_0001;
        const WALL   = 0b0000_0010;
        const SLIPPY = 0b0000_0100;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TwistCode(pub u8);

impl TwistCode {
    pub const FLAT: TwistCode = TwistCode(0);
}

/// Consumed by particle and object physics to sample the surrounding mesh.
pub trait MeshSampler {
    /// Elevation of the mesh under `(x, y)`.
    fn elevation(&self, x: f32, y: f32) -> f32;

    /// Per-tile twist code, used to look up a floor normal.
    fn twist(&self, tile: u32) -> TwistCode;

    /// Floor normal for a twist code (flat = `+Z`).
    fn twist_normal(&self, twist: TwistCode) -> Vector3<f32>;

    /// Tests a point against wall geometry; returns the contact normal and
    /// penetration pressure if the point is inside `stoppedby` flagged
    /// tiles.
    fn hit_wall(&self, pos: Vector3<f32>, radius: f32, stoppedby: MeshFx) -> Option<(Vector3<f32>, f32)>;

    /// Like `hit_wall` but only reports whether contact occurred.
    fn test_wall(&self, pos: Vector3<f32>, radius: f32, stoppedby: MeshFx) -> bool {
        self.hit_wall(pos, radius, stoppedby).is_some()
    }

    fn test_fx(&self, tile: u32, flags: MeshFx) -> bool;

    fn grid_is_valid(&self, tile: u32) -> bool;

    fn tile_at(&self, x: f32, y: f32) -> u32;

    fn is_water(&self, tile: u32) -> bool;
}

/// Consumed wherever objects need to look up or enumerate other objects.
pub trait ObjectHandler {
    fn get(&self, handle: Handle<Object>) -> Option<&Object>;

    fn get_mut(&mut self, handle: Handle<Object>) -> Option<&mut Object>;

    fn contains(&self, handle: Handle<Object>) -> bool {
        self.get(handle).is_some()
    }

    /// Radius search around `(x, y)` used by homing target acquisition and
    /// gravity-pull profiles.
    fn find_nearby(&self, x: f32, y: f32, radius: f32) -> Vec<Handle<Object>>;

    /// Optional hook for `endspawn_characterstate`: spawn a game object in
    /// the given initial state when a particle retires. A host that
    /// doesn't support scripted character states can leave this a no-op.
    fn spawn_character_state(&mut self, _state: i32, _at: Vector3<f32>) -> Option<Handle<Object>> {
        None
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DamageType {
    Slash,
    Crush,
    Poke,
    Holy,
    Evil,
    Fire,
    Ice,
    Zap,
}

/// Consumed by collision resolution to apply damage to an object.
pub trait DamageSystem {
    /// Applies damage to `target`, returning the amount actually dealt
    /// (after target-side mitigation the damage system itself tracks).
    #[allow(clippy::too_many_arguments)]
    fn damage(
        &mut self,
        target: Handle<Object>,
        direction: Vector3<f32>,
        base: i32,
        rand: i32,
        kind: DamageType,
        team: u8,
        owner: Option<Handle<Object>>,
        armor_piercing: bool,
        time_bypass: bool,
        friendly_fire: bool,
    ) -> i32;
}

/// Consumed to play a one-shot sound effect at a world position.
pub trait AudioSink {
    fn play_sound(&mut self, pos: Vector3<f32>, sound_id: u32);
}

bitflags::bitflags! {
    pub struct BillboardFlags: u32 {
        const FADE_OUT = 0b0000_0001;
        const RANDOM_OFFSET = 0b0000_0010;
    }
}

/// Consumed to spawn a floating text billboard (damage numbers, "Blocked!",
/// "Deflected!").
pub trait BillboardSink {
    fn make_billboard(&mut self, obj: Handle<Object>, text: &str, color: [f32; 4], tint: [f32; 4], lifetime_seconds: f32, flags: BillboardFlags);
}
