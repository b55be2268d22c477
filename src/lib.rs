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

//! Runtime simulation core for a 3D action-RPG engine: spatial indexing,
//! particle simulation, object animation/matrix derivation, and
//! character-particle collision resolution.
//!
//! A host embeds this crate by implementing the collaborator traits in
//! [`interfaces`] (and [`object::matrix_cache::GripSource`] /
//! [`object::animation::ActionSource`] where it owns model data) and
//! driving a [`world::World`] with one `tick()` per fixed step.

pub mod alloc;
pub mod bsp;
pub mod collision;
pub mod config;
pub mod error;
pub mod interfaces;
pub mod math;
pub mod object;
pub mod particle;
#[cfg(test)]
mod test_support;
pub mod world;

pub use config::SimConfig;
pub use error::{SimError, SimErrorKind, SimResult};
pub use world::World;
