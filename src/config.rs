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

//! Tunable constants, centralized the way the original engine's global
//! physics/environment table centralizes them, minus the console that would
//! normally let a player change them at runtime (out of scope).

use chrono::Duration;

/// World-wide physics constants, grounded on
/// `Ego::Physics::g_environment` and `PhysicalConstants.hpp`.
#[derive(Copy, Clone, Debug)]
pub struct Environment {
    pub gravity: f32,
    pub airfriction: f32,
    pub waterfriction: f32,
    pub noslipfriction: f32,
    pub slippyfriction: f32,
    pub hillslide: f32,
}

impl Default for Environment {
    fn default() -> Environment {
        Environment {
            gravity: -1.0,
            airfriction: 0.9868,
            waterfriction: 0.8,
            noslipfriction: 0.9950,
            slippyfriction: 1.0,
            hillslide: 1.0,
        }
    }
}

/// Top-level simulation tunables.
#[derive(Clone, Debug)]
pub struct SimConfig {
    pub environment: Environment,

    /// Fixed simulation tick length; the engine advances in quanta of this
    /// regardless of render frame rate.
    pub tick: Duration,

    /// BSP tree dimensionality. 3 for ordinary spatial queries.
    pub bsp_dim: usize,

    /// BSP tree maximum depth.
    pub bsp_max_depth: usize,

    /// Particle vertical speed below which a bounce is treated as settled,
    /// per `STOPBOUNCINGPART`.
    pub stop_bouncing_part: f32,

    /// Z-tolerance for platform attachment, per `PLATTOLERANCE`.
    pub plat_tolerance: f32,

    /// Velocity clamp applied after knockback, per `MAX_KNOCKBACK_VELOCITY`.
    pub max_knockback_velocity: f32,

    /// Fraction of a platform's stickiness subtracted from floor friction,
    /// per `PLATFORM_STICKINESS`.
    pub platform_stickiness: f32,

    /// Tolerance band for matching `real_flip` to `integer_flip / 4`.
    pub flip_tolerance: f32,

    /// Seed for the shared RNG; fixed so identical inputs reproduce
    /// identical simulation state.
    pub rng_seed: u64,
}

impl Default for SimConfig {
    fn default() -> SimConfig {
        SimConfig {
            environment: Environment::default(),
            tick: Duration::milliseconds(20),
            bsp_dim: 3,
            bsp_max_depth: 6,
            stop_bouncing_part: 10.0,
            plat_tolerance: 50.0,
            max_knockback_velocity: 40.0,
            platform_stickiness: 0.1,
            flip_tolerance: 0.125,
            rng_seed: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tick_is_fifty_hertz() {
        let cfg = SimConfig::default();
        assert_eq!(cfg.tick, Duration::milliseconds(20));
    }
}
