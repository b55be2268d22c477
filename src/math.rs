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

//! Shared vector/matrix/bounding-volume math.
//!
//! Column-major throughout; `world = M * local`. Facing is kept internally
//! as `Angles` (degrees) and only converted to/from the spec's 16-bit "turn"
//! units at the crate boundary (see [`Turn`]).

use cgmath::{Deg, InnerSpace, Matrix3, Matrix4, Vector3, Zero};

/// A 16-bit fixed-point angle, as used by the original engine's facing
/// fields. Kept only at I/O boundaries; all internal math uses [`Angles`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub struct Turn(pub u16);

impl Turn {
    pub fn to_deg(self) -> Deg<f32> {
        Deg(self.0 as f32 * 360.0 / 65536.0)
    }

    pub fn from_deg(deg: Deg<f32>) -> Turn {
        let normalized = deg.0.rem_euclid(360.0);
        Turn((normalized * 65536.0 / 360.0) as u16)
    }
}

/// Three Euler-like facing angles in degrees.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Angles {
    pub pitch: Deg<f32>,
    pub roll: Deg<f32>,
    pub yaw: Deg<f32>,
}

impl Angles {
    pub fn zero() -> Angles {
        Angles {
            pitch: Deg(0.0),
            roll: Deg(0.0),
            yaw: Deg(0.0),
        }
    }

    /// Composes a world-fixed (yaw * pitch * roll) rotation matrix.
    pub fn mat3_world_fixed(&self) -> Matrix3<f32> {
        Matrix3::from_angle_z(self.yaw) * Matrix3::from_angle_y(self.pitch)
            * Matrix3::from_angle_x(self.roll)
    }

    /// Composes a body-fixed (roll * pitch * yaw) rotation matrix, used for
    /// characters with `stickyButt` so rotation order tracks the model's
    /// own local axes instead of the world axes.
    pub fn mat3_body_fixed(&self) -> Matrix3<f32> {
        Matrix3::from_angle_x(self.roll) * Matrix3::from_angle_y(self.pitch)
            * Matrix3::from_angle_z(self.yaw)
    }
}

impl std::ops::Add for Angles {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self {
            pitch: self.pitch + other.pitch,
            roll: self.roll + other.roll,
            yaw: self.yaw + other.yaw,
        }
    }
}

/// An axis-aligned plane or arbitrary-normal plane in point-normal form.
///
/// Axis-aligned planes are tagged specially so point-side tests only touch
/// a single component, mirroring the engine's own optimization.
#[derive(Clone, Debug)]
pub struct Hyperplane {
    normal: Vector3<f32>,
    dist: f32,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum PlaneSide {
    Positive,
    Negative,
}

impl Hyperplane {
    pub fn new(normal: Vector3<f32>, dist: f32) -> Hyperplane {
        Hyperplane {
            normal: normal.normalize(),
            dist,
        }
    }

    pub fn normal(&self) -> Vector3<f32> {
        self.normal
    }

    pub fn dist(&self) -> f32 {
        self.dist
    }

    pub fn point_dist(&self, point: Vector3<f32>) -> f32 {
        point.dot(self.normal) - self.dist
    }

    pub fn point_side(&self, point: Vector3<f32>) -> PlaneSide {
        if self.point_dist(point) >= 0.0 {
            PlaneSide::Positive
        } else {
            PlaneSide::Negative
        }
    }
}

/// Axis-aligned bounding box.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb3 {
    pub min: Vector3<f32>,
    pub max: Vector3<f32>,
}

impl Aabb3 {
    pub fn new(min: Vector3<f32>, max: Vector3<f32>) -> Aabb3 {
        Aabb3 { min, max }
    }

    pub fn from_center_radius(center: Vector3<f32>, radius: Vector3<f32>) -> Aabb3 {
        Aabb3 {
            min: center - radius,
            max: center + radius,
        }
    }

    pub fn center(&self) -> Vector3<f32> {
        (self.min + self.max) * 0.5
    }

    pub fn union(&self, other: &Aabb3) -> Aabb3 {
        Aabb3 {
            min: Vector3::new(
                self.min.x.min(other.min.x),
                self.min.y.min(other.min.y),
                self.min.z.min(other.min.z),
            ),
            max: Vector3::new(
                self.max.x.max(other.max.x),
                self.max.y.max(other.max.y),
                self.max.z.max(other.max.z),
            ),
        }
    }

    pub fn translate(&self, offset: Vector3<f32>) -> Aabb3 {
        Aabb3 {
            min: self.min + offset,
            max: self.max + offset,
        }
    }

    pub fn expand(&self, radius: Vector3<f32>) -> Aabb3 {
        Aabb3 {
            min: self.min - radius,
            max: self.max + radius,
        }
    }

    /// Expands the box to cover its swept motion over `velocity * dt`.
    pub fn swept(&self, velocity: Vector3<f32>, dt: f32) -> Aabb3 {
        self.union(&self.translate(velocity * dt))
    }

    pub fn contains(&self, other: &Aabb3) -> bool {
        self.min.x <= other.min.x
            && self.min.y <= other.min.y
            && self.min.z <= other.min.z
            && self.max.x >= other.max.x
            && self.max.y >= other.max.y
            && self.max.z >= other.max.z
    }

    pub fn overlaps(&self, other: &Aabb3) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    pub fn contains_point(&self, point: Vector3<f32>) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
            && point.z >= self.min.z
            && point.z <= self.max.z
    }

    pub fn interpolate(&self, other: &Aabb3, t: f32) -> Aabb3 {
        Aabb3 {
            min: self.min + (other.min - self.min) * t,
            max: self.max + (other.max - self.max) * t,
        }
    }
}

/// An octagonal bounding box: four axis-aligned extents plus four diagonal
/// ("octagonal") extents and a separate Z range. Cheaper than a capsule but
/// a closer fit to a character silhouette than a plain AABB, which is why
/// per-frame character collision volumes use this shape instead of
/// [`Aabb3`].
///
/// The diagonal bounds are measured along the `x+y` and `x-y` directions
/// (unnormalized, i.e. in the same units as `x`/`y` rather than `x*sqrt(2)`),
/// matching the convention of bounding a square rotated 45 degrees.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Obb {
    pub x_min: f32,
    pub x_max: f32,
    pub y_min: f32,
    pub y_max: f32,
    pub xy_min: f32,
    pub xy_max: f32,
    pub yx_min: f32,
    pub yx_max: f32,
    pub z_min: f32,
    pub z_max: f32,
}

impl Obb {
    pub fn from_aabb(aabb: &Aabb3) -> Obb {
        Obb {
            x_min: aabb.min.x,
            x_max: aabb.max.x,
            y_min: aabb.min.y,
            y_max: aabb.max.y,
            xy_min: aabb.min.x + aabb.min.y,
            xy_max: aabb.max.x + aabb.max.y,
            yx_min: aabb.min.x - aabb.max.y,
            yx_max: aabb.max.x - aabb.min.y,
            z_min: aabb.min.z,
            z_max: aabb.max.z,
        }
    }

    pub fn union(&self, other: &Obb) -> Obb {
        Obb {
            x_min: self.x_min.min(other.x_min),
            x_max: self.x_max.max(other.x_max),
            y_min: self.y_min.min(other.y_min),
            y_max: self.y_max.max(other.y_max),
            xy_min: self.xy_min.min(other.xy_min),
            xy_max: self.xy_max.max(other.xy_max),
            yx_min: self.yx_min.min(other.yx_min),
            yx_max: self.yx_max.max(other.yx_max),
            z_min: self.z_min.min(other.z_min),
            z_max: self.z_max.max(other.z_max),
        }
    }

    pub fn translate(&self, offset: Vector3<f32>) -> Obb {
        let xy = offset.x + offset.y;
        let yx = offset.x - offset.y;
        Obb {
            x_min: self.x_min + offset.x,
            x_max: self.x_max + offset.x,
            y_min: self.y_min + offset.y,
            y_max: self.y_max + offset.y,
            xy_min: self.xy_min + xy,
            xy_max: self.xy_max + xy,
            yx_min: self.yx_min + yx,
            yx_max: self.yx_max + yx,
            z_min: self.z_min + offset.z,
            z_max: self.z_max + offset.z,
        }
    }

    pub fn interpolate(&self, other: &Obb, t: f32) -> Obb {
        macro_rules! lerp {
            ($field:ident) => {
                self.$field + (other.$field - self.$field) * t
            };
        }

        Obb {
            x_min: lerp!(x_min),
            x_max: lerp!(x_max),
            y_min: lerp!(y_min),
            y_max: lerp!(y_max),
            xy_min: lerp!(xy_min),
            xy_max: lerp!(xy_max),
            yx_min: lerp!(yx_min),
            yx_max: lerp!(yx_max),
            z_min: lerp!(z_min),
            z_max: lerp!(z_max),
        }
    }

    pub fn to_aabb(&self) -> Aabb3 {
        Aabb3::new(
            Vector3::new(self.x_min, self.y_min, self.z_min),
            Vector3::new(self.x_max, self.y_max, self.z_max),
        )
    }

    pub fn overlaps(&self, other: &Obb) -> bool {
        self.x_min <= other.x_max
            && self.x_max >= other.x_min
            && self.y_min <= other.y_max
            && self.y_max >= other.y_min
            && self.xy_min <= other.xy_max
            && self.xy_max >= other.xy_min
            && self.yx_min <= other.yx_max
            && self.yx_max >= other.yx_min
            && self.z_min <= other.z_max
            && self.z_max >= other.z_min
    }
}

pub fn bounds<'a, I>(points: I) -> (Vector3<f32>, Vector3<f32>)
where
    I: IntoIterator<Item = &'a Vector3<f32>>,
{
    let mut min = Vector3::new(f32::MAX, f32::MAX, f32::MAX);
    let mut max = Vector3::new(f32::MIN, f32::MIN, f32::MIN);
    for p in points.into_iter() {
        min.x = p.x.min(min.x);
        min.y = p.y.min(min.y);
        min.z = p.z.min(min.z);
        max.x = p.x.max(max.x);
        max.y = p.y.max(max.y);
        max.z = p.z.max(max.z);
    }
    (min, max)
}

/// Clamps `val` into `[min, max]`.
pub fn clamp(val: f32, min: f32, max: f32) -> f32 {
    debug_assert!(min <= max);
    val.max(min).min(max)
}

pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

pub fn vec3_zero() -> Vector3<f32> {
    Vector3::zero()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_roundtrips_through_degrees() {
        let t = Turn(16384); // a quarter turn, 90 degrees
        let deg = t.to_deg();
        assert!((deg.0 - 90.0).abs() < 0.01);
        assert_eq!(Turn::from_deg(deg).0, t.0);
    }

    #[test]
    fn aabb_union_covers_both() {
        let a = Aabb3::new(Vector3::new(0.0, 0.0, 0.0), Vector3::new(1.0, 1.0, 1.0));
        let b = Aabb3::new(Vector3::new(-1.0, 2.0, 0.5), Vector3::new(0.5, 3.0, 2.0));
        let u = a.union(&b);
        assert_eq!(u.min, Vector3::new(-1.0, 0.0, 0.0));
        assert_eq!(u.max, Vector3::new(1.0, 3.0, 2.0));
    }

    #[test]
    fn aabb_overlaps_detects_separation() {
        let a = Aabb3::new(Vector3::new(0.0, 0.0, 0.0), Vector3::new(1.0, 1.0, 1.0));
        let b = Aabb3::new(Vector3::new(2.0, 2.0, 2.0), Vector3::new(3.0, 3.0, 3.0));
        assert!(!a.overlaps(&b));
        let c = Aabb3::new(Vector3::new(0.5, 0.5, 0.5), Vector3::new(1.5, 1.5, 1.5));
        assert!(a.overlaps(&c));
    }

    #[test]
    fn obb_from_degenerate_aabb_is_a_point() {
        let p = Vector3::new(3.0, -2.0, 5.0);
        let aabb = Aabb3::new(p, p);
        let obb = Obb::from_aabb(&aabb);
        assert_eq!(obb.x_min, obb.x_max);
        assert_eq!(obb.xy_min, obb.xy_max);
    }

    #[test]
    fn hyperplane_point_side() {
        let plane = Hyperplane::new(Vector3::new(1.0, 0.0, 0.0), 1.0);
        assert_eq!(
            plane.point_side(Vector3::new(2.0, 0.0, 0.0)),
            PlaneSide::Positive
        );
        assert_eq!(
            plane.point_side(Vector3::new(0.0, 0.0, 0.0)),
            PlaneSide::Negative
        );
    }
}
