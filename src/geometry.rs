//! Integer geometry and toroidal coordinate arithmetic.
//!
//! Everything in this module is dimension-generic over a const `D` so the
//! same code serves the 2D case the rest of the crate exercises and any
//! higher-dimensional world the application chooses to build. [`IntPoint`]
//! is an N-tuple of integers with element-wise arithmetic and toroidal
//! reduction; [`IntHyperRect`] is a half-open axis-aligned box `[ul, br)`
//! with a stable id; [`AreaOfInterest`] is the per-dimension halo thickness.

use serde::{Deserialize, Serialize};
use std::ops::{Add, Sub};

/// An N-tuple of integer coordinates.
///
/// Supports element-wise addition/subtraction ("shift right"/"shift left" in
/// the original design's terms) and toroidal reduction against a world size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntPoint<const D: usize>(pub [i64; D]);

impl<const D: usize> IntPoint<D> {
    /// Build a point from raw coordinates.
    #[must_use]
    pub fn new(coords: [i64; D]) -> Self {
        Self(coords)
    }

    /// The zero point.
    #[must_use]
    pub fn origin() -> Self {
        Self([0; D])
    }

    /// Coordinate along dimension `dim`.
    #[must_use]
    pub fn get(&self, dim: usize) -> i64 {
        self.0[dim]
    }

    /// Translate by `delta` (the "shift right" operation).
    #[must_use]
    pub fn shr(&self, delta: &IntPoint<D>) -> Self {
        *self + *delta
    }

    /// Translate by `-delta` (the "shift left" operation).
    #[must_use]
    pub fn shl(&self, delta: &IntPoint<D>) -> Self {
        *self - *delta
    }

    /// Reduce a coordinate into `[0, size)` per dimension: `((x mod size) +
    /// size) mod size`. `size` must be strictly positive in every dimension.
    #[must_use]
    pub fn wrap(&self, size: &IntPoint<D>) -> Self {
        let mut out = [0i64; D];
        for i in 0..D {
            let s = size.0[i];
            out[i] = ((self.0[i] % s) + s) % s;
        }
        Self(out)
    }

    /// Toroidal difference along a single dimension: the signed distance
    /// from `self` to `other` along the shortest arc of a ring of the given
    /// `size`, per §4.1.
    #[must_use]
    pub fn toroidal_diff_dim(x1: i64, x2: i64, size: i64) -> i64 {
        if (x1 - x2).abs() <= size / 2 {
            return x1 - x2;
        }
        let torus = |x: i64| ((x % size) + size) % size;
        let dx = torus(x1) - torus(x2);
        if 2 * dx > size {
            dx - size
        } else if 2 * dx < -size {
            dx + size
        } else {
            dx
        }
    }

    /// Toroidal difference across every dimension.
    #[must_use]
    pub fn toroidal_diff(&self, other: &IntPoint<D>, size: &IntPoint<D>) -> IntPoint<D> {
        let mut out = [0i64; D];
        for i in 0..D {
            out[i] = Self::toroidal_diff_dim(self.0[i], other.0[i], size.0[i]);
        }
        IntPoint(out)
    }
}

impl<const D: usize> Add for IntPoint<D> {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        let mut out = [0i64; D];
        for i in 0..D {
            out[i] = self.0[i] + rhs.0[i];
        }
        Self(out)
    }
}

impl<const D: usize> Sub for IntPoint<D> {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        let mut out = [0i64; D];
        for i in 0..D {
            out[i] = self.0[i] - rhs.0[i];
        }
        Self(out)
    }
}

/// Per-dimension non-negative halo thickness.
///
/// Invariant enforced by [`crate::halo::HaloField`]: every partition's
/// interior is at least `2 * aoi` in each dimension so the private
/// sub-region (the partition shrunk by the aoi) is non-empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AreaOfInterest<const D: usize>(pub [u32; D]);

impl<const D: usize> AreaOfInterest<D> {
    /// Build an AOI from raw per-dimension thicknesses.
    #[must_use]
    pub fn new(thickness: [u32; D]) -> Self {
        Self(thickness)
    }

    /// The AOI expressed as a signed [`IntPoint`] delta, for use with
    /// [`IntHyperRect::resize`].
    #[must_use]
    pub fn as_point(&self) -> IntPoint<D> {
        let mut out = [0i64; D];
        for i in 0..D {
            out[i] = i64::from(self.0[i]);
        }
        IntPoint(out)
    }
}

/// An axis-aligned integer hyperrectangle `[ul, br)` with a stable id.
///
/// The world rectangle always has id `-1`. Coordinates follow the numpy/PIL
/// convention: `ul` (upper-left) is inclusive, `br` (bottom-right) is
/// exclusive, so `size()[i] = br[i] - ul[i]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntHyperRect<const D: usize> {
    /// Stable identifier; `-1` denotes the world rectangle.
    pub id: i64,
    /// Inclusive lower (upper-left) corner.
    pub ul: IntPoint<D>,
    /// Exclusive upper (bottom-right) corner.
    pub br: IntPoint<D>,
}

impl<const D: usize> IntHyperRect<D> {
    /// Construct a rectangle from corners.
    #[must_use]
    pub fn new(id: i64, ul: IntPoint<D>, br: IntPoint<D>) -> Self {
        Self { id, ul, br }
    }

    /// Per-dimension extent (`br - ul`).
    #[must_use]
    pub fn size(&self) -> IntPoint<D> {
        self.br - self.ul
    }

    /// Total number of cells covered (product of `size()`); zero if any
    /// dimension has collapsed to non-positive extent.
    #[must_use]
    pub fn area(&self) -> i64 {
        let s = self.size();
        if (0..D).any(|i| s.0[i] <= 0) {
            return 0;
        }
        s.0.iter().product()
    }

    /// Whether `point` lies within `[ul, br)`.
    #[must_use]
    pub fn contains(&self, point: &IntPoint<D>) -> bool {
        (0..D).all(|i| point.0[i] >= self.ul.0[i] && point.0[i] < self.br.0[i])
    }

    /// Whether `self` and `other` share any cell.
    #[must_use]
    pub fn intersects(&self, other: &IntHyperRect<D>) -> bool {
        self.intersection(other).is_some()
    }

    /// The overlapping sub-rectangle, or `None` if the rectangles are
    /// disjoint in any dimension. The returned rectangle inherits `self`'s id.
    #[must_use]
    pub fn intersection(&self, other: &IntHyperRect<D>) -> Option<IntHyperRect<D>> {
        let mut ul = [0i64; D];
        let mut br = [0i64; D];
        for i in 0..D {
            ul[i] = self.ul.0[i].max(other.ul.0[i]);
            br[i] = self.br.0[i].min(other.br.0[i]);
            if br[i] <= ul[i] {
                return None;
            }
        }
        Some(IntHyperRect {
            id: self.id,
            ul: IntPoint(ul),
            br: IntPoint(br),
        })
    }

    /// Translate both corners by `delta`.
    #[must_use]
    pub fn shift(&self, delta: &IntPoint<D>) -> IntHyperRect<D> {
        IntHyperRect {
            id: self.id,
            ul: self.ul + *delta,
            br: self.br + *delta,
        }
    }

    /// Expand (positive `amount`) or shrink (negative) every side by
    /// `amount` per dimension: `ul -= amount`, `br += amount`.
    #[must_use]
    pub fn resize(&self, amount: &IntPoint<D>) -> IntHyperRect<D> {
        IntHyperRect {
            id: self.id,
            ul: self.ul - *amount,
            br: self.br + *amount,
        }
    }

    /// Expand by an [`AreaOfInterest`].
    #[must_use]
    pub fn expand_by_aoi(&self, aoi: &AreaOfInterest<D>) -> IntHyperRect<D> {
        self.resize(&aoi.as_point())
    }

    /// Shrink by an [`AreaOfInterest`] (the private partition).
    #[must_use]
    pub fn shrink_by_aoi(&self, aoi: &AreaOfInterest<D>) -> IntHyperRect<D> {
        let neg = aoi.as_point();
        self.resize(&IntPoint(neg.0.map(|v| -v)))
    }

    /// Flatten a point known to lie in `self` to a row-major index.
    ///
    /// # Panics
    ///
    /// Panics (in debug builds) if `point` is outside `self`; callers must
    /// check [`Self::contains`] first.
    #[must_use]
    pub fn flatten(&self, point: &IntPoint<D>) -> usize {
        debug_assert!(self.contains(point), "point outside rectangle");
        let size = self.size();
        let mut idx: i64 = 0;
        for i in 0..D {
            idx = idx * size.0[i] + (point.0[i] - self.ul.0[i]);
        }
        idx as usize
    }

    /// Enumerate every world-shifted copy of `self` under toroidal topology:
    /// `self` translated by each of `3^D` combinations of `{-size, 0, size}`
    /// per dimension (including the identity shift).
    #[must_use]
    pub fn toroidal_shifts(&self, world_size: &IntPoint<D>) -> Vec<IntHyperRect<D>> {
        let mut shifts = vec![[0i64; D]];
        for dim in 0..D {
            let mut next = Vec::with_capacity(shifts.len() * 3);
            for base in &shifts {
                for mult in [-1i64, 0, 1] {
                    let mut s = *base;
                    s[dim] = mult * world_size.0[dim];
                    next.push(s);
                }
            }
            shifts = next;
        }
        shifts
            .into_iter()
            .map(|delta| self.shift(&IntPoint(delta)))
            .collect()
    }
}

/// 2D convenience aliases; the common case exercised by the test suite.
pub type Point2 = IntPoint<2>;
pub type Rect2 = IntHyperRect<2>;
pub type Aoi2 = AreaOfInterest<2>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_reduces_into_range() {
        let size = Point2::new([100, 100]);
        assert_eq!(Point2::new([150, -10]).wrap(&size), Point2::new([50, 90]));
        assert_eq!(Point2::new([0, 0]).wrap(&size), Point2::new([0, 0]));
    }

    #[test]
    fn toroidal_diff_takes_shorter_arc() {
        // size 100: going from 5 to 95 the short way is -10, not 90.
        let d = Point2::toroidal_diff_dim(5, 95, 100);
        assert_eq!(d, 10);
        let d = Point2::toroidal_diff_dim(95, 5, 100);
        assert_eq!(d, -10);
    }

    #[test]
    fn intersection_is_none_when_disjoint() {
        let a = Rect2::new(0, Point2::new([0, 0]), Point2::new([10, 10]));
        let b = Rect2::new(1, Point2::new([10, 0]), Point2::new([20, 10]));
        assert!(a.intersection(&b).is_none());
    }

    #[test]
    fn resize_expands_and_shrinks() {
        let r = Rect2::new(0, Point2::new([10, 10]), Point2::new([20, 20]));
        let aoi = Aoi2::new([2, 2]);
        let expanded = r.expand_by_aoi(&aoi);
        assert_eq!(expanded.ul, Point2::new([8, 8]));
        assert_eq!(expanded.br, Point2::new([22, 22]));
        let shrunk = r.shrink_by_aoi(&aoi);
        assert_eq!(shrunk.ul, Point2::new([12, 12]));
        assert_eq!(shrunk.br, Point2::new([18, 18]));
    }

    #[test]
    fn flatten_is_row_major() {
        // Last dimension is contiguous: for a [4,3]-size rect, stepping the
        // first coordinate moves by the row stride (3), stepping the second
        // moves by 1.
        let r = Rect2::new(0, Point2::new([0, 0]), Point2::new([4, 3]));
        assert_eq!(r.flatten(&Point2::new([0, 0])), 0);
        assert_eq!(r.flatten(&Point2::new([1, 0])), 3);
        assert_eq!(r.flatten(&Point2::new([0, 1])), 1);
    }

    #[test]
    fn toroidal_shifts_count_is_3_pow_d() {
        let r = Rect2::new(0, Point2::new([0, 0]), Point2::new([10, 10]));
        let shifts = r.toroidal_shifts(&Point2::new([100, 100]));
        assert_eq!(shifts.len(), 9);
    }
}
