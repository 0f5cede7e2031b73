//! Dense per-cell storage over a hyperrectangle.
//!
//! Two concrete strategies, matching the original design's "deep
//! inheritance... maps to a generic grid storage parameterized by element
//! type plus one variant per storage strategy" (see `DESIGN.md`):
//!
//! - [`NumericGrid<T>`] -- a contiguous `Vec<T>` for primitive numeric cells,
//!   with zero-copy packing of contiguous spans and a strided fallback for
//!   non-contiguous sub-rects.
//! - [`ObjectGrid<T>`] -- a `Vec<Option<T>>` for opaque application objects,
//!   packed/unpacked via `serde`+`postcard` rather than raw byte layout.
//!
//! Both implement the shared [`GridStorage`] trait so [`crate::halo::HaloField`]
//! can be generic over the storage strategy.

use crate::error::{CoreError, CoreResult};
use crate::geometry::IntHyperRect;
use serde::{de::DeserializeOwned, Serialize};

/// A numeric cell type packable as a fixed-width little-endian byte span.
pub trait NumericCell: Copy + Default + Send + Sync + 'static {
    /// Width in bytes of the encoded form.
    const WIDTH: usize;
    /// Encode into little-endian bytes, appended to `out`.
    fn write_le(&self, out: &mut Vec<u8>);
    /// Decode from a little-endian byte span of exactly `WIDTH` bytes.
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_numeric_cell {
    ($t:ty, $width:literal) => {
        impl NumericCell for $t {
            const WIDTH: usize = $width;
            fn write_le(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }
            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; $width];
                buf.copy_from_slice(bytes);
                <$t>::from_le_bytes(buf)
            }
        }
    };
}

impl_numeric_cell!(i32, 4);
impl_numeric_cell!(u32, 4);
impl_numeric_cell!(i64, 8);
impl_numeric_cell!(u64, 8);
impl_numeric_cell!(f32, 4);
impl_numeric_cell!(f64, 8);
impl_numeric_cell!(u8, 1);

/// Shared interface over a dense storage strategy bound to a rectangle.
///
/// `pack`/`unpack` take a *list* of sub-rectangles so a halo send/receive
/// spanning several disjoint toroidal-wrap pieces can be packed into a
/// single buffer in one call, per §4.2.
pub trait GridStorage<const D: usize>: Sized {
    /// Element type stored per cell.
    type Elem;

    /// Allocate a zeroed/empty storage over `rect`.
    fn new_storage(rect: IntHyperRect<D>) -> Self;

    /// The rectangle this storage is addressed against.
    fn rect(&self) -> &IntHyperRect<D>;

    /// Read the cell at a flat row-major index.
    fn get(&self, flat_idx: usize) -> Self::Elem;

    /// Write the cell at a flat row-major index.
    fn set(&mut self, flat_idx: usize, value: Self::Elem);

    /// Reset the cell at a flat row-major index to its "empty" value (the
    /// numeric reset value for [`NumericGrid`], `None` for [`ObjectGrid`]).
    fn clear(&mut self, flat_idx: usize);

    /// Re-point this storage at a new rectangle, discarding all data.
    fn reshape(&mut self, new_rect: IntHyperRect<D>);

    /// Serialize the cells covered by `sub_rects` (each must lie within
    /// `self.rect()`) into a single byte buffer, sub-rects concatenated in
    /// the order given.
    fn pack(&self, sub_rects: &[IntHyperRect<D>]) -> CoreResult<Vec<u8>>;

    /// Deserialize `bytes` (as produced by a matching `pack` call on a peer)
    /// back into the cells covered by `sub_rects`, in order.
    fn unpack(&mut self, sub_rects: &[IntHyperRect<D>], bytes: &[u8]) -> CoreResult<()>;
}

/// Dense contiguous storage for a primitive numeric element type.
#[derive(Debug, Clone)]
pub struct NumericGrid<T: NumericCell, const D: usize> {
    rect: IntHyperRect<D>,
    cells: Vec<T>,
    /// Value new/reset cells take (see `remove_object` semantics in
    /// [`crate::halo::HaloField`]).
    pub init_val: T,
}

impl<T: NumericCell, const D: usize> NumericGrid<T, D> {
    /// Build a storage with an explicit reset value, overriding `T::default()`.
    #[must_use]
    pub fn with_init(rect: IntHyperRect<D>, init_val: T) -> Self {
        let n = rect.area().max(0) as usize;
        Self {
            rect,
            cells: vec![init_val; n],
            init_val,
        }
    }

    fn local_index(&self, rect: &IntHyperRect<D>, local: usize) -> CoreResult<usize> {
        // Translate a flat index local to `rect` into a flat index in
        // `self.rect` by recovering the coordinate and re-flattening.
        let size = rect.size();
        let mut coord = [0i64; D];
        let mut rem = local as i64;
        for i in (0..D).rev() {
            let dim = size.0[i];
            if dim == 0 {
                return Err(CoreError::SerializationFailure {
                    detail: "zero-extent sub-rectangle".into(),
                });
            }
            coord[i] = rem % dim;
            rem /= dim;
        }
        let mut world = [0i64; D];
        for i in 0..D {
            world[i] = rect.ul.0[i] + coord[i];
        }
        let world_point = crate::geometry::IntPoint(world);
        if !self.rect.contains(&world_point) {
            return Err(CoreError::SerializationFailure {
                detail: "sub-rectangle escapes storage bounds".into(),
            });
        }
        Ok(self.rect.flatten(&world_point))
    }
}

impl<T: NumericCell, const D: usize> GridStorage<D> for NumericGrid<T, D> {
    type Elem = T;

    fn new_storage(rect: IntHyperRect<D>) -> Self {
        Self::with_init(rect, T::default())
    }

    fn rect(&self) -> &IntHyperRect<D> {
        &self.rect
    }

    fn get(&self, flat_idx: usize) -> T {
        self.cells[flat_idx]
    }

    fn set(&mut self, flat_idx: usize, value: T) {
        self.cells[flat_idx] = value;
    }

    fn clear(&mut self, flat_idx: usize) {
        self.cells[flat_idx] = self.init_val;
    }

    fn reshape(&mut self, new_rect: IntHyperRect<D>) {
        let n = new_rect.area().max(0) as usize;
        self.cells = vec![self.init_val; n];
        self.rect = new_rect;
    }

    fn pack(&self, sub_rects: &[IntHyperRect<D>]) -> CoreResult<Vec<u8>> {
        let mut out = Vec::new();
        for sub in sub_rects {
            let area = sub.area().max(0) as usize;
            out.reserve(area * T::WIDTH);
            for local in 0..area {
                let flat = self.local_index(sub, local)?;
                self.cells[flat].write_le(&mut out);
            }
        }
        Ok(out)
    }

    fn unpack(&mut self, sub_rects: &[IntHyperRect<D>], bytes: &[u8]) -> CoreResult<()> {
        let mut cursor = 0usize;
        for sub in sub_rects {
            let area = sub.area().max(0) as usize;
            for local in 0..area {
                let end = cursor + T::WIDTH;
                let chunk = bytes.get(cursor..end).ok_or_else(|| CoreError::SerializationFailure {
                    detail: "truncated halo buffer".into(),
                })?;
                let value = T::read_le(chunk);
                let flat = self.local_index(sub, local)?;
                self.cells[flat] = value;
                cursor = end;
            }
        }
        Ok(())
    }
}

/// Dense storage for an opaque application object, serialized with
/// `postcard` when crossing the wire.
#[derive(Debug, Clone)]
pub struct ObjectGrid<T, const D: usize> {
    rect: IntHyperRect<D>,
    cells: Vec<Option<T>>,
}

impl<T: Clone + Serialize + DeserializeOwned, const D: usize> ObjectGrid<T, D> {
    fn local_index(&self, rect: &IntHyperRect<D>, local: usize) -> CoreResult<usize> {
        let size = rect.size();
        let mut coord = [0i64; D];
        let mut rem = local as i64;
        for i in (0..D).rev() {
            let dim = size.0[i];
            if dim == 0 {
                return Err(CoreError::SerializationFailure {
                    detail: "zero-extent sub-rectangle".into(),
                });
            }
            coord[i] = rem % dim;
            rem /= dim;
        }
        let mut world = [0i64; D];
        for i in 0..D {
            world[i] = rect.ul.0[i] + coord[i];
        }
        let world_point = crate::geometry::IntPoint(world);
        if !self.rect.contains(&world_point) {
            return Err(CoreError::SerializationFailure {
                detail: "sub-rectangle escapes storage bounds".into(),
            });
        }
        Ok(self.rect.flatten(&world_point))
    }
}

impl<T: Clone + Serialize + DeserializeOwned, const D: usize> GridStorage<D> for ObjectGrid<T, D> {
    type Elem = Option<T>;

    fn new_storage(rect: IntHyperRect<D>) -> Self {
        let n = rect.area().max(0) as usize;
        Self {
            rect,
            cells: vec![None; n],
        }
    }

    fn rect(&self) -> &IntHyperRect<D> {
        &self.rect
    }

    fn get(&self, flat_idx: usize) -> Option<T> {
        self.cells[flat_idx].clone()
    }

    fn set(&mut self, flat_idx: usize, value: Option<T>) {
        self.cells[flat_idx] = value;
    }

    fn clear(&mut self, flat_idx: usize) {
        self.cells[flat_idx] = None;
    }

    fn reshape(&mut self, new_rect: IntHyperRect<D>) {
        let n = new_rect.area().max(0) as usize;
        self.cells = vec![None; n];
        self.rect = new_rect;
    }

    fn pack(&self, sub_rects: &[IntHyperRect<D>]) -> CoreResult<Vec<u8>> {
        let mut values = Vec::new();
        for sub in sub_rects {
            let area = sub.area().max(0) as usize;
            for local in 0..area {
                let flat = self.local_index(sub, local)?;
                values.push(self.cells[flat].clone());
            }
        }
        postcard::to_allocvec(&values).map_err(|e| CoreError::SerializationFailure {
            detail: e.to_string(),
        })
    }

    fn unpack(&mut self, sub_rects: &[IntHyperRect<D>], bytes: &[u8]) -> CoreResult<()> {
        let values: Vec<Option<T>> =
            postcard::from_bytes(bytes).map_err(|e| CoreError::SerializationFailure {
                detail: e.to_string(),
            })?;
        let mut it = values.into_iter();
        for sub in sub_rects {
            let area = sub.area().max(0) as usize;
            for local in 0..area {
                let value = it.next().ok_or_else(|| CoreError::SerializationFailure {
                    detail: "short object buffer".into(),
                })?;
                let flat = self.local_index(sub, local)?;
                self.cells[flat] = value;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{IntPoint, Rect2};

    fn rect(id: i64, ul: [i64; 2], br: [i64; 2]) -> Rect2 {
        Rect2::new(id, IntPoint(ul), IntPoint(br))
    }

    #[test]
    fn numeric_pack_unpack_roundtrip_full_rect() {
        let r = rect(0, [0, 0], [4, 4]);
        let mut storage = NumericGrid::<i32, 2>::new_storage(r);
        for i in 0..storage.cells.len() {
            storage.set(i, i as i32);
        }
        let packed = storage.pack(&[r]).unwrap();
        let mut other = NumericGrid::<i32, 2>::new_storage(r);
        other.unpack(&[r], &packed).unwrap();
        for i in 0..storage.cells.len() {
            assert_eq!(storage.get(i), other.get(i));
        }
    }

    #[test]
    fn numeric_pack_unpack_sub_rect() {
        let full = rect(0, [0, 0], [10, 10]);
        let mut storage = NumericGrid::<i32, 2>::new_storage(full);
        for i in 0..storage.cells.len() {
            storage.set(i, i as i32);
        }
        let sub = rect(0, [2, 2], [5, 5]);
        let packed = storage.pack(&[sub]).unwrap();

        let mut dest = NumericGrid::<i32, 2>::new_storage(full);
        dest.unpack(&[sub], &packed).unwrap();
        for y in 2..5 {
            for x in 2..5 {
                let p = IntPoint([x, y]);
                let flat = full.flatten(&p);
                assert_eq!(storage.get(flat), dest.get(flat));
            }
        }
        // cells outside the sub-rect were untouched (default 0)
        assert_eq!(dest.get(full.flatten(&IntPoint([0, 0]))), 0);
    }

    #[test]
    fn object_grid_roundtrip() {
        #[derive(Clone, Debug, PartialEq, Serialize, serde::Deserialize)]
        struct Agent {
            id: u64,
            energy: f32,
        }
        let r = rect(0, [0, 0], [2, 2]);
        let mut storage = ObjectGrid::<Agent, 2>::new_storage(r);
        storage.set(0, Some(Agent { id: 1, energy: 1.5 }));
        storage.set(3, Some(Agent { id: 2, energy: 2.5 }));
        let packed = storage.pack(&[r]).unwrap();
        let mut dest = ObjectGrid::<Agent, 2>::new_storage(r);
        dest.unpack(&[r], &packed).unwrap();
        assert_eq!(dest.get(0), Some(Agent { id: 1, energy: 1.5 }));
        assert_eq!(dest.get(3), Some(Agent { id: 2, energy: 2.5 }));
        assert_eq!(dest.get(1), None);
    }

    #[test]
    fn reshape_discards_data() {
        let r = rect(0, [0, 0], [2, 2]);
        let mut storage = NumericGrid::<i32, 2>::new_storage(r);
        storage.set(0, 42);
        storage.reshape(rect(0, [0, 0], [3, 3]));
        assert_eq!(storage.get(0), storage.init_val);
    }
}
