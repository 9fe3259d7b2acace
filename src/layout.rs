use std::ops::Range;

use crate::errors::{Error, Result};
use crate::types::MAX_RANK;

/// Strided view descriptor over a flat buffer.
///
/// Every layout has exactly `MAX_RANK` dims; shapes with fewer user-visible
/// dims are padded on the left with 1s. `ndim` remembers how many trailing
/// dims the user addresses; operations that take indices, permutations or
/// masks interpret them against that trailing suffix.
#[derive(Clone, Debug, PartialEq)]
pub struct Layout {
    size: usize,
    ndim: usize,
    shape: [usize; MAX_RANK],
    strides: [usize; MAX_RANK],
}

fn row_major(shape: &[usize; MAX_RANK]) -> [usize; MAX_RANK] {
    let mut strides = [0usize; MAX_RANK];
    let mut acc = 1usize;
    for i in (0..MAX_RANK).rev() {
        strides[i] = acc;
        acc *= shape[i];
    }
    strides
}

impl Layout {
    /// Row-major contiguous layout over a user shape of up to `MAX_RANK` dims.
    pub fn new(dims: &[usize]) -> Result<Self> {
        if dims.len() > MAX_RANK {
            return Err(Error::InvalidShape {
                dims: dims.iter().map(|&d| d as i64).collect(),
                reason: "too many dims",
            });
        }
        if dims.iter().any(|&d| d == 0) {
            return Err(Error::InvalidShape {
                dims: dims.iter().map(|&d| d as i64).collect(),
                reason: "zero-sized dim",
            });
        }
        let mut shape = [1usize; MAX_RANK];
        shape[MAX_RANK - dims.len()..].copy_from_slice(dims);
        let strides = row_major(&shape);
        Ok(Self {
            size: shape.iter().product(),
            ndim: dims.len(),
            shape,
            strides,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn ndim(&self) -> usize {
        self.ndim
    }

    /// User-visible shape: the trailing `ndim` dims.
    pub fn dims(&self) -> &[usize] {
        &self.shape[MAX_RANK - self.ndim..]
    }

    pub fn shape(&self) -> &[usize; MAX_RANK] {
        &self.shape
    }

    pub fn strides(&self) -> &[usize; MAX_RANK] {
        &self.strides
    }

    /// Flat buffer offset of a logical index addressing the trailing
    /// `idx.len()` dims; leading dims are implicitly 0.
    pub fn flat_index(&self, idx: &[usize]) -> Result<usize> {
        if idx.len() > MAX_RANK {
            return Err(Error::IndexOutOfBounds {
                index: idx.len(),
                dim: MAX_RANK,
                axis: 0,
            });
        }
        let base = MAX_RANK - idx.len();
        let mut offset = 0usize;
        for (k, &i) in idx.iter().enumerate() {
            let axis = base + k;
            if i >= self.shape[axis] {
                return Err(Error::IndexOutOfBounds {
                    index: i,
                    dim: self.shape[axis],
                    axis: k,
                });
            }
            offset += i * self.strides[axis];
        }
        Ok(offset)
    }

    /// The single positive factor relating these strides to the row-major
    /// contiguous strides of the same shape, if one exists. Dims of extent 1
    /// never constrain the result.
    pub fn step(&self) -> Option<usize> {
        let mut contig = 1usize;
        let mut step: Option<usize> = None;
        for i in (0..MAX_RANK).rev() {
            if self.shape[i] != 1 {
                let s = self.strides[i];
                if s == 0 || s % contig != 0 {
                    return None;
                }
                let k = s / contig;
                match step {
                    None => step = Some(k),
                    Some(prev) if prev != k => return None,
                    _ => {}
                }
            }
            contig *= self.shape[i];
        }
        Some(step.unwrap_or(1))
    }

    pub fn is_regular(&self) -> bool {
        self.step().is_some()
    }

    pub fn is_contiguous(&self) -> bool {
        self.step() == Some(1)
    }

    /// Pairs two layouts over a range of axes: a dim of 1 adopts the other
    /// side's extent with stride 0; equal dims are untouched; anything else
    /// is a mismatch. Both layouts end up with identical shapes over the
    /// range and the wider of the two ndims.
    pub fn broadcast(a: &mut Layout, b: &mut Layout, axes: Range<usize>) -> Result<()> {
        for axis in axes {
            let (da, db) = (a.shape[axis], b.shape[axis]);
            if da == db {
                continue;
            }
            if da == 1 {
                a.shape[axis] = db;
                a.strides[axis] = 0;
            } else if db == 1 {
                b.shape[axis] = da;
                b.strides[axis] = 0;
            } else {
                return Err(Error::BroadcastMismatch {
                    lhs: da,
                    rhs: db,
                    axis: axis + a.ndim.max(b.ndim) - MAX_RANK,
                });
            }
        }
        a.size = a.shape.iter().product();
        b.size = b.shape.iter().product();
        let ndim = a.ndim.max(b.ndim);
        a.ndim = ndim;
        b.ndim = ndim;
        Ok(())
    }

    /// Permutes the trailing `perm.len()` dims of shape and strides.
    pub fn transpose(&mut self, perm: &[usize]) -> Result<()> {
        let n = perm.len();
        if n > MAX_RANK {
            return Err(Error::DuplicatePermutation {
                perm: perm.to_vec(),
            });
        }
        let mut seen = [false; MAX_RANK];
        for &p in perm {
            if p >= n || seen[p] {
                return Err(Error::DuplicatePermutation {
                    perm: perm.to_vec(),
                });
            }
            seen[p] = true;
        }
        let base = MAX_RANK - n;
        let (old_shape, old_strides) = (self.shape, self.strides);
        for (i, &p) in perm.iter().enumerate() {
            self.shape[base + i] = old_shape[base + p];
            self.strides[base + i] = old_strides[base + p];
        }
        Ok(())
    }

    /// Retargets a regular layout to a new shape. Accepts at most one `-1`
    /// extent, which is inferred from the total size; the new strides are
    /// row-major scaled by the original step.
    pub fn reshape(&mut self, dims: &[i64]) -> Result<()> {
        let resolved = resolve_dims(dims, self.size)?;
        let step = self.step().ok_or(Error::NotRegular)?;
        let mut out = Layout::new(&resolved)?;
        if out.size != self.size {
            return Err(Error::InvalidShape {
                dims: dims.to_vec(),
                reason: "element count mismatch",
            });
        }
        for s in out.strides.iter_mut() {
            *s *= step;
        }
        *self = out;
        Ok(())
    }

    /// Shrinks every masked dim of the trailing suffix to 1 and recomputes
    /// row-major strides. A mask with no set bits leaves the shape alone.
    pub fn reduce(&mut self, mask: &[bool]) -> Result<()> {
        if mask.len() > MAX_RANK {
            return Err(Error::InvalidShape {
                dims: vec![mask.len() as i64],
                reason: "mask longer than rank",
            });
        }
        let base = MAX_RANK - mask.len();
        for (k, &m) in mask.iter().enumerate() {
            if m {
                self.shape[base + k] = 1;
            }
        }
        self.strides = row_major(&self.shape);
        self.size = self.shape.iter().product();
        Ok(())
    }
}

fn resolve_dims(dims: &[i64], size: usize) -> Result<Vec<usize>> {
    if dims.len() > MAX_RANK {
        return Err(Error::InvalidShape {
            dims: dims.to_vec(),
            reason: "too many dims",
        });
    }
    let mut infer = None;
    let mut known = 1usize;
    for (i, &d) in dims.iter().enumerate() {
        if d == -1 {
            if infer.is_some() {
                return Err(Error::InvalidShape {
                    dims: dims.to_vec(),
                    reason: "more than one -1",
                });
            }
            infer = Some(i);
        } else if d <= 0 {
            return Err(Error::InvalidShape {
                dims: dims.to_vec(),
                reason: "non-positive dim",
            });
        } else {
            known *= d as usize;
        }
    }
    let mut resolved: Vec<usize> = dims.iter().map(|&d| d.max(1) as usize).collect();
    if let Some(i) = infer {
        if known == 0 || size % known != 0 {
            return Err(Error::InvalidShape {
                dims: dims.to_vec(),
                reason: "cannot infer -1 extent",
            });
        }
        resolved[i] = size / known;
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_pads_left_and_is_contiguous() {
        let l = Layout::new(&[2, 3]).unwrap();
        assert_eq!(l.size(), 6);
        assert_eq!(l.ndim(), 2);
        assert_eq!(l.dims(), &[2, 3]);
        assert_eq!(&l.shape()[..6], &[1; 6]);
        assert_eq!(l.strides()[6], 3);
        assert_eq!(l.strides()[7], 1);
        assert!(l.is_contiguous());
    }

    #[test]
    fn flat_index_addresses_trailing_suffix() {
        let l = Layout::new(&[2, 3]).unwrap();
        assert_eq!(l.flat_index(&[1, 2]).unwrap(), 5);
        assert_eq!(l.flat_index(&[2]).unwrap(), 2);
        assert!(matches!(
            l.flat_index(&[2, 0]),
            Err(Error::IndexOutOfBounds { .. })
        ));
    }

    #[test]
    fn transpose_permutes_trailing_dims_only() {
        let mut l = Layout::new(&[2, 3]).unwrap();
        l.transpose(&[1, 0]).unwrap();
        assert_eq!(l.dims(), &[3, 2]);
        assert_eq!(l.strides()[6], 1);
        assert_eq!(l.strides()[7], 3);
        assert!(!l.is_regular());
        // round-trip restores the original
        l.transpose(&[1, 0]).unwrap();
        assert_eq!(l.dims(), &[2, 3]);
        assert!(l.is_contiguous());
    }

    #[test]
    fn transpose_rejects_duplicate_axes() {
        let mut l = Layout::new(&[2, 3]).unwrap();
        assert!(matches!(
            l.transpose(&[0, 0]),
            Err(Error::DuplicatePermutation { .. })
        ));
    }

    #[test]
    fn broadcast_zero_strides_the_unit_dim() {
        let mut a = Layout::new(&[2, 2]).unwrap();
        let mut b = Layout::new(&[2]).unwrap();
        Layout::broadcast(&mut a, &mut b, 0..MAX_RANK).unwrap();
        assert_eq!(a.dims(), b.dims());
        assert_eq!(b.strides()[6], 0);
        assert_eq!(b.size(), 4);
    }

    #[test]
    fn broadcast_rejects_incompatible_dims() {
        let mut a = Layout::new(&[2, 3]).unwrap();
        let mut b = Layout::new(&[2, 2]).unwrap();
        assert!(matches!(
            Layout::broadcast(&mut a, &mut b, 0..MAX_RANK),
            Err(Error::BroadcastMismatch { .. })
        ));
    }

    #[test]
    fn reshape_infers_single_wildcard() {
        let mut l = Layout::new(&[2, 3]).unwrap();
        l.reshape(&[-1]).unwrap();
        assert_eq!(l.dims(), &[6]);
        assert!(l.is_contiguous());
        assert!(matches!(
            l.reshape(&[-1, -1]),
            Err(Error::InvalidShape { .. })
        ));
        assert!(matches!(l.reshape(&[4]), Err(Error::InvalidShape { .. })));
    }

    #[test]
    fn reshape_scales_strides_by_step() {
        // step-2 regular view of a [2, 3] block
        let mut l = Layout::new(&[2, 3]).unwrap();
        for s in l.strides.iter_mut() {
            *s *= 2;
        }
        assert_eq!(l.step(), Some(2));
        l.reshape(&[3, 2]).unwrap();
        assert_eq!(l.dims(), &[3, 2]);
        assert_eq!(l.strides()[6], 4);
        assert_eq!(l.strides()[7], 2);
    }

    #[test]
    fn reshape_requires_regular() {
        let mut l = Layout::new(&[2, 3]).unwrap();
        l.transpose(&[1, 0]).unwrap();
        assert!(matches!(l.reshape(&[6]), Err(Error::NotRegular)));
    }

    #[test]
    fn reduce_masks_dims_to_one() {
        let mut l = Layout::new(&[2, 3]).unwrap();
        l.reduce(&[false, true]).unwrap();
        assert_eq!(l.dims(), &[2, 1]);
        assert_eq!(l.size(), 2);
        assert!(l.is_contiguous());
    }

    #[test]
    fn reduce_all_zero_mask_is_noop() {
        let mut l = Layout::new(&[2, 3]).unwrap();
        let before = l.clone();
        l.reduce(&[false, false]).unwrap();
        assert_eq!(l, before);
    }
}
