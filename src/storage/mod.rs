use std::cell::RefCell;
use std::rc::Rc;

use crate::backend::{self, Backend};
use crate::errors::{Error, Result};
use crate::layout::Layout;
use crate::types::{StorageId, MAX_RANK};

pub mod registry;
pub use registry::{BufferRef, Recording, Registry};

/// Typed handle over one strided view of a shared allocation.
///
/// Cloning a `Storage` clones the handle, not the registration: clones share
/// the id and never touch the registry. New registry entries are only minted
/// by `init`, `alloc`, `shallow_copy` and the view-producing ops.
#[derive(Clone)]
pub struct Storage {
    id: StorageId,
    layout: Layout,
    backend: &'static dyn Backend,
    buffer: BufferRef,
}

fn same_backend(a: &Storage, b: &Storage) -> Result<()> {
    if a.backend.name() != b.backend.name() {
        return Err(Error::BackendMismatch {
            expected: a.backend.name(),
            found: b.backend.name(),
        });
    }
    Ok(())
}

impl Storage {
    /// Fresh zero-initialized storage registered as a new bucket root.
    pub fn init(reg: &mut Registry, dims: &[usize], backend_name: &str) -> Result<Self> {
        let backend = backend::get(backend_name)?;
        Self::alloc(reg, Layout::new(dims)?, backend)
    }

    /// Fresh allocation for an already-computed layout.
    pub fn alloc(reg: &mut Registry, layout: Layout, backend: &'static dyn Backend) -> Result<Self> {
        let buffer = Rc::new(RefCell::new(backend.alloc(layout.size())?));
        let id = reg.register_root(buffer.clone());
        Ok(Self {
            id,
            layout,
            backend,
            buffer,
        })
    }

    pub fn id(&self) -> StorageId {
        self.id
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn backend(&self) -> &'static dyn Backend {
        self.backend
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Deep-copies the layout, shares the allocation; the copy joins the
    /// source's bucket.
    pub fn shallow_copy(&self, reg: &mut Registry) -> Result<Self> {
        let id = reg.register_child(self.id)?;
        Ok(Self {
            id,
            layout: self.layout.clone(),
            backend: self.backend,
            buffer: self.buffer.clone(),
        })
    }

    /// View when already contiguous, materialized copy otherwise.
    pub fn contiguous(&self, reg: &mut Registry) -> Result<Self> {
        if self.layout.is_contiguous() {
            return self.shallow_copy(reg);
        }
        let out = Self::alloc(reg, Layout::new(self.layout.dims())?, self.backend)?;
        self.backend.contiguous(
            &self.layout,
            self.buffer.borrow().as_slice(),
            &out.layout,
            out.buffer.borrow_mut().as_mut_slice(),
        )?;
        Ok(out)
    }

    /// Transposed view of the trailing dims.
    pub fn transpose(&self, reg: &mut Registry, perm: &[usize]) -> Result<Self> {
        let mut out = self.shallow_copy(reg)?;
        out.layout.transpose(perm)?;
        Ok(out)
    }

    /// Retargeted view when the source is regular, contiguous copy
    /// otherwise.
    pub fn reshape(&self, reg: &mut Registry, dims: &[i64]) -> Result<Self> {
        let mut out = if self.layout.is_regular() {
            self.shallow_copy(reg)?
        } else {
            self.contiguous(reg)?
        };
        out.layout.reshape(dims)?;
        Ok(out)
    }

    /// View whose size-1 dims are stretched to `target`'s extents with zero
    /// strides. `target` itself must not need expanding.
    pub fn broadcast_to(&self, reg: &mut Registry, target: &Layout) -> Result<Self> {
        let mut out = self.shallow_copy(reg)?;
        let mut probe = target.clone();
        let broadcast = Layout::broadcast(&mut out.layout, &mut probe, 0..MAX_RANK);
        if broadcast.is_err() || probe.shape() != target.shape() {
            out.free(reg)?;
            return Err(Error::ShapeMismatch {
                expected: target.dims().to_vec(),
                found: self.layout.dims().to_vec(),
            });
        }
        Ok(out)
    }

    /// Removes this handle's registration; consumes the handle.
    pub fn free(self, reg: &mut Registry) -> Result<()> {
        reg.deregister(self.id)
    }

    pub fn fill(&mut self, value: f32) -> Result<()> {
        self.backend
            .fill(&self.layout, self.buffer.borrow_mut().as_mut_slice(), value)
    }

    pub fn fill_rand(&mut self) -> Result<()> {
        self.backend
            .fill_rand(&self.layout, self.buffer.borrow_mut().as_mut_slice())
    }

    pub fn get(&self, idx: &[usize]) -> Result<f32> {
        self.backend
            .get(&self.layout, self.buffer.borrow().as_slice(), idx)
    }

    pub fn set(&mut self, idx: &[usize], value: f32) -> Result<()> {
        self.backend
            .set(&self.layout, self.buffer.borrow_mut().as_mut_slice(), idx, value)
    }

    pub fn dump(&self) -> String {
        self.backend
            .format(&self.layout, self.buffer.borrow().as_slice())
    }

    /// Logical elements flattened into a scratch buffer with a matching
    /// contiguous layout. Not a registry event.
    fn to_contiguous_vec(&self) -> Result<(Layout, Vec<f32>)> {
        let flat = Layout::new(self.layout.dims())?;
        let mut buf = self.backend.alloc(self.layout.size())?;
        self.backend.contiguous(
            &self.layout,
            self.buffer.borrow().as_slice(),
            &flat,
            &mut buf,
        )?;
        Ok((flat, buf))
    }
}

/// `out ← α·x + y`, or `out ← α·x + out` when `y` is `None`. Operands are
/// broadcast across all dims; an operand sharing `out`'s allocation is
/// detached into scratch first.
pub fn axpy(alpha: f32, x: &Storage, y: Option<&Storage>, out: &mut Storage) -> Result<()> {
    same_backend(x, out)?;
    if let Some(ys) = y {
        same_backend(ys, out)?;
    }
    let x_tmp = if Rc::ptr_eq(&x.buffer, &out.buffer) {
        Some(x.to_contiguous_vec()?)
    } else {
        None
    };
    let mut xl = match &x_tmp {
        Some((l, _)) => l.clone(),
        None => x.layout.clone(),
    };

    match y {
        Some(ys) => {
            let y_tmp = if Rc::ptr_eq(&ys.buffer, &out.buffer) {
                Some(ys.to_contiguous_vec()?)
            } else {
                None
            };
            let mut yl = match &y_tmp {
                Some((l, _)) => l.clone(),
                None => ys.layout.clone(),
            };
            Layout::broadcast(&mut xl, &mut yl, 0..MAX_RANK)?;
            if xl.shape() != out.layout.shape() {
                return Err(Error::ShapeMismatch {
                    expected: out.layout.dims().to_vec(),
                    found: xl.dims().to_vec(),
                });
            }
            let x_borrow;
            let x_data: &[f32] = match &x_tmp {
                Some((_, v)) => v,
                None => {
                    x_borrow = x.buffer.borrow();
                    x_borrow.as_slice()
                }
            };
            let y_borrow;
            let y_data: &[f32] = match &y_tmp {
                Some((_, v)) => v,
                None => {
                    y_borrow = ys.buffer.borrow();
                    y_borrow.as_slice()
                }
            };
            let mut out_borrow = out.buffer.borrow_mut();
            out.backend.axpy(
                alpha,
                &xl,
                x_data,
                Some((&yl, y_data)),
                &out.layout,
                out_borrow.as_mut_slice(),
            )
        }
        None => {
            let mut ol = out.layout.clone();
            Layout::broadcast(&mut xl, &mut ol, 0..MAX_RANK)?;
            if ol.shape() != out.layout.shape() {
                return Err(Error::ShapeMismatch {
                    expected: out.layout.dims().to_vec(),
                    found: ol.dims().to_vec(),
                });
            }
            let x_borrow;
            let x_data: &[f32] = match &x_tmp {
                Some((_, v)) => v,
                None => {
                    x_borrow = x.buffer.borrow();
                    x_borrow.as_slice()
                }
            };
            let mut out_borrow = out.buffer.borrow_mut();
            out.backend.axpy(
                alpha,
                &xl,
                x_data,
                None,
                &out.layout,
                out_borrow.as_mut_slice(),
            )
        }
    }
}

/// Batched `c ← α·(a@b) + β·c` over the trailing two dims, broadcasting the
/// batch dims of `a` and `b`.
pub fn gemm(alpha: f32, a: &Storage, b: &Storage, beta: f32, c: &mut Storage) -> Result<()> {
    same_backend(a, c)?;
    same_backend(b, c)?;
    let a_tmp = if Rc::ptr_eq(&a.buffer, &c.buffer) {
        Some(a.to_contiguous_vec()?)
    } else {
        None
    };
    let b_tmp = if Rc::ptr_eq(&b.buffer, &c.buffer) {
        Some(b.to_contiguous_vec()?)
    } else {
        None
    };
    let mut la = match &a_tmp {
        Some((l, _)) => l.clone(),
        None => a.layout.clone(),
    };
    let mut lb = match &b_tmp {
        Some((l, _)) => l.clone(),
        None => b.layout.clone(),
    };
    Layout::broadcast(&mut la, &mut lb, 0..MAX_RANK - 2)?;

    let (m, k) = (la.shape()[MAX_RANK - 2], la.shape()[MAX_RANK - 1]);
    let n = lb.shape()[MAX_RANK - 1];
    if lb.shape()[MAX_RANK - 2] != k {
        return Err(Error::ShapeMismatch {
            expected: vec![k, n],
            found: lb.dims().to_vec(),
        });
    }
    let mut expected = *la.shape();
    expected[MAX_RANK - 2] = m;
    expected[MAX_RANK - 1] = n;
    if c.layout.shape() != &expected {
        return Err(Error::ShapeMismatch {
            expected: expected[MAX_RANK - c.layout.ndim().max(2)..].to_vec(),
            found: c.layout.dims().to_vec(),
        });
    }

    let a_borrow;
    let a_data: &[f32] = match &a_tmp {
        Some((_, v)) => v,
        None => {
            a_borrow = a.buffer.borrow();
            a_borrow.as_slice()
        }
    };
    let b_borrow;
    let b_data: &[f32] = match &b_tmp {
        Some((_, v)) => v,
        None => {
            b_borrow = b.buffer.borrow();
            b_borrow.as_slice()
        }
    };
    let mut c_borrow = c.buffer.borrow_mut();
    c.backend.gemm(
        alpha,
        &la,
        a_data,
        &lb,
        b_data,
        beta,
        &c.layout,
        c_borrow.as_mut_slice(),
    )
}

/// `dst ← α·sum_masked(src) + β·dst`, reducing the masked trailing dims.
///
/// The sum is carried out by the GEMM kernel: reduced axes are permuted to
/// the back, the source is flattened into a `(kept, summed)` matrix and
/// multiplied by a `(summed, 1)` column of ones. Intermediates are captured
/// by a recording and freed on the way out, error or not.
pub fn reduce(
    reg: &mut Registry,
    alpha: f32,
    src: &Storage,
    mask: &[bool],
    beta: f32,
    dst: &mut Storage,
) -> Result<()> {
    same_backend(src, dst)?;
    if mask.len() != src.layout.ndim() {
        return Err(Error::InvalidShape {
            dims: vec![mask.len() as i64],
            reason: "mask length must match ndim",
        });
    }
    // the accumulator is written through a reshaped view, which must alias it
    if !dst.layout.is_regular() {
        return Err(Error::NotRegular);
    }
    let mut expect = src.layout.clone();
    expect.reduce(mask)?;
    if dst.layout.shape() != expect.shape() {
        return Err(Error::ShapeMismatch {
            expected: expect.dims().to_vec(),
            found: dst.layout.dims().to_vec(),
        });
    }

    if !mask.iter().any(|&m| m) {
        apply_beta(dst, beta)?;
        return axpy(alpha, src, None, dst);
    }

    let rec = reg.start_recording();
    let result = (|reg: &mut Registry| -> Result<()> {
        let n = mask.len();
        let kept: Vec<usize> = (0..n).filter(|&i| !mask[i]).collect();
        let summed: Vec<usize> = (0..n).filter(|&i| mask[i]).collect();
        let kept_size: usize = kept.iter().map(|&i| src.layout.dims()[i]).product();
        let summed_size: usize = summed.iter().map(|&i| src.layout.dims()[i]).product();
        let perm: Vec<usize> = kept.iter().chain(summed.iter()).copied().collect();

        let t = src.transpose(reg, &perm)?;
        let mat = t.reshape(reg, &[kept_size as i64, summed_size as i64])?;
        let mut ones = Storage::init(reg, &[summed_size, 1], src.backend.name())?;
        ones.fill(1.0)?;
        let mut dst_mat = dst.reshape(reg, &[kept_size as i64, 1])?;
        gemm(alpha, &mat, &ones, beta, &mut dst_mat)
    })(reg);
    let recording = reg.stop_recording(rec)?;
    reg.free_recorded(recording)?;
    result
}

fn apply_beta(dst: &mut Storage, beta: f32) -> Result<()> {
    if beta == 0.0 {
        dst.fill(0.0)
    } else if beta == 1.0 {
        Ok(())
    } else {
        let alias = dst.clone();
        axpy(beta - 1.0, &alias, None, dst)
    }
}
