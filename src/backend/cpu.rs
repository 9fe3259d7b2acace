use std::fmt::Write as _;

use rand::distributions::Uniform;
use rand::Rng;
#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::backend::Backend;
use crate::errors::{Error, Result};
use crate::layout::Layout;
use crate::types::MAX_RANK;

/// Dense single-precision CPU kernels, row-major.
#[derive(Debug)]
pub struct CpuF32;

/// Odometer over a padded shape, yielding logical coordinates in row-major
/// order.
struct Coords {
    shape: [usize; MAX_RANK],
    idx: [usize; MAX_RANK],
    remaining: usize,
}

impl Coords {
    fn new(shape: &[usize; MAX_RANK]) -> Self {
        Self {
            shape: *shape,
            idx: [0; MAX_RANK],
            remaining: shape.iter().product(),
        }
    }
}

impl Iterator for Coords {
    type Item = [usize; MAX_RANK];

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.idx;
        self.remaining -= 1;
        for ax in (0..MAX_RANK).rev() {
            self.idx[ax] += 1;
            if self.idx[ax] < self.shape[ax] {
                break;
            }
            self.idx[ax] = 0;
        }
        Some(current)
    }
}

fn offset(idx: &[usize; MAX_RANK], strides: &[usize; MAX_RANK]) -> usize {
    idx.iter().zip(strides).map(|(i, s)| i * s).sum()
}

fn check_same_shape(a: &Layout, b: &Layout) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(Error::ShapeMismatch {
            expected: a.dims().to_vec(),
            found: b.dims().to_vec(),
        });
    }
    Ok(())
}

/// Number of trailing elements of `l` forming one contiguous block in its
/// buffer. Unit dims never break a run.
fn contiguous_run(l: &Layout) -> usize {
    let mut run = 1usize;
    for ax in (0..MAX_RANK).rev() {
        if l.shape()[ax] == 1 {
            continue;
        }
        if l.strides()[ax] == run {
            run *= l.shape()[ax];
        } else {
            break;
        }
    }
    run
}

/// Buffer offset of flat batch index `index` decoded against the shared
/// batch shape (dims 0..MAX_RANK-2) with the given strides.
fn batch_offset(mut index: usize, shape: &[usize; MAX_RANK], strides: &[usize; MAX_RANK]) -> usize {
    let mut off = 0usize;
    for ax in (0..MAX_RANK - 2).rev() {
        let d = shape[ax];
        off += (index % d) * strides[ax];
        index /= d;
    }
    off
}

#[allow(clippy::too_many_arguments)]
fn matmul_block(
    alpha: f32,
    a: &[f32],
    (ars, acs): (usize, usize),
    b: &[f32],
    (brs, bcs): (usize, usize),
    beta: f32,
    c: &mut [f32],
    (crs, ccs): (usize, usize),
    (m, k, n): (usize, usize, usize),
) {
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f32;
            for p in 0..k {
                acc += a[i * ars + p * acs] * b[p * brs + j * bcs];
            }
            let slot = i * crs + j * ccs;
            c[slot] = if beta == 0.0 {
                alpha * acc
            } else {
                alpha * acc + beta * c[slot]
            };
        }
    }
}

impl CpuF32 {
    /// Materializes `l` into a fresh contiguous buffer of the same shape.
    fn materialize(&self, l: &Layout, data: &[f32]) -> Result<(Layout, Vec<f32>)> {
        let flat = Layout::new(l.dims())?;
        let mut buf = self.alloc(l.size())?;
        self.contiguous(l, data, &flat, &mut buf)?;
        Ok((flat, buf))
    }
}

impl Backend for CpuF32 {
    fn name(&self) -> &'static str {
        "cpu_f32"
    }

    fn alloc(&self, size: usize) -> Result<Vec<f32>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)
            .map_err(|_| Error::AllocFailed { size })?;
        buf.resize(size, 0.0);
        Ok(buf)
    }

    fn fill(&self, layout: &Layout, data: &mut [f32], value: f32) -> Result<()> {
        if layout.is_contiguous() {
            data[..layout.size()].fill(value);
            return Ok(());
        }
        for idx in Coords::new(layout.shape()) {
            data[offset(&idx, layout.strides())] = value;
        }
        Ok(())
    }

    fn fill_rand(&self, layout: &Layout, data: &mut [f32]) -> Result<()> {
        let mut rng = rand::thread_rng();
        let dist = Uniform::new(-1.0f32, 1.0);
        if layout.is_contiguous() {
            for v in data[..layout.size()].iter_mut() {
                *v = rng.sample(dist);
            }
            return Ok(());
        }
        for idx in Coords::new(layout.shape()) {
            data[offset(&idx, layout.strides())] = rng.sample(dist);
        }
        Ok(())
    }

    fn get(&self, layout: &Layout, data: &[f32], idx: &[usize]) -> Result<f32> {
        Ok(data[layout.flat_index(idx)?])
    }

    fn set(&self, layout: &Layout, data: &mut [f32], idx: &[usize], value: f32) -> Result<()> {
        data[layout.flat_index(idx)?] = value;
        Ok(())
    }

    fn contiguous(
        &self,
        src: &Layout,
        src_data: &[f32],
        dst: &Layout,
        dst_data: &mut [f32],
    ) -> Result<()> {
        check_same_shape(src, dst)?;
        if !dst.is_contiguous() {
            return Err(Error::NotContiguous);
        }
        let run = contiguous_run(src);
        // iterate only the axes outside the trailing run
        let mut outer = *src.shape();
        let mut covered = 1usize;
        for ax in (0..MAX_RANK).rev() {
            if covered == run {
                break;
            }
            covered *= outer[ax];
            outer[ax] = 1;
        }
        let mut dst_off = 0usize;
        for idx in Coords::new(&outer) {
            let s = offset(&idx, src.strides());
            dst_data[dst_off..dst_off + run].copy_from_slice(&src_data[s..s + run]);
            dst_off += run;
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, name = "kernel_axpy")]
    fn axpy(
        &self,
        alpha: f32,
        x: &Layout,
        x_data: &[f32],
        y: Option<(&Layout, &[f32])>,
        out: &Layout,
        out_data: &mut [f32],
    ) -> Result<()> {
        check_same_shape(x, out)?;
        if let Some((yl, _)) = y {
            check_same_shape(yl, out)?;
        }
        // Irregular views (e.g. transposed) are materialized so the main
        // loop only ever chases real or zero strides. Broadcast views pass
        // through untouched.
        let materialized;
        let (x_l, x_buf): (&Layout, &[f32]) =
            if x.step().is_none() && !x.strides().contains(&0) {
                materialized = self.materialize(x, x_data)?;
                (&materialized.0, &materialized.1)
            } else {
                (x, x_data)
            };

        let n = out.size();
        match y {
            Some((yl, y_data))
                if x_l.is_contiguous() && yl.is_contiguous() && out.is_contiguous() =>
            {
                for ((o, &xv), &yv) in out_data[..n]
                    .iter_mut()
                    .zip(&x_buf[..n])
                    .zip(&y_data[..n])
                {
                    *o = alpha * xv + yv;
                }
            }
            None if x_l.is_contiguous() && out.is_contiguous() => {
                for (o, &xv) in out_data[..n].iter_mut().zip(&x_buf[..n]) {
                    *o += alpha * xv;
                }
            }
            _ => {
                for idx in Coords::new(out.shape()) {
                    let oo = offset(&idx, out.strides());
                    let yv = match y {
                        Some((yl, y_data)) => y_data[offset(&idx, yl.strides())],
                        None => out_data[oo],
                    };
                    out_data[oo] = alpha * x_buf[offset(&idx, x_l.strides())] + yv;
                }
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, name = "kernel_gemm")]
    fn gemm(
        &self,
        alpha: f32,
        a: &Layout,
        a_data: &[f32],
        b: &Layout,
        b_data: &[f32],
        beta: f32,
        c: &Layout,
        c_data: &mut [f32],
    ) -> Result<()> {
        let (m, k) = (a.shape()[MAX_RANK - 2], a.shape()[MAX_RANK - 1]);
        let n = b.shape()[MAX_RANK - 1];
        let batch_ok = a.shape()[..MAX_RANK - 2] == b.shape()[..MAX_RANK - 2]
            && a.shape()[..MAX_RANK - 2] == c.shape()[..MAX_RANK - 2];
        if b.shape()[MAX_RANK - 2] != k
            || c.shape()[MAX_RANK - 2] != m
            || c.shape()[MAX_RANK - 1] != n
            || !batch_ok
        {
            return Err(Error::ShapeMismatch {
                expected: a.dims().to_vec(),
                found: b.dims().to_vec(),
            });
        }

        // BLAS-style inner loops want unit column stride; copy operands
        // that do not have one.
        let a_m;
        let (a_l, a_buf): (&Layout, &[f32]) = if a.strides()[MAX_RANK - 1] != 1 {
            a_m = self.materialize(a, a_data)?;
            (&a_m.0, &a_m.1)
        } else {
            (a, a_data)
        };
        let b_m;
        let (b_l, b_buf): (&Layout, &[f32]) = if b.strides()[MAX_RANK - 1] != 1 {
            b_m = self.materialize(b, b_data)?;
            (&b_m.0, &b_m.1)
        } else {
            (b, b_data)
        };

        let a_mat = (a_l.strides()[MAX_RANK - 2], a_l.strides()[MAX_RANK - 1]);
        let b_mat = (b_l.strides()[MAX_RANK - 2], b_l.strides()[MAX_RANK - 1]);
        let c_mat = (c.strides()[MAX_RANK - 2], c.strides()[MAX_RANK - 1]);
        let batch_count: usize = c.shape()[..MAX_RANK - 2].iter().product();

        #[cfg(feature = "rayon")]
        if c.is_contiguous() {
            let mat = m * n;
            c_data[..batch_count * mat]
                .par_chunks_mut(mat)
                .enumerate()
                .for_each(|(bi, c_block)| {
                    let ao = batch_offset(bi, c.shape(), a_l.strides());
                    let bo = batch_offset(bi, c.shape(), b_l.strides());
                    matmul_block(
                        alpha,
                        &a_buf[ao..],
                        a_mat,
                        &b_buf[bo..],
                        b_mat,
                        beta,
                        c_block,
                        (n, 1),
                        (m, k, n),
                    );
                });
            return Ok(());
        }

        for bi in 0..batch_count {
            let ao = batch_offset(bi, c.shape(), a_l.strides());
            let bo = batch_offset(bi, c.shape(), b_l.strides());
            let co = batch_offset(bi, c.shape(), c.strides());
            matmul_block(
                alpha,
                &a_buf[ao..],
                a_mat,
                &b_buf[bo..],
                b_mat,
                beta,
                &mut c_data[co..],
                c_mat,
                (m, k, n),
            );
        }
        Ok(())
    }

    fn format(&self, layout: &Layout, data: &[f32]) -> String {
        let mut out = String::new();
        render(layout, data, &mut Vec::new(), &mut out);
        out
    }
}

fn render(l: &Layout, data: &[f32], idx: &mut Vec<usize>, out: &mut String) {
    if idx.len() == l.ndim() {
        let off = l.flat_index(idx).unwrap_or(0);
        let _ = write!(out, "{:.4}", data[off]);
        return;
    }
    let extent = l.dims()[idx.len()];
    out.push('[');
    for i in 0..extent {
        if i > 0 {
            out.push_str(if idx.len() + 1 == l.ndim() { ", " } else { ",\n " });
        }
        idx.push(i);
        render(l, data, idx, out);
        idx.pop();
    }
    out.push(']');
}
