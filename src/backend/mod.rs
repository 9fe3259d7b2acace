use crate::errors::{Error, Result};
use crate::layout::Layout;

pub mod cpu;

/// Kernel vtable for one numeric type on one device.
///
/// Kernels operate on raw `(layout, buffer)` pairs and return synchronously;
/// everything above this trait (aliasing, registration, broadcasting policy)
/// is the storage layer's concern. Buffers passed to a single call are
/// guaranteed disjoint by the caller.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Zero-initialized buffer of `size` elements.
    fn alloc(&self, size: usize) -> Result<Vec<f32>>;

    /// Writes `value` to every slot addressed by the layout.
    fn fill(&self, layout: &Layout, data: &mut [f32], value: f32) -> Result<()>;

    /// Uniform random values in [-1, 1).
    fn fill_rand(&self, layout: &Layout, data: &mut [f32]) -> Result<()>;

    fn get(&self, layout: &Layout, data: &[f32], idx: &[usize]) -> Result<f32>;

    fn set(&self, layout: &Layout, data: &mut [f32], idx: &[usize], value: f32) -> Result<()>;

    /// Copies the logical elements of `src` into a contiguous `dst` of the
    /// same shape, block-copying along contiguous runs of `src`.
    fn contiguous(
        &self,
        src: &Layout,
        src_data: &[f32],
        dst: &Layout,
        dst_data: &mut [f32],
    ) -> Result<()>;

    /// `out ← α·x + y`. With `y = None` the combination is in place:
    /// `out ← α·x + out`. Shapes must already be broadcast-aligned; size-1
    /// dims arrive here as zero strides.
    fn axpy(
        &self,
        alpha: f32,
        x: &Layout,
        x_data: &[f32],
        y: Option<(&Layout, &[f32])>,
        out: &Layout,
        out_data: &mut [f32],
    ) -> Result<()>;

    /// Batched matrix multiply over the trailing two dims:
    /// `c ← α·(a@b) + β·c`, batch dims already broadcast-aligned.
    #[allow(clippy::too_many_arguments)]
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
    ) -> Result<()>;

    /// Human-readable rendering of the logical elements.
    fn format(&self, layout: &Layout, data: &[f32]) -> String;
}

static CPU_F32: cpu::CpuF32 = cpu::CpuF32;
static ALL_BACKENDS: [&dyn Backend; 1] = [&CPU_F32];

/// Every backend compiled into this build.
pub fn all() -> &'static [&'static dyn Backend] {
    &ALL_BACKENDS
}

/// Looks a backend up by its registered name.
pub fn get(name: &str) -> Result<&'static dyn Backend> {
    all()
        .iter()
        .copied()
        .find(|b| b.name() == name)
        .ok_or_else(|| Error::InvalidBackend(name.to_string()))
}
