use crate::backend::Backend;
use crate::errors::{Error, Result};
use crate::layout::Layout;
use crate::storage::{self, Registry, Storage};
use crate::types::MAX_RANK;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    Leaf,
    Axpy,
    Gemm,
    Transpose,
    Reshape,
    ReduceSum,
}

/// Operation tag plus exactly the metadata that kind needs.
#[derive(Clone, Debug)]
pub enum OpInfo {
    Leaf,
    Axpy { alpha: f32 },
    Gemm { alpha: f32, beta: f32 },
    Transpose { perm: Vec<usize> },
    Reshape { dims: Vec<i64> },
    ReduceSum { mask: Vec<bool> },
}

impl OpInfo {
    pub fn kind(&self) -> OpKind {
        match self {
            OpInfo::Leaf => OpKind::Leaf,
            OpInfo::Axpy { .. } => OpKind::Axpy,
            OpInfo::Gemm { .. } => OpKind::Gemm,
            OpInfo::Transpose { .. } => OpKind::Transpose,
            OpInfo::Reshape { .. } => OpKind::Reshape,
            OpInfo::ReduceSum { .. } => OpKind::ReduceSum,
        }
    }

    pub fn name(&self) -> &'static str {
        match self.kind() {
            OpKind::Leaf => "leaf",
            OpKind::Axpy => "axpy",
            OpKind::Gemm => "gemm",
            OpKind::Transpose => "transpose",
            OpKind::Reshape => "reshape",
            OpKind::ReduceSum => "reduce_sum",
        }
    }
}

/// Forward-computed value cached on the node and consumed by backward.
#[derive(Clone, Debug)]
pub enum OpContext {
    /// Batch dims that were broadcast for each GEMM operand; its gradient
    /// must be summed back across them.
    GemmBroadcast { a_mask: Vec<bool>, b_mask: Vec<bool> },
}

pub struct ForwardArgs<'a> {
    pub reg: &'a mut Registry,
    pub inputs: &'a [Storage],
    pub info: &'a OpInfo,
    pub out_layout: &'a Layout,
    pub backend: &'static dyn Backend,
    pub requires_grad: bool,
}

pub struct BackwardArgs<'a> {
    pub reg: &'a mut Registry,
    pub inputs: &'a [Storage],
    pub output: &'a Storage,
    pub grad_output: &'a Storage,
    pub info: &'a OpInfo,
    pub context: Option<&'a OpContext>,
    /// Accumulator per slot; `None` when that input takes no gradient.
    /// Backward accumulates, never overwrites.
    pub grads: &'a mut [Option<Storage>],
}

pub trait Operation: Sync {
    fn name(&self) -> &'static str;
    fn forward(&self, args: ForwardArgs<'_>) -> Result<(Storage, Option<OpContext>)>;
    fn backward(&self, args: BackwardArgs<'_>) -> Result<()>;
}

/// Static dispatch table keyed by op kind.
pub fn op_for(kind: OpKind) -> Result<&'static dyn Operation> {
    match kind {
        OpKind::Leaf => Err(Error::InvalidOperation(
            "leaf nodes have no forward/backward pair".to_string(),
        )),
        OpKind::Axpy => Ok(&AxpyOp),
        OpKind::Gemm => Ok(&GemmOp),
        OpKind::Transpose => Ok(&TransposeOp),
        OpKind::Reshape => Ok(&ReshapeOp),
        OpKind::ReduceSum => Ok(&ReduceSumOp),
    }
}

fn two_inputs<'a>(inputs: &'a [Storage], op: &'static str) -> Result<(&'a Storage, &'a Storage)> {
    match inputs {
        [x, y] => Ok((x, y)),
        _ => Err(Error::InvalidOperation(format!(
            "{op} takes exactly two inputs, got {}",
            inputs.len()
        ))),
    }
}

fn one_input<'a>(inputs: &'a [Storage], op: &'static str) -> Result<&'a Storage> {
    match inputs {
        [x] => Ok(x),
        _ => Err(Error::InvalidOperation(format!(
            "{op} takes exactly one input, got {}",
            inputs.len()
        ))),
    }
}

/// Dims of the trailing suffix where `input` was broadcast up to `output`'s
/// extent and its gradient must be summed back down.
fn broadcast_mask(input: &Layout, output: &Layout) -> Vec<bool> {
    let nd = output.ndim();
    let base = MAX_RANK - nd;
    (0..nd)
        .map(|i| input.shape()[base + i] == 1 && output.shape()[base + i] > 1)
        .collect()
}

/// Same as `broadcast_mask`, restricted to the batch dims of a GEMM.
fn batch_broadcast_mask(input: &Layout, output: &Layout) -> Vec<bool> {
    let nd = output.ndim().max(2);
    let base = MAX_RANK - nd;
    (0..nd)
        .map(|i| {
            base + i < MAX_RANK - 2
                && input.shape()[base + i] == 1
                && output.shape()[base + i] > 1
        })
        .collect()
}

fn inverse_perm(perm: &[usize]) -> Vec<usize> {
    let mut inv = vec![0usize; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inv[p] = i;
    }
    inv
}

/// `grad += α·reduce(grad_output)` over the masked dims, or a plain
/// strided accumulation when nothing was broadcast.
fn accumulate_scaled(
    reg: &mut Registry,
    alpha: f32,
    grad_output: &Storage,
    mask: &[bool],
    grad: &mut Storage,
) -> Result<()> {
    if mask.iter().any(|&m| m) {
        storage::reduce(reg, alpha, grad_output, mask, 1.0, grad)
    } else {
        storage::axpy(alpha, grad_output, None, grad)
    }
}

struct AxpyOp;

impl Operation for AxpyOp {
    fn name(&self) -> &'static str {
        "axpy"
    }

    fn forward(&self, args: ForwardArgs<'_>) -> Result<(Storage, Option<OpContext>)> {
        let OpInfo::Axpy { alpha } = args.info else {
            return Err(Error::InvalidOperation("axpy metadata expected".to_string()));
        };
        let (x, y) = two_inputs(args.inputs, "axpy")?;
        let mut out = Storage::alloc(args.reg, args.out_layout.clone(), args.backend)?;
        storage::axpy(*alpha, x, Some(y), &mut out)?;
        Ok((out, None))
    }

    fn backward(&self, args: BackwardArgs<'_>) -> Result<()> {
        let OpInfo::Axpy { alpha } = args.info else {
            return Err(Error::InvalidOperation("axpy metadata expected".to_string()));
        };
        // the scalar attaches to slot 0; slot 1 passes through unscaled
        for (slot, coef) in [(0usize, *alpha), (1, 1.0)] {
            if let Some(grad) = args.grads[slot].as_mut() {
                let mask = broadcast_mask(args.inputs[slot].layout(), args.grad_output.layout());
                accumulate_scaled(args.reg, coef, args.grad_output, &mask, grad)?;
            }
        }
        Ok(())
    }
}

struct GemmOp;

impl GemmOp {
    /// `grad += mask-reduced α·(lhs@rhs)`; a direct β=1 GEMM when the
    /// operand saw no batch broadcast.
    fn accumulate_matmul(
        reg: &mut Registry,
        alpha: f32,
        lhs: &Storage,
        rhs: &Storage,
        mask: &[bool],
        grad: &mut Storage,
    ) -> Result<()> {
        if !mask.iter().any(|&m| m) {
            return storage::gemm(alpha, lhs, rhs, 1.0, grad);
        }
        let mut la = lhs.layout().clone();
        let mut lb = rhs.layout().clone();
        Layout::broadcast(&mut la, &mut lb, 0..MAX_RANK - 2)?;
        let mut shape = *la.shape();
        shape[MAX_RANK - 1] = lb.shape()[MAX_RANK - 1];
        let tmp_layout = Layout::new(&shape[MAX_RANK - mask.len()..])?;
        let mut tmp = Storage::alloc(reg, tmp_layout, lhs.backend())?;
        let result = storage::gemm(alpha, lhs, rhs, 0.0, &mut tmp)
            .and_then(|_| storage::reduce(reg, 1.0, &tmp, mask, 1.0, grad));
        tmp.free(reg)?;
        result
    }
}

impl Operation for GemmOp {
    fn name(&self) -> &'static str {
        "gemm"
    }

    fn forward(&self, args: ForwardArgs<'_>) -> Result<(Storage, Option<OpContext>)> {
        let OpInfo::Gemm { alpha, beta } = args.info else {
            return Err(Error::InvalidOperation("gemm metadata expected".to_string()));
        };
        let (a, b) = two_inputs(args.inputs, "gemm")?;
        let mut out = Storage::alloc(args.reg, args.out_layout.clone(), args.backend)?;
        storage::gemm(*alpha, a, b, *beta, &mut out)?;
        let context = args.requires_grad.then(|| OpContext::GemmBroadcast {
            a_mask: batch_broadcast_mask(a.layout(), args.out_layout),
            b_mask: batch_broadcast_mask(b.layout(), args.out_layout),
        });
        Ok((out, context))
    }

    fn backward(&self, args: BackwardArgs<'_>) -> Result<()> {
        let OpInfo::Gemm { alpha, .. } = args.info else {
            return Err(Error::InvalidOperation("gemm metadata expected".to_string()));
        };
        let Some(OpContext::GemmBroadcast { a_mask, b_mask }) = args.context else {
            return Err(Error::InvalidOperation(
                "gemm backward requires its forward context".to_string(),
            ));
        };
        let (a, b) = two_inputs(args.inputs, "gemm")?;
        if let Some(grad) = args.grads[0].as_mut() {
            // grad_a += α·(grad_out @ bᵀ)
            let bt = b.transpose(args.reg, &[1, 0])?;
            let result =
                Self::accumulate_matmul(args.reg, *alpha, args.grad_output, &bt, a_mask, grad);
            bt.free(args.reg)?;
            result?;
        }
        if let Some(grad) = args.grads[1].as_mut() {
            // grad_b += α·(aᵀ @ grad_out)
            let at = a.transpose(args.reg, &[1, 0])?;
            let result =
                Self::accumulate_matmul(args.reg, *alpha, &at, args.grad_output, b_mask, grad);
            at.free(args.reg)?;
            result?;
        }
        Ok(())
    }
}

struct TransposeOp;

impl Operation for TransposeOp {
    fn name(&self) -> &'static str {
        "transpose"
    }

    fn forward(&self, args: ForwardArgs<'_>) -> Result<(Storage, Option<OpContext>)> {
        let OpInfo::Transpose { perm } = args.info else {
            return Err(Error::InvalidOperation(
                "transpose metadata expected".to_string(),
            ));
        };
        let x = one_input(args.inputs, "transpose")?;
        let out = x.transpose(args.reg, perm)?;
        Ok((out, None))
    }

    fn backward(&self, args: BackwardArgs<'_>) -> Result<()> {
        let OpInfo::Transpose { perm } = args.info else {
            return Err(Error::InvalidOperation(
                "transpose metadata expected".to_string(),
            ));
        };
        if let Some(grad) = args.grads[0].as_mut() {
            let view = args.grad_output.transpose(args.reg, &inverse_perm(perm))?;
            let result = storage::axpy(1.0, &view, None, grad);
            view.free(args.reg)?;
            result?;
        }
        Ok(())
    }
}

struct ReshapeOp;

impl Operation for ReshapeOp {
    fn name(&self) -> &'static str {
        "reshape"
    }

    fn forward(&self, args: ForwardArgs<'_>) -> Result<(Storage, Option<OpContext>)> {
        let OpInfo::Reshape { dims } = args.info else {
            return Err(Error::InvalidOperation(
                "reshape metadata expected".to_string(),
            ));
        };
        let x = one_input(args.inputs, "reshape")?;
        let out = x.reshape(args.reg, dims)?;
        Ok((out, None))
    }

    fn backward(&self, args: BackwardArgs<'_>) -> Result<()> {
        if let Some(grad) = args.grads[0].as_mut() {
            let src_dims: Vec<i64> = args.inputs[0]
                .layout()
                .dims()
                .iter()
                .map(|&d| d as i64)
                .collect();
            let view = args.grad_output.reshape(args.reg, &src_dims)?;
            let result = storage::axpy(1.0, &view, None, grad);
            view.free(args.reg)?;
            result?;
        }
        Ok(())
    }
}

struct ReduceSumOp;

impl Operation for ReduceSumOp {
    fn name(&self) -> &'static str {
        "reduce_sum"
    }

    fn forward(&self, args: ForwardArgs<'_>) -> Result<(Storage, Option<OpContext>)> {
        let OpInfo::ReduceSum { mask } = args.info else {
            return Err(Error::InvalidOperation(
                "reduce_sum metadata expected".to_string(),
            ));
        };
        let x = one_input(args.inputs, "reduce_sum")?;
        let mut out = Storage::alloc(args.reg, args.out_layout.clone(), args.backend)?;
        storage::reduce(args.reg, 1.0, x, mask, 0.0, &mut out)?;
        Ok((out, None))
    }

    fn backward(&self, args: BackwardArgs<'_>) -> Result<()> {
        if let Some(grad) = args.grads[0].as_mut() {
            // stretch the reduced dims back out with zero strides
            let view = args
                .grad_output
                .broadcast_to(args.reg, args.inputs[0].layout())?;
            let result = storage::axpy(1.0, &view, None, grad);
            view.free(args.reg)?;
            result?;
        }
        Ok(())
    }
}
