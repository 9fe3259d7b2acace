use crate::context;
use crate::errors::{Error, Result};
use crate::graph::{OpInfo, OpKind};
use crate::layout::Layout;
use crate::storage::Storage;
use crate::types::{NodeId, MAX_RANK};

/// User-facing handle naming one graph node.
///
/// A tensor is a lightweight reference: ops build graph nodes lazily and
/// nothing is computed until `execute`, `get` or `backward` forces the
/// subgraph. The carried layout is a snapshot for shape queries; the graph
/// node stays authoritative.
#[derive(Clone, Debug)]
pub struct Tensor {
    node: NodeId,
    layout: Layout,
}

impl Tensor {
    /// Fresh zero-filled leaf on the named backend. Whether it carries
    /// gradients follows the process-wide flag at creation time.
    pub fn new(dims: &[usize], backend: &str) -> Result<Self> {
        context::with(|cx| {
            let storage = Storage::init(&mut cx.registry, dims, backend)?;
            let layout = storage.layout().clone();
            let requires_grad = cx.grad_enabled();
            let node = cx.graph.add_leaf(&mut cx.registry, &storage, requires_grad)?;
            // the graph holds its own shallow copy
            storage.free(&mut cx.registry)?;
            Ok(Self { node, layout })
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node
    }

    /// User-visible shape.
    pub fn shape(&self) -> &[usize] {
        self.layout.dims()
    }

    pub fn ndim(&self) -> usize {
        self.layout.ndim()
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Overwrites the leaf's elements with a constant.
    pub fn fill(&self, value: f32) -> Result<()> {
        self.fill_with(|storage| storage.fill(value))
    }

    /// Overwrites the leaf's elements with uniform random values.
    pub fn fill_rand(&self) -> Result<()> {
        self.fill_with(|storage| storage.fill_rand())
    }

    fn fill_with(&self, f: impl FnOnce(&mut Storage) -> Result<()>) -> Result<()> {
        context::with(|cx| {
            let node = cx.graph.node_mut(self.node)?;
            if node.kind() != OpKind::Leaf {
                return Err(Error::InvalidOperation(
                    "only leaf tensors can be filled".to_string(),
                ));
            }
            f(node.storage_mut().ok_or(Error::ForwardNotExecuted)?)
        })
    }

    /// Elementwise `self + other`, broadcasting across all dims.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        // add is axpy(α=1) over (a, b)
        build_axpy(1.0, self, other)
    }

    /// Elementwise `self - other`, broadcasting across all dims.
    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        // sub is axpy(α=-1) computed as α·b + a: slot 0 is b, slot 1 is a
        build_axpy(-1.0, other, self)
    }

    /// Batched matrix product over the trailing two dims; leading dims
    /// broadcast.
    pub fn gemm(&self, other: &Tensor) -> Result<Tensor> {
        context::with(|cx| {
            let mut la = cx.graph.node(self.node)?.layout().clone();
            let mut lb = cx.graph.node(other.node)?.layout().clone();
            Layout::broadcast(&mut la, &mut lb, 0..MAX_RANK - 2)?;
            let k = la.shape()[MAX_RANK - 1];
            if lb.shape()[MAX_RANK - 2] != k {
                return Err(Error::ShapeMismatch {
                    expected: vec![k, lb.shape()[MAX_RANK - 1]],
                    found: lb.dims().to_vec(),
                });
            }
            let mut shape = *la.shape();
            shape[MAX_RANK - 1] = lb.shape()[MAX_RANK - 1];
            let ndim = la.ndim().max(2);
            let layout = Layout::new(&shape[MAX_RANK - ndim..])?;
            let node = cx.graph.add_op(
                OpInfo::Gemm {
                    alpha: 1.0,
                    beta: 0.0,
                },
                layout.clone(),
                &[self.node, other.node],
            )?;
            Ok(Tensor { node, layout })
        })
    }

    /// Permutes the trailing dims.
    pub fn transpose(&self, perm: &[usize]) -> Result<Tensor> {
        context::with(|cx| {
            let mut probe = cx.graph.node(self.node)?.layout().clone();
            probe.transpose(perm)?;
            let layout = Layout::new(probe.dims())?;
            let node = cx.graph.add_op(
                OpInfo::Transpose {
                    perm: perm.to_vec(),
                },
                layout.clone(),
                &[self.node],
            )?;
            Ok(Tensor { node, layout })
        })
    }

    /// Retargets the shape; one extent may be `-1` and is inferred.
    pub fn reshape(&self, dims: &[i64]) -> Result<Tensor> {
        context::with(|cx| {
            let source = cx.graph.node(self.node)?.layout().clone();
            // validate counts against a contiguous probe; the cached storage
            // may still be an irregular view and get copied at execution
            let mut probe = Layout::new(source.dims())?;
            probe.reshape(dims)?;
            let layout = Layout::new(probe.dims())?;
            let node = cx.graph.add_op(
                OpInfo::Reshape {
                    dims: dims.to_vec(),
                },
                layout.clone(),
                &[self.node],
            )?;
            Ok(Tensor { node, layout })
        })
    }

    /// Sums over the masked dims; masked extents collapse to 1.
    pub fn reduce_sum(&self, mask: &[bool]) -> Result<Tensor> {
        context::with(|cx| {
            let mut layout = cx.graph.node(self.node)?.layout().clone();
            if mask.len() != layout.ndim() {
                return Err(Error::InvalidShape {
                    dims: vec![mask.len() as i64],
                    reason: "mask length must match ndim",
                });
            }
            layout.reduce(mask)?;
            let node = cx.graph.add_op(
                OpInfo::ReduceSum {
                    mask: mask.to_vec(),
                },
                layout.clone(),
                &[self.node],
            )?;
            Ok(Tensor { node, layout })
        })
    }

    /// Forces forward evaluation of this tensor's subgraph.
    pub fn execute(&self) -> Result<()> {
        context::with(|cx| cx.graph.execute(&mut cx.registry, self.node))
    }

    /// Reads one element, executing first if needed.
    pub fn get(&self, idx: &[usize]) -> Result<f32> {
        context::with(|cx| {
            cx.graph.execute(&mut cx.registry, self.node)?;
            cx.graph
                .node(self.node)?
                .storage()
                .ok_or(Error::ForwardNotExecuted)?
                .get(idx)
        })
    }

    /// The cached forward result, if this node has been executed.
    pub fn storage(&self) -> Result<Option<Storage>> {
        context::with(|cx| Ok(cx.graph.node(self.node)?.storage().cloned()))
    }

    /// Runs reverse-mode differentiation from this tensor, executing the
    /// forward pass first if needed.
    pub fn backward(&self) -> Result<()> {
        context::with(|cx| {
            cx.graph.execute(&mut cx.registry, self.node)?;
            cx.graph.backward(&mut cx.registry, self.node)
        })
    }

    /// Wraps the accumulated gradient as a fresh leaf tensor sharing the
    /// gradient's buffer.
    pub fn grad(&self) -> Result<Tensor> {
        context::with(|cx| {
            let grad = cx
                .graph
                .node(self.node)?
                .grad()
                .cloned()
                .ok_or(Error::GradientNotAvailable)?;
            let layout = grad.layout().clone();
            let requires_grad = cx.grad_enabled();
            let node = cx.graph.add_leaf(&mut cx.registry, &grad, requires_grad)?;
            Ok(Tensor { node, layout })
        })
    }

    /// Zeroes the gradient buffer; no-op when none exists.
    pub fn zero_grad(&self) -> Result<()> {
        context::with(|cx| cx.graph.zero_grad(self.node))
    }

    /// Per-tensor override of the process-wide gradient mode.
    pub fn set_requires_grad(&self, requires_grad: bool) -> Result<()> {
        context::with(|cx| cx.graph.set_requires_grad(self.node, requires_grad))
    }

    pub fn requires_grad(&self) -> Result<bool> {
        context::with(|cx| Ok(cx.graph.node(self.node)?.requires_grad()))
    }

    /// Rendering of the forward value, executing first if needed.
    pub fn dump(&self) -> Result<String> {
        context::with(|cx| {
            cx.graph.execute(&mut cx.registry, self.node)?;
            Ok(cx
                .graph
                .node(self.node)?
                .storage()
                .ok_or(Error::ForwardNotExecuted)?
                .dump())
        })
    }

    /// Releases this handle's reference; the node (and transitively its
    /// inputs) is freed when no references remain.
    pub fn free(self) -> Result<()> {
        context::with(|cx| cx.graph.decrement_ref(&mut cx.registry, self.node))
    }
}

fn build_axpy(alpha: f32, slot0: &Tensor, slot1: &Tensor) -> Result<Tensor> {
    context::with(|cx| {
        let mut l0 = cx.graph.node(slot0.node)?.layout().clone();
        let mut l1 = cx.graph.node(slot1.node)?.layout().clone();
        Layout::broadcast(&mut l0, &mut l1, 0..MAX_RANK)?;
        let layout = Layout::new(l0.dims())?;
        let node = cx.graph.add_op(
            OpInfo::Axpy { alpha },
            layout.clone(),
            &[slot0.node, slot1.node],
        )?;
        Ok(Tensor { node, layout })
    })
}
