use crate::context;
use crate::errors::{Error, Result};
use crate::layout::Layout;
use crate::storage::{self, Storage};
use crate::tensor::Tensor;

/// Parameter-update strategies over a fixed set of leaf tensors.
pub trait Optimizer {
    /// Applies one update from the accumulated gradients.
    fn step(&mut self) -> Result<()>;

    /// Clears the parameters' gradient buffers.
    fn zero_grad(&self) -> Result<()>;
}

/// Stochastic gradient descent with optional momentum.
///
/// With momentum `μ > 0` each parameter carries a velocity buffer updated as
/// `v ← μ·v + grad`, and the step applies `p ← p − lr·v`; otherwise the
/// gradient is applied directly.
pub struct Sgd {
    params: Vec<Tensor>,
    lr: f32,
    momentum: f32,
    velocity: Vec<Option<Storage>>,
}

impl Sgd {
    pub fn new(params: Vec<Tensor>, lr: f32, momentum: f32) -> Result<Self> {
        context::with(|cx| {
            for p in &params {
                if !cx.graph.node(p.node_id())?.requires_grad() {
                    return Err(Error::RequiresGradFalse);
                }
            }
            Ok(())
        })?;
        let velocity = params.iter().map(|_| None).collect();
        Ok(Self {
            params,
            lr,
            momentum,
            velocity,
        })
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    /// Releases the velocity buffers; consumes the optimizer.
    pub fn free(mut self) -> Result<()> {
        context::with(|cx| {
            for v in self.velocity.drain(..).flatten() {
                v.free(&mut cx.registry)?;
            }
            Ok(())
        })
    }
}

impl Optimizer for Sgd {
    fn step(&mut self) -> Result<()> {
        context::with(|cx| {
            for (i, p) in self.params.iter().enumerate() {
                let node = cx.graph.node(p.node_id())?;
                let grad = node.grad().cloned().ok_or(Error::GradientNotAvailable)?;
                let mut param = node.storage().cloned().ok_or(Error::ForwardNotExecuted)?;
                if self.momentum > 0.0 {
                    if self.velocity[i].is_none() {
                        let zeroed = Storage::alloc(
                            &mut cx.registry,
                            Layout::new(param.layout().dims())?,
                            param.backend(),
                        )?;
                        self.velocity[i] = Some(zeroed);
                    }
                    let v = self.velocity[i].as_mut().ok_or(Error::HandleUninitialized)?;
                    // v ← μ·v + grad
                    let prev = v.clone();
                    storage::axpy(self.momentum, &prev, Some(&grad), v)?;
                    // p ← p − lr·v
                    let v = v.clone();
                    storage::axpy(-self.lr, &v, None, &mut param)?;
                } else {
                    storage::axpy(-self.lr, &grad, None, &mut param)?;
                }
            }
            Ok(())
        })
    }

    fn zero_grad(&self) -> Result<()> {
        context::with(|cx| {
            for p in &self.params {
                cx.graph.zero_grad(p.node_id())?;
            }
            Ok(())
        })
    }
}
