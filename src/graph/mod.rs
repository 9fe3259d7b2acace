use std::collections::HashMap;
use std::fmt::Write as _;

use tracing::{debug, trace};

use crate::backend::Backend;
use crate::errors::{Error, Result};
use crate::layout::Layout;
use crate::storage::{Registry, Storage};
use crate::types::{NodeId, MAX_INPUTS};

pub mod ops;

pub use ops::{OpContext, OpInfo, OpKind};
use ops::{op_for, BackwardArgs, ForwardArgs};

/// A vertex of the computation DAG: either a materialized leaf or a lazy
/// operation over earlier nodes.
pub struct Node {
    id: NodeId,
    info: OpInfo,
    /// Operand node ids; the position in this list is the edge's slot.
    inputs: Vec<NodeId>,
    layout: Layout,
    backend: &'static dyn Backend,
    storage: Option<Storage>,
    grad: Option<Storage>,
    context: Option<OpContext>,
    ref_count: usize,
    requires_grad: bool,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> OpKind {
        self.info.kind()
    }

    pub fn info(&self) -> &OpInfo {
        &self.info
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn storage(&self) -> Option<&Storage> {
        self.storage.as_ref()
    }

    pub fn storage_mut(&mut self) -> Option<&mut Storage> {
        self.storage.as_mut()
    }

    pub fn grad(&self) -> Option<&Storage> {
        self.grad.as_ref()
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }
}

/// The computation graph: an arena of nodes plus the scheduling, execution
/// and gradient machinery over it.
#[derive(Default)]
pub struct Graph {
    nodes: HashMap<NodeId, Node>,
    next_id: usize,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(&id).ok_or(Error::NodeNotFound(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(&id).ok_or(Error::NodeNotFound(id))
    }

    /// Materialized leaf holding a shallow copy of `storage`; the caller
    /// keeps (and may free) its own handle.
    pub fn add_leaf(
        &mut self,
        reg: &mut Registry,
        storage: &Storage,
        requires_grad: bool,
    ) -> Result<NodeId> {
        let copy = storage.shallow_copy(reg)?;
        let id = NodeId(self.next_id);
        self.next_id += 1;
        let node = Node {
            id,
            info: OpInfo::Leaf,
            inputs: Vec::new(),
            layout: copy.layout().clone(),
            backend: copy.backend(),
            storage: Some(copy),
            grad: None,
            context: None,
            ref_count: 1,
            requires_grad,
        };
        self.nodes.insert(id, node);
        trace!(?id, requires_grad, "leaf added");
        Ok(id)
    }

    /// Lazy op node over existing nodes. All inputs must share one backend;
    /// each gains a reference held by the new node.
    pub fn add_op(&mut self, info: OpInfo, layout: Layout, inputs: &[NodeId]) -> Result<NodeId> {
        if inputs.len() > MAX_INPUTS {
            return Err(Error::TooManyInputs {
                count: inputs.len(),
                max: MAX_INPUTS,
            });
        }
        let mut backend: Option<&'static dyn Backend> = None;
        let mut requires_grad = false;
        for &input in inputs {
            let node = self.node(input)?;
            match backend {
                None => backend = Some(node.backend),
                Some(b) if b.name() != node.backend.name() => {
                    return Err(Error::BackendMismatch {
                        expected: b.name(),
                        found: node.backend.name(),
                    })
                }
                Some(_) => {}
            }
            requires_grad |= node.requires_grad;
        }
        let backend = backend.ok_or_else(|| {
            Error::InvalidOperation("an op node needs at least one input".to_string())
        })?;
        let id = NodeId(self.next_id);
        self.next_id += 1;
        let node = Node {
            id,
            info,
            inputs: inputs.to_vec(),
            layout,
            backend,
            storage: None,
            grad: None,
            context: None,
            ref_count: 1,
            requires_grad,
        };
        trace!(?id, op = node.info.name(), ?inputs, "op added");
        self.nodes.insert(id, node);
        for &input in inputs {
            if let Some(n) = self.nodes.get_mut(&input) {
                n.ref_count += 1;
            }
        }
        Ok(id)
    }

    /// Nodes reachable from `target` through operand edges, ordered so that
    /// every node appears after all of its inputs.
    pub fn topo_sort(&self, target: NodeId) -> Result<Vec<NodeId>> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;
        enum Visit {
            Enter(NodeId),
            Exit(NodeId),
        }
        self.node(target)?;
        let mut state: HashMap<NodeId, u8> = HashMap::new();
        let mut order = Vec::new();
        let mut stack = vec![Visit::Enter(target)];
        while let Some(visit) = stack.pop() {
            match visit {
                Visit::Enter(id) => {
                    match state.get(&id).copied().unwrap_or(WHITE) {
                        BLACK => continue,
                        GRAY => return Err(Error::TopologicalSortFailed),
                        _ => {}
                    }
                    state.insert(id, GRAY);
                    stack.push(Visit::Exit(id));
                    for &input in self.node(id)?.inputs.iter().rev() {
                        match state.get(&input).copied().unwrap_or(WHITE) {
                            GRAY => return Err(Error::TopologicalSortFailed),
                            BLACK => {}
                            _ => stack.push(Visit::Enter(input)),
                        }
                    }
                }
                Visit::Exit(id) => {
                    state.insert(id, BLACK);
                    order.push(id);
                }
            }
        }
        Ok(order)
    }

    /// Evaluates the subgraph below `target`, caching each op's result on
    /// its node. Already-materialized nodes are skipped.
    pub fn execute(&mut self, reg: &mut Registry, target: NodeId) -> Result<()> {
        let order = self.topo_sort(target)?;
        debug!(?target, nodes = order.len(), "forward pass");
        for id in order {
            let (info, input_ids, layout, backend, requires_grad) = {
                let node = self.node(id)?;
                if node.storage.is_some() || node.kind() == OpKind::Leaf {
                    continue;
                }
                (
                    node.info.clone(),
                    node.inputs.clone(),
                    node.layout.clone(),
                    node.backend,
                    node.requires_grad,
                )
            };
            let mut inputs = Vec::with_capacity(input_ids.len());
            for input in &input_ids {
                inputs.push(
                    self.node(*input)?
                        .storage
                        .clone()
                        .ok_or(Error::ForwardNotExecuted)?,
                );
            }
            let op = op_for(info.kind())?;
            let (out, context) = op
                .forward(ForwardArgs {
                    reg: &mut *reg,
                    inputs: &inputs,
                    info: &info,
                    out_layout: &layout,
                    backend,
                    requires_grad,
                })
                .map_err(|e| Error::ExecutionFailed {
                    node: id,
                    op: op.name(),
                    source: Box::new(e),
                })?;
            if out.backend_name() != backend.name() {
                return Err(Error::BackendMismatch {
                    expected: backend.name(),
                    found: out.backend_name(),
                });
            }
            let node = self.node_mut(id)?;
            node.storage = Some(out);
            node.context = context;
        }
        Ok(())
    }

    /// Reverse-mode sweep from `target`, whose forward value must already be
    /// cached. Leaf gradients accumulate across calls; op-node gradients are
    /// per-sweep scratch, re-zeroed on their first touch of each sweep.
    pub fn backward(&mut self, reg: &mut Registry, target: NodeId) -> Result<()> {
        if self.node(target)?.storage.is_none() {
            return Err(Error::ForwardNotExecuted);
        }
        let order = self.topo_sort(target)?;
        debug!(?target, nodes = order.len(), "backward pass");

        let mut touched: Vec<NodeId> = Vec::new();
        // seed the output gradient with ones
        {
            let (layout, backend, absent) = {
                let node = self.node(target)?;
                (node.layout.clone(), node.backend, node.grad.is_none())
            };
            if absent {
                let seed = Storage::alloc(reg, Layout::new(layout.dims())?, backend)?;
                self.node_mut(target)?.grad = Some(seed);
            }
            if let Some(grad) = self.node_mut(target)?.grad.as_mut() {
                grad.fill(1.0)?;
            }
            touched.push(target);
        }

        for &id in order.iter().rev() {
            let (info, input_ids) = {
                let node = self.node(id)?;
                if node.kind() == OpKind::Leaf || !node.requires_grad || node.grad.is_none() {
                    continue;
                }
                (node.info.clone(), node.inputs.clone())
            };
            // first touch of each accumulator this sweep: allocate leaves
            // once, re-zero op scratch
            for &input in &input_ids {
                let (wants_grad, is_leaf, absent, layout, backend) = {
                    let node = self.node(input)?;
                    (
                        node.requires_grad,
                        node.kind() == OpKind::Leaf,
                        node.grad.is_none(),
                        node.layout.clone(),
                        node.backend,
                    )
                };
                if !wants_grad || touched.contains(&input) {
                    continue;
                }
                if absent {
                    let zeroed = Storage::alloc(reg, Layout::new(layout.dims())?, backend)?;
                    self.node_mut(input)?.grad = Some(zeroed);
                } else if !is_leaf {
                    if let Some(grad) = self.node_mut(input)?.grad.as_mut() {
                        grad.fill(0.0)?;
                    }
                }
                touched.push(input);
            }

            let mut inputs = Vec::with_capacity(input_ids.len());
            let mut grads = Vec::with_capacity(input_ids.len());
            for &input in &input_ids {
                let node = self.node(input)?;
                inputs.push(node.storage.clone().ok_or(Error::ForwardNotExecuted)?);
                grads.push(if node.requires_grad {
                    node.grad.clone()
                } else {
                    None
                });
            }
            let (output, grad_output, context) = {
                let node = self.node(id)?;
                (
                    node.storage.clone().ok_or(Error::ForwardNotExecuted)?,
                    node.grad.clone().ok_or(Error::GradientNotAvailable)?,
                    node.context.clone(),
                )
            };
            let op = op_for(info.kind())?;
            op.backward(BackwardArgs {
                reg: &mut *reg,
                inputs: &inputs,
                output: &output,
                grad_output: &grad_output,
                info: &info,
                context: context.as_ref(),
                grads: &mut grads,
            })?;
            // backward consumed the cached context
            self.node_mut(id)?.context = None;
        }
        Ok(())
    }

    /// Zeroes one node's gradient buffer; no-op when none exists.
    pub fn zero_grad(&mut self, id: NodeId) -> Result<()> {
        if let Some(grad) = self.node_mut(id)?.grad.as_mut() {
            grad.fill(0.0)?;
        }
        Ok(())
    }

    /// Zeroes every gradient buffer in the graph.
    pub fn zero_grad_all(&mut self) -> Result<()> {
        for node in self.nodes.values_mut() {
            if let Some(grad) = node.grad.as_mut() {
                grad.fill(0.0)?;
            }
        }
        Ok(())
    }

    pub fn set_requires_grad(&mut self, id: NodeId, requires_grad: bool) -> Result<()> {
        self.node_mut(id)?.requires_grad = requires_grad;
        Ok(())
    }

    /// Drops one reference to `id`; a node reaching zero is freed together
    /// with its buffers, releasing one reference of each input in turn.
    pub fn decrement_ref(&mut self, reg: &mut Registry, id: NodeId) -> Result<()> {
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let node = self.node_mut(id)?;
            node.ref_count = node.ref_count.saturating_sub(1);
            if node.ref_count > 0 {
                continue;
            }
            let node = self
                .nodes
                .remove(&id)
                .ok_or(Error::NodeNotFound(id))?;
            debug!(?id, op = node.info.name(), "node freed");
            if let Some(storage) = node.storage {
                storage.free(reg)?;
            }
            if let Some(grad) = node.grad {
                grad.free(reg)?;
            }
            pending.extend(node.inputs);
        }
        Ok(())
    }

    /// Unconditionally frees every node; process teardown path.
    pub fn clear(&mut self, reg: &mut Registry) {
        let count = self.nodes.len();
        for (_, node) in self.nodes.drain() {
            if let Some(storage) = node.storage {
                let _ = storage.free(reg);
            }
            if let Some(grad) = node.grad {
                let _ = grad.free(reg);
            }
        }
        if count > 0 {
            debug!(count, "graph cleared");
        }
    }

    /// DOT rendering of the whole graph for debugging.
    pub fn to_dot(&self) -> String {
        let mut ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        ids.sort();
        let mut dot = String::from("digraph gradix {\n  rankdir=BT;\n");
        for id in &ids {
            let node = &self.nodes[id];
            let _ = writeln!(
                dot,
                "  n{} [label=\"#{} {} {:?}\"];",
                id.0,
                id.0,
                node.info.name(),
                node.layout.dims()
            );
        }
        for id in &ids {
            for (slot, input) in self.nodes[id].inputs.iter().enumerate() {
                let _ = writeln!(dot, "  n{} -> n{} [label=\"{}\"];", input.0, id.0, slot);
            }
        }
        dot.push_str("}\n");
        dot
    }
}
