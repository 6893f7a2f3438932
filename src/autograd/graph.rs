//! Computation graph arena and the backward-pass driver
//!
//! Nodes live in an arena addressed by stable [`NodeId`] handles; parent
//! links are handles into the same arena, so graph reclamation is dropping
//! the graph and diamond-shaped sharing needs no reference counting.

use std::sync::Arc;

use ndarray::ArrayD;
use parking_lot::RwLock;

use super::op::Op;
use crate::backend::{self, Device};
use crate::error::{RevgradError, RevgradResult};

pub type NodeId = usize;

/// A single value in the differentiable computation graph
#[derive(Debug)]
pub struct Node {
    pub(crate) data: ArrayD<f64>,
    pub(crate) grad: Option<ArrayD<f64>>,
    pub(crate) requires_grad: bool,
    pub(crate) parents: Vec<NodeId>,
    pub(crate) op: Op,
    pub(crate) topo_cache: Option<Vec<NodeId>>,
}

impl Node {
    fn leaf(data: ArrayD<f64>, requires_grad: bool) -> Self {
        Self {
            grad: requires_grad.then(|| ArrayD::zeros(data.raw_dim())),
            data,
            requires_grad,
            parents: Vec::new(),
            op: Op::Leaf,
            topo_cache: None,
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

pub(crate) struct GraphInner {
    pub(crate) nodes: Vec<Node>,
    pub(crate) device: Device,
}

impl GraphInner {
    pub(crate) fn leaf(&mut self, data: ArrayD<f64>, requires_grad: bool) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node::leaf(data, requires_grad));
        id
    }

    /// Record an operator output. While gradient recording is suspended the
    /// node is stored as a plain constant with no parents.
    pub(crate) fn op_node(&mut self, data: ArrayD<f64>, op: Op) -> NodeId {
        if !backend::grad_enabled() {
            return self.leaf(data, false);
        }
        let parents = op.parents();
        let requires_grad = parents.iter().any(|&p| self.nodes[p].requires_grad);
        let id = self.nodes.len();
        self.nodes.push(Node {
            data,
            grad: None,
            requires_grad,
            parents,
            op,
            topo_cache: None,
        });
        id
    }

    /// Ancestors of `root` in topological order (parents strictly before
    /// children, `root` last). Memoized on the terminal node and reused by
    /// repeated backward calls.
    ///
    /// Post-order DFS over an explicit stack of (node, next parent index)
    /// frames, so chain depth is bounded by heap and not the call stack.
    pub(crate) fn topo_order(&mut self, root: NodeId) -> RevgradResult<Vec<NodeId>> {
        if let Some(cached) = &self.nodes[root].topo_cache {
            return Ok(cached.clone());
        }
        let mut order = Vec::new();
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut stack: Vec<(NodeId, usize)> = vec![(root, 0)];
        marks[root] = Mark::InProgress;
        while let Some(&(id, next)) = stack.last() {
            if let Some(&parent) = self.nodes[id].parents.get(next) {
                let top = stack.len() - 1;
                stack[top].1 += 1;
                match marks[parent] {
                    Mark::InProgress => return Err(RevgradError::CycleDetected),
                    Mark::Done => {}
                    Mark::Unvisited => {
                        marks[parent] = Mark::InProgress;
                        stack.push((parent, 0));
                    }
                }
            } else {
                marks[id] = Mark::Done;
                order.push(id);
                stack.pop();
            }
        }
        tracing::debug!(root, nodes = order.len(), "topological order computed");
        self.nodes[root].topo_cache = Some(order.clone());
        Ok(order)
    }

    /// Run the backward sweep from `root`.
    ///
    /// Seeds the terminal gradient with ones when it is unset or still
    /// all-zero, then walks the topological order in reverse, accumulating
    /// each primitive's local contributions into parent gradient buffers.
    pub(crate) fn backward(&mut self, root: NodeId) -> RevgradResult<()> {
        let needs_seed = match &self.nodes[root].grad {
            None => true,
            Some(g) => g.iter().all(|&v| v == 0.0),
        };
        if needs_seed {
            self.nodes[root].grad = Some(ArrayD::ones(self.nodes[root].data.raw_dim()));
        }

        let order = self.topo_order(root)?;
        tracing::debug!(root, nodes = order.len(), "backward pass");

        for &id in order.iter().rev() {
            if !self.nodes[id].requires_grad {
                continue;
            }
            if matches!(self.nodes[id].op, Op::Leaf) {
                continue;
            }
            let out_grad = match self.nodes[id].grad.clone() {
                Some(g) => g,
                None => continue,
            };
            let op = self.nodes[id].op.clone();
            let out_data = self.nodes[id].data.clone();
            let contributions = op.backward(&self.nodes, &out_data, &out_grad)?;
            for (parent, contribution) in contributions {
                match &mut self.nodes[parent].grad {
                    Some(g) => *g += &contribution,
                    slot @ None => *slot = Some(contribution),
                }
            }
        }
        Ok(())
    }

    pub(crate) fn zero_gradients(&mut self) {
        for node in &mut self.nodes {
            if let Some(grad) = &mut node.grad {
                grad.fill(0.0);
            }
        }
    }

    #[cfg(test)]
    fn force_parent(&mut self, child: NodeId, parent: NodeId) {
        self.nodes[child].parents.push(parent);
    }
}

/// Handle to a computation graph arena. Cheap to clone; all handles address
/// the same arena.
#[derive(Clone)]
pub struct Graph {
    pub(crate) inner: Arc<RwLock<GraphInner>>,
}

impl Graph {
    /// Create an empty graph on the selected backend device.
    ///
    /// Fails with `BackendUnconfigured` when no backend was selected.
    pub fn new() -> RevgradResult<Self> {
        let device = backend::current()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(GraphInner {
                nodes: Vec::new(),
                device,
            })),
        })
    }

    pub fn device(&self) -> Device {
        self.inner.read().device
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    /// Topological order of `root`'s ancestors, computing and caching it if
    /// needed.
    pub fn topological_order(&self, root: NodeId) -> RevgradResult<Vec<NodeId>> {
        self.inner.write().topo_order(root)
    }

    /// Reset every allocated gradient buffer in the arena to zero.
    pub fn zero_gradients(&self) {
        self.inner.write().zero_gradients();
    }

    pub(crate) fn same_arena(&self, other: &Graph) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    fn inner() -> GraphInner {
        GraphInner {
            nodes: Vec::new(),
            device: Device::Cpu,
        }
    }

    fn scalar(v: f64) -> ArrayD<f64> {
        ArrayD::from_elem(IxDyn(&[]), v)
    }

    #[test]
    fn test_topo_order_parents_before_children() {
        let mut g = inner();
        let x = g.leaf(scalar(3.0), true);
        let y = g.op_node(scalar(9.0), Op::Mul(x, x));
        let z = g.op_node(scalar(12.0), Op::Add(x, y));

        let order = g.topo_order(z).unwrap();
        let pos =
            |id: NodeId| order.iter().position(|&n| n == id).expect("node missing from order");
        assert_eq!(order.len(), 3);
        assert!(pos(x) < pos(y));
        assert!(pos(y) < pos(z));
        assert!(pos(x) < pos(z));
        assert_eq!(*order.last().unwrap(), z);
    }

    #[test]
    fn test_cycle_detected() {
        let mut g = inner();
        let x = g.leaf(scalar(1.0), true);
        let y = g.op_node(scalar(2.0), Op::Add(x, x));
        g.force_parent(x, y);
        assert!(matches!(g.topo_order(y), Err(RevgradError::CycleDetected)));
    }

    #[test]
    fn test_backward_seeds_ones_and_applies_chain_rule() {
        // y = (x * x) + x at x = 3 gives dy/dx = 2x + 1 = 7
        let mut g = inner();
        let x = g.leaf(scalar(3.0), true);
        let xx = g.op_node(scalar(9.0), Op::Mul(x, x));
        let y = g.op_node(scalar(12.0), Op::Add(xx, x));

        g.backward(y).unwrap();
        assert_eq!(g.nodes[y].grad.as_ref().unwrap(), &scalar(1.0));
        assert_eq!(g.nodes[x].grad.as_ref().unwrap(), &scalar(7.0));
    }

    #[test]
    fn test_gradients_accumulate_across_branches() {
        // Two independent consumers of x must sum their contributions.
        let mut g = inner();
        let x = g.leaf(scalar(2.0), true);
        let a = g.op_node(scalar(4.0), Op::Mul(x, x));
        let b = g.op_node(scalar(4.0), Op::Add(x, x));
        let y = g.op_node(scalar(8.0), Op::Add(a, b));

        g.backward(y).unwrap();
        // d/dx (x*x) = 4, d/dx (x+x) = 2
        assert_eq!(g.nodes[x].grad.as_ref().unwrap(), &scalar(6.0));
    }

    #[test]
    fn test_repeated_backward_reuses_cached_order() {
        let mut g = inner();
        let x = g.leaf(scalar(3.0), true);
        let y = g.op_node(scalar(9.0), Op::Mul(x, x));

        g.backward(y).unwrap();
        assert!(g.nodes[y].topo_cache.is_some());
        assert_eq!(g.nodes[x].grad.as_ref().unwrap(), &scalar(6.0));

        // Second sweep reuses the cache and keeps accumulating.
        g.backward(y).unwrap();
        assert_eq!(g.nodes[x].grad.as_ref().unwrap(), &scalar(12.0));
    }

    #[test]
    fn test_constant_subgraph_skipped() {
        let mut g = inner();
        let c = g.leaf(scalar(5.0), false);
        let x = g.leaf(scalar(3.0), true);
        let y = g.op_node(scalar(15.0), Op::Mul(c, x));

        g.backward(y).unwrap();
        assert!(g.nodes[c].grad.is_none());
        assert_eq!(g.nodes[x].grad.as_ref().unwrap(), &scalar(5.0));
    }

    #[test]
    fn test_deep_chain_does_not_exhaust_stack() {
        // A long sequential chain must order and differentiate without
        // recursion depth limits.
        let mut g = inner();
        let leaf = g.leaf(scalar(1.0), true);
        let mut id = leaf;
        for _ in 0..100_000 {
            id = g.op_node(scalar(1.0), Op::Neg(id));
        }

        let order = g.topo_order(id).unwrap();
        assert_eq!(order.len(), 100_001);
        assert_eq!(order[0], leaf);
        assert_eq!(*order.last().unwrap(), id);

        g.backward(id).unwrap();
        // An even number of negations composes to the identity.
        assert_eq!(g.nodes[leaf].grad.as_ref().unwrap(), &scalar(1.0));
    }

    #[test]
    fn test_zero_gradients_resets_buffers() {
        let mut g = inner();
        let x = g.leaf(scalar(3.0), true);
        let y = g.op_node(scalar(9.0), Op::Mul(x, x));
        g.backward(y).unwrap();
        g.zero_gradients();
        assert!(g.nodes[x].grad.as_ref().unwrap().iter().all(|&v| v == 0.0));
    }
}
