//! Reverse-mode automatic differentiation with a dynamic computation graph
//!
//! Operators over [`Var`] handles build the graph during the forward pass;
//! [`Var::backward`] orders every ancestor topologically and accumulates
//! gradients by dispatching on each node's [`Op`] tag.

pub mod graph;
pub mod numeric;
pub mod op;
pub mod ops;
pub mod var;

pub use graph::{Graph, Node, NodeId};
pub use numeric::{broadcast_shape, reduce_gradient};
pub use op::{AngleMode, Op};
pub use var::Var;
