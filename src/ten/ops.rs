use crate::back::{Backend, Layout};
use crate::error::{mismatch, Result};
use crate::ten::{ComponentDescription, ComponentKind, Node, NodeId, Shape};
use std::fmt::Debug;

/// A kernel wired to concrete nodes.
///
/// Forward reads the input values and overwrites the output value. Backward
/// reads the forward values plus the output gradient and writes the input
/// gradients. Weight and bias gradients are overwritten, gradients flowing
/// into `x` are accumulated so a node feeding several connections sums them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// `y = w * x`
    Multiply { x: NodeId, w: NodeId, y: NodeId },
    /// `y = x * w + b`, `b` is a single row added to every row
    MultiplyAdd {
        x: NodeId,
        w: NodeId,
        b: NodeId,
        y: NodeId,
    },
    /// `y = max(0, x)`
    Relu { x: NodeId, y: NodeId },
}

fn expect_eq(lhs: (&str, usize), rhs: (&str, usize)) -> Result<()> {
    if lhs.1 != rhs.1 {
        return mismatch(format!(
            "{} ({}) must equal {} ({})",
            lhs.0, lhs.1, rhs.0, rhs.1
        ));
    }
    Ok(())
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Multiply { .. } => "multiply",
            Operation::MultiplyAdd { .. } => "multiplyAdd",
            Operation::Relu { .. } => "relu",
        }
    }

    /// Inputs in the order their dependency edges are registered.
    pub fn inputs(&self) -> Vec<NodeId> {
        match *self {
            Operation::Multiply { x, w, .. } => vec![x, w],
            Operation::MultiplyAdd { x, w, b, .. } => vec![x, w, b],
            Operation::Relu { x, .. } => vec![x],
        }
    }

    pub fn output(&self) -> NodeId {
        match *self {
            Operation::Multiply { y, .. } => y,
            Operation::MultiplyAdd { y, .. } => y,
            Operation::Relu { y, .. } => y,
        }
    }

    /// Validate the kernel's shape contract against the shapes of its nodes.
    pub fn check_shapes(&self, shape: impl Fn(NodeId) -> Shape) -> Result<()> {
        match *self {
            Operation::Multiply { x, w, y } => {
                let (x, w, y) = (shape(x), shape(w), shape(y));
                expect_eq(("W width", w.width), ("X height", x.height))?;
                expect_eq(("W height", w.height), ("Y height", y.height))?;
                expect_eq(("X width", x.width), ("Y width", y.width))
            }
            Operation::MultiplyAdd { x, w, b, y } => {
                let (x, w, b, y) = (shape(x), shape(w), shape(b), shape(y));
                expect_eq(("X width", x.width), ("W height", w.height))?;
                expect_eq(("B height", b.height), ("one row", 1))?;
                expect_eq(("B width", b.width), ("W width", w.width))?;
                expect_eq(("Y height", y.height), ("X height", x.height))?;
                expect_eq(("Y width", y.width), ("W width", w.width))
            }
            Operation::Relu { x, y } => {
                let (x, y) = (shape(x), shape(y));
                expect_eq(("X width", x.width), ("Y width", y.width))?;
                expect_eq(("X height", x.height), ("Y height", y.height))
            }
        }
    }

    pub fn describe<Buf>(&self, index: usize, nodes: &[Node<Buf>]) -> ComponentDescription {
        let n = |id: NodeId| nodes[id].name.as_str();
        let detail = match *self {
            Operation::Multiply { x, w, y } => format!("{} = {} * {}", n(y), n(w), n(x)),
            Operation::MultiplyAdd { x, w, b, y } => {
                format!("{} = {} * {} + {}", n(y), n(x), n(w), n(b))
            }
            Operation::Relu { x, y } => format!("{} = relu({})", n(y), n(x)),
        };
        ComponentDescription {
            name: format!("{}#{}", self.kind(), index),
            kind: ComponentKind::Operation,
            detail,
        }
    }

    pub fn forward<B: Backend>(&self, b: &mut B, nodes: &[Node<B::Buffer>]) -> Result<()> {
        match *self {
            Operation::Multiply { x, w, y } => b.gemm(
                &nodes[w].value,
                Layout::Normal,
                &nodes[x].value,
                Layout::Normal,
                &nodes[y].value,
                false,
            ),
            Operation::MultiplyAdd { x, w, b: bias, y } => {
                b.gemm(
                    &nodes[x].value,
                    Layout::Normal,
                    &nodes[w].value,
                    Layout::Normal,
                    &nodes[y].value,
                    false,
                )?;
                b.add_row(&nodes[bias].value, &nodes[y].value)
            }
            Operation::Relu { x, y } => b.relu(&nodes[x].value, &nodes[y].value),
        }
    }

    pub fn backward<B: Backend>(&self, b: &mut B, nodes: &[Node<B::Buffer>]) -> Result<()> {
        match *self {
            Operation::Multiply { x, w, y } => {
                // dW += dY * X^t
                b.gemm(
                    &nodes[y].gradient,
                    Layout::Normal,
                    &nodes[x].value,
                    Layout::Transposed,
                    &nodes[w].gradient,
                    true,
                )?;
                // dX += W^t * dY
                b.gemm(
                    &nodes[w].value,
                    Layout::Transposed,
                    &nodes[y].gradient,
                    Layout::Normal,
                    &nodes[x].gradient,
                    true,
                )
            }
            Operation::MultiplyAdd { x, w, b: bias, y } => {
                // dW = X^t * dY
                b.gemm(
                    &nodes[x].value,
                    Layout::Transposed,
                    &nodes[y].gradient,
                    Layout::Normal,
                    &nodes[w].gradient,
                    false,
                )?;
                b.col_sum(&nodes[y].gradient, &nodes[bias].gradient)?;
                // dX += dY * W^t
                b.gemm(
                    &nodes[y].gradient,
                    Layout::Normal,
                    &nodes[w].value,
                    Layout::Transposed,
                    &nodes[x].gradient,
                    true,
                )
            }
            Operation::Relu { x, y } => {
                b.relu_backward(&nodes[y].value, &nodes[y].gradient, &nodes[x].gradient)
            }
        }
    }
}

/// Seed `actual`'s gradient from the pair difference.
pub fn loss_seed<B: Backend>(
    b: &mut B,
    actual: &Node<B::Buffer>,
    expected: &Node<B::Buffer>,
) -> Result<()> {
    b.loss(&expected.value, &actual.value, &actual.gradient)
}
