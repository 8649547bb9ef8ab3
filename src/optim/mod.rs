use crate::back::{Backend, MatrixBuffer};
use crate::error::Result;
use crate::eval::Graph;
use crate::ten::{Component, NodeType};
use log::trace;

pub trait Optimizer {
    fn step<B: Backend>(&mut self, g: &mut Graph<B>) -> Result<()>;
}

/// Plain gradient descent: `value -= lr * gradient` on every `train` node.
#[derive(Debug, Clone, Copy)]
pub struct Sgd {
    lr: f32,
}

impl Sgd {
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }
}

impl Optimizer for Sgd {
    fn step<B: Backend>(&mut self, g: &mut Graph<B>) -> Result<()> {
        for c in g.build_order()?.into_iter().rev() {
            let Component::Node(id) = c else { continue };
            let n = g.node(id);
            if n.spec.node_type != NodeType::Train {
                continue;
            }
            trace!("update {} with lr {}", n.name, self.lr);
            let (value, gradient) = (n.value.clone(), n.gradient.clone());
            value.scaled_add(g.backend(), &gradient, -self.lr)?;
        }
        Ok(())
    }
}
