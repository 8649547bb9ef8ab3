mod dot;
mod order;

pub use order::topo;

use crate::back::{Backend, MatrixBuffer};
use crate::error::{mismatch, ErrorKind, Result};
use crate::optim::{Optimizer, Sgd};
use crate::ten::{
    loss_seed, Component, ComponentDescription, ConnId, Init, LossPair, Node, NodeId, NodeSpec,
    NodeType, Operation,
};
use derivative::Derivative;
use fnv::FnvHashMap;
use log::{debug, trace};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Dependency graph of named matrices and the operations between them.
///
/// Nodes and connections are kept in creation order, which together with the
/// edge insertion order makes [`Graph::build_order`] deterministic. The graph
/// has no mode: callers run [`Graph::forward`] before
/// [`Graph::calculate_gradient`] so the values the backward kernels read are
/// current.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Graph<B: Backend> {
    #[derivative(Debug = "ignore")]
    b: B,
    #[derivative(Debug = "ignore")]
    rng: StdRng,

    nodes: Vec<Node<B::Buffer>>,
    names: FnvHashMap<String, NodeId>,
    connections: Vec<Operation>,

    // Every node and connection, in creation order
    components: Vec<Component>,
    // (source, target): source must be computed before target
    edges: Vec<(Component, Component)>,
    loss_pairs: Vec<LossPair>,
}

impl<B: Backend> Graph<B> {
    pub fn new(b: B) -> Self {
        Self::with_rng(b, StdRng::from_entropy())
    }

    /// Graph whose random initialization is reproducible.
    pub fn seeded(b: B, seed: u64) -> Self {
        Self::with_rng(b, StdRng::seed_from_u64(seed))
    }

    fn with_rng(b: B, rng: StdRng) -> Self {
        Self {
            b,
            rng,
            nodes: vec![],
            names: Default::default(),
            connections: vec![],
            components: vec![],
            edges: vec![],
            loss_pairs: vec![],
        }
    }

    pub fn backend(&mut self) -> &mut B {
        &mut self.b
    }

    pub fn node_id(&self, name: &str) -> Result<NodeId> {
        self.names.get(name).copied().ok_or_else(|| {
            ErrorKind::UnknownNode {
                name: name.to_string(),
            }
            .into()
        })
    }

    pub fn node(&self, id: NodeId) -> &Node<B::Buffer> {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> &[Node<B::Buffer>] {
        &self.nodes
    }

    pub fn connections(&self) -> &[Operation] {
        &self.connections
    }

    pub fn edges(&self) -> &[(Component, Component)] {
        &self.edges
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name.as_str())
    }

    pub fn create_node(&mut self, name: &str, spec: NodeSpec, init: Option<Init>) -> Result<NodeId> {
        if self.names.contains_key(name) {
            return Err(ErrorKind::DuplicateName {
                name: name.to_string(),
            }
            .into());
        }
        let shape = spec.shape();
        shape.validate()?;
        let data = init
            .unwrap_or_default()
            .materialize(&shape, &mut self.rng)?
            .into_raw_vec();

        let value = self.b.buffer(&shape)?;
        value.write(&mut self.b, &data)?;
        let gradient = self.b.buffer(&shape)?;

        let id = self.nodes.len();
        debug!("create node {name}: {shape} {:?}", spec.node_type);
        self.nodes.push(Node {
            name: name.to_string(),
            spec,
            value,
            gradient,
        });
        self.names.insert(name.to_string(), id);
        self.components.push(Component::Node(id));
        Ok(id)
    }

    /// `y = w * x`
    pub fn multiply(&mut self, x: &str, w: &str, y: &str) -> Result<ConnId> {
        let op = Operation::Multiply {
            x: self.node_id(x)?,
            w: self.node_id(w)?,
            y: self.node_id(y)?,
        };
        self.connect(op)
    }

    /// `y = x * w + b`
    pub fn multiply_add(&mut self, x: &str, w: &str, b: &str, y: &str) -> Result<ConnId> {
        let op = Operation::MultiplyAdd {
            x: self.node_id(x)?,
            w: self.node_id(w)?,
            b: self.node_id(b)?,
            y: self.node_id(y)?,
        };
        self.connect(op)
    }

    /// `y = max(0, x)`
    pub fn relu(&mut self, x: &str, y: &str) -> Result<ConnId> {
        let op = Operation::Relu {
            x: self.node_id(x)?,
            y: self.node_id(y)?,
        };
        self.connect(op)
    }

    /// Register a connection and its dependency edges.
    pub fn connect(&mut self, op: Operation) -> Result<ConnId> {
        let known = |id: NodeId| {
            if id < self.nodes.len() {
                Ok(())
            } else {
                Err(ErrorKind::UnknownNode {
                    name: format!("#{id}"),
                })
            }
        };
        for id in op.inputs().into_iter().chain([op.output()]) {
            known(id)?;
        }
        op.check_shapes(|id| self.nodes[id].shape())?;

        let id = self.connections.len();
        let this = Component::Connection(id);
        for input in op.inputs() {
            self.edges.push((Component::Node(input), this));
        }
        self.edges.push((this, Component::Node(op.output())));
        debug!("connect {}", op.describe(id, &self.nodes).detail);
        self.connections.push(op);
        self.components.push(this);
        Ok(id)
    }

    pub fn add_loss_pair(&mut self, actual: &str, expected: &str) -> Result<()> {
        let actual = self.node_id(actual)?;
        let expected = self.node_id(expected)?;
        let (sa, se) = (self.nodes[actual].shape(), self.nodes[expected].shape());
        if sa != se {
            return mismatch(format!("actual ({sa}) must have the same shape as expected ({se})"));
        }
        self.loss_pairs.push(LossPair { actual, expected });
        Ok(())
    }

    pub fn loss_pairs(&self) -> &[LossPair] {
        &self.loss_pairs
    }

    /// All nodes and connections, every source before its targets.
    pub fn build_order(&self) -> Result<Vec<Component>> {
        topo(&self.components, &self.edges).map_err(|c| {
            ErrorKind::CyclicDependency {
                component: self.describe(c).detail,
            }
            .into()
        })
    }

    pub fn describe(&self, c: Component) -> ComponentDescription {
        match c {
            Component::Node(id) => self.nodes[id].describe(),
            Component::Connection(id) => self.connections[id].describe(id, &self.nodes),
        }
    }

    pub fn components_in_build_order(&self) -> Result<Vec<ComponentDescription>> {
        Ok(self
            .build_order()?
            .into_iter()
            .map(|c| self.describe(c))
            .collect())
    }

    pub fn forward(&mut self) -> Result<()> {
        for c in self.build_order()? {
            if let Component::Connection(id) = c {
                let op = self.connections[id];
                trace!("forward {}#{id}", op.kind());
                op.forward(&mut self.b, &self.nodes)?;
            }
        }
        Ok(())
    }

    /// Recompute every gradient from the loss pairs.
    ///
    /// Gradients of `output` nodes are not cleared, they are expected to be
    /// seeded by a loss pair or by the caller.
    pub fn calculate_gradient(&mut self) -> Result<()> {
        for n in &self.nodes {
            if n.spec.node_type != NodeType::Output {
                self.b.zero(&n.gradient)?;
            }
        }
        for p in &self.loss_pairs {
            loss_seed(&mut self.b, &self.nodes[p.actual], &self.nodes[p.expected])?;
        }
        for c in self.build_order()?.into_iter().rev() {
            if let Component::Connection(id) = c {
                let op = self.connections[id];
                trace!("backward {}#{id}", op.kind());
                op.backward(&mut self.b, &self.nodes)?;
            }
        }
        Ok(())
    }

    /// Gradient descent step on every `train` node.
    pub fn apply_gradient(&mut self, learning_rate: f32) -> Result<()> {
        Sgd::new(learning_rate).step(self)
    }

    pub fn backward_and_add_gradient(&mut self, learning_rate: f32) -> Result<()> {
        self.calculate_gradient()?;
        self.apply_gradient(learning_rate)
    }

    pub fn set_values(&mut self, name: &str, values: &[f32]) -> Result<()> {
        let id = self.node_id(name)?;
        self.nodes[id].value.write(&mut self.b, values)
    }

    pub fn values(&mut self, name: &str) -> Result<Vec<f32>> {
        let id = self.node_id(name)?;
        self.nodes[id].value.read(&mut self.b)
    }

    pub fn gradients(&mut self, name: &str) -> Result<Vec<f32>> {
        let id = self.node_id(name)?;
        self.nodes[id].gradient.read(&mut self.b)
    }

    pub fn spec(&self, name: &str) -> Result<NodeSpec> {
        Ok(self.nodes[self.node_id(name)?].spec)
    }

    /// `1/2 * sum (actual - expected)^2` over all loss pairs, read back from the device.
    pub fn loss_value(&mut self) -> Result<f32> {
        let mut total = 0.0f64;
        for p in &self.loss_pairs {
            let actual = self.nodes[p.actual].value.read(&mut self.b)?;
            let expected = self.nodes[p.expected].value.read(&mut self.b)?;
            total += actual
                .iter()
                .zip(&expected)
                .map(|(a, e)| 0.5 * (*a as f64 - *e as f64).powi(2))
                .sum::<f64>();
        }
        Ok(total as f32)
    }

    /// Wait for all queued device work.
    pub fn finish(&mut self) -> Result<()> {
        self.b.finish()
    }
}
