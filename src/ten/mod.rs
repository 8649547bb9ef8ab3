pub mod ops;
pub mod shape;

pub use ops::*;
pub use shape::*;

use derivative::Derivative;
use serde::{Deserialize, Serialize};

pub type NodeId = usize;
pub type ConnId = usize;

/// Anything that takes part in the build order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    Node(NodeId),
    Connection(ConnId),
}

/// Named matrix with its gradient.
///
/// Both buffers are allocated when the node is created and live as long as the graph.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Node<Buf> {
    pub name: String,
    pub spec: NodeSpec,
    #[derivative(Debug = "ignore")]
    pub value: Buf,
    #[derivative(Debug = "ignore")]
    pub gradient: Buf,
}

impl<Buf> Node<Buf> {
    pub fn shape(&self) -> Shape {
        self.spec.shape()
    }

    pub fn describe(&self) -> ComponentDescription {
        ComponentDescription {
            name: self.name.clone(),
            kind: ComponentKind::Node,
            detail: format!("{} : matrix {}", self.name, self.shape()),
        }
    }
}

/// An (actual, expected) pair whose difference seeds `actual`'s gradient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossPair {
    pub actual: NodeId,
    pub expected: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Node,
    Operation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ComponentKind,
    pub detail: String,
}
