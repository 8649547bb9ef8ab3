//! Small reverse-mode differentiation engine over dense matrices.
//!
//! A [`Graph`] holds named matrices ([`ten::Node`]) and the operations between
//! them. Values flow forward in build order, gradients flow back in reverse.
//! The graph runs on a [`back::Backend`] and can be driven in-process or
//! through the command protocol in [`proto`].

pub mod back;
pub mod config;
pub mod error;
pub mod eval;
pub mod optim;
pub mod proto;
pub mod ten;

pub use crate::config::{BackendKind, ContextConfig};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::eval::Graph;
pub use crate::proto::client::GraphClient;
pub use crate::ten::{Init, NodeSpec, NodeType, Shape};
