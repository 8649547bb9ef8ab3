//! Command/response protocol between a controller and the graph context.
//!
//! Commands are processed one at a time in arrival order. Replies are matched
//! to their commands through the request id the controller picked.

pub mod client;
pub mod wire;
pub mod worker;

use crate::error::Error;
use crate::ten::{ComponentDescription, Init, NodeSpec};

pub type RequestId = u64;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CreateNode {
        name: String,
        spec: NodeSpec,
        initialization: Option<Init>,
    },
    Multiply {
        x: String,
        w: String,
        y: String,
    },
    MultiplyAdd {
        x: String,
        w: String,
        b: String,
        y: String,
    },
    Relu {
        x: String,
        y: String,
    },
    Loss {
        actual: String,
        expected: String,
    },
    SetValues {
        name: String,
        values: Vec<f32>,
    },
    Forward,
    CalculateGradient,
    ApplyGradient {
        learning_rate: f32,
    },
    BackwardAndAddGradient {
        learning_rate: f32,
    },
    GetValues {
        name: String,
    },
    GetSpec {
        name: String,
    },
    GetComponentsInBuildOrder,
    Finish,
}

impl Command {
    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreateNode { .. } => "createNode",
            Command::Multiply { .. } => "multiply",
            Command::MultiplyAdd { .. } => "multiplyAdd",
            Command::Relu { .. } => "relu",
            Command::Loss { .. } => "loss",
            Command::SetValues { .. } => "setValues",
            Command::Forward => "forward",
            Command::CalculateGradient => "calculateGradient",
            Command::ApplyGradient { .. } => "applyGradient",
            Command::BackwardAndAddGradient { .. } => "backwardAndAddGradient",
            Command::GetValues { .. } => "getValues",
            Command::GetSpec { .. } => "getSpec",
            Command::GetComponentsInBuildOrder => "getComponentsInBuildOrder",
            Command::Finish => "finish",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub command: Command,
    pub request_id: Option<RequestId>,
}

impl Request {
    pub fn new(command: Command, request_id: Option<RequestId>) -> Self {
        Self {
            command,
            request_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReply {
    pub message: String,
    pub command: Option<String>,
    pub request_id: Option<RequestId>,
}

impl ErrorReply {
    pub fn new(err: &Error, command: Option<&str>, request_id: Option<RequestId>) -> Self {
        Self {
            message: err.to_string(),
            command: command.map(str::to_string),
            request_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Sent once, unsolicited, after the context is initialized.
    Ready,
    Done {
        command: &'static str,
        request_id: Option<RequestId>,
    },
    Error(ErrorReply),
    Values {
        values: Vec<f32>,
        gradients: Vec<f32>,
        request_id: Option<RequestId>,
    },
    Spec {
        spec: NodeSpec,
        request_id: Option<RequestId>,
    },
    Components {
        components: Vec<ComponentDescription>,
        request_id: Option<RequestId>,
    },
    Finish {
        request_id: Option<RequestId>,
    },
}

impl Response {
    pub fn error(err: &Error, command: Option<&str>, request_id: Option<RequestId>) -> Self {
        Response::Error(ErrorReply::new(err, command, request_id))
    }

    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Response::Ready => None,
            Response::Error(e) => e.request_id,
            Response::Done { request_id, .. }
            | Response::Values { request_id, .. }
            | Response::Spec { request_id, .. }
            | Response::Components { request_id, .. }
            | Response::Finish { request_id } => *request_id,
        }
    }

    /// Wire name of the response.
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Ready => "ready",
            Response::Done { .. } => "done",
            Response::Error(_) => "error",
            Response::Values { .. } => "getValues",
            Response::Spec { .. } => "getSpec",
            Response::Components { .. } => "getComponentsInBuildOrder",
            Response::Finish { .. } => "finish",
        }
    }
}
