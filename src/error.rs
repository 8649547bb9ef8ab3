use crate::ten::Shape;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ErrorKind {
    #[error("Node with name {name} already exists")]
    DuplicateName { name: String },
    #[error("Node with name {name} not found")]
    UnknownNode { name: String },
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error("Cyclic dependency detected in graph at {component}")]
    CyclicDependency { component: String },
    #[error("Data size ({got}) does not match matrix dimensions ({shape})")]
    SizeMismatch { got: usize, shape: Shape },
    #[error("Cannot bind buffer {buffer} as kernel target: {reason}")]
    TargetBinding { buffer: u64, reason: String },
    #[error("Graph context not ready: {reason}")]
    NotReady { reason: String },
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    #[error("Malformed payload for {command}: {message}")]
    Payload { command: String, message: String },
    #[error("Device error: {0}")]
    Device(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Internal error: {0}")]
    Internal(String),
    #[error("{command} failed: {message}")]
    Remote { command: String, message: String },
    #[error("Graph context disconnected")]
    Disconnected,
}

pub type Error = Box<ErrorKind>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(crate) fn mismatch<T>(msg: impl Into<String>) -> Result<T> {
    Err(ErrorKind::DimensionMismatch(msg.into()).into())
}
