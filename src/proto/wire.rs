//! JSON form of the protocol: one `{type, payload?, requestId?}` object per message.

use crate::error::{Error, ErrorKind, Result};
use crate::proto::{Command, ErrorReply, Request, RequestId, Response};
use crate::ten::{Init, NodeSpec};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    request_id: Option<RequestId>,
}

#[derive(Deserialize)]
struct CreateNode {
    name: String,
    spec: NodeSpec,
    #[serde(default)]
    initialization: Option<Init>,
}

#[derive(Deserialize)]
struct Multiply {
    x: String,
    w: String,
    y: String,
}

#[derive(Deserialize)]
struct MultiplyAdd {
    x: String,
    w: String,
    b: String,
    y: String,
}

#[derive(Deserialize)]
struct Relu {
    x: String,
    y: String,
}

#[derive(Deserialize)]
struct Loss {
    actual: String,
    expected: String,
}

#[derive(Deserialize)]
struct SetValues {
    name: String,
    values: Vec<f32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Rate {
    learning_rate: f32,
}

#[derive(Deserialize)]
struct Named {
    name: String,
}

fn payload<T: DeserializeOwned>(command: &str, v: Value) -> Result<T> {
    serde_json::from_value(v).map_err(|e| {
        ErrorKind::Payload {
            command: command.to_string(),
            message: e.to_string(),
        }
        .into()
    })
}

impl Command {
    pub fn from_wire(kind: &str, v: Value) -> Result<Command> {
        Ok(match kind {
            "createNode" => {
                let p: CreateNode = payload(kind, v)?;
                Command::CreateNode {
                    name: p.name,
                    spec: p.spec,
                    initialization: p.initialization,
                }
            }
            "multiply" => {
                let Multiply { x, w, y } = payload(kind, v)?;
                Command::Multiply { x, w, y }
            }
            "multiplyAdd" => {
                let MultiplyAdd { x, w, b, y } = payload(kind, v)?;
                Command::MultiplyAdd { x, w, b, y }
            }
            "relu" => {
                let Relu { x, y } = payload(kind, v)?;
                Command::Relu { x, y }
            }
            "loss" => {
                let Loss { actual, expected } = payload(kind, v)?;
                Command::Loss { actual, expected }
            }
            "setValues" => {
                let SetValues { name, values } = payload(kind, v)?;
                Command::SetValues { name, values }
            }
            "forward" => Command::Forward,
            "calculateGradient" => Command::CalculateGradient,
            "applyGradient" => Command::ApplyGradient {
                learning_rate: payload::<Rate>(kind, v)?.learning_rate,
            },
            "backwardAndAddGradient" => Command::BackwardAndAddGradient {
                learning_rate: payload::<Rate>(kind, v)?.learning_rate,
            },
            "getValues" => Command::GetValues {
                name: payload::<Named>(kind, v)?.name,
            },
            "getSpec" => Command::GetSpec {
                name: payload::<Named>(kind, v)?.name,
            },
            "getComponentsInBuildOrder" => Command::GetComponentsInBuildOrder,
            "finish" => Command::Finish,
            other => return Err(ErrorKind::UnknownCommand(other.to_string()).into()),
        })
    }
}

/// Parse one command message.
///
/// A rejected message comes back as the error reply to send, correlated to
/// its request id when that much could be read.
pub fn decode(text: &str) -> std::result::Result<Request, ErrorReply> {
    let msg: WireMessage = serde_json::from_str(text).map_err(malformed)?;
    match Command::from_wire(&msg.kind, msg.payload) {
        Ok(command) => Ok(Request::new(command, msg.request_id)),
        Err(e) => Err(ErrorReply::new(&e, Some(&msg.kind), msg.request_id)),
    }
}

/// Parse one raw input line, which need not be valid UTF-8.
pub fn decode_bytes(line: &[u8]) -> std::result::Result<Request, ErrorReply> {
    let text = std::str::from_utf8(line).map_err(malformed)?;
    decode(text)
}

fn malformed(e: impl std::fmt::Display) -> ErrorReply {
    let err: Error = ErrorKind::Payload {
        command: "message".into(),
        message: e.to_string(),
    }
    .into();
    ErrorReply::new(&err, None, None)
}

fn message(kind: &str, payload: Option<Value>, request_id: Option<RequestId>) -> Value {
    let mut m = Map::new();
    m.insert("type".into(), kind.into());
    if let Some(p) = payload {
        m.insert("payload".into(), p);
    }
    if let Some(id) = request_id {
        m.insert("requestId".into(), id.into());
    }
    Value::Object(m)
}

impl Response {
    pub fn to_json(&self) -> Value {
        let id = self.request_id();
        let payload = match self {
            Response::Ready | Response::Finish { .. } => None,
            Response::Done { command, .. } => Some(json!({ "type": command })),
            Response::Error(e) => {
                let mut m = Map::new();
                m.insert("message".into(), e.message.clone().into());
                if let Some(c) = &e.command {
                    m.insert("command".into(), c.clone().into());
                }
                Some(Value::Object(m))
            }
            Response::Values {
                values, gradients, ..
            } => Some(json!({ "values": values, "gradients": gradients })),
            Response::Spec { spec, .. } => Some(json!({ "spec": spec })),
            Response::Components { components, .. } => {
                Some(json!({ "componentNames": components }))
            }
        };
        message(self.kind(), payload, id)
    }
}

pub fn encode(r: &Response) -> String {
    r.to_json().to_string()
}
