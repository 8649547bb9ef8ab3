//! The execution context: one thread owning the backend and the graph.

use crate::back::cpu::CpuBackend;
use crate::back::Backend;
use crate::config::{BackendKind, ContextConfig};
use crate::error::{Error, ErrorKind, Result};
use crate::eval::Graph;
use crate::proto::{Command, Request, RequestId, Response};
use log::{debug, error, info, warn};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, Sender};
use std::thread::JoinHandle;

/// Answers one command at a time.
pub trait Handler {
    fn handle(&mut self, req: Request) -> Response;
}

/// A graph waiting for commands.
#[derive(Debug)]
pub struct Context<B: Backend> {
    graph: Graph<B>,
}

impl<B: Backend> Context<B> {
    pub fn new(graph: Graph<B>) -> Self {
        Self { graph }
    }

    pub fn graph(&mut self) -> &mut Graph<B> {
        &mut self.graph
    }

    fn execute(&mut self, command: Command, request_id: Option<RequestId>) -> Result<Response> {
        let kind = command.name();
        let g = &mut self.graph;
        match command {
            Command::CreateNode {
                name,
                spec,
                initialization,
            } => {
                g.create_node(&name, spec, initialization)?;
            }
            Command::Multiply { x, w, y } => {
                g.multiply(&x, &w, &y)?;
            }
            Command::MultiplyAdd { x, w, b, y } => {
                g.multiply_add(&x, &w, &b, &y)?;
            }
            Command::Relu { x, y } => {
                g.relu(&x, &y)?;
            }
            Command::Loss { actual, expected } => g.add_loss_pair(&actual, &expected)?,
            Command::SetValues { name, values } => g.set_values(&name, &values)?,
            Command::Forward => g.forward()?,
            Command::CalculateGradient => g.calculate_gradient()?,
            Command::ApplyGradient { learning_rate } => g.apply_gradient(learning_rate)?,
            Command::BackwardAndAddGradient { learning_rate } => {
                g.backward_and_add_gradient(learning_rate)?
            }
            Command::GetValues { name } => {
                return Ok(Response::Values {
                    values: g.values(&name)?,
                    gradients: g.gradients(&name)?,
                    request_id,
                })
            }
            Command::GetSpec { name } => {
                return Ok(Response::Spec {
                    spec: g.spec(&name)?,
                    request_id,
                })
            }
            Command::GetComponentsInBuildOrder => {
                return Ok(Response::Components {
                    components: g.components_in_build_order()?,
                    request_id,
                })
            }
            Command::Finish => {
                g.finish()?;
                return Ok(Response::Finish { request_id });
            }
        }
        Ok(Response::Done {
            command: kind,
            request_id,
        })
    }
}

impl<B: Backend> Handler for Context<B> {
    fn handle(&mut self, req: Request) -> Response {
        let kind = req.command.name();
        let id = req.request_id;
        debug!("{kind} (request {id:?})");
        match self.execute(req.command, id) {
            Ok(r) => r,
            Err(e) => {
                warn!("{kind} (request {id:?}) failed: {e}");
                Response::error(&e, Some(kind), id)
            }
        }
    }
}

/// Stands in for a context whose initialization failed.
#[derive(Debug)]
struct Unready {
    reason: String,
}

impl Handler for Unready {
    fn handle(&mut self, req: Request) -> Response {
        let err: Error = ErrorKind::NotReady {
            reason: self.reason.clone(),
        }
        .into();
        Response::error(&err, Some(req.command.name()), req.request_id)
    }
}

fn seeded<B: Backend>(b: B, seed: Option<u64>) -> Graph<B> {
    match seed {
        Some(seed) => Graph::seeded(b, seed),
        None => Graph::new(b),
    }
}

/// Open the configured backend and wrap a fresh graph around it.
pub fn open(config: &ContextConfig) -> Result<Box<dyn Handler>> {
    info!("opening {} graph context", config.backend);
    match config.backend {
        BackendKind::Cpu => Ok(Box::new(Context::new(seeded(
            CpuBackend::new(),
            config.seed,
        )))),
        #[cfg(feature = "wgpu")]
        BackendKind::Wgpu => {
            let b = pollster::block_on(crate::back::wgpu::WgpuBackend::new())?;
            Ok(Box::new(Context::new(seeded(b, config.seed))))
        }
        #[cfg(not(feature = "wgpu"))]
        BackendKind::Wgpu => Err(ErrorKind::Config("built without the wgpu feature".into()).into()),
    }
}

/// Start a context thread for `config`.
pub fn spawn(
    config: ContextConfig,
    requests: Receiver<Request>,
    responses: Sender<Response>,
) -> Result<JoinHandle<()>> {
    spawn_with(move || open(&config), requests, responses)
}

/// Start a context thread whose handler is built by `init` on that thread.
///
/// `ready` is sent once `init` succeeds. If it fails a single uncorrelated
/// error is sent instead and every command is answered with `NotReady`.
/// The thread exits when `requests` is closed.
pub fn spawn_with<F>(
    init: F,
    requests: Receiver<Request>,
    responses: Sender<Response>,
) -> Result<JoinHandle<()>>
where
    F: FnOnce() -> Result<Box<dyn Handler>> + Send + 'static,
{
    std::thread::Builder::new()
        .name("graph-worker".into())
        .spawn(move || {
            let mut handler: Box<dyn Handler> = match init() {
                Ok(h) => {
                    info!("graph context ready");
                    if responses.send(Response::Ready).is_err() {
                        return;
                    }
                    h
                }
                Err(e) => {
                    warn!("graph context failed to initialize: {e}");
                    if responses.send(Response::error(&e, None, None)).is_err() {
                        return;
                    }
                    Box::new(Unready {
                        reason: e.to_string(),
                    })
                }
            };
            for req in requests.iter() {
                if responses.send(handle_caught(handler.as_mut(), req)).is_err() {
                    break;
                }
            }
            info!("graph context shut down");
        })
        .map_err(|e| ErrorKind::Device(format!("spawning graph worker: {e}")).into())
}

/// Runs one command, turning a panic into an error reply for that command.
fn handle_caught(handler: &mut dyn Handler, req: Request) -> Response {
    let (command, id) = (req.command.name(), req.request_id);
    match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(req))) {
        Ok(r) => r,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".into());
            error!("{command} (request {id:?}) panicked: {msg}");
            Response::error(&ErrorKind::Internal(msg).into(), Some(command), id)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::proto::ErrorReply;
    use crate::ten::{NodeSpec, NodeType};
    use std::sync::mpsc::channel;

    fn request(command: Command, id: RequestId) -> Request {
        Request::new(command, Some(id))
    }

    #[test]
    fn test_context_replies() {
        let mut ctx = Context::new(Graph::seeded(CpuBackend::new(), 1));
        let r = ctx.handle(request(
            Command::CreateNode {
                name: "X".into(),
                spec: NodeSpec::new(2, 1, NodeType::Input),
                initialization: None,
            },
            1,
        ));
        assert_eq!(
            r,
            Response::Done {
                command: "createNode",
                request_id: Some(1)
            }
        );

        let r = ctx.handle(request(
            Command::SetValues {
                name: "X".into(),
                values: vec![1.0, 2.0],
            },
            2,
        ));
        assert_eq!(r.request_id(), Some(2));

        let r = ctx.handle(request(Command::GetValues { name: "X".into() }, 3));
        assert_eq!(
            r,
            Response::Values {
                values: vec![1.0, 2.0],
                gradients: vec![0.0, 0.0],
                request_id: Some(3)
            }
        );

        let r = ctx.handle(request(Command::GetSpec { name: "Q".into() }, 4));
        let Response::Error(ErrorReply {
            message,
            command,
            request_id,
        }) = &r
        else {
            panic!("expected an error, got {r:?}")
        };
        assert_eq!(command.as_deref(), Some("getSpec"));
        assert_eq!(*request_id, Some(4));
        assert!(message.contains("Q"));

        let r = ctx.handle(request(Command::Finish, 5));
        assert_eq!(r, Response::Finish { request_id: Some(5) });
    }

    #[test]
    fn test_failed_init_answers_not_ready() {
        let (req_tx, req_rx) = channel();
        let (resp_tx, resp_rx) = channel();
        let handle = spawn_with(
            || Err(ErrorKind::Device("no adapter".into()).into()),
            req_rx,
            resp_tx,
        )
        .unwrap();

        req_tx.send(request(Command::Forward, 1)).unwrap();
        req_tx.send(request(Command::Finish, 2)).unwrap();
        drop(req_tx);
        handle.join().unwrap();

        let responses = resp_rx.iter().collect::<Vec<_>>();
        assert_eq!(responses.len(), 3);
        let Response::Error(first) = &responses[0] else {
            panic!("expected an init error")
        };
        assert_eq!(first.request_id, None);
        assert!(first.message.contains("no adapter"));
        for (r, id) in responses[1..].iter().zip([1, 2]) {
            let Response::Error(e) = r else {
                panic!("expected NotReady, got {r:?}")
            };
            assert_eq!(e.request_id, Some(id));
            assert!(e.message.contains("not ready"));
        }
    }

    struct Flaky;

    impl Handler for Flaky {
        fn handle(&mut self, req: Request) -> Response {
            match req.command {
                Command::Forward => panic!("kernel exploded"),
                Command::Finish => Response::Finish {
                    request_id: req.request_id,
                },
                _ => Response::error(&ErrorKind::Device("unused".into()).into(), None, None),
            }
        }
    }

    #[test]
    fn test_panicking_command_is_answered_and_worker_keeps_serving() {
        let (req_tx, req_rx) = channel();
        let (resp_tx, resp_rx) = channel();
        let handle = spawn_with(|| Ok(Box::new(Flaky) as Box<dyn Handler>), req_rx, resp_tx).unwrap();

        req_tx.send(request(Command::Forward, 1)).unwrap();
        req_tx.send(request(Command::Finish, 2)).unwrap();
        drop(req_tx);
        handle.join().unwrap();

        let responses = resp_rx.iter().collect::<Vec<_>>();
        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0], Response::Ready);
        let Response::Error(e) = &responses[1] else {
            panic!("expected an error, got {:?}", responses[1])
        };
        assert_eq!(e.request_id, Some(1));
        assert_eq!(e.command.as_deref(), Some("forward"));
        assert!(e.message.contains("kernel exploded"));
        assert_eq!(responses[2], Response::Finish { request_id: Some(2) });
    }
}
