//! Controller side: sends commands without blocking and resolves replies by request id.

use crate::config::ContextConfig;
use crate::error::{ErrorKind, Result};
use crate::proto::worker::{self, Handler};
use crate::proto::{Command, ErrorReply, Request, RequestId, Response};
use crate::ten::{ComponentDescription, Init, NodeSpec};
use fnv::FnvHashMap;
use futures_intrusive::channel::shared::{oneshot_channel, OneshotSender};
use futures_intrusive::sync::ManualResetEvent;
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

type Pending = Arc<Mutex<FnvHashMap<RequestId, OneshotSender<Response>>>>;

/// Values and gradients of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeValues {
    pub values: Vec<f32>,
    pub gradients: Vec<f32>,
}

/// Outcome of initialization, published once by the dispatcher.
struct ReadyState {
    event: ManualResetEvent,
    outcome: Mutex<Option<std::result::Result<(), String>>>,
}

impl ReadyState {
    fn new() -> Self {
        Self {
            event: ManualResetEvent::new(false),
            outcome: Mutex::new(None),
        }
    }

    fn publish(&self, outcome: std::result::Result<(), String>) {
        if let Ok(mut o) = self.outcome.lock() {
            if o.is_none() {
                *o = Some(outcome);
            }
        }
        self.event.set();
    }
}

/// Handle to a graph context running on its own thread.
///
/// Mutating and executing commands return as soon as they are queued. Their
/// error replies are collected and can be drained with
/// [`GraphClient::take_errors`]. Queries are `async` and resolve to their
/// own reply.
pub struct GraphClient {
    requests: Option<Sender<Request>>,
    pending: Pending,
    next_id: AtomicU64,
    ready: Arc<ReadyState>,
    errors: Arc<Mutex<Vec<ErrorReply>>>,
    threads: Vec<JoinHandle<()>>,
}

impl GraphClient {
    pub fn spawn(config: ContextConfig) -> Result<Self> {
        Self::spawn_with(move || worker::open(&config))
    }

    pub fn spawn_with<F>(init: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Box<dyn Handler>> + Send + 'static,
    {
        let (req_tx, req_rx) = channel();
        let (resp_tx, resp_rx) = channel();
        let worker = worker::spawn_with(init, req_rx, resp_tx)?;

        let pending = Pending::default();
        let ready = Arc::new(ReadyState::new());
        let errors = Arc::new(Mutex::new(vec![]));
        let dispatcher = {
            let (pending, ready, errors) = (pending.clone(), ready.clone(), errors.clone());
            std::thread::Builder::new()
                .name("graph-dispatch".into())
                .spawn(move || dispatch(resp_rx, pending, ready, errors))
                .map_err(|e| ErrorKind::Device(format!("spawning dispatcher: {e}")))?
        };

        Ok(Self {
            requests: Some(req_tx),
            pending,
            next_id: AtomicU64::new(1),
            ready,
            errors,
            threads: vec![worker, dispatcher],
        })
    }

    /// Queue any command without waiting for its reply.
    pub fn submit(&self, command: Command) -> Result<RequestId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send_with_id(command, id)?;
        Ok(id)
    }

    fn send_with_id(&self, command: Command, id: RequestId) -> Result<()> {
        debug!("send {} (request {id})", command.name());
        let tx = self.requests.as_ref().ok_or(ErrorKind::Disconnected)?;
        tx.send(Request::new(command, Some(id)))
            .map_err(|_| ErrorKind::Disconnected.into())
    }

    async fn request(&self, command: Command) -> Result<Response> {
        let name = command.name();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot_channel();
        self.pending
            .lock()
            .map_err(|_| ErrorKind::Disconnected)?
            .insert(id, tx);
        if let Err(e) = self.send_with_id(command, id) {
            if let Ok(mut p) = self.pending.lock() {
                p.remove(&id);
            }
            return Err(e);
        }

        match rx.receive().await {
            Some(Response::Error(e)) => Err(ErrorKind::Remote {
                command: e.command.unwrap_or_else(|| name.to_string()),
                message: e.message,
            }
            .into()),
            Some(r) => Ok(r),
            None => Err(ErrorKind::Disconnected.into()),
        }
    }

    /// Resolves once the context has initialized, or failed to.
    pub async fn wait_for_ready(&self) -> Result<()> {
        self.ready.event.wait().await;
        let outcome = self
            .ready
            .outcome
            .lock()
            .map_err(|_| ErrorKind::Disconnected)?
            .clone();
        match outcome {
            Some(Ok(())) => Ok(()),
            Some(Err(reason)) => Err(ErrorKind::NotReady { reason }.into()),
            None => Err(ErrorKind::Disconnected.into()),
        }
    }

    pub fn create_node(
        &self,
        name: &str,
        spec: NodeSpec,
        initialization: Option<Init>,
    ) -> Result<RequestId> {
        self.submit(Command::CreateNode {
            name: name.into(),
            spec,
            initialization,
        })
    }

    pub fn multiply(&self, x: &str, w: &str, y: &str) -> Result<RequestId> {
        self.submit(Command::Multiply {
            x: x.into(),
            w: w.into(),
            y: y.into(),
        })
    }

    pub fn multiply_add(&self, x: &str, w: &str, b: &str, y: &str) -> Result<RequestId> {
        self.submit(Command::MultiplyAdd {
            x: x.into(),
            w: w.into(),
            b: b.into(),
            y: y.into(),
        })
    }

    pub fn relu(&self, x: &str, y: &str) -> Result<RequestId> {
        self.submit(Command::Relu {
            x: x.into(),
            y: y.into(),
        })
    }

    pub fn loss(&self, actual: &str, expected: &str) -> Result<RequestId> {
        self.submit(Command::Loss {
            actual: actual.into(),
            expected: expected.into(),
        })
    }

    pub fn set_values(&self, name: &str, values: Vec<f32>) -> Result<RequestId> {
        self.submit(Command::SetValues {
            name: name.into(),
            values,
        })
    }

    pub fn forward(&self) -> Result<RequestId> {
        self.submit(Command::Forward)
    }

    pub fn calculate_gradient(&self) -> Result<RequestId> {
        self.submit(Command::CalculateGradient)
    }

    pub fn apply_gradient(&self, learning_rate: f32) -> Result<RequestId> {
        self.submit(Command::ApplyGradient { learning_rate })
    }

    pub fn backward_and_add_gradient(&self, learning_rate: f32) -> Result<RequestId> {
        self.submit(Command::BackwardAndAddGradient { learning_rate })
    }

    pub async fn get_values(&self, name: &str) -> Result<NodeValues> {
        match self.request(Command::GetValues { name: name.into() }).await? {
            Response::Values {
                values, gradients, ..
            } => Ok(NodeValues { values, gradients }),
            other => unexpected("getValues", &other),
        }
    }

    pub async fn get_spec(&self, name: &str) -> Result<NodeSpec> {
        match self.request(Command::GetSpec { name: name.into() }).await? {
            Response::Spec { spec, .. } => Ok(spec),
            other => unexpected("getSpec", &other),
        }
    }

    pub async fn get_components_in_build_order(&self) -> Result<Vec<ComponentDescription>> {
        match self.request(Command::GetComponentsInBuildOrder).await? {
            Response::Components { components, .. } => Ok(components),
            other => unexpected("getComponentsInBuildOrder", &other),
        }
    }

    /// Resolves after every previously queued command has completed.
    pub async fn finish(&self) -> Result<()> {
        match self.request(Command::Finish).await? {
            Response::Finish { .. } => Ok(()),
            other => unexpected("finish", &other),
        }
    }

    /// Error replies that no pending request claimed, oldest first.
    pub fn take_errors(&self) -> Vec<ErrorReply> {
        match self.errors.lock() {
            Ok(mut e) => std::mem::take(&mut *e),
            Err(_) => vec![],
        }
    }
}

impl Drop for GraphClient {
    fn drop(&mut self) {
        // Closing the request channel stops the worker, which stops the dispatcher
        self.requests.take();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

fn unexpected<T>(command: &str, r: &Response) -> Result<T> {
    Err(ErrorKind::Remote {
        command: command.to_string(),
        message: format!("unexpected {} reply", r.kind()),
    }
    .into())
}

fn dispatch(
    responses: Receiver<Response>,
    pending: Pending,
    ready: Arc<ReadyState>,
    errors: Arc<Mutex<Vec<ErrorReply>>>,
) {
    for r in responses.iter() {
        match r {
            Response::Ready => ready.publish(Ok(())),
            Response::Error(e) if e.request_id.is_none() => {
                warn!("context error: {}", e.message);
                ready.publish(Err(e.message.clone()));
                if let Ok(mut errs) = errors.lock() {
                    errs.push(e);
                }
            }
            r => {
                let waiter = r
                    .request_id()
                    .and_then(|id| pending.lock().ok().and_then(|mut p| p.remove(&id)));
                match (waiter, r) {
                    (Some(tx), r) => {
                        let _ = tx.send(r);
                    }
                    (None, Response::Error(e)) => {
                        warn!(
                            "{} (request {:?}) failed: {}",
                            e.command.as_deref().unwrap_or("?"),
                            e.request_id,
                            e.message
                        );
                        if let Ok(mut errs) = errors.lock() {
                            errs.push(e);
                        }
                    }
                    (None, r) => debug!("{} (request {:?})", r.kind(), r.request_id()),
                }
            }
        }
    }
    // Wake anyone still waiting
    ready.publish(Err("graph context exited".into()));
    if let Ok(mut p) = pending.lock() {
        p.clear();
    }
}
