//! Worker-side host: an operation registry plus a named thread that drains
//! requests and answers on the response channel.
//!
//! Real deployments register handlers that hit the network or parse files;
//! tests register scripted handlers. Either way the controller only ever sees
//! [`TransportMessage`]s.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, trace, warn};

use crate::error::RpcError;
use crate::rpc::{CbId, Operation, Payload, Progress, Request, ResponseBody, ResponseMessage, TransportMessage};

/// Lets a handler report non-terminal progress for its correlation id. The
/// terminal message is derived from the handler's return value, so exactly one
/// terminal goes out per request by construction.
pub struct ProgressSink<'a> {
    cb_id: CbId,
    out: &'a Sender<TransportMessage>,
}

impl ProgressSink<'_> {
    pub fn send(&self, progress: Progress) {
        let _ = self.out.send(TransportMessage::Response(ResponseMessage {
            cb_id: self.cb_id,
            body: ResponseBody::Progress(progress),
        }));
    }
}

pub type OperationHandler = Box<dyn Fn(&Operation, &ProgressSink) -> Result<Payload, RpcError> + Send>;

#[derive(Default)]
pub struct OperationRegistry {
    handlers: HashMap<&'static str, OperationHandler>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &'static str,
        handler: impl Fn(&Operation, &ProgressSink) -> Result<Payload, RpcError> + Send + 'static,
    ) {
        if self.handlers.insert(name, Box::new(handler)).is_some() {
            warn!("operation \"{}\" registered twice, keeping the newer handler", name);
        }
    }

    fn dispatch(&self, request: &Request, out: &Sender<TransportMessage>) -> Result<Payload, RpcError> {
        let name = request.operation.name();
        let sink = ProgressSink {
            cb_id: request.cb_id,
            out,
        };
        match self.handlers.get(name) {
            Some(handler) => handler(&request.operation, &sink),
            None => Err(RpcError::UnknownOperation(name.to_string())),
        }
    }
}

/// One worker thread. Reports readiness once after startup, then answers
/// requests until shut down or until the request channel breaks.
pub struct ResourceWorker {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl ResourceWorker {
    pub fn spawn(
        name: &str,
        registry: OperationRegistry,
        requests: Receiver<Request>,
        responses: Sender<TransportMessage>,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_flag = shutdown.clone();

        let handle = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || Self::run(registry, requests, responses, shutdown_flag))
            .expect("Spawning the resource worker thread succeeds");

        Self {
            handle: Some(handle),
            shutdown,
        }
    }

    fn run(
        registry: OperationRegistry,
        requests: Receiver<Request>,
        responses: Sender<TransportMessage>,
        shutdown: Arc<AtomicBool>,
    ) {
        if responses.send(TransportMessage::Ready).is_err() {
            warn!("controller went away before the worker became ready");
            return;
        }

        loop {
            if shutdown.load(SeqCst) {
                info!("worker shutdown requested");
                return;
            }

            let request = match requests.recv_timeout(Duration::from_millis(100)) {
                Ok(request) => request,
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    trace!("request channel closed, worker exiting");
                    return;
                }
            };

            trace!("worker handling {} (cb_id {})", request.operation.name(), request.cb_id);
            let body = match registry.dispatch(&request, &responses) {
                Ok(payload) => ResponseBody::Result(payload),
                Err(error) => ResponseBody::Error(error),
            };
            // The controller may have torn down mid-request; it drops the
            // response by correlation id, so a broken pipe is fine too.
            let _ = responses.send(TransportMessage::Response(ResponseMessage {
                cb_id: request.cb_id,
                body,
            }));
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, SeqCst);
    }

    pub fn join(mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ResourceWorker {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
