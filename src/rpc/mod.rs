//! Duplex, asynchronous message passing between the controller thread and the
//! worker threads.
//!
//! Each outgoing request carries a generated correlation id (`cb_id`). The
//! channel keeps a registry mapping id -> callback triple; incoming responses
//! either complete the entry terminally (result or error, exactly once) or
//! report non-terminal progress. Messages for an unknown or already
//! unregistered id are silently dropped - that is the mechanism by which
//! in-flight requests are safely ignored after a consumer tears itself down.

pub mod worker;

use std::collections::HashMap;
use std::sync::mpsc::Sender;

use log::{trace, warn};

use crate::error::RpcError;
use crate::model::{
    Fragment, IndexNode, PropertyDbData, PropertyRow, ResourceKey, ResourceKind,
};

pub type CbId = u64;

/// The fixed set of operations the worker understands. Not a general task
/// scheduler: the shapes are known up front.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Root manifest request. Fragment metadata arrives incrementally via
    /// progress messages; the terminal result fixes the total count.
    LoadManifest { model: String },
    LoadResource {
        kind: ResourceKind,
        key: ResourceKey,
        shared: bool,
    },
    LoadPropertyDb { path: String },
    QueryProperties {
        path: String,
        object_ids: Vec<u64>,
        filter: Option<String>,
    },
    LoadExternalIds { path: String },
    BuildSpatialIndex { model: String },
    Unload { model: String },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::LoadManifest { .. } => "LoadManifest",
            Operation::LoadResource { .. } => "LoadResource",
            Operation::LoadPropertyDb { .. } => "LoadPropertyDb",
            Operation::QueryProperties { .. } => "QueryProperties",
            Operation::LoadExternalIds { .. } => "LoadExternalIds",
            Operation::BuildSpatialIndex { .. } => "BuildSpatialIndex",
            Operation::Unload { .. } => "Unload",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub operation: Operation,
    pub cb_id: CbId,
}

/// Successful operation results.
#[derive(Debug, Clone)]
pub enum Payload {
    Manifest { total_fragments: usize },
    Resource {
        kind: ResourceKind,
        key: ResourceKey,
        bytes: std::sync::Arc<Vec<u8>>,
    },
    PropertyDb(PropertyDbData),
    PropertyRows(Vec<PropertyRow>),
    ExternalIds(crate::model::ExternalIdTable),
    SpatialIndex(Vec<IndexNode>),
    Ack,
}

/// Non-terminal progress. May repeat any number of times before the terminal
/// message for the same correlation id.
#[derive(Debug, Clone)]
pub enum Progress {
    Percent(u32),
    /// Incremental fragment metadata batch for a manifest request.
    Fragments(Vec<Fragment>),
}

#[derive(Debug, Clone)]
pub enum ResponseBody {
    Result(Payload),
    Error(RpcError),
    Progress(Progress),
}

#[derive(Debug, Clone)]
pub struct ResponseMessage {
    pub cb_id: CbId,
    pub body: ResponseBody,
}

/// Everything the worker puts on the physical channel towards the controller.
#[derive(Debug, Clone)]
pub enum TransportMessage {
    /// The worker finished initializing; the readiness gate may flush.
    Ready,
    Response(ResponseMessage),
}

type SuccessFn = Box<dyn FnOnce(Payload) + Send>;
type ErrorFn = Box<dyn FnOnce(RpcError) + Send>;
type ProgressFn = Box<dyn FnMut(Progress) + Send>;
type InterceptFilter = Box<dyn Fn(&ResponseMessage) -> bool + Send>;
type InterceptHandler = Box<dyn FnMut(ResponseMessage) + Send>;

/// The `(on_success, on_error, on_progress)` triple registered per request.
/// Exactly one of success/error fires, exactly once.
pub struct Callbacks {
    on_success: SuccessFn,
    on_error: ErrorFn,
    on_progress: Option<ProgressFn>,
}

impl Callbacks {
    pub fn new(
        on_success: impl FnOnce(Payload) + Send + 'static,
        on_error: impl FnOnce(RpcError) + Send + 'static,
    ) -> Self {
        Self {
            on_success: Box::new(on_success),
            on_error: Box::new(on_error),
            on_progress: None,
        }
    }

    pub fn with_progress(
        on_success: impl FnOnce(Payload) + Send + 'static,
        on_error: impl FnOnce(RpcError) + Send + 'static,
        on_progress: impl FnMut(Progress) + Send + 'static,
    ) -> Self {
        Self {
            on_progress: Some(Box::new(on_progress)),
            ..Self::new(on_success, on_error)
        }
    }

    /// Fire-and-forget, e.g. the best-effort unload notification.
    pub fn ignored() -> Self {
        Self::new(|_| {}, |_| {})
    }
}

/// Controller-side end of the channel. Only ever touched from the controller
/// thread, hence `&mut self` instead of locks.
pub struct RpcChannel {
    outbound: Sender<Request>,
    next_cb_id: CbId,
    registry: HashMap<CbId, Callbacks>,
    /// Requests buffered until the worker reports ready.
    backlog: Vec<Request>,
    ready: bool,
    closed: bool,
    intercept: Option<(InterceptFilter, InterceptHandler)>,
}

impl RpcChannel {
    pub fn new(outbound: Sender<Request>) -> Self {
        Self {
            outbound,
            next_cb_id: 1,
            registry: HashMap::new(),
            backlog: Vec::new(),
            ready: false,
            closed: false,
            intercept: None,
        }
    }

    /// Registers the callback triple and sends (or buffers) the request.
    /// On a closed channel the error callback fires immediately with
    /// [`RpcError::Unloaded`], so callers never hang.
    pub fn send(&mut self, operation: Operation, callbacks: Callbacks) -> CbId {
        let cb_id = self.next_cb_id;
        self.next_cb_id += 1;

        if self.closed {
            trace!("dropping {} on closed channel", operation.name());
            (callbacks.on_error)(RpcError::Unloaded);
            return cb_id;
        }

        trace!("sending {} (cb_id {})", operation.name(), cb_id);
        self.registry.insert(cb_id, callbacks);

        let request = Request { operation, cb_id };
        if self.ready {
            self.dispatch(request);
        } else {
            self.backlog.push(request);
        }
        cb_id
    }

    /// Flushes the backlog in arrival order, exactly once. A second readiness
    /// report is ignored.
    pub fn mark_ready(&mut self) {
        if self.ready {
            warn!("duplicate worker readiness report, ignoring");
            return;
        }
        self.ready = true;
        for request in std::mem::take(&mut self.backlog) {
            self.dispatch(request);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    fn dispatch(&mut self, request: Request) {
        if self.outbound.send(request).is_err() {
            // The worker is gone; the teardown path will fail the callbacks.
            warn!("request channel to worker is broken");
        }
    }

    /// A secondary filter so one physical channel can carry a second logical
    /// protocol (internal asset traffic) without cross-talk with operation
    /// responses. Matching messages bypass the correlation registry.
    pub fn set_intercept(
        &mut self,
        filter: impl Fn(&ResponseMessage) -> bool + Send + 'static,
        handler: impl FnMut(ResponseMessage) + Send + 'static,
    ) {
        self.intercept = Some((Box::new(filter), Box::new(handler)));
    }

    /// Dispatches one incoming message to its registered callbacks.
    pub fn on_message(&mut self, message: ResponseMessage) {
        if let Some((filter, handler)) = self.intercept.as_mut() {
            if filter(&message) {
                handler(message);
                return;
            }
        }

        let cb_id = message.cb_id;
        match message.body {
            ResponseBody::Progress(progress) => {
                match self.registry.get_mut(&cb_id) {
                    Some(callbacks) => {
                        if let Some(on_progress) = callbacks.on_progress.as_mut() {
                            on_progress(progress);
                        }
                    }
                    None => trace!("dropping progress for unknown cb_id {}", cb_id),
                }
            }
            ResponseBody::Result(payload) => match self.registry.remove(&cb_id) {
                Some(callbacks) => (callbacks.on_success)(payload),
                None => trace!("dropping result for unknown cb_id {}", cb_id),
            },
            ResponseBody::Error(error) => match self.registry.remove(&cb_id) {
                Some(callbacks) => (callbacks.on_error)(error),
                None => trace!("dropping error for unknown cb_id {}", cb_id),
            },
        }
    }

    pub fn pending_requests(&self) -> usize {
        self.registry.len()
    }

    /// Teardown: every still-registered callback receives a terminal
    /// [`RpcError::Unloaded`], late-arriving messages are dropped from then on.
    pub fn shutdown(&mut self) {
        self.closed = true;
        self.backlog.clear();
        for (cb_id, callbacks) in std::mem::take(&mut self.registry) {
            trace!("synthesizing unload failure for cb_id {}", cb_id);
            (callbacks.on_error)(RpcError::Unloaded);
        }
    }
}
