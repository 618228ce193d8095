//! The per-model controller: owns the channel to its worker, the activation
//! resolver and the completion tracker, and runs the load data flow
//! (manifest -> fragments -> broker -> activation -> completion).
//!
//! All loader state is touched only from the controller thread; workers and
//! other loaders reach it exclusively through queued messages. The shared
//! caches (resource broker, property database service) are process-wide and
//! injected at construction.

pub mod activation;
pub mod completion;

use std::sync::atomic::{AtomicU32, Ordering::SeqCst};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, trace, warn};
use tokio::sync::oneshot;

use crate::broker::{DependencySignal, ResourceBroker};
use crate::depot::{ResourceDepot, SceneSink, SpatialIndexConsumer};
use crate::error::{PropDbError, RpcError};
use crate::loader::activation::{ActivationResolver, ResolveCtx, Trigger};
use crate::loader::completion::CompletionTracker;
use crate::model::{Fragment, FragmentId, IndexNode, LoadPhase, LoaderEvent, LoaderId, ResourceKind};
use crate::propdb::{PropertyDbCache, QueryPromise};
use crate::rpc::{Callbacks, Operation, Payload, Progress, Request, RpcChannel, TransportMessage};

static NEXT_LOADER_ID: AtomicU32 = AtomicU32::new(1);

/// Process-wide shared caches, created once and injected into every loader.
#[derive(Clone, Default)]
pub struct SharedCaches {
    pub broker: Arc<ResourceBroker>,
    pub propdb: Arc<PropertyDbCache>,
}

impl SharedCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settles everything still queued in the property database service.
    /// Call once, when the whole process shuts down.
    pub fn shutdown(&self) {
        self.propdb.shutdown();
    }
}

pub struct ModelLoaderOptions {
    pub model: String,
    /// Logical path of the property database to load alongside the geometry,
    /// if any.
    pub property_db: Option<String>,
    /// Marks the property database entry as surviving this loader's release.
    pub share_property_db: bool,
    pub skip_hidden: bool,
}

impl ModelLoaderOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            property_db: None,
            share_property_db: false,
            skip_hidden: false,
        }
    }
}

/// Controller-internal follow-ups queued by channel callbacks, drained by the
/// pump. Keeps the callbacks free of any `&mut` access to the loader.
enum ControlMsg {
    FragmentBatch(Vec<Fragment>),
    ManifestDone { total: usize },
    ManifestFailed(RpcError),
    IndexDone(Vec<IndexNode>),
    IndexFailed(RpcError),
    PropertyDbReady(String),
    PropertyDbFailed { path: String },
}

pub struct ModelLoader {
    id: LoaderId,
    model: String,
    property_db: Option<String>,
    share_property_db: bool,

    channel: RpcChannel,
    transport_rx: Receiver<TransportMessage>,
    control_tx: Sender<ControlMsg>,
    control_rx: Receiver<ControlMsg>,
    signal_tx: Sender<DependencySignal>,
    signal_rx: Receiver<DependencySignal>,

    resolver: ActivationResolver,
    tracker: CompletionTracker,
    caches: SharedCaches,
    materials: Arc<dyn ResourceDepot>,
    geometries: Arc<dyn ResourceDepot>,
    scene: Arc<dyn SceneSink>,
    index_consumer: Arc<dyn SpatialIndexConsumer>,
    events: Sender<LoaderEvent>,

    /// Path acquired on the property db service, released on teardown.
    propdb_handle: Option<String>,
    started: bool,
    torn_down: bool,
}

impl ModelLoader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: ModelLoaderOptions,
        caches: SharedCaches,
        materials: Arc<dyn ResourceDepot>,
        geometries: Arc<dyn ResourceDepot>,
        scene: Arc<dyn SceneSink>,
        index_consumer: Arc<dyn SpatialIndexConsumer>,
        requests: Sender<Request>,
        transport_rx: Receiver<TransportMessage>,
        events: Sender<LoaderEvent>,
    ) -> Self {
        let (control_tx, control_rx) = channel();
        let (signal_tx, signal_rx) = channel();
        Self {
            id: NEXT_LOADER_ID.fetch_add(1, SeqCst),
            model: options.model,
            property_db: options.property_db,
            share_property_db: options.share_property_db,
            channel: RpcChannel::new(requests),
            transport_rx,
            control_tx,
            control_rx,
            signal_tx,
            signal_rx,
            resolver: ActivationResolver::new(options.skip_hidden),
            tracker: CompletionTracker::new(events.clone()),
            caches,
            materials,
            geometries,
            scene,
            index_consumer,
            events,
            propdb_handle: None,
            started: false,
            torn_down: false,
        }
    }

    pub fn loader_id(&self) -> LoaderId {
        self.id
    }

    /// Issues the root manifest request and kicks off the property database
    /// load. Fragment batches then arrive as progress messages.
    pub fn begin_load(&mut self) {
        if self.started {
            warn!("begin_load called twice for {}", self.model);
            return;
        }
        self.started = true;
        info!("loading model {}", self.model);

        let ctl_ok = self.control_tx.clone();
        let ctl_err = self.control_tx.clone();
        let ctl_progress = self.control_tx.clone();
        self.channel.send(
            Operation::LoadManifest {
                model: self.model.clone(),
            },
            Callbacks::with_progress(
                move |payload| {
                    let _ = match payload {
                        Payload::Manifest { total_fragments } => ctl_ok.send(ControlMsg::ManifestDone {
                            total: total_fragments,
                        }),
                        other => {
                            warn!("unexpected manifest payload: {:?}", other);
                            ctl_ok.send(ControlMsg::ManifestFailed(RpcError::protocol(
                                "payload is not a manifest",
                            )))
                        }
                    };
                },
                move |err| {
                    let _ = ctl_err.send(ControlMsg::ManifestFailed(err));
                },
                move |progress| {
                    if let Progress::Fragments(batch) = progress {
                        let _ = ctl_progress.send(ControlMsg::FragmentBatch(batch));
                    }
                },
            ),
        );

        if let Some(path) = self.property_db.clone() {
            self.propdb_handle = Some(path.clone());
            let ctl = self.control_tx.clone();
            let failed_path = path.clone();
            let propdb = Arc::clone(&self.caches.propdb);
            propdb.acquire(
                &path,
                self.share_property_db,
                &mut self.channel,
                Box::new(move |result| {
                    let _ = match result {
                        Ok(db) => ctl.send(ControlMsg::PropertyDbReady(db.path.clone())),
                        Err(err) => {
                            warn!("property database load failed: {}", err);
                            ctl.send(ControlMsg::PropertyDbFailed {
                                path: failed_path.clone(),
                            })
                        }
                    };
                }),
            );
        }
    }

    /// Processes everything currently queued (worker responses, internal
    /// follow-ups, dependency signals from any loader) without blocking.
    /// Returns true once the load is complete.
    pub fn tick(&mut self) -> bool {
        loop {
            let mut worked = false;
            while let Ok(message) = self.transport_rx.try_recv() {
                worked = true;
                self.handle_transport(message);
            }
            while let Ok(message) = self.control_rx.try_recv() {
                worked = true;
                self.handle_control(message);
            }
            while let Ok(signal) = self.signal_rx.try_recv() {
                worked = true;
                self.handle_signal(signal);
            }
            if !worked {
                break;
            }
        }
        self.tracker.is_complete()
    }

    /// Convenience pump for embedders with a dedicated controller thread.
    pub fn run_until_complete(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.tick() {
                return true;
            }
            if Instant::now() >= deadline {
                warn!("model {} did not finish loading within {:?}", self.model, timeout);
                return false;
            }
            match self.transport_rx.recv_timeout(Duration::from_millis(5)) {
                Ok(message) => self.handle_transport(message),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    // Cross-loader signals can still complete us; don't spin.
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    fn handle_transport(&mut self, message: TransportMessage) {
        match message {
            TransportMessage::Ready => self.channel.mark_ready(),
            TransportMessage::Response(response) => self.channel.on_message(response),
        }
    }

    fn handle_control(&mut self, message: ControlMsg) {
        match message {
            ControlMsg::FragmentBatch(batch) => {
                trace!("fragment batch of {} for {}", batch.len(), self.model);
                for fragment in batch {
                    let id = fragment.id;
                    self.resolver.add_fragment(fragment);
                    self.try_activate(id, Trigger::Fragment);
                }
                self.after_progress();
            }
            ControlMsg::ManifestDone { total } => {
                info!("manifest for {} closed with {} fragments", self.model, total);
                self.resolver.set_total(total);
                let _ = self.events.send(LoaderEvent::RootLoaded {
                    total_fragments: total,
                });
                self.tracker.phase_done(LoadPhase::FragmentList);
                self.request_spatial_index();
                self.after_progress();
            }
            ControlMsg::ManifestFailed(err) => {
                error!("manifest for {} failed: {}", self.model, err);
                let _ = self.events.send(LoaderEvent::LoadError {
                    phase: LoadPhase::FragmentList,
                    error: err,
                });
                // The load must still terminate in finite time: no fragments
                // and no index build are coming anymore.
                for phase in [LoadPhase::FragmentList, LoadPhase::Streaming, LoadPhase::SpatialIndex] {
                    if !self.tracker.is_phase_done(phase) {
                        self.tracker.phase_done(phase);
                    }
                }
            }
            ControlMsg::IndexDone(nodes) => {
                self.index_consumer.accept(nodes);
                self.tracker.phase_done(LoadPhase::SpatialIndex);
            }
            ControlMsg::IndexFailed(err) => {
                warn!("spatial index build for {} failed: {}", self.model, err);
                let _ = self.events.send(LoaderEvent::LoadError {
                    phase: LoadPhase::SpatialIndex,
                    error: err,
                });
                self.tracker.phase_done(LoadPhase::SpatialIndex);
            }
            ControlMsg::PropertyDbReady(path) => {
                let _ = self.events.send(LoaderEvent::ObjectTreeCreated { path });
            }
            ControlMsg::PropertyDbFailed { path } => {
                let _ = self.events.send(LoaderEvent::ObjectTreeUnavailable { path });
            }
        }
    }

    fn handle_signal(&mut self, signal: DependencySignal) {
        let trigger = match signal.kind {
            ResourceKind::Material => Trigger::Material,
            ResourceKind::Geometry => Trigger::Geom,
        };
        self.try_activate(signal.fragment, trigger);
        self.after_progress();
    }

    fn try_activate(&mut self, id: FragmentId, trigger: Trigger) {
        let mut ctx = ResolveCtx {
            loader: self.id,
            broker: &self.caches.broker,
            materials: &self.materials,
            geometries: &self.geometries,
            channel: &mut self.channel,
            scene: &self.scene,
            signals: &self.signal_tx,
            events: &self.events,
        };
        self.resolver.try_activate(id, trigger, &mut ctx);
    }

    fn after_progress(&mut self) {
        if let Some(total) = self.resolver.total() {
            self.tracker
                .update_streaming_progress(self.resolver.resolved(), total);
        }
        if self.resolver.all_resolved() && !self.tracker.is_phase_done(LoadPhase::Streaming) {
            self.tracker.phase_done(LoadPhase::Streaming);
        }
    }

    fn request_spatial_index(&mut self) {
        let ctl_ok = self.control_tx.clone();
        let ctl_err = self.control_tx.clone();
        self.channel.send(
            Operation::BuildSpatialIndex {
                model: self.model.clone(),
            },
            Callbacks::new(
                move |payload| {
                    let _ = match payload {
                        Payload::SpatialIndex(nodes) => ctl_ok.send(ControlMsg::IndexDone(nodes)),
                        other => {
                            warn!("unexpected spatial index payload: {:?}", other);
                            ctl_ok.send(ControlMsg::IndexFailed(RpcError::protocol(
                                "payload is not a spatial index",
                            )))
                        }
                    };
                },
                move |err| {
                    let _ = ctl_err.send(ControlMsg::IndexFailed(err));
                },
            ),
        );
    }

    /// Property query against this loader's database. The promise always
    /// settles; on teardown it resolves to [`PropDbError::Unloaded`].
    pub fn query_properties(&mut self, object_ids: Vec<u64>, filter: Option<String>) -> QueryPromise {
        match self.propdb_handle.clone() {
            Some(path) => self
                .caches
                .propdb
                .query(&path, object_ids, filter, &mut self.channel),
            None => {
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(Err(PropDbError::NotConfigured));
                rx
            }
        }
    }

    /// Kicks (or joins) the delay-loaded external id side table fetch.
    pub fn load_external_ids(&mut self) -> crate::propdb::ExternalIdPromise {
        match self.propdb_handle.clone() {
            Some(path) => {
                let propdb = Arc::clone(&self.caches.propdb);
                propdb.load_external_ids(&path, &mut self.channel)
            }
            None => {
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(Err(PropDbError::NotConfigured));
                rx
            }
        }
    }

    /// Unloads this model while leaving the shared caches intact for other
    /// loaders: unregisters all correlation callbacks (late responses get
    /// dropped), synthesizes terminal failures for anything still waiting,
    /// removes this loader's broker waiters and releases its property db
    /// reference.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        info!("tearing down loader {} for {}", self.id, self.model);

        // Best-effort eviction notice; must go out before the channel closes.
        self.channel.send(
            Operation::Unload {
                model: self.model.clone(),
            },
            Callbacks::ignored(),
        );
        self.channel.shutdown();
        self.caches.broker.remove_loader_waiters(self.id);
        if let Some(path) = self.propdb_handle.take() {
            self.caches.propdb.release(&path);
        }

        // The synthesized failures above queued follow-ups; apply them so the
        // tracker reaches a terminal state for anyone still polling.
        while let Ok(message) = self.control_rx.try_recv() {
            self.handle_control(message);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.tracker.is_complete()
    }
}

impl Drop for ModelLoader {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests;
