use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::depot::{CollectingIndexConsumer, CollectingSceneSink, MemoryDepot};
use crate::error::{PropDbError, RpcError};
use crate::loader::{ModelLoader, ModelLoaderOptions, SharedCaches};
use crate::model::{
    Fragment, FragmentFlags, IndexNode, LoaderEvent, PropertyDbData, PropertyRow, ResourceKey,
};
use crate::rpc::worker::{OperationRegistry, ResourceWorker};
use crate::rpc::{
    Operation, Payload, Progress, ResponseBody, ResponseMessage, TransportMessage,
};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn test_index_nodes() -> Vec<IndexNode> {
    vec![IndexNode {
        min: [0.0; 3],
        max: [1.0; 3],
        left: -1,
        right: -1,
        fragment: 0,
    }]
}

/// Scripted worker: streams the given fragments in small manifest batches,
/// serves resources (failing the listed keys) and answers the remaining
/// operations with canned payloads.
fn scripted_registry(
    fragments: Vec<Fragment>,
    failing_keys: HashSet<u64>,
    resource_requests: Arc<AtomicUsize>,
) -> OperationRegistry {
    let total = fragments.len();
    let mut registry = OperationRegistry::new();

    registry.register("LoadManifest", move |_, sink| {
        for batch in fragments.chunks(2) {
            sink.send(Progress::Fragments(batch.to_vec()));
        }
        Ok(Payload::Manifest {
            total_fragments: total,
        })
    });
    registry.register("LoadResource", move |operation, _| {
        resource_requests.fetch_add(1, SeqCst);
        let Operation::LoadResource { kind, key, .. } = operation else {
            return Err(RpcError::protocol("not a resource request"));
        };
        if failing_keys.contains(&key.0) {
            Err(RpcError::operation(500, "resource fetch failed"))
        } else {
            Ok(Payload::Resource {
                kind: *kind,
                key: *key,
                bytes: Arc::new(vec![0u8; 16]),
            })
        }
    });
    registry.register("BuildSpatialIndex", |_, _| Ok(Payload::SpatialIndex(test_index_nodes())));
    registry.register("LoadPropertyDb", |_, _| {
        Ok(Payload::PropertyDb(PropertyDbData {
            files: vec![("attrs.bin".into(), Arc::new(vec![1u8]))],
            object_count: 42,
        }))
    });
    registry.register("QueryProperties", |_, _| {
        Ok(Payload::PropertyRows(vec![PropertyRow {
            object_id: 1,
            name: "Wall".into(),
            category: "Construction".into(),
            value: "Concrete".into(),
        }]))
    });
    registry.register("Unload", |_, _| Ok(Payload::Ack));
    registry
}

struct Harness {
    loader: ModelLoader,
    events: Receiver<LoaderEvent>,
    scene: Arc<CollectingSceneSink>,
    index: Arc<CollectingIndexConsumer>,
    _worker: ResourceWorker,
}

fn harness(
    options: ModelLoaderOptions,
    caches: SharedCaches,
    materials: Arc<MemoryDepot>,
    geometries: Arc<MemoryDepot>,
    registry: OperationRegistry,
) -> Harness {
    let (request_tx, request_rx) = channel();
    let (transport_tx, transport_rx) = channel();
    let (event_tx, events) = channel();
    let scene = Arc::new(CollectingSceneSink::new());
    let index = Arc::new(CollectingIndexConsumer::new());

    let worker = ResourceWorker::spawn("test resource worker", registry, request_rx, transport_tx);
    let loader = ModelLoader::new(
        options,
        caches,
        materials,
        geometries,
        scene.clone(),
        index.clone(),
        request_tx,
        transport_rx,
        event_tx,
    );

    Harness {
        loader,
        events,
        scene,
        index,
        _worker: worker,
    }
}

fn fragment(id: u32, material: u64, geometry: u64) -> Fragment {
    Fragment::new(id, ResourceKey(material), ResourceKey(geometry))
}

#[test]
fn full_load_reaches_completion_with_shared_and_sentinel_fragments() {
    init_logs();
    let caches = SharedCaches::new();
    let fragments = vec![
        fragment(1, 100, 200),
        fragment(2, 100, 200), // shares both keys with fragment 1
        fragment(3, 101, 0),   // no geometry by design
        {
            let mut hidden = fragment(4, 100, 201);
            hidden.flags = FragmentFlags::HIDDEN;
            hidden
        },
    ];
    let requests = Arc::new(AtomicUsize::new(0));
    let mut h = harness(
        ModelLoaderOptions {
            skip_hidden: true,
            property_db: Some("tower/props.db".into()),
            ..ModelLoaderOptions::new("tower.model")
        },
        caches,
        Arc::new(MemoryDepot::new()),
        Arc::new(MemoryDepot::new()),
        scripted_registry(fragments, HashSet::new(), requests.clone()),
    );

    h.loader.begin_load();
    assert!(h.loader.run_until_complete(Duration::from_secs(5)));

    // Shared keys are deduplicated: materials 100 and 101, geometry 200.
    // The hidden fragment never requests its geometry 201.
    assert_eq!(3, requests.load(SeqCst));
    // Fragments 1 and 2 produce placements; sentinel and hidden do not.
    assert_eq!(2, h.scene.len());
    assert_eq!(test_index_nodes(), h.index.take());

    // The property database finishes independently of geometry completion;
    // keep pumping until its event shows up.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut events: Vec<LoaderEvent> = Vec::new();
    loop {
        h.loader.tick();
        events.extend(h.events.try_iter());
        if events.iter().any(|e| matches!(e, LoaderEvent::ObjectTreeCreated { .. })) {
            break;
        }
        assert!(Instant::now() < deadline, "property database must finish loading");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(events
        .iter()
        .any(|e| matches!(e, LoaderEvent::RootLoaded { total_fragments: 4 })));
    assert_eq!(
        1,
        events.iter().filter(|e| matches!(e, LoaderEvent::LoadComplete)).count()
    );
    let last_percent = events
        .iter()
        .filter_map(|e| match e {
            LoaderEvent::Progress { percent, .. } => Some(*percent),
            _ => None,
        })
        .last();
    assert_eq!(Some(100), last_percent);
}

#[test]
fn partial_failures_still_account_for_every_fragment() {
    init_logs();
    let caches = SharedCaches::new();
    // 100 fragments, unique geometries 1000..1100, 37 of them failing.
    let fragments: Vec<Fragment> = (0..100).map(|i| fragment(i, 500, 1000 + i as u64)).collect();
    let failing: HashSet<u64> = (1000..1037).collect();
    let requests = Arc::new(AtomicUsize::new(0));
    let mut h = harness(
        ModelLoaderOptions::new("plant.model"),
        caches,
        Arc::new(MemoryDepot::new()),
        Arc::new(MemoryDepot::new()),
        scripted_registry(fragments, failing, requests.clone()),
    );

    h.loader.begin_load();
    assert!(h.loader.run_until_complete(Duration::from_secs(5)));

    // 63 renderable placements, but all 100 fragments are accounted for.
    assert_eq!(63, h.scene.len());
    let events: Vec<LoaderEvent> = h.events.try_iter().collect();
    assert_eq!(
        37,
        events.iter().filter(|e| matches!(e, LoaderEvent::MeshFailed { .. })).count()
    );
    assert!(events.iter().any(|e| matches!(e, LoaderEvent::LoadComplete)));
}

#[test]
fn two_loaders_share_one_resource_request() {
    init_logs();
    let caches = SharedCaches::new();
    let materials = Arc::new(MemoryDepot::new());
    let geometries = Arc::new(MemoryDepot::new());
    let requests = Arc::new(AtomicUsize::new(0));

    // Both models reference the same material 7 and geometry 9.
    let mut a = harness(
        ModelLoaderOptions::new("a.model"),
        caches.clone(),
        materials.clone(),
        geometries.clone(),
        scripted_registry(vec![fragment(1, 7, 9)], HashSet::new(), requests.clone()),
    );
    let mut b = harness(
        ModelLoaderOptions::new("b.model"),
        caches.clone(),
        materials.clone(),
        geometries.clone(),
        scripted_registry(vec![fragment(1, 7, 9)], HashSet::new(), requests.clone()),
    );

    a.loader.begin_load();
    b.loader.begin_load();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let a_done = a.loader.tick();
        let b_done = b.loader.tick();
        if a_done && b_done {
            break;
        }
        assert!(Instant::now() < deadline, "both loads should complete");
        std::thread::sleep(Duration::from_millis(1));
    }

    // One material plus one geometry request across both loaders. The worker
    // timing decides which loader issues them; the other only ever joins the
    // waiter lists or hits the shared depots.
    assert_eq!(2, requests.load(SeqCst));
    assert_eq!(1, a.scene.len());
    assert_eq!(1, b.scene.len());
}

#[test]
fn manifest_failure_still_terminates_the_load() {
    let caches = SharedCaches::new();
    // No LoadManifest handler registered: the request errors out.
    let mut registry = OperationRegistry::new();
    registry.register("Unload", |_, _| Ok(Payload::Ack));
    let mut h = harness(
        ModelLoaderOptions::new("broken.model"),
        caches,
        Arc::new(MemoryDepot::new()),
        Arc::new(MemoryDepot::new()),
        registry,
    );

    h.loader.begin_load();
    assert!(h.loader.run_until_complete(Duration::from_secs(5)));

    let events: Vec<LoaderEvent> = h.events.try_iter().collect();
    assert!(events.iter().any(|e| matches!(e, LoaderEvent::LoadError { .. })));
    assert!(events.iter().any(|e| matches!(e, LoaderEvent::LoadComplete)));
}

/// Manual transport: no worker thread, every response is crafted by hand.
struct ManualRig {
    loader: ModelLoader,
    events: Receiver<LoaderEvent>,
    requests: Receiver<crate::rpc::Request>,
    stash: Vec<crate::rpc::Request>,
    transport_tx: std::sync::mpsc::Sender<TransportMessage>,
    scene: Arc<CollectingSceneSink>,
}

fn manual_rig(options: ModelLoaderOptions, caches: SharedCaches) -> ManualRig {
    let (request_tx, requests) = channel();
    let (transport_tx, transport_rx) = channel();
    let (event_tx, events) = channel();
    let scene = Arc::new(CollectingSceneSink::new());
    let loader = ModelLoader::new(
        options,
        caches,
        Arc::new(MemoryDepot::new()),
        Arc::new(MemoryDepot::new()),
        scene.clone(),
        Arc::new(CollectingIndexConsumer::new()),
        request_tx,
        transport_rx,
        event_tx,
    );
    transport_tx.send(TransportMessage::Ready).unwrap();
    ManualRig {
        loader,
        events,
        requests,
        stash: Vec::new(),
        transport_tx,
        scene,
    }
}

impl ManualRig {
    fn respond(&self, cb_id: u64, body: ResponseBody) {
        self.transport_tx
            .send(TransportMessage::Response(ResponseMessage { cb_id, body }))
            .unwrap();
    }

    /// Pulls the oldest outstanding request for the named operation, keeping
    /// the others around for later assertions.
    fn next_request_named(&mut self, name: &str) -> crate::rpc::Request {
        self.loader.tick();
        self.stash.extend(self.requests.try_iter());
        let position = self
            .stash
            .iter()
            .position(|r| r.operation.name() == name)
            .unwrap_or_else(|| panic!("expected an outstanding {} request", name));
        self.stash.remove(position)
    }
}

#[test]
fn queries_without_a_configured_database_settle_immediately() {
    let caches = SharedCaches::new();
    let mut rig = manual_rig(ModelLoaderOptions::new("bare.model"), caches);

    let mut rows = rig.loader.query_properties(vec![1], None);
    assert!(matches!(
        rows.try_recv().unwrap(),
        Err(PropDbError::NotConfigured)
    ));
    let mut ids = rig.loader.load_external_ids();
    assert!(matches!(
        ids.try_recv().unwrap(),
        Err(PropDbError::NotConfigured)
    ));
}

#[test]
fn teardown_settles_pending_queries_and_drops_late_responses() {
    let caches = SharedCaches::new();
    let mut rig = manual_rig(
        ModelLoaderOptions {
            property_db: Some("plant/props.db".into()),
            ..ModelLoaderOptions::new("plant.model")
        },
        caches.clone(),
    );

    rig.loader.begin_load();
    let db_request = rig.next_request_named("LoadPropertyDb");
    rig.respond(
        db_request.cb_id,
        ResponseBody::Result(Payload::PropertyDb(PropertyDbData {
            files: vec![("attrs.bin".into(), Arc::new(vec![1u8]))],
            object_count: 3,
        })),
    );
    rig.loader.tick();

    let mut pending = rig.loader.query_properties(vec![1, 2], None);
    rig.loader.tick();
    assert!(pending.try_recv().is_err(), "query must still be in flight");

    let manifest_request = rig.next_request_named("LoadManifest");
    rig.loader.teardown();

    // The synchronously blocked caller receives a terminal signal.
    assert!(matches!(pending.try_recv().unwrap(), Err(PropDbError::Unloaded)));
    // This loader's db reference is gone; the shared cache entry collapsed.
    assert_eq!(0, caches.propdb.entry_count());

    // A late manifest response is dropped instead of acting on freed state.
    rig.respond(
        manifest_request.cb_id,
        ResponseBody::Result(Payload::Manifest { total_fragments: 5 }),
    );
    rig.loader.tick();
    assert_eq!(0, rig.scene.len());
    let root_loaded = rig
        .events
        .try_iter()
        .filter(|e| matches!(e, LoaderEvent::RootLoaded { .. }))
        .count();
    assert_eq!(0, root_loaded);
}

#[test]
fn teardown_does_not_poison_shared_keys_for_other_loaders() {
    init_logs();
    let caches = SharedCaches::new();
    let requests = Arc::new(AtomicUsize::new(0));

    let mut doomed = manual_rig(ModelLoaderOptions::new("doomed.model"), caches.clone());
    doomed.loader.begin_load();
    let manifest = doomed.next_request_named("LoadManifest");
    doomed.respond(
        manifest.cb_id,
        ResponseBody::Progress(Progress::Fragments(vec![fragment(1, 7, 9)])),
    );
    doomed.loader.tick();
    // Its resource requests are now pending on the shared broker.
    assert_eq!(2, caches.broker.pending_keys());

    // The in-flight requests die with the loader's channel. They are aborted,
    // not recorded as failures, so the keys stay loadable.
    doomed.loader.teardown();
    assert_eq!(0, caches.broker.pending_keys());

    let mut survivor = harness(
        ModelLoaderOptions::new("survivor.model"),
        caches.clone(),
        Arc::new(MemoryDepot::new()),
        Arc::new(MemoryDepot::new()),
        scripted_registry(vec![fragment(1, 7, 9)], HashSet::new(), requests.clone()),
    );
    survivor.loader.begin_load();
    assert!(survivor.loader.run_until_complete(Duration::from_secs(5)));
    assert_eq!(1, survivor.scene.len());
    assert_eq!(2, requests.load(SeqCst));
}
