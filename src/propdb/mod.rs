//! Ref-counted, shared, cross-request property database cache with a
//! delay-loadable external-id side table.
//!
//! The service is process-wide: concurrently active model loaders share
//! entries by logical database path. The same dedup discipline as the
//! resource broker applies, just to a heavier multi-file resource: requests
//! arriving before the first load finishes are queued as waiter callbacks
//! instead of triggering duplicate loads. Entries (and their constituent
//! shared file blobs, themselves ref-counted) collapse only when the last
//! reference is released and the entry is not flagged as globally shared.

use std::sync::{Arc, Mutex};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use itertools::Itertools;
use log::{trace, warn};
use tokio::sync::oneshot;

use crate::error::{PropDbError, RpcError};
use crate::model::{ExternalIdTable, PropertyDbData, PropertyRow};
use crate::rpc::{Callbacks, Operation, Payload, RpcChannel};

/// Parsed database handle shared between consumers. The actual attribute
/// parsing is out of scope; the cache shares and ref-counts the raw files.
#[derive(Debug)]
pub struct PropertyDb {
    pub path: String,
    pub object_count: usize,
    /// Names of the file blobs this database pins in the file-level cache.
    pub files: Vec<String>,
}

pub type DbResult = Result<Arc<PropertyDb>, PropDbError>;
/// `Sync` because queued waiters live inside the concurrently shared entry
/// map; all practical waiters (channel senders, collector handles) qualify.
pub type DbWaiter = Box<dyn FnOnce(DbResult) + Send + Sync>;

pub type ExternalIdResult = Result<Arc<ExternalIdTable>, PropDbError>;
/// One-shot promise for a side-table request. Always settled, even when the
/// owning entry is unloaded mid-flight.
pub type ExternalIdPromise = oneshot::Receiver<ExternalIdResult>;

pub type QueryResult = Result<Vec<PropertyRow>, PropDbError>;
pub type QueryPromise = oneshot::Receiver<QueryResult>;

enum EntryState {
    /// No load in flight and no terminal outcome: the previous request died
    /// with its issuer's channel. The next acquire reissues.
    Idle,
    /// First load still in flight; everyone arriving meanwhile queues here.
    Loading(Vec<DbWaiter>),
    Ready(Arc<PropertyDb>),
    /// Null database plus error flag: kept so repeat acquires short-circuit.
    Failed(PropDbError),
}

enum ExternalIdState {
    NotLoaded,
    Loading(Vec<oneshot::Sender<ExternalIdResult>>),
    Available(Arc<ExternalIdTable>),
    Failed(PropDbError),
}

struct DbEntry {
    state: EntryState,
    ref_count: u32,
    /// Globally shared entries survive their last release.
    globally_shared: bool,
    external: ExternalIdState,
}

struct SharedFile {
    bytes: Arc<Vec<u8>>,
    ref_count: u32,
}

#[derive(Default)]
pub struct PropertyDbCache {
    entries: DashMap<String, DbEntry>,
    /// File-level sub-cache, shared across databases that reference the same
    /// blob.
    files: DashMap<String, SharedFile>,
}

impl PropertyDbCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the database at `path`, lazily creating the cache entry and
    /// issuing the single load on first miss. The waiter is invoked exactly
    /// once: synchronously when the entry is already terminal, or when the
    /// in-flight load finishes, or with [`PropDbError::Unloaded`] if the entry
    /// collapses first. Every acquire takes one reference.
    pub fn acquire(
        self: &Arc<Self>,
        path: &str,
        globally_shared: bool,
        channel: &mut RpcChannel,
        waiter: DbWaiter,
    ) {
        let mut waiter = Some(waiter);
        let (settle, issue): (Option<DbResult>, bool) =
            match self.entries.entry(path.to_string()) {
                Entry::Occupied(mut occupied) => {
                    let entry = occupied.get_mut();
                    entry.ref_count += 1;
                    entry.globally_shared |= globally_shared;
                    match &mut entry.state {
                        EntryState::Ready(db) => (Some(Ok(db.clone())), false),
                        EntryState::Failed(error) => (Some(Err(error.clone())), false),
                        EntryState::Loading(waiters) => {
                            waiters.push(waiter.take().expect("waiter still present"));
                            (None, false)
                        }
                        state @ EntryState::Idle => {
                            *state = EntryState::Loading(vec![waiter
                                .take()
                                .expect("waiter still present")]);
                            (None, true)
                        }
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(DbEntry {
                        state: EntryState::Loading(vec![waiter
                            .take()
                            .expect("waiter still present")]),
                        ref_count: 1,
                        globally_shared,
                        external: ExternalIdState::NotLoaded,
                    });
                    (None, true)
                }
            };

        // Settled and sent outside the map guard: error callbacks on a closed
        // channel fire synchronously and reenter the entry.
        if let Some(result) = settle {
            (waiter.take().expect("waiter still present"))(result);
        }
        if issue {
            let cache = Arc::clone(self);
            let cache_err = Arc::clone(self);
            let path_ok = path.to_string();
            let path_err = path.to_string();
            channel.send(
                Operation::LoadPropertyDb { path: path.to_string() },
                Callbacks::new(
                    move |payload| match payload {
                        Payload::PropertyDb(data) => cache.load_finished(&path_ok, Ok(data)),
                        other => {
                            warn!("unexpected payload for property db {}: {:?}", path_ok, other);
                            cache.load_finished(
                                &path_ok,
                                Err(RpcError::protocol("payload is not a property database")),
                            );
                        }
                    },
                    move |error| cache_err.load_finished(&path_err, Err(error)),
                ),
            );
        }
    }

    fn load_finished(&self, path: &str, result: Result<PropertyDbData, RpcError>) {
        let (waiters, outcome): (Vec<DbWaiter>, DbResult) = {
            let Some(mut entry) = self.entries.get_mut(path) else {
                trace!("terminal for property db {} after it was unloaded, dropping", path);
                return;
            };
            let EntryState::Loading(waiters) = &mut entry.state else {
                warn!("duplicate terminal for property db {}, ignoring", path);
                return;
            };
            let waiters = std::mem::take(waiters);
            match result {
                Ok(data) => {
                    let names = data.files.iter().map(|(name, _)| name.clone()).collect_vec();
                    for (name, bytes) in data.files {
                        self.pin_file(&name, bytes);
                    }
                    let db = Arc::new(PropertyDb {
                        path: path.to_string(),
                        object_count: data.object_count,
                        files: names,
                    });
                    entry.state = EntryState::Ready(db.clone());
                    (waiters, Ok(db))
                }
                Err(RpcError::Unloaded) => {
                    // The issuing loader tore down mid-flight. That says
                    // nothing about the database itself, so the entry stays
                    // re-requestable for the surviving loaders.
                    entry.state = EntryState::Idle;
                    (waiters, Err(PropDbError::Unloaded))
                }
                Err(error) => {
                    let error = PropDbError::LoadFailed {
                        path: path.to_string(),
                        source: error,
                    };
                    entry.state = EntryState::Failed(error.clone());
                    (waiters, Err(error))
                }
            }
        };

        for waiter in waiters {
            waiter(outcome.clone());
        }
    }

    /// Releases one reference. At zero (and not globally shared) the entry
    /// collapses: queued waiters and side-table promises are settled with
    /// [`PropDbError::Unloaded`] and the pinned file blobs are released.
    pub fn release(&self, path: &str) {
        {
            let Some(mut entry) = self.entries.get_mut(path) else {
                warn!("release for unknown property db {}", path);
                return;
            };
            if entry.ref_count == 0 {
                warn!("ref count underflow for property db {}", path);
                return;
            }
            entry.ref_count -= 1;
        }

        if let Some((_, entry)) = self
            .entries
            .remove_if(path, |_, entry| entry.ref_count == 0 && !entry.globally_shared)
        {
            self.collapse(path, entry);
        }
    }

    fn collapse(&self, path: &str, entry: DbEntry) {
        trace!("collapsing property db {}", path);
        match entry.state {
            EntryState::Loading(waiters) => {
                for waiter in waiters {
                    waiter(Err(PropDbError::Unloaded));
                }
            }
            EntryState::Ready(db) => self.unpin_files(&db.files),
            EntryState::Idle | EntryState::Failed(_) => {}
        }
        if let ExternalIdState::Loading(promises) = entry.external {
            for promise in promises {
                let _ = promise.send(Err(PropDbError::Unloaded));
            }
        }
    }

    fn pin_file(&self, name: &str, bytes: Arc<Vec<u8>>) {
        match self.files.entry(name.to_string()) {
            Entry::Occupied(mut occupied) => occupied.get_mut().ref_count += 1,
            Entry::Vacant(vacant) => {
                vacant.insert(SharedFile { bytes, ref_count: 1 });
            }
        }
    }

    fn unpin_files(&self, names: &[String]) {
        for name in names {
            let remove = match self.files.get_mut(name) {
                Some(mut file) => {
                    file.ref_count = file.ref_count.saturating_sub(1);
                    file.ref_count == 0
                }
                None => {
                    warn!("unpin for unknown shared file {}", name);
                    false
                }
            };
            if remove {
                self.files.remove_if(name, |_, file| file.ref_count == 0);
            }
        }
    }

    /// Delay-loaded external id side table. `NotLoaded` issues the single
    /// request; `Loading` enqueues a promise instead of re-requesting;
    /// terminal states settle synchronously from the cache.
    pub fn load_external_ids(
        self: &Arc<Self>,
        path: &str,
        channel: &mut RpcChannel,
    ) -> ExternalIdPromise {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);

        let (settle, issue): (Option<ExternalIdResult>, bool) = {
            let Some(mut entry) = self.entries.get_mut(path) else {
                let _ = tx.take().expect("promise still present").send(Err(PropDbError::NotCached(
                    path.to_string(),
                )));
                return rx;
            };
            match &mut entry.external {
                ExternalIdState::Available(table) => (Some(Ok(table.clone())), false),
                ExternalIdState::Failed(error) => (Some(Err(error.clone())), false),
                ExternalIdState::Loading(promises) => {
                    promises.push(tx.take().expect("promise still present"));
                    (None, false)
                }
                ExternalIdState::NotLoaded => {
                    entry.external =
                        ExternalIdState::Loading(vec![tx.take().expect("promise still present")]);
                    (None, true)
                }
            }
        };

        if let Some(result) = settle {
            let _ = tx.take().expect("promise still present").send(result);
        }
        if issue {
            let cache = Arc::clone(self);
            let cache_err = Arc::clone(self);
            let path_ok = path.to_string();
            let path_err = path.to_string();
            channel.send(
                Operation::LoadExternalIds { path: path.to_string() },
                Callbacks::new(
                    move |payload| match payload {
                        Payload::ExternalIds(table) => cache.external_finished(&path_ok, Ok(table)),
                        other => {
                            warn!("unexpected payload for external ids of {}: {:?}", path_ok, other);
                            cache.external_finished(
                                &path_ok,
                                Err(RpcError::protocol("payload is not an external id table")),
                            );
                        }
                    },
                    move |error| cache_err.external_finished(&path_err, Err(error)),
                ),
            );
        }
        rx
    }

    fn external_finished(&self, path: &str, result: Result<ExternalIdTable, RpcError>) {
        let (promises, outcome): (Vec<oneshot::Sender<ExternalIdResult>>, ExternalIdResult) = {
            let Some(mut entry) = self.entries.get_mut(path) else {
                trace!("external id terminal for unloaded db {}, dropping", path);
                return;
            };
            let ExternalIdState::Loading(promises) = &mut entry.external else {
                warn!("duplicate external id terminal for {}, ignoring", path);
                return;
            };
            let promises = std::mem::take(promises);
            match result {
                Ok(table) => {
                    let table = Arc::new(table);
                    entry.external = ExternalIdState::Available(table.clone());
                    (promises, Ok(table))
                }
                Err(RpcError::Unloaded) => {
                    // Same abort discipline as the database load itself.
                    entry.external = ExternalIdState::NotLoaded;
                    (promises, Err(PropDbError::Unloaded))
                }
                Err(error) => {
                    let error = PropDbError::ExternalIds {
                        path: path.to_string(),
                        source: error,
                    };
                    entry.external = ExternalIdState::Failed(error.clone());
                    (promises, Err(error))
                }
            }
        };

        for promise in promises {
            // Settled exactly once; a consumer that dropped its receiver is fine.
            let _ = promise.send(outcome.clone());
        }
    }

    /// Property query by object ids with an optional filter. The promise is
    /// settled by the response, or with [`PropDbError::Unloaded`] when the
    /// owning loader tears down first (the channel synthesizes the failure).
    pub fn query(
        &self,
        path: &str,
        object_ids: Vec<u64>,
        filter: Option<String>,
        channel: &mut RpcChannel,
    ) -> QueryPromise {
        let (tx, rx) = oneshot::channel();
        if !self.entries.contains_key(path) {
            let _ = tx.send(Err(PropDbError::NotCached(path.to_string())));
            return rx;
        }

        let slot = Arc::new(Mutex::new(Some(tx)));
        let slot_err = slot.clone();
        let path_ok = path.to_string();
        let path_err = path.to_string();
        channel.send(
            Operation::QueryProperties {
                path: path.to_string(),
                object_ids,
                filter,
            },
            Callbacks::new(
                move |payload| {
                    if let Some(tx) = slot.lock().expect("query promise slot").take() {
                        let _ = tx.send(match payload {
                            Payload::PropertyRows(rows) => Ok(rows),
                            other => {
                                warn!("unexpected payload for query on {}: {:?}", path_ok, other);
                                Err(PropDbError::LoadFailed {
                                    path: path_ok.clone(),
                                    source: RpcError::protocol("payload is not a row set"),
                                })
                            }
                        });
                    }
                },
                move |error| {
                    if let Some(tx) = slot_err.lock().expect("query promise slot").take() {
                        let _ = tx.send(Err(match error {
                            RpcError::Unloaded => PropDbError::Unloaded,
                            other => PropDbError::LoadFailed {
                                path: path_err.clone(),
                                source: other,
                            },
                        }));
                    }
                },
            ),
        );
        rx
    }

    /// Service shutdown: collapses every entry and settles anything still
    /// queued, so no consumer is left hanging.
    pub fn shutdown(&self) {
        let paths = self.entries.iter().map(|e| e.key().clone()).collect_vec();
        for path in paths {
            if let Some((_, entry)) = self.entries.remove(&path) {
                self.collapse(&path, entry);
            }
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn cached_file(&self, name: &str) -> Option<Arc<Vec<u8>>> {
        self.files.get(name).map(|file| file.bytes.clone())
    }

    #[cfg(test)]
    fn ref_count(&self, path: &str) -> Option<u32> {
        self.entries.get(path).map(|entry| entry.ref_count)
    }
}
