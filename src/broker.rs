//! Resource request broker: guarantees at most one in-flight request per
//! shared resource key and fans the eventual result out to every fragment
//! that needed it, regardless of arrival order.
//!
//! The pending maps are process-wide and shared by all concurrently active
//! model loaders - whoever misses first issues the single request, everyone
//! else joins the waiter list. This is the same dedup discipline the asset
//! resolver applies to parsed assets, applied one level earlier, to the
//! requests themselves.

use std::sync::mpsc::Sender;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use log::{trace, warn};

use crate::depot::ResourceDepot;
use crate::error::RpcError;
use crate::model::{FragmentId, LoaderId, LoaderEvent, ResourceKey, ResourceKind};
use crate::rpc::{Callbacks, Operation, Payload, RpcChannel};

/// Delivered to a waiting loader when a resource it registered for reaches its
/// terminal state. `ok == false` means permanent failure for this session.
#[derive(Debug, Clone)]
pub struct DependencySignal {
    pub fragment: FragmentId,
    pub kind: ResourceKind,
    pub key: ResourceKey,
    pub ok: bool,
}

/// One fragment waiting for one resource, with the signal and event senders
/// of its owning loader.
pub struct Waiter {
    pub loader: LoaderId,
    pub fragment: FragmentId,
    pub notify: Sender<DependencySignal>,
    pub events: Sender<LoaderEvent>,
}

struct PendingEntry {
    /// Registration order is preserved for the fan-out.
    waiters: Vec<Waiter>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Already materialized downstream, no request needed.
    Resolved,
    /// Terminally failed earlier this session; never re-requested.
    Failed,
    /// A request is in flight, the waiter joined its list.
    Pending,
    /// First miss: a pending entry was created and exactly one request issued.
    Missing,
}

#[derive(Default)]
pub struct ResourceBroker {
    pending: DashMap<(ResourceKind, ResourceKey), PendingEntry>,
    failed: DashSet<(ResourceKind, ResourceKey)>,
}

impl ResourceBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Side-effect-free lookup, used when re-checking a fragment after a
    /// dependency signal (the fragment is already registered, or the
    /// resource is already terminal).
    pub fn probe(&self, kind: ResourceKind, key: ResourceKey, depot: &dyn ResourceDepot) -> Lookup {
        if depot.contains(key) {
            return Lookup::Resolved;
        }
        if self.failed.contains(&(kind, key)) {
            return Lookup::Failed;
        }
        if self.pending.contains_key(&(kind, key)) {
            return Lookup::Pending;
        }
        Lookup::Missing
    }

    /// The full lookup: short-circuits on a depot hit or a recorded failure,
    /// joins an existing pending entry, or creates one and issues exactly one
    /// request for the key.
    pub fn find_or_load(
        self: &Arc<Self>,
        kind: ResourceKind,
        key: ResourceKey,
        depot: &Arc<dyn ResourceDepot>,
        waiter: Waiter,
        channel: &mut RpcChannel,
    ) -> Lookup {
        if depot.contains(key) {
            return Lookup::Resolved;
        }
        if self.failed.contains(&(kind, key)) {
            return Lookup::Failed;
        }

        {
            use dashmap::mapref::entry::Entry;
            match self.pending.entry((kind, key)) {
                Entry::Occupied(mut entry) => {
                    // Registration is idempotent per (loader, fragment), so
                    // re-checks after a dependency signal may safely go
                    // through here again.
                    let waiters = &mut entry.get_mut().waiters;
                    if !waiters
                        .iter()
                        .any(|w| w.loader == waiter.loader && w.fragment == waiter.fragment)
                    {
                        waiters.push(waiter);
                    }
                    return Lookup::Pending;
                }
                Entry::Vacant(entry) => {
                    entry.insert(PendingEntry {
                        waiters: vec![waiter],
                    });
                }
            }
        }

        trace!("requesting {:?} {}", kind, key);
        let broker = Arc::clone(self);
        let broker_err = Arc::clone(self);
        let depot = Arc::clone(depot);
        channel.send(
            Operation::LoadResource {
                kind,
                key,
                shared: true,
            },
            Callbacks::new(
                move |payload| match payload {
                    Payload::Resource { bytes, .. } => {
                        depot.store(key, bytes);
                        broker.resolve_terminal(kind, key, true);
                    }
                    other => {
                        warn!("unexpected payload for {:?} {}: {:?}", kind, key, other);
                        broker.resolve_terminal(kind, key, false);
                    }
                },
                move |error| {
                    // An unloaded channel means the requesting loader went
                    // away, not that the resource is bad. The key must stay
                    // requestable for everyone else.
                    if matches!(error, RpcError::Unloaded) {
                        broker_err.abort_pending(kind, key);
                        return;
                    }
                    warn!("{:?} {} failed: {}", kind, key, error);
                    broker_err.resolve_terminal(kind, key, false);
                },
            ),
        );

        Lookup::Missing
    }

    /// Terminal resolution for a key: records permanent failure state, then
    /// notifies every waiter in registration order and deletes the entry.
    /// The result is announced once per waiting loader, so loaders that only
    /// joined the waiter list observe it too. A double terminal is detected
    /// and ignored with a diagnostic.
    pub fn resolve_terminal(&self, kind: ResourceKind, key: ResourceKey, ok: bool) {
        if !ok && !self.failed.insert((kind, key)) {
            warn!("duplicate failure for {:?} {}, ignoring", kind, key);
            return;
        }

        let Some((_, entry)) = self.pending.remove(&(kind, key)) else {
            warn!("terminal event for {:?} {} without a pending entry, ignoring", kind, key);
            return;
        };

        let mut announced: Vec<LoaderId> = Vec::new();
        for waiter in entry.waiters {
            if !announced.contains(&waiter.loader) {
                announced.push(waiter.loader);
                let event = if ok {
                    received_event(kind, key)
                } else {
                    failed_event(kind, key)
                };
                let _ = waiter.events.send(event);
            }
            // A torn-down loader has dropped its receiver; that is expected.
            let _ = waiter.notify.send(DependencySignal {
                fragment: waiter.fragment,
                kind,
                key,
                ok,
            });
        }
    }

    /// Drops the pending entry for a request that will never be answered
    /// (its channel closed) and wakes the remaining waiters. The key is not
    /// recorded as failed: a woken waiter re-enters [`Self::find_or_load`]
    /// and reissues the request on its own, still-living channel.
    pub fn abort_pending(&self, kind: ResourceKind, key: ResourceKey) {
        let Some((_, entry)) = self.pending.remove(&(kind, key)) else {
            return;
        };
        trace!(
            "request for {:?} {} aborted, waking {} waiters",
            kind,
            key,
            entry.waiters.len()
        );
        for waiter in entry.waiters {
            let _ = waiter.notify.send(DependencySignal {
                fragment: waiter.fragment,
                kind,
                key,
                ok: false,
            });
        }
    }

    /// Removes all waiters of one loader without disturbing the in-flight
    /// requests; the results still land in the shared depots for everyone
    /// else.
    pub fn remove_loader_waiters(&self, loader: LoaderId) {
        for mut entry in self.pending.iter_mut() {
            entry.waiters.retain(|w| w.loader != loader);
        }
    }

    pub fn pending_keys(&self) -> usize {
        self.pending.len()
    }
}

fn received_event(kind: ResourceKind, key: ResourceKey) -> LoaderEvent {
    match kind {
        ResourceKind::Geometry => LoaderEvent::MeshReceived { key },
        ResourceKind::Material => LoaderEvent::MaterialReceived { key },
    }
}

fn failed_event(kind: ResourceKind, key: ResourceKey) -> LoaderEvent {
    match kind {
        ResourceKind::Geometry => LoaderEvent::MeshFailed { key },
        ResourceKind::Material => LoaderEvent::MaterialFailed { key },
    }
}
