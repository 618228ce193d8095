//! Per-fragment activation: decides whether a fragment's dependencies
//! (material, geometry) are satisfied and either activates it or registers it
//! with the broker and defers.
//!
//! Activation is driven by lookups, not by what the trigger claims: every
//! attempt re-derives both dependency states from the broker, and defers
//! whenever one of them is not terminal yet. The no-geometry sentinel rule is
//! easy to get subtly wrong (double counting), so every path either returns
//! early without counting, defers without counting, or reaches final
//! activation exactly once.

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::Arc;

use log::{trace, warn};

use crate::broker::{DependencySignal, Lookup, ResourceBroker, Waiter};
use crate::depot::{ResourceDepot, SceneSink};
use crate::model::{Fragment, FragmentFlags, FragmentId, LoaderId, LoaderEvent, ResourceKind, ScenePlacement};
use crate::rpc::RpcChannel;

/// What caused this activation attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// The fragment metadata just arrived from the manifest.
    Fragment,
    /// A material resolution for this fragment just happened.
    Material,
    /// A geometry resolution for this fragment just happened.
    Geom,
}

/// Everything `try_activate` needs besides the resolver's own state. Borrowed
/// field-wise from the loader so the resolver stays independently testable.
pub struct ResolveCtx<'a> {
    pub loader: LoaderId,
    pub broker: &'a Arc<ResourceBroker>,
    pub materials: &'a Arc<dyn ResourceDepot>,
    pub geometries: &'a Arc<dyn ResourceDepot>,
    pub channel: &'a mut RpcChannel,
    pub scene: &'a Arc<dyn SceneSink>,
    pub signals: &'a Sender<DependencySignal>,
    pub events: &'a Sender<LoaderEvent>,
}

impl ResolveCtx<'_> {
    fn waiter(&self, fragment: FragmentId) -> Waiter {
        Waiter {
            loader: self.loader,
            fragment,
            notify: self.signals.clone(),
            events: self.events.clone(),
        }
    }
}

struct FragmentSlot {
    meta: Fragment,
    /// Set exactly once, together with the progress counter.
    done: bool,
}

pub struct ActivationResolver {
    fragments: HashMap<FragmentId, FragmentSlot>,
    /// Count of fragments accounted for (activated, failed or skipped).
    resolved: usize,
    /// Fixed once the manifest's terminal message arrives.
    total: Option<usize>,
    skip_hidden: bool,
}

impl ActivationResolver {
    pub fn new(skip_hidden: bool) -> Self {
        Self {
            fragments: HashMap::new(),
            resolved: 0,
            total: None,
            skip_hidden,
        }
    }

    pub fn add_fragment(&mut self, meta: Fragment) {
        let id = meta.id;
        if self
            .fragments
            .insert(id, FragmentSlot { meta, done: false })
            .is_some()
        {
            warn!("fragment {} delivered twice by the manifest", id);
        }
    }

    pub fn set_total(&mut self, total: usize) {
        self.total = Some(total);
    }

    pub fn resolved(&self) -> usize {
        self.resolved
    }

    pub fn total(&self) -> Option<usize> {
        self.total
    }

    /// Whether every manifest fragment is accounted for. Only meaningful once
    /// the total is fixed.
    pub fn all_resolved(&self) -> bool {
        self.total.is_some_and(|total| self.resolved >= total)
    }

    /// One attempt of the per-fragment state machine. Either activates the
    /// fragment, or registers it with the broker and defers until the next
    /// trigger re-invokes this. The trigger is diagnostic; the decision is
    /// made from the broker lookups alone.
    pub fn try_activate(&mut self, id: FragmentId, trigger: Trigger, ctx: &mut ResolveCtx) {
        let Some(slot) = self.fragments.get_mut(&id) else {
            warn!("activation trigger {:?} for unknown fragment {}", trigger, id);
            return;
        };
        if slot.done {
            trace!("fragment {} already accounted for, dropping {:?} trigger", id, trigger);
            return;
        }

        // Skipped fragments never need geometry or material.
        if slot.meta.flags.contains(FragmentFlags::NOT_LOADED)
            || (self.skip_hidden && slot.meta.flags.contains(FragmentFlags::HIDDEN))
        {
            slot.done = true;
            self.resolved += 1;
            return;
        }

        // Material. Registration on the broker is idempotent per fragment,
        // so re-checks after a signal go through the same call; if the
        // original request was aborted by a loader teardown, this reissues it
        // on our own channel.
        let waiter = ctx.waiter(id);
        let material_lookup = ctx.broker.find_or_load(
            ResourceKind::Material,
            slot.meta.material,
            ctx.materials,
            waiter,
            ctx.channel,
        );
        // A failed material never blocks a fragment: the material manager
        // substitutes a default, which counts as "a material exists".
        let have_material = matches!(material_lookup, Lookup::Resolved | Lookup::Failed);

        // No-geometry sentinel: done as soon as the material side is settled.
        if slot.meta.geometry.is_no_geometry() {
            if have_material {
                slot.done = true;
                self.resolved += 1;
            }
            return;
        }

        // Geometry, same discipline as material.
        let waiter = ctx.waiter(id);
        let geometry_lookup = ctx.broker.find_or_load(
            ResourceKind::Geometry,
            slot.meta.geometry,
            ctx.geometries,
            waiter,
            ctx.channel,
        );
        let have_geometry = matches!(geometry_lookup, Lookup::Resolved | Lookup::Failed);

        // Defer: the signal for whichever dependency is still open re-invokes
        // this function.
        if !have_material || !have_geometry {
            return;
        }

        // Final activation, exactly once. A permanently failed geometry still
        // advances progress, it just produces no placement (degraded render).
        slot.done = true;
        self.resolved += 1;
        if geometry_lookup == Lookup::Resolved {
            ctx.scene.add_placement(ScenePlacement {
                fragment: id,
                material: slot.meta.material,
                geometry: slot.meta.geometry,
                transform: slot.meta.transform,
            });
        }
    }
}
