//! Plain data types shared by the loader, the broker and the wire protocol.

use std::fmt;
use std::sync::Arc;

use glam::Affine3A;

pub type FragmentId = u32;
pub type LoaderId = u32;

/// Content hash identifying a de-duplicated geometry or material blob.
/// Many fragments (across independently loading models) may reference the
/// same key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(pub u64);

impl ResourceKey {
    /// Geometry sentinel: "this fragment has no geometry by design".
    pub const NO_GEOMETRY: ResourceKey = ResourceKey(0);

    pub fn is_no_geometry(&self) -> bool {
        *self == Self::NO_GEOMETRY
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Geometry,
    Material,
}

bitflags::bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct FragmentFlags: u8 {
        /// The fragment is present in the manifest but not meant to be loaded.
        const NOT_LOADED = 0x01;
        const HIDDEN = 0x02;
    }
}

/// One mesh-instance placement as delivered by the model manifest. Pure
/// metadata; the per-fragment resolution state lives in the activation
/// resolver.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub id: FragmentId,
    pub material: ResourceKey,
    /// [`ResourceKey::NO_GEOMETRY`] means the fragment has no geometry at all.
    pub geometry: ResourceKey,
    pub flags: FragmentFlags,
    pub transform: Affine3A,
}

impl Fragment {
    pub fn new(id: FragmentId, material: ResourceKey, geometry: ResourceKey) -> Self {
        Self {
            id,
            material,
            geometry,
            flags: FragmentFlags::empty(),
            transform: Affine3A::IDENTITY,
        }
    }
}

/// The renderable proxy built on final activation, handed to the scene sink.
#[derive(Debug, Clone)]
pub struct ScenePlacement {
    pub fragment: FragmentId,
    pub material: ResourceKey,
    pub geometry: ResourceKey,
    pub transform: Affine3A,
}

/// One node of the flattened spatial index. The build itself is an opaque
/// worker operation; the loader only forwards the finished array.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexNode {
    pub min: [f32; 3],
    pub max: [f32; 3],
    /// Index of the left child, -1 for leaves.
    pub left: i32,
    /// Index of the right child, -1 for leaves.
    pub right: i32,
    /// Fragment referenced by a leaf node, -1 for inner nodes.
    pub fragment: i32,
}

/// Payload of a successfully loaded property database: the constituent files
/// plus a few header figures. Parsing the files is out of scope, the cache
/// only shares and ref-counts them.
#[derive(Debug, Clone)]
pub struct PropertyDbData {
    pub files: Vec<(String, Arc<Vec<u8>>)>,
    pub object_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropertyRow {
    pub object_id: u64,
    pub name: String,
    pub category: String,
    pub value: String,
}

/// The delay-loaded external id side table. Optional and larger than the
/// baseline database files, hence fetched separately.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalIdTable {
    pub ids: Vec<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoadPhase {
    FragmentList,
    Streaming,
    SpatialIndex,
}

/// Events raised to external collaborators (renderer, UI).
#[derive(Debug, Clone)]
pub enum LoaderEvent {
    RootLoaded { total_fragments: usize },
    MeshReceived { key: ResourceKey },
    MeshFailed { key: ResourceKey },
    MaterialReceived { key: ResourceKey },
    MaterialFailed { key: ResourceKey },
    Progress { percent: u32, phase: LoadPhase },
    ObjectTreeCreated { path: String },
    ObjectTreeUnavailable { path: String },
    /// A whole phase failed terminally. The load still runs to completion so
    /// the process terminates in finite time.
    LoadError { phase: LoadPhase, error: crate::error::RpcError },
    LoadComplete,
}
