//! Incremental model streaming for large CAD scenes: a manifest of fragments
//! is streamed in batches while the geometry and material blobs they
//! reference are fetched, de-duplicated and cached process-wide.
//!
//! The moving parts, bottom up:
//! - [`rpc`]: a correlation-id channel between a model loader and its
//!   resource worker, with progress messages and a readiness gate.
//! - [`broker`]: at most one in-flight request per shared resource key,
//!   fanned out to every fragment (of every loader) that waits on it.
//! - [`loader`]: the per-model controller that turns manifest batches and
//!   dependency signals into scene placements and tracks completion across
//!   the fragment-list, streaming and spatial-index phases.
//! - [`propdb`]: the ref-counted property database service, shared between
//!   loaders of the same model.
//!
//! Loaders never call into each other. Everything crosses thread and loader
//! boundaries as messages, and all shared state lives in the caches injected
//! at construction ([`loader::SharedCaches`]).

pub mod broker;
pub mod depot;
pub mod error;
pub mod loader;
pub mod model;
pub mod propdb;
pub mod rpc;
