use thiserror::Error;

/// Failures on the request/response channel, either reported by the remote
/// operation handler or synthesized locally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// Terminal failure reported by the remote handler for this operation.
    #[error("operation failed with code {code}: {msg}")]
    Operation { code: i32, msg: String },

    #[error("no handler registered for operation \"{0}\"")]
    UnknownOperation(String),

    /// Malformed message, e.g. a payload that doesn't match the operation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Synthesized locally when the owning loader tears down while the request
    /// is still in flight. Callers must never be left hanging on unload.
    #[error("request abandoned: the loader was unloaded")]
    Unloaded,
}

impl RpcError {
    pub fn operation(code: i32, msg: impl Into<String>) -> Self {
        Self::Operation { code, msg: msg.into() }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}

/// Failures of the property database cache service. `Unloaded` is kept
/// distinguishable from `NotCached` so callers can tell "genuinely missing"
/// from "became unavailable while waiting".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PropDbError {
    #[error("property database \"{path}\" failed to load: {source}")]
    LoadFailed {
        path: String,
        #[source]
        source: RpcError,
    },

    #[error("property database \"{0}\" is not cached")]
    NotCached(String),

    /// The loader was created without a property database path.
    #[error("no property database is configured for this model")]
    NotConfigured,

    /// The owning cache entry was released while this request was pending.
    #[error("property database was unloaded while the request was pending")]
    Unloaded,

    #[error("external id table for \"{path}\" failed to load: {source}")]
    ExternalIds {
        path: String,
        #[source]
        source: RpcError,
    },
}
