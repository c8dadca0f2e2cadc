//! Error types for the pool engine and the in-sandbox bridges.

/// Errors surfaced by the sandpool library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No warm workload could be allocated. This is a capacity condition,
    /// not a failure; callers map it to a 503-equivalent signal.
    #[error("no warm workload available")]
    NoWarmAvailable,

    /// The named workload does not exist.
    #[error("workload not found: {0}")]
    NotFound(String),

    /// Invalid caller input, rejected before any orchestrator call.
    #[error("validation error: {0}")]
    Validation(String),

    /// The workload exists but is not reachable yet (no pod IP).
    #[error("workload not reachable: {0}")]
    Unreachable(String),

    /// Error from the orchestrator API.
    #[error("orchestrator error: {0}")]
    Orchestrator(#[from] kube::Error),

    /// Non-2xx response from an in-sandbox bridge, with the upstream body.
    #[error("bridge error ({status}): {message}")]
    Bridge { status: u16, message: String },

    /// Network / connection error talking to an in-sandbox bridge.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error on a caller-provided sink or stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// True when the orchestrator rejected a write because the carried
/// resource version was stale. Not an error: the losing side of an
/// optimistic-concurrency race re-reads and retries.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

/// True when the orchestrator reports the object gone. Swallowed in
/// delete paths, mapped to `None`/[`Error::NotFound`] in get paths.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// True for transient upstream failures (5xx) worth retrying in place.
pub fn is_transient(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code >= 500)
}
