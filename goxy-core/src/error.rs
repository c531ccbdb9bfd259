use thiserror::Error;

/// Errors surfaced across the proxy engine's public boundaries.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad descriptor grammar, unknown rule reference, bad arity, bad regex.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A verdict descriptor did not match any known grammar form.
    #[error("malformed verdict descriptor: {0}")]
    MalformedVerdict(String),

    /// A filter or composer referenced a rule name that was never compiled.
    #[error("unknown rule: {0}")]
    UnknownRule(String),

    /// A rule received a value kind it does not support (e.g. `any` on a scalar).
    #[error("rule {rule} does not support input of this kind: {detail}")]
    InvalidInputType { rule: String, detail: String },

    /// Internal marker: a splicer/handler returned because of a drop verdict.
    #[error("flow dropped by filter chain")]
    Dropped,

    /// Graceful shutdown exceeded the caller's deadline.
    #[error("shutdown exceeded deadline")]
    ShutdownTimeout,

    /// Control-plane lookup for a proxy id outside the 1-based range.
    #[error("no such proxy: {0}")]
    NoSuchProxy(usize),

    /// Control-plane lookup for a filter id outside a proxy's filter range.
    #[error("invalid filter: proxy {proxy_id} filter {filter_id}")]
    InvalidFilter { proxy_id: usize, filter_id: usize },

    /// The OS "use of closed socket" condition, treated as benign during shutdown.
    #[error("connection closed")]
    ConnectionClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Regex(#[from] regex::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
