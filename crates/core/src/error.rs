use thiserror::Error;

/// Failure kinds surfaced by the orchestration core.
///
/// Only two kinds carry local recovery: bundle resolution (recovery
/// hook, then static fallback) and service HTTP errors (retry policy).
/// Everything else is captured onto the failing run or delivery.
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("step '{step_id}' depends on unknown step '{dependency}'")]
    MissingDependency { step_id: String, dependency: String },

    #[error("workflow contains a cycle: {cycle}")]
    CycleDetected { cycle: String },

    #[error("no handler resolvable for job '{slug}'")]
    HandlerMissing { slug: String },

    #[error("bundle resolution failed for {binding}: {reason}")]
    BundleResolution { binding: String, reason: String },

    #[error("bundle checksum mismatch for {key}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("sandbox timed out after {elapsed_ms}ms")]
    SandboxTimeout { elapsed_ms: u64 },

    #[error("sandbox exited abnormally (code: {code:?}, signal: {signal:?})")]
    SandboxCrash {
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("service '{slug}' unavailable: {reason}")]
    ServiceUnavailable { slug: String, reason: String },

    #[error("service call failed with status {status}")]
    ServiceHttp { status: u16 },

    #[error("template error: {0}")]
    Template(String),

    #[error("record store error: {0}")]
    Store(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("skipped idempotent replay for key '{0}'")]
    SkippedIdempotent(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// True when a retry policy may be applied to this failure.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::ServiceHttp { .. } | Self::Store(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
