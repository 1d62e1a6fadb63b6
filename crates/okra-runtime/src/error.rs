//! Error taxonomy for the runtime.
//!
//! Every fallible operation in this crate returns [`Error`], whose variants
//! map onto the kinds described in the design: configuration, lifecycle,
//! validation, execution, policy, external, and cancellation. [`Error::code`]
//! maps any variant onto one of the stable wire [`ErrorCode`]s.

use std::fmt;

pub type Result<T, E = Error> = core::result::Result<T, E>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Stable, wire-visible response error codes (see the external interfaces).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCode {
    ValidationError,
    ExecutionError,
    InternalError,
    NotFound,
    Unavailable,
    DeadlineExceeded,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Unavailable => "UNAVAILABLE",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
        };
        f.write_str(s)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("wasm module is empty")]
    InvalidModule,
    #[error("failed to link required WASI preview1 surface: {0}")]
    MissingWasi(#[source] anyhow::Error),
    #[error("failed to link host API imports: {0}")]
    HostLinkFailed(#[source] anyhow::Error),
    #[error("module is missing required export `{0}`")]
    MissingExport(&'static str),
    #[error("min_workers ({min}) must be <= max_workers ({max})")]
    InvalidWorkerBounds { min: usize, max: usize },
    #[error("max_workers must be >= 1")]
    ZeroMaxWorkers,
    #[error("service package is missing a {0}")]
    MissingPackageField(&'static str),
    #[error("schema declares zero services")]
    EmptySchema,
    #[error("unknown language `{0}`")]
    UnknownLanguage(String),
}

#[derive(thiserror::Error, Debug)]
pub enum LifecycleError {
    #[error("runtime orchestrator is already started")]
    AlreadyStarted,
    #[error("runtime orchestrator has not been started")]
    NotStarted,
    #[error("actor `{0}` is already deployed")]
    AlreadyDeployed(String),
    #[error("actor `{0}` is not deployed")]
    NotDeployed(String),
    #[error("worker pool has been shut down")]
    ShutDown,
    #[error("shutdown did not complete within the deadline")]
    ShutdownTimedOut,
    #[error("{0} actor(s) failed to shut down cleanly")]
    ShutdownErrors(usize),
}

#[derive(thiserror::Error, Debug)]
pub enum ValidationError {
    #[error("method `{0}` not found")]
    MethodNotFound(String),
    #[error("method `{0}` requires non-empty input")]
    InputRequired(String),
    #[error("request method name is empty")]
    EmptyMethod,
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("sandbox trap: {0}")]
    Trap(#[source] anyhow::Error),
    #[error("guest memory access out of bounds: ptr={ptr} len={len}")]
    MemoryAccessFailed { ptr: u32, len: u32 },
    #[error("handle_request returned a malformed packed result")]
    MalformedResult,
    #[error("failed to instantiate a new worker: {0}")]
    InstantiationFailed(#[source] anyhow::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum PolicyError {
    #[error("host API `{0}` denied by policy: {1}")]
    Denied(String, String),
    #[error("rate limit exceeded for `{0}`")]
    RateLimited(String),
    #[error("access to reserved key `{0}` is not permitted")]
    ReservedKey(String),
    #[error("value exceeds size limit ({actual} > {limit} bytes)")]
    SizeLimitExceeded { actual: usize, limit: usize },
    #[error("value out of bounds: {0}")]
    OutOfBounds(String),
    #[error("host API calls are not permitted during _initialize")]
    NotYetAvailable,
    #[error("unknown capability `{0}`")]
    UnknownCapability(String),
    #[error("unknown iterator id `{0}`")]
    UnknownIterator(String),
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error("external capability failure: {0}")]
    External(#[source] BoxError),
    #[error("operation canceled")]
    Canceled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Maps this error onto one of the stable wire error codes.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::ValidationError,
            Self::Execution(_) => ErrorCode::ExecutionError,
            Self::Lifecycle(LifecycleError::NotDeployed(_)) => ErrorCode::NotFound,
            Self::Lifecycle(LifecycleError::ShutDown) => ErrorCode::Unavailable,
            Self::Lifecycle(_) => ErrorCode::InternalError,
            Self::Policy(_) => ErrorCode::ExecutionError,
            Self::External(_) => ErrorCode::ExecutionError,
            Self::Canceled | Self::DeadlineExceeded => ErrorCode::DeadlineExceeded,
            Self::Configuration(_) | Self::Internal(_) => ErrorCode::InternalError,
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    #[must_use]
    pub fn external(err: impl Into<BoxError>) -> Self {
        Self::External(err.into())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::DeadlineExceeded
    }
}
