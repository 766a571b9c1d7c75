use std::{
    error::Error,
    fmt::{self, Display},
};
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a sandplane-related operation.
pub type SandplaneResult<T> = Result<T, SandplaneError>;

/// An error that occurred during a sandbox lifecycle operation.
#[derive(Debug, Error)]
pub enum SandplaneError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred during an HTTP middleware operation.
    #[error("http middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// An error that occurred when serializing or deserializing JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error returned by a netlink operation.
    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    /// An error returned by a system call.
    #[error("system error: {0}")]
    Sys(#[from] nix::Error),

    /// An error from the shared utility crate.
    #[error(transparent)]
    Sandutils(#[from] sandutils::SandutilsError),

    /// The requested sandbox is not registered in the session cache.
    #[error("sandbox not found: {0}")]
    SandboxNotFound(String),

    /// The requested task id is not registered in the task store.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// A sandbox with the same id already exists.
    #[error("sandbox already exists: {0}")]
    SandboxAlreadyExists(String),

    /// A task with the same id was already started.
    #[error("task already started: {0}")]
    TaskAlreadyExists(String),

    /// The requested template has no artifacts on this node.
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    /// The team has reached its concurrent sandbox limit.
    #[error("team {team_id} reached its sandbox limit of {limit}")]
    TeamLimitExceeded {
        /// The team that hit the limit.
        team_id: String,
        /// The configured limit.
        limit: usize,
    },

    /// A refresh was attempted past the sandbox's absolute lifetime cap.
    #[error("sandbox {0} reached its maximum instance length")]
    ReachedMaxLength(String),

    /// The ambient context was cancelled mid-operation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// The key-value store rejected or failed an operation.
    #[error("kv store error: {0}")]
    KvStore(String),

    /// An error that occurred while building the sandbox network topology.
    #[error("network setup failed: {0}")]
    NetworkSetup(String),

    /// The hypervisor control socket returned an error.
    #[error("hypervisor api error: {0}")]
    HypervisorApi(String),

    /// The VM failed to boot from its snapshot.
    #[error("sandbox boot failed: {0}")]
    BootFailed(String),

    /// The hypervisor version string could not be parsed.
    #[error("invalid hypervisor version: {0}")]
    InvalidHypervisorVersion(String),

    /// A required build artifact is missing or malformed.
    #[error("invalid template artifact: {0}")]
    InvalidTemplate(String),

    /// An invalid argument was supplied.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// The coarse classification of an error, used to choose a client-facing
/// HTTP status and retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Sandbox, slot, task, or template id unknown.
    NotFound,

    /// Id collision; retryable by the caller with a new id.
    AlreadyExists,

    /// A quota or range is exhausted; retry after back-off.
    Exhausted,

    /// Malformed input or missing required artifact.
    Invalid,

    /// A refresh ran past the absolute lifetime cap.
    ReachedMaxLength,

    /// A dependency hiccup that is retried locally.
    Transient,

    /// A partial side effect required a compensating rollback.
    Fatal,
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandplaneError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> SandplaneError {
        SandplaneError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Classifies the error for surface-level handling.
    pub fn class(&self) -> ErrorClass {
        match self {
            SandplaneError::SandboxNotFound(_)
            | SandplaneError::TaskNotFound(_)
            | SandplaneError::TemplateNotFound(_) => ErrorClass::NotFound,
            SandplaneError::SandboxAlreadyExists(_) | SandplaneError::TaskAlreadyExists(_) => {
                ErrorClass::AlreadyExists
            }
            SandplaneError::TeamLimitExceeded { .. } => ErrorClass::Exhausted,
            SandplaneError::ReachedMaxLength(_) => ErrorClass::ReachedMaxLength,
            SandplaneError::InvalidTemplate(_)
            | SandplaneError::InvalidArgument(_)
            | SandplaneError::InvalidHypervisorVersion(_) => ErrorClass::Invalid,
            SandplaneError::HttpRequest(_)
            | SandplaneError::HttpMiddleware(_)
            | SandplaneError::KvStore(_) => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }

    /// Returns the message safe to show to API clients.
    ///
    /// Fatal and transient errors keep their internal detail in telemetry
    /// only; everything else is already client-shaped.
    pub fn client_message(&self) -> String {
        match self.class() {
            ErrorClass::Fatal => "sandbox operation failed".to_string(),
            ErrorClass::Transient => "temporary backend failure, retry shortly".to_string(),
            _ => self.to_string(),
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `SandplaneResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> SandplaneResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            SandplaneError::SandboxNotFound("sb-1".into()).class(),
            ErrorClass::NotFound
        );
        assert_eq!(
            SandplaneError::TeamLimitExceeded {
                team_id: "t1".into(),
                limit: 2
            }
            .class(),
            ErrorClass::Exhausted
        );
        assert_eq!(
            SandplaneError::ReachedMaxLength("sb-1".into()).class(),
            ErrorClass::ReachedMaxLength
        );
        assert_eq!(
            SandplaneError::BootFailed("no snapfile".into()).class(),
            ErrorClass::Fatal
        );
        assert_eq!(
            SandplaneError::KvStore("connection reset".into()).class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn test_client_message_hides_fatal_detail() {
        let err = SandplaneError::BootFailed("snapfile missing at /secret/path".into());
        assert!(!err.client_message().contains("/secret/path"));

        let err = SandplaneError::SandboxNotFound("sb-1".into());
        assert!(err.client_message().contains("sb-1"));
    }
}
