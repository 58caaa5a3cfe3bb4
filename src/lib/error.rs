use std::{fmt, time::Duration};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// How a failure should be handled by callers and the retry wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Requires a user decision (credentials, conflicting refs, bad input).
    /// Never auto-retried.
    UserActionable,
    /// Transient. Eligible for bounded retry with backoff.
    Retriable,
    /// Corruption, cancellation or unexpected state. Surfaced immediately.
    Fatal,
}

/// Stable programmatic tags for every failure the core can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    AuthRequired,
    NotFastForward,
    MergeConflict,
    QuotaExceeded,
    PermissionDenied,
    InvalidRef,
    InvalidInput,
    Network,
    Timeout,
    RelayTimeout,
    RelayError,
    ServerError,
    RateLimited,
    Transient,
    CorruptObject,
    Filesystem,
    Unknown,
    OperationAborted,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthRequired => "auth-required",
            ErrorCode::NotFastForward => "not-fast-forward",
            ErrorCode::MergeConflict => "merge-conflict",
            ErrorCode::QuotaExceeded => "quota-exceeded",
            ErrorCode::PermissionDenied => "permission-denied",
            ErrorCode::InvalidRef => "invalid-ref",
            ErrorCode::InvalidInput => "invalid-input",
            ErrorCode::Network => "network",
            ErrorCode::Timeout => "timeout",
            ErrorCode::RelayTimeout => "relay-timeout",
            ErrorCode::RelayError => "relay-error",
            ErrorCode::ServerError => "server-error",
            ErrorCode::RateLimited => "rate-limited",
            ErrorCode::Transient => "transient",
            ErrorCode::CorruptObject => "corrupt-object",
            ErrorCode::Filesystem => "filesystem",
            ErrorCode::Unknown => "unknown",
            ErrorCode::OperationAborted => "operation-aborted",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorCode::AuthRequired
            | ErrorCode::NotFastForward
            | ErrorCode::MergeConflict
            | ErrorCode::QuotaExceeded
            | ErrorCode::PermissionDenied
            | ErrorCode::InvalidRef
            | ErrorCode::InvalidInput => ErrorCategory::UserActionable,
            ErrorCode::Network
            | ErrorCode::Timeout
            | ErrorCode::RelayTimeout
            | ErrorCode::RelayError
            | ErrorCode::ServerError
            | ErrorCode::RateLimited
            | ErrorCode::Transient => ErrorCategory::Retriable,
            ErrorCode::CorruptObject
            | ErrorCode::Filesystem
            | ErrorCode::Unknown
            | ErrorCode::OperationAborted => ErrorCategory::Fatal,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fields preserved through timeouts and cancellation for upstream
/// telemetry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    pub operation: Option<String>,
    pub naddr: Option<String>,
    pub remote: Option<String>,
    pub ref_name: Option<String>,
    pub relay: Option<String>,
    pub status_code: Option<u16>,
}

impl ErrorContext {
    pub fn for_operation(operation: impl Into<String>) -> Self {
        Self {
            operation: Some(operation.into()),
            ..Self::default()
        }
    }

    pub fn with_naddr(mut self, naddr: impl Into<String>) -> Self {
        self.naddr = Some(naddr.into());
        self
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = Some(remote.into());
        self
    }

    pub fn with_ref(mut self, ref_name: impl Into<String>) -> Self {
        self.ref_name = Some(ref_name.into());
        self
    }

    pub fn with_relay(mut self, relay: impl Into<String>) -> Self {
        self.relay = Some(relay.into());
        self
    }

    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }
}

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct CoreError {
    pub code: ErrorCode,
    pub message: String,
    pub hint: Option<String>,
    pub context: ErrorContext,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl CoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            hint: None,
            context: ErrorContext::default(),
            source: None,
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn aborted(context: ErrorContext) -> Self {
        Self::new(ErrorCode::OperationAborted, "operation aborted").with_context(context)
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }
}

impl From<git2::Error> for CoreError {
    fn from(err: git2::Error) -> Self {
        use git2::{ErrorClass, ErrorCode as GitCode};
        let code = match (err.code(), err.class()) {
            (GitCode::Auth, _) | (_, ErrorClass::Ssh) => ErrorCode::AuthRequired,
            (GitCode::NotFastForward, _) => ErrorCode::NotFastForward,
            (GitCode::Conflict | GitCode::MergeConflict | GitCode::Unmerged, _) => {
                ErrorCode::MergeConflict
            }
            (GitCode::InvalidSpec, _) => ErrorCode::InvalidRef,
            (GitCode::Timeout, _) => ErrorCode::Timeout,
            (GitCode::Certificate, _) | (_, ErrorClass::Net | ErrorClass::Http) => {
                ErrorCode::Network
            }
            (_, ErrorClass::Os | ErrorClass::Filesystem) => ErrorCode::Filesystem,
            (_, ErrorClass::Odb | ErrorClass::Object | ErrorClass::Sha1) => {
                ErrorCode::CorruptObject
            }
            _ => ErrorCode::Unknown,
        };
        let hint = match code {
            ErrorCode::AuthRequired => {
                Some("authentication required: configure a token for the git server".to_string())
            }
            ErrorCode::NotFastForward => {
                Some("the remote has newer commits: fetch and rebase first".to_string())
            }
            _ => None,
        };
        Self {
            code,
            message: err.message().to_string(),
            hint,
            context: ErrorContext::default(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorCode::Filesystem, err.to_string()).with_source(err)
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            ErrorCode::Timeout
        } else {
            match err.status() {
                Some(status) if status.as_u16() == 429 => ErrorCode::RateLimited,
                Some(status) if status.is_server_error() => ErrorCode::ServerError,
                Some(status) if status.as_u16() == 403 => ErrorCode::PermissionDenied,
                _ => ErrorCode::Network,
            }
        };
        let context = ErrorContext {
            status_code: err.status().map(|s| s.as_u16()),
            ..ErrorContext::default()
        };
        Self::new(code, err.to_string())
            .with_context(context)
            .with_source(err)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::InvalidInput, err.to_string()).with_source(err)
    }
}

/// Runs `fut` under an operation-local deadline, converting an elapsed
/// timer into a typed `timeout` error that keeps the caller's context.
pub async fn with_timeout<T, F>(
    fut: F,
    ms: u64,
    label: &str,
    context: ErrorContext,
) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(Duration::from_millis(ms), fut).await {
        Ok(res) => res,
        Err(_) => Err(
            CoreError::new(ErrorCode::Timeout, format!("{label} timed out after {ms}ms"))
                .with_context(context),
        ),
    }
}
