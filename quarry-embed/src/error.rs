//! Error types and failure classification for provider calls

/// Result type for embedding and rerank operations.
///
/// Convenience alias using [`EmbedError`] as the error type, used throughout
/// the crate for operations that can fail.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Classification of a provider failure.
///
/// Downstream components record this next to the failed segment so that an
/// external scheduler can decide whether a retry is worthwhile. The mapping
/// from raw provider errors to kinds lives entirely in this module: provider
/// SDKs phrase their errors differently across versions, and keeping the
/// pattern matching here means callers only ever see the stable labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network-level failure (timeout, reset connection) — retryable
    Transient,
    /// Provider throttled the request — retryable with longer backoff
    RateLimit,
    /// The model exists but cannot be used (inactive, wrong type)
    InvalidModel,
    /// The provider does not know the requested model
    ModelNotFound,
    /// Credentials rejected
    AuthFailed,
    /// The input itself is unusable (too long, malformed) — per-segment fatal
    InvalidInput,
    /// Anything unclassified
    Fatal,
}

impl ErrorKind {
    /// Stable label stored alongside failed segments.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::InvalidModel => "invalid_model",
            ErrorKind::ModelNotFound => "model_not_found",
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Fatal => "fatal",
        }
    }

    /// Whether an external scheduler should re-attempt the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::RateLimit)
    }

    /// Classify an HTTP status code, when one is available.
    ///
    /// Status codes are more reliable than message text, so they are
    /// consulted first. Returns `None` for statuses that carry no signal on
    /// their own (e.g. a generic 400 whose body must be inspected).
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            401 | 403 => Some(ErrorKind::AuthFailed),
            404 => Some(ErrorKind::ModelNotFound),
            408 => Some(ErrorKind::Transient),
            429 => Some(ErrorKind::RateLimit),
            500..=599 => Some(ErrorKind::Transient),
            _ => None,
        }
    }

    /// Classify a provider error message by its text.
    ///
    /// Pattern-based and intentionally conservative: anything unrecognized is
    /// [`ErrorKind::Fatal`] so it is never silently retried.
    pub fn from_message(message: &str) -> Self {
        let msg = message.to_ascii_lowercase();

        if msg.contains("timeout")
            || msg.contains("timed out")
            || msg.contains("connection")
            || msg.contains("network")
            || msg.contains("socket")
            || msg.contains("reset by peer")
        {
            ErrorKind::Transient
        } else if msg.contains("rate limit")
            || msg.contains("too many requests")
            || msg.contains("quota")
        {
            ErrorKind::RateLimit
        } else if msg.contains("model") && (msg.contains("not found") || msg.contains("does not exist"))
        {
            ErrorKind::ModelNotFound
        } else if msg.contains("invalid model") || msg.contains("model is not active") {
            ErrorKind::InvalidModel
        } else if msg.contains("unauthorized")
            || msg.contains("authentication")
            || msg.contains("api key")
            || msg.contains("forbidden")
        {
            ErrorKind::AuthFailed
        } else if msg.contains("invalid input")
            || msg.contains("too long")
            || msg.contains("maximum context")
            || msg.contains("exceeds the limit")
        {
            ErrorKind::InvalidInput
        } else {
            ErrorKind::Fatal
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type for all embedding and rerank operations.
///
/// Covers configuration problems, transport failures, provider-side API
/// errors, and malformed responses. [`EmbedError::kind`] collapses every
/// variant into an [`ErrorKind`] for persistence and retry decisions.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// The requested model is unknown or not active
    #[error("unknown or inactive model: {model_id}")]
    InvalidModel { model_id: String },

    /// The model configuration itself is unusable
    #[error("invalid model configuration: {message}")]
    InvalidConfig { message: String },

    /// The input text or produced vector is unusable
    #[error("invalid embedding input: {message}")]
    InvalidInput { message: String },

    /// The request never produced an HTTP response
    #[error("provider request failed: {source}")]
    Request {
        #[source]
        source: reqwest::Error,
        kind: ErrorKind,
    },

    /// The provider answered with a non-success status
    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The provider answered 2xx but the body did not make sense
    #[error("malformed provider response: {message}")]
    Response { message: String },
}

impl EmbedError {
    /// Create an invalid configuration error with a custom message.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create an invalid input error with a custom message.
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Wrap a transport error, classifying it from the reqwest failure mode.
    pub fn request(source: reqwest::Error) -> Self {
        // Everything that never reached the provider is worth retrying.
        let kind = if source.is_timeout() || source.is_connect() || source.is_request() {
            ErrorKind::Transient
        } else {
            ErrorKind::Fatal
        };
        Self::Request { source, kind }
    }

    /// Collapse this error into its taxonomy label.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EmbedError::InvalidModel { .. } => ErrorKind::InvalidModel,
            EmbedError::InvalidConfig { .. } => ErrorKind::InvalidModel,
            EmbedError::InvalidInput { .. } => ErrorKind::InvalidInput,
            EmbedError::Request { kind, .. } => *kind,
            EmbedError::Api { status, message } => ErrorKind::from_status(*status)
                .unwrap_or_else(|| ErrorKind::from_message(message)),
            EmbedError::Response { .. } => ErrorKind::Fatal,
        }
    }
}
