use thiserror::Error;

pub type SpeechResult<T> = Result<T, SpeechError>;

#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("failed to launch worker `{program}`: {reason}")]
    Launch { program: String, reason: String },

    #[error("worker transport failure: {0}")]
    Transport(String),

    #[error("worker protocol violation: {0}")]
    Protocol(String),

    #[error("worker reported error: {0}")]
    WorkerReported(String),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("json failure: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl SpeechError {
    #[must_use]
    pub fn launch(program: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Launch {
            program: program.into(),
            reason: reason.to_string(),
        }
    }

    /// Wrap a pipe-level failure, naming the step that failed.
    #[must_use]
    pub fn transport(step: &str, error: impl std::fmt::Display) -> Self {
        Self::Transport(format!("{step}: {error}"))
    }

    /// Stable, unique, machine-readable code for every variant.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Launch { .. } => "LS-LAUNCH",
            Self::Transport(_) => "LS-TRANSPORT",
            Self::Protocol(_) => "LS-PROTOCOL",
            Self::WorkerReported(_) => "LS-WORKER",
            Self::Io(_) => "LS-IO",
            Self::Json(_) => "LS-JSON",
            Self::Storage(_) => "LS-STORAGE",
            Self::InvalidRequest(_) => "LS-INVALID-REQUEST",
        }
    }

    /// Whether the caller may reasonably resubmit the same request.
    ///
    /// A transport failure usually means the worker died; retrying is the
    /// caller's decision (and will keep failing until the client is rebuilt).
    /// A worker-reported error came from a well-formed exchange, so the
    /// connection itself is still healthy.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::WorkerReported(_))
    }
}
