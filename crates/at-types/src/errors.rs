use thiserror::Error;

/// Main error type for the AutoTune system
#[derive(Error, Debug)]
pub enum AtError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Delegate error: {0}")]
    Delegate(#[from] DelegateError),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl AtError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether the error was caused by the caller (bad request or unknown id)
    /// rather than by the system.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::NotFound { .. })
    }
}

/// Persistence errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Corrupt record {id}: {message}")]
    CorruptRecord { id: String, message: String },

    #[error("Snapshot error: {message}")]
    Snapshot { message: String },

    #[error("Dataset read failed for {path}: {message}")]
    DatasetRead { path: String, message: String },
}

/// Candidate search errors
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Empty search axis: {axis}")]
    EmptyAxis { axis: &'static str },

    #[error("Invalid search space: {message}")]
    InvalidSpace { message: String },

    #[error("Probe {probe_id} failed: {message}")]
    ProbeFailed { probe_id: String, message: String },

    #[error("Predictor not trained")]
    PredictorNotTrained,

    #[error("Prediction failed: {message}")]
    PredictionFailed { message: String },

    #[error("Predictor model error: {message}")]
    Model { message: String },
}

/// Remote execution errors.
///
/// Every variant renders as a `(success, message)` outcome via
/// [`RemoteError::outcome`].
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    #[error("Not connected")]
    NotConnected,

    #[error("Command exited with code {exit_code}: {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    #[error("Command timed out after {timeout_seconds} seconds")]
    Timeout { timeout_seconds: u64 },

    #[error("Runner completed but produced no result: {path} is missing")]
    MissingResult { path: String },

    #[error("Invalid result file {path}: {message}")]
    InvalidResult { path: String, message: String },

    #[error("Transfer failed for {path}: {message}")]
    Transfer { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// Errors that mean the execution channel itself is unusable, as opposed
    /// to the remote process having failed on its own terms.
    pub fn is_infrastructure(&self) -> bool {
        !matches!(self, Self::CommandFailed { .. })
    }

    pub fn outcome(&self) -> (bool, String) {
        (false, self.to_string())
    }
}

/// Errors returned by training, evaluation and probe delegates
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DelegateError {
    #[error("Stopped by request")]
    Stopped,

    #[error("Run failed: {message}")]
    Failed { message: String },

    #[error("Infrastructure failure: {message}")]
    Infrastructure { message: String },
}

impl DelegateError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::Infrastructure {
            message: message.into(),
        }
    }
}

impl From<RemoteError> for DelegateError {
    fn from(err: RemoteError) -> Self {
        if err.is_infrastructure() {
            Self::Infrastructure {
                message: err.to_string(),
            }
        } else {
            Self::Failed {
                message: err.to_string(),
            }
        }
    }
}

/// Result type alias for AutoTune operations
pub type AtResult<T> = Result<T, AtError>;

/// Result alias for remote operations
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::AtError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::AtError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::AtError::Config(format!($($arg)*))
    };
}
