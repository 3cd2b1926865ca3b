/// Failures raised by a `Store` backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(String),

    #[error("Failed to (de)serialize record {key}: {message}")]
    Serialization { key: String, message: String },

    #[error("Failed to acquire store lock: {0}")]
    Lock(String),

    #[error("Store mutex poisoned")]
    Poisoned,
}

/// Error enum for orchestration and single-item operations.
///
/// Categories:
/// - Contention: another run holds the resource, surface "try again"
/// - Fail-fast: rejected before any work was scheduled
/// - Batch-fatal: the current invocation cannot proceed, the task runtime retries
/// - Operation: a user-triggered single-item operation failed, item left in `error`
#[derive(Debug, thiserror::Error)]
pub enum GolemError {
    // Contention
    #[error("A prioritization job is already running ({0})")]
    JobAlreadyRunning(String),

    #[error("{operation} is already in progress for item {item_id}, try again shortly")]
    InProgress { operation: String, item_id: String },

    // Fail-fast
    #[error("Metrics source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Nothing to do: the catalog has no items")]
    NothingToDo,

    #[error("No prioritization job is running")]
    NoActiveJob,

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("A draft already exists for item {0}; approve or reject it first")]
    DraftExists(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    // Batch-fatal
    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Task queue error: {0}")]
    Queue(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    // Operation
    #[error("Content generation failed: {0}")]
    Generation(String),

    #[error("Draft validation failed: {0}")]
    Validation(String),

    #[error("Analysis failed: {0}")]
    Analysis(String),
}

impl GolemError {
    /// Returns true if the error is a normal "someone else holds it" signal
    /// rather than a failure.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            GolemError::JobAlreadyRunning(_) | GolemError::InProgress { .. }
        )
    }

    /// Returns true if re-running the same invocation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GolemError::Catalog(_)
                | GolemError::Queue(_)
                | GolemError::Store(StoreError::Io(_))
                | GolemError::Store(StoreError::Lock(_))
        ) || self.is_contention()
    }
}

/// Allows `?` to convert `GolemError` to `String` at the CLI boundary.
impl From<GolemError> for String {
    fn from(err: GolemError) -> String {
        err.to_string()
    }
}

impl From<StoreError> for String {
    fn from(err: StoreError) -> String {
        err.to_string()
    }
}
