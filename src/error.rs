//! Error taxonomy shared by every layer of the crate.

/// Errors surfaced by view construction, request building, execution,
/// partitioning and sessions.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExploreError {
    /// A fact or dimension table lacks columns the joined view needs.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A request was malformed. Caught before anything reaches a backend.
    #[error("invalid request: {0}")]
    RequestInvalid(String),

    /// Transient backend failure. Callers may retry with backoff.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("grouped result has {rows} rows, exceeding the cap of {cap}")]
    ResultTooLarge { rows: usize, cap: usize },

    #[error("invalid partition fractions: {0}")]
    InvalidFractions(String),

    /// The model-fitting collaborator rejected or failed the fit.
    #[error("model fit failed: {0}")]
    ModelFit(String),

    #[error("session has ended")]
    SessionEnded,
}

impl ExploreError {
    /// Returns `true` when the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExploreError::BackendUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, ExploreError>;
