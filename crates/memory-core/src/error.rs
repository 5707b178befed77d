use thiserror::Error;

/// Memory service domain errors.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("immutability violation: {0}")]
    ImmutabilityViolation(String),

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("search index error: {0}")]
    SearchIndex(String),

    #[error("embedder error: {0}")]
    Embedder(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MemoryError {
    pub fn not_found(resource: impl Into<String>, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{} '{}' not found", resource.into(), id))
    }

    pub fn conflict_title(resource: impl Into<String>, title: impl Into<String>) -> Self {
        Self::Conflict(format!(
            "{} with title '{}' already exists",
            resource.into(),
            title.into()
        ))
    }

    pub fn already_corrected(entry_id: impl std::fmt::Display) -> Self {
        Self::ImmutabilityViolation(format!(
            "entry '{entry_id}' has already been corrected and cannot be modified"
        ))
    }
}
