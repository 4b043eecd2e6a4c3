use thiserror::Error;

/* ============================= ERROR TAXONOMY ============================= */

/// Error classification used across both services.
///
/// Every external boundary (HTTP, subprocess, storage, LLM, cluster API)
/// maps into one of these categories; the workflow engine dispatches on
/// whether a failure is retryable (`Transient`) or final (`Permanent`).
#[derive(Debug, Error)]
pub enum MenderError {
    /// Retryable failures: timeouts, 5xx responses, unreachable peers.
    #[error("transient: {0}")]
    Transient(String),

    /// Structural failures that a retry will not fix: missing fields,
    /// unparseable LLM output after the strict retry, bad requests.
    #[error("permanent: {0}")]
    Permanent(String),

    /// A command matched the danger filter and was refused.
    #[error("blocked by safety filter: {0}")]
    Blocked(String),

    #[error("storage: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),

    #[error("llm: {0}")]
    Llm(String),
}

pub type Result<T> = std::result::Result<T, MenderError>;

impl MenderError {
    /// True for failures the caller may retry once before surfacing.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MenderError::Transient(_) | MenderError::Llm(_) | MenderError::Kube(_)
        )
    }
}

impl From<reqwest::Error> for MenderError {
    fn from(e: reqwest::Error) -> Self {
        // Client-side construction errors are permanent; everything that
        // touched the wire is worth one retry.
        if e.is_builder() {
            MenderError::Permanent(e.to_string())
        } else {
            MenderError::Transient(e.to_string())
        }
    }
}
