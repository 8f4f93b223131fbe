use thiserror::Error;

/// Top-level error type for the `nodepulse-core` crate.
///
/// Transport failures bubble up from `nodepulse-api` unchanged; the
/// variants here cover what the data layer itself can get wrong. The
/// error boundary classifies all of them into user-facing categories.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Any failure from the transport layer.
    #[error(transparent)]
    Api(#[from] nodepulse_api::Error),

    /// A cached payload no longer matches the expected shape.
    #[error("invalid cached payload for {key}: {detail}")]
    Decode { key: String, detail: String },

    /// Caller-supplied logic failed inside a boundary wrapper.
    #[error("application error: {0}")]
    Application(String),
}

impl CoreError {
    /// Returns `true` if this wraps a transient transport failure.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Api(e) => e.is_transient(),
            _ => false,
        }
    }
}
