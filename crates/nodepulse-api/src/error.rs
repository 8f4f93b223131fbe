use thiserror::Error;

/// Top-level error type for the `nodepulse-api` crate.
///
/// Covers every failure mode across both transport surfaces: the JSON-RPC
/// request/response client and the WebSocket metrics stream.
/// `nodepulse-core` maps these into user-facing diagnostics.
///
/// The enum is `Clone` on purpose: deduplicated callers all wait on the
/// same in-flight call, so a single terminal failure has to be handed to
/// every resolver. Transport-library errors are stringified at the point
/// of capture instead of being wrapped.
#[derive(Debug, Clone, Error)]
pub enum Error {
    // ── Connection ──────────────────────────────────────────────────
    /// Establishing the stream connection failed (DNS, TCP, TLS, upgrade).
    #[error("connection failed: {0}")]
    Connect(String),

    /// The stream connection dropped mid-session.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// The offline send queue overflowed and the oldest message was
    /// dropped.
    #[error("outbound queue full, dropped oldest message")]
    QueueOverflow,

    // ── HTTP transport ──────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, body read).
    #[error("HTTP transport error: {0}")]
    Http(String),

    /// Non-success HTTP status from the RPC endpoint.
    #[error("HTTP status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    /// No response within the per-call budget.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    // ── Protocol ────────────────────────────────────────────────────
    /// Malformed or unexpected frame/envelope.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Well-formed error response from the remote node. Never retried --
    /// it represents a definitive remote decision.
    #[error("RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    // ── Local ───────────────────────────────────────────────────────
    /// URL parsing error.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Local (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The client's dispatcher has shut down; no further calls possible.
    #[error("transport client shut down")]
    ClientClosed,
}

impl Error {
    /// Returns `true` if this is a transient failure worth retrying.
    ///
    /// RPC error responses and protocol errors are deliberately excluded:
    /// retrying them would just replay a deterministic failure.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connect(_)
            | Self::ConnectionClosed(_)
            | Self::Http(_)
            | Self::Timeout { .. } => true,
            // Server-side trouble is worth another attempt; client-side
            // rejections (4xx) are not.
            Self::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns `true` if this is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Extract the RPC error code, if this is an RPC error response.
    pub fn rpc_error_code(&self) -> Option<i64> {
        match self {
            Self::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}
