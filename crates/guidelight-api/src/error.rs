use thiserror::Error;

/// Top-level error type for the `guidelight-api` crate.
///
/// Covers every failure mode of the wire layer: HTTP transport, backend
/// rejections, the WebSocket channel, and payload decoding.
/// `guidelight-core` maps these into user-facing diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// URL with a scheme the client cannot speak.
    #[error("Unsupported URL scheme '{scheme}' (expected {expected})")]
    UnsupportedScheme {
        scheme: String,
        expected: &'static str,
    },

    /// Request timed out.
    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// TLS or client construction error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Backend ─────────────────────────────────────────────────────
    /// The backend answered with a non-success HTTP status.
    #[error("Backend rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    /// API token missing or refused.
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    // ── WebSocket ───────────────────────────────────────────────────
    /// WebSocket connection failed.
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed unexpectedly.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// Too many heartbeats went unanswered.
    #[error("WebSocket heartbeat lost after {missed} unanswered pings")]
    HeartbeatLost { missed: u32 },

    /// Outbound frame could not be queued or written.
    #[error("WebSocket send failed: {0}")]
    WebSocketSend(String),

    /// `send()` was called while no connection is established.
    #[error("WebSocket is not connected")]
    NotConnected,

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect(),
            Self::Timeout { .. }
            | Self::WebSocketConnect(_)
            | Self::WebSocketClosed { .. }
            | Self::HeartbeatLost { .. }
            | Self::WebSocketSend(_)
            | Self::NotConnected => true,
            Self::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns `true` if this is a "not found" error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Transport(e) => e.status() == Some(reqwest::StatusCode::NOT_FOUND),
            Self::Rejected { status: 404, .. } => true,
            _ => false,
        }
    }

    /// HTTP status attached to this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport(e) => e.status().map(|s| s.as_u16()),
            Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}
