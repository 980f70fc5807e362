// ── Core error types ──
//
// User-facing errors from guidelight-core. Consumers never see raw HTTP
// status codes or JSON parse failures; the `From<guidelight_api::Error>`
// impl translates transport-layer errors into domain variants.

use std::path::PathBuf;

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot reach backend at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Backend request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// `start` was called on a controller that has already been shut down.
    #[error("Sync session was shut down and cannot be restarted")]
    SessionClosed,

    /// A fallback-only HTTP action was attempted while the push channel is up.
    #[error("Refusing {operation} over HTTP while the WebSocket is connected")]
    PushChannelHealthy { operation: &'static str },

    // ── Operation errors ─────────────────────────────────────────────
    #[error("Operation rejected by backend: {message}")]
    Rejected { message: String, status: Option<u16> },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },

    // ── Alarm errors ─────────────────────────────────────────────────
    /// The advisory lock backend itself is unusable (not merely contended).
    #[error("Lock '{name}' unavailable: {reason}")]
    LockUnavailable { name: String, reason: String },

    #[error("Audio engine not ready: {reason}")]
    AudioNotReady { reason: String },

    #[error("Suppression store error at {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── API errors (wrapped, not exposed raw) ────────────────────────
    #[error("API error: {message}")]
    Api { message: String, status: Option<u16> },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl CoreError {
    /// Returns `true` if retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } | Self::Timeout { .. } => true,
            Self::Rejected { status, .. } | Self::Api { status, .. } => {
                status.is_some_and(|s| s >= 500)
            }
            _ => false,
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<guidelight_api::Error> for CoreError {
    fn from(err: guidelight_api::Error) -> Self {
        use guidelight_api::Error as Api;

        match err {
            Api::Authentication { message } => CoreError::AuthenticationFailed { message },
            Api::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout { timeout_secs: 0 }
                } else if e.is_connect() {
                    CoreError::ConnectionFailed {
                        url: e
                            .url()
                            .map_or_else(|| "<unknown>".into(), ToString::to_string),
                        reason: e.to_string(),
                    }
                } else {
                    CoreError::Api {
                        message: e.to_string(),
                        status: e.status().map(|s| s.as_u16()),
                    }
                }
            }
            Api::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            Api::UnsupportedScheme { scheme, expected } => CoreError::Config {
                message: format!("Unsupported URL scheme '{scheme}' (expected {expected})"),
            },
            Api::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            Api::Tls(msg) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("TLS error: {msg}"),
            },
            Api::Rejected { status, message } => CoreError::Rejected {
                message,
                status: Some(status),
            },
            Api::WebSocketConnect(reason) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("WebSocket connection failed: {reason}"),
            },
            Api::WebSocketClosed { code, reason } => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("WebSocket closed (code {code}): {reason}"),
            },
            Api::HeartbeatLost { missed } => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("heartbeat lost after {missed} unanswered pings"),
            },
            Api::WebSocketSend(reason) => CoreError::ConnectionFailed {
                url: String::new(),
                reason: format!("WebSocket send failed: {reason}"),
            },
            Api::NotConnected => CoreError::ConnectionFailed {
                url: String::new(),
                reason: "WebSocket is not connected".into(),
            },
            Api::Deserialization { message, body: _ } => CoreError::Api {
                message: format!("Deserialization error: {message}"),
                status: None,
            },
        }
    }
}
