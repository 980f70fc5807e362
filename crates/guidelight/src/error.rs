//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use guidelight_config::ConfigError;
use guidelight_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not reach the backend{}: {reason}", url_suffix(.url))]
    #[diagnostic(
        code(guidelight::connection_failed),
        help("Check that the backend is running and reachable.\nTry: guidelight status -v")
    )]
    ConnectionFailed { url: String, reason: String },

    #[error("Authentication failed: {message}")]
    #[diagnostic(
        code(guidelight::auth_failed),
        help("Set server.api_token in the config file or GUIDELIGHT_SERVER__API_TOKEN.")
    )]
    AuthFailed { message: String },

    #[error("Request timed out after {seconds}s")]
    #[diagnostic(
        code(guidelight::timeout),
        help("Raise server.timeout or check backend responsiveness.")
    )]
    Timeout { seconds: u64 },

    // ── Configuration ────────────────────────────────────────────────
    #[error("No backend configured")]
    #[diagnostic(
        code(guidelight::no_config),
        help("Pass --server, set GUIDELIGHT_SERVER__HTTP_URL, or add server.http_url to {path}")
    )]
    NoServer { path: String },

    #[error(transparent)]
    #[diagnostic(code(guidelight::config))]
    Config(ConfigError),

    // ── Everything else from core ────────────────────────────────────
    #[error(transparent)]
    #[diagnostic(code(guidelight::core))]
    Core(CoreError),

    #[error("Invalid JSON output: {0}")]
    #[diagnostic(code(guidelight::json))]
    Json(#[from] serde_json::Error),
}

fn url_suffix(url: &str) -> String {
    if url.is_empty() {
        String::new()
    } else {
        format!(" at {url}")
    }
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::AuthFailed { .. } => exit_code::AUTH,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::NoServer { .. } | Self::Config(_) => exit_code::USAGE,
            Self::Core(_) | Self::Json(_) => exit_code::GENERAL,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::MissingServerUrl { path } => Self::NoServer { path },
            other => Self::Config(other),
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConnectionFailed { url, reason } => Self::ConnectionFailed { url, reason },
            CoreError::AuthenticationFailed { message } => Self::AuthFailed { message },
            CoreError::Timeout { timeout_secs } => Self::Timeout {
                seconds: timeout_secs,
            },
            other => Self::Core(other),
        }
    }
}
