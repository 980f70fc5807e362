// ── Runtime sync configuration ──
//
// Describes *where* the backend lives and how every component is tuned.
// Built by the binary from `guidelight-config`, passed to `SyncController`.
// Core never reads config files.

use std::time::Duration;

use guidelight_api::{ReconnectConfig, TransportConfig};
use url::Url;

use crate::error::CoreError;

/// Name of the advisory lock that guards audio output.
pub const DEFAULT_ALARM_LOCK: &str = "guidelight-alarm-audio";

/// Zone activation tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneSettings {
    /// A cleared-equivalent signal this soon after a local activation is
    /// treated as stale, unless sequence numbers say otherwise.
    pub race_window: Duration,
}

impl Default for ZoneSettings {
    fn default() -> Self {
        Self {
            race_window: Duration::from_secs(3),
        }
    }
}

/// Command tracker timers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerSettings {
    /// How long an acked record stays visible before removal.
    pub ack_grace: Duration,
    /// Upper bound on any non-terminal state before the record fails.
    pub pending_timeout: Duration,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            ack_grace: Duration::from_secs(2),
            pending_timeout: Duration::from_secs(15),
        }
    }
}

/// Alarm coordinator tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmSettings {
    pub lock_name: String,
    /// Initial gain, clamped to `[0, 1]`.
    pub volume: f32,
    /// Default suppression window used by callers that do not pick one.
    pub ack_duration: Duration,
}

impl Default for AlarmSettings {
    fn default() -> Self {
        Self {
            lock_name: DEFAULT_ALARM_LOCK.into(),
            volume: 0.8,
            ack_duration: Duration::from_secs(300),
        }
    }
}

/// Configuration for one sync session against one backend.
///
/// No `Default`: a backend URL must always be given.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Backend HTTP root (e.g. `https://guidance.example`).
    pub http_url: Url,
    /// Explicit WebSocket endpoint; derived from `http_url` when `None`.
    pub ws_url: Option<Url>,
    pub transport: TransportConfig,
    pub reconnect: ReconnectConfig,
    pub zone: ZoneSettings,
    pub commands: TrackerSettings,
    /// Fallback poll period while the WebSocket is down.
    pub poll_interval: Duration,
    pub alarm: AlarmSettings,
    /// Device group whose `command_status` messages are applied.
    pub scope: String,
}

impl SyncConfig {
    pub fn new(http_url: Url) -> Self {
        Self {
            http_url,
            ws_url: None,
            transport: TransportConfig::default(),
            reconnect: ReconnectConfig::default(),
            zone: ZoneSettings::default(),
            commands: TrackerSettings::default(),
            poll_interval: Duration::from_secs(30),
            alarm: AlarmSettings::default(),
            scope: "default".into(),
        }
    }

    /// The WebSocket endpoint: `ws_url` if set, otherwise `http_url` with
    /// `http→ws` / `https→wss` and path `/ws`.
    pub fn websocket_url(&self) -> Result<Url, CoreError> {
        if let Some(ref url) = self.ws_url {
            return Ok(url.clone());
        }
        derive_websocket_url(&self.http_url)
    }
}

/// Map a backend HTTP root to its WebSocket endpoint.
pub fn derive_websocket_url(http_url: &Url) -> Result<Url, CoreError> {
    let scheme = match http_url.scheme() {
        "http" => "ws",
        "https" => "wss",
        "ws" | "wss" => return Ok(http_url.clone()),
        other => {
            return Err(CoreError::Config {
                message: format!("cannot derive a WebSocket URL from scheme '{other}'"),
            });
        }
    };

    let mut url = http_url.clone();
    url.set_scheme(scheme).map_err(|()| CoreError::Config {
        message: format!("cannot switch {http_url} to {scheme}"),
    })?;
    url.set_path("/ws");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_follows_http_scheme() {
        let plain = derive_websocket_url(&Url::parse("http://10.0.0.5:8080").unwrap()).unwrap();
        assert_eq!(plain.as_str(), "ws://10.0.0.5:8080/ws");

        let tls = derive_websocket_url(&Url::parse("https://guidance.example/app?x=1").unwrap())
            .unwrap();
        assert_eq!(tls.as_str(), "wss://guidance.example/ws");
    }

    #[test]
    fn explicit_websocket_url_wins() {
        let mut config = SyncConfig::new(Url::parse("https://guidance.example").unwrap());
        config.ws_url = Some(Url::parse("wss://push.guidance.example/live").unwrap());
        assert_eq!(
            config.websocket_url().unwrap().as_str(),
            "wss://push.guidance.example/live"
        );
    }

    #[test]
    fn unknown_scheme_is_a_config_error() {
        let err = derive_websocket_url(&Url::parse("ftp://guidance.example").unwrap()).unwrap_err();
        assert!(matches!(err, CoreError::Config { .. }));
    }
}
