//! Configuration for guidelight.
//!
//! Layered with figment: built-in defaults, then the TOML file at the
//! platform config path, then `GUIDELIGHT_` environment variables (`__`
//! separates sections, e.g. `GUIDELIGHT_SERVER__HTTP_URL`). The result is
//! translated into `guidelight_core::SyncConfig`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use guidelight_core::config::DEFAULT_ALARM_LOCK;
use guidelight_core::{
    AlarmSettings, ReconnectConfig, SyncConfig, TlsMode, TrackerSettings, TransportConfig,
    ZoneSettings,
};

const ENV_PREFIX: &str = "GUIDELIGHT_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("no backend URL configured (set server.http_url in {path} or GUIDELIGHT_SERVER__HTTP_URL)")]
    MissingServerUrl { path: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub transport: TransportSection,
    pub zone: ZoneSection,
    pub commands: CommandsSection,
    pub fallback: FallbackSection,
    pub alarm: AlarmSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Backend root, e.g. "https://guidance.example". Required.
    pub http_url: Option<String>,

    /// WebSocket endpoint; derived from `http_url` when unset.
    pub ws_url: Option<String>,

    /// Bearer token for REST calls (plaintext; prefer the env var).
    #[serde(skip_serializing)]
    pub api_token: Option<String>,

    /// Request timeout in seconds.
    pub timeout: u64,

    /// Accept self-signed TLS certificates.
    pub insecure: bool,

    /// Path to a custom CA certificate.
    pub ca_cert: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_url: None,
            ws_url: None,
            api_token: None,
            timeout: 10,
            insecure: false,
            ca_cert: None,
        }
    }
}

/// WebSocket heartbeat and reconnect backoff.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportSection {
    pub heartbeat_secs: u64,
    pub max_missed_pongs: u32,
    pub backoff_initial_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_ms: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            heartbeat_secs: 25,
            max_missed_pongs: 3,
            backoff_initial_ms: 1_000,
            backoff_multiplier: 1.5,
            backoff_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ZoneSection {
    /// Stale-clear guard after an activation, in milliseconds.
    pub race_window_ms: u64,
}

impl Default for ZoneSection {
    fn default() -> Self {
        Self {
            race_window_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CommandsSection {
    pub ack_grace_ms: u64,
    pub pending_timeout_secs: u64,
    /// Device group whose command statuses are tracked.
    pub scope: String,
}

impl Default for CommandsSection {
    fn default() -> Self {
        Self {
            ack_grace_ms: 2_000,
            pending_timeout_secs: 15,
            scope: "default".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct FallbackSection {
    pub poll_interval_secs: u64,
}

impl Default for FallbackSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AlarmSection {
    pub volume: f32,
    pub lock_name: String,
    pub ack_duration_secs: u64,
    /// Where the suppression deadline is kept; defaults to the data dir.
    pub suppression_file: Option<PathBuf>,
    /// Raw little-endian f32 mono PCM; a built-in siren when unset.
    pub sample_file: Option<PathBuf>,
    pub sample_rate: u32,
}

impl Default for AlarmSection {
    fn default() -> Self {
        Self {
            volume: 0.8,
            lock_name: DEFAULT_ALARM_LOCK.into(),
            ack_duration_secs: 300,
            suppression_file: None,
            sample_file: None,
            sample_rate: 44_100,
        }
    }
}

// ── Paths ───────────────────────────────────────────────────────────

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "guidelight", "guidelight")
}

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    project_dirs().map_or_else(
        || fallback_dir().join("config.toml"),
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

/// Default location of the durable suppression deadline.
pub fn default_suppression_path() -> PathBuf {
    project_dirs().map_or_else(
        || fallback_dir().join("alarm-suppressed-until"),
        |dirs| dirs.data_dir().join("alarm-suppressed-until"),
    )
}

fn fallback_dir() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("guidelight");
    p
}

// ── Loading ─────────────────────────────────────────────────────────

/// Load from the canonical config path plus environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` plus environment. A missing file is not an error.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let config: Config = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()?;
    Ok(config)
}

// ── Translation ─────────────────────────────────────────────────────

impl Config {
    /// Build the runtime `SyncConfig`. Fails without a backend URL.
    pub fn to_sync_config(&self) -> Result<SyncConfig, ConfigError> {
        let raw = self
            .server
            .http_url
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingServerUrl {
                path: config_path().display().to_string(),
            })?;
        let http_url = parse_url("server.http_url", raw)?;
        let ws_url = self
            .server
            .ws_url
            .as_deref()
            .map(|raw| parse_url("server.ws_url", raw))
            .transpose()?;

        self.validate()?;

        let mut transport = TransportConfig {
            tls: self.tls_mode(),
            timeout: Duration::from_secs(self.server.timeout),
            api_token: None,
        };
        if let Some(ref token) = self.server.api_token {
            transport = transport.with_api_token(SecretString::from(token.clone()));
        }

        let t = &self.transport;
        let mut config = SyncConfig::new(http_url);
        config.ws_url = ws_url;
        config.transport = transport;
        config.reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(t.backoff_initial_ms),
            max_delay: Duration::from_millis(t.backoff_max_ms),
            multiplier: t.backoff_multiplier,
            heartbeat_interval: Duration::from_secs(t.heartbeat_secs),
            max_missed_pongs: t.max_missed_pongs,
        };
        config.zone = ZoneSettings {
            race_window: Duration::from_millis(self.zone.race_window_ms),
        };
        config.commands = TrackerSettings {
            ack_grace: Duration::from_millis(self.commands.ack_grace_ms),
            pending_timeout: Duration::from_secs(self.commands.pending_timeout_secs),
        };
        config.poll_interval = Duration::from_secs(self.fallback.poll_interval_secs);
        config.alarm = AlarmSettings {
            lock_name: self.alarm.lock_name.clone(),
            volume: self.alarm.volume,
            ack_duration: Duration::from_secs(self.alarm.ack_duration_secs),
        };
        config.scope.clone_from(&self.commands.scope);
        Ok(config)
    }

    /// The configured suppression file, or the platform default.
    pub fn suppression_path(&self) -> PathBuf {
        self.alarm
            .suppression_file
            .clone()
            .unwrap_or_else(default_suppression_path)
    }

    /// Directory holding the alarm lock files and bus, shared by every
    /// process that uses the same suppression file.
    pub fn coordination_dir(&self) -> PathBuf {
        self.suppression_path()
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
    }

    /// Effective configuration as TOML. The API token is never written.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn tls_mode(&self) -> TlsMode {
        if self.server.insecure {
            TlsMode::DangerAcceptInvalid
        } else if let Some(ref ca) = self.server.ca_cert {
            TlsMode::CustomCa(ca.clone())
        } else {
            TlsMode::System
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.alarm.volume) {
            return Err(invalid("alarm.volume", format!("{} is outside 0.0..=1.0", self.alarm.volume)));
        }
        if self.fallback.poll_interval_secs == 0 {
            return Err(invalid("fallback.poll_interval_secs", "must be at least 1".into()));
        }
        if self.transport.backoff_multiplier < 1.0 {
            return Err(invalid(
                "transport.backoff_multiplier",
                format!("{} would shrink the delay", self.transport.backoff_multiplier),
            ));
        }
        if self.transport.backoff_initial_ms > self.transport.backoff_max_ms {
            return Err(invalid(
                "transport.backoff_initial_ms",
                "exceeds transport.backoff_max_ms".into(),
            ));
        }
        if self.alarm.lock_name.trim().is_empty() {
            return Err(invalid("alarm.lock_name", "must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_url(field: &str, raw: &str) -> Result<Url, ConfigError> {
    raw.parse().map_err(|e| invalid(field, format!("'{raw}' is not a URL: {e}")))
}

fn invalid(field: &str, reason: String) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn file_values_override_defaults() {
        let (_dir, path) = write_config(
            r#"
            [server]
            http_url = "https://guidance.example"
            api_token = "tok"

            [zone]
            race_window_ms = 1500

            [commands]
            scope = "district-7"

            [alarm]
            volume = 0.5
            "#,
        );

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.transport, TransportSection::default());

        let sync = config.to_sync_config().unwrap();
        assert_eq!(sync.http_url.as_str(), "https://guidance.example/");
        assert_eq!(sync.websocket_url().unwrap().as_str(), "wss://guidance.example/ws");
        assert_eq!(sync.zone.race_window, Duration::from_millis(1500));
        assert_eq!(sync.scope, "district-7");
        assert!(sync.transport.api_token.is_some());
        assert!((sync.alarm.volume - 0.5).abs() < f32::EPSILON);
        assert_eq!(sync.poll_interval, Duration::from_secs(30));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.commands, CommandsSection::default());
    }

    #[test]
    fn no_server_url_is_an_error() {
        let err = Config::default().to_sync_config().unwrap_err();
        assert!(matches!(err, ConfigError::MissingServerUrl { .. }));
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = Config::default();
        config.server.http_url = Some("http://10.0.0.5:8080".into());
        config.alarm.volume = 1.5;
        let err = config.to_sync_config().unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "alarm.volume"));

        config.alarm.volume = 1.0;
        config.server.ws_url = Some("not a url".into());
        let err = config.to_sync_config().unwrap_err();
        assert!(matches!(err, ConfigError::Validation { ref field, .. } if field == "server.ws_url"));
    }

    #[test]
    fn token_never_rendered() {
        let mut config = Config::default();
        config.server.api_token = Some("super-secret".into());
        let rendered = config.to_toml().unwrap();
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("[alarm]"));
    }

    #[test]
    fn coordination_dir_sits_next_to_suppression_file() {
        let mut config = Config::default();
        config.alarm.suppression_file = Some(PathBuf::from("/var/lib/guidelight/suppressed"));
        assert_eq!(config.coordination_dir(), PathBuf::from("/var/lib/guidelight"));

        config.alarm.suppression_file = Some(PathBuf::from("suppressed"));
        assert_eq!(config.coordination_dir(), PathBuf::from("."));
    }
}
