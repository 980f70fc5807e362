//! Wire types for the backend WebSocket channel and the fallback HTTP API.
//!
//! Every inbound frame is a JSON object with a `type` discriminator. The
//! remaining fields are either inline or wrapped in a `data` object; both
//! shapes are accepted.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::error::Error;

// ── Discriminators ──────────────────────────────────────────────────

/// Inbound message discriminator (`type` field).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageKind {
    StateSync,
    ZoneState,
    CommandStatus,
    GatewayStatus,
    WeatherUpdate,
    LampUpdate,
    Pong,
}

/// Zone lifecycle reported by `zone_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ZoneStatus {
    Activated,
    Deactivating,
    Cleared,
}

/// Desired on/off state for a lamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum LampState {
    #[serde(alias = "ON")]
    On,
    #[serde(alias = "OFF")]
    Off,
}

/// Command lifecycle as reported by `command_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CommandState {
    Queued,
    Sent,
    Ack,
    Retry,
    Failed,
}

impl CommandState {
    /// `true` once the command can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ack | Self::Failed)
    }
}

// ── Payloads ────────────────────────────────────────────────────────

/// Authoritative emergency state.
///
/// Shared by the `state_sync` WebSocket message and the fallback
/// `GET /api/emergency/state` endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyState {
    #[serde(default, alias = "isEmergencyActive")]
    pub is_activated: bool,

    #[serde(default, alias = "activeZone", alias = "zone")]
    pub zone_name: Option<String>,

    #[serde(default)]
    pub wind_direction: Option<String>,

    #[serde(default, with = "flexible_ts")]
    pub activation_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub deactivation_in_progress: bool,

    /// Monotonic backend version, when the backend provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

/// `zone_state` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneStateMessage {
    pub status: ZoneStatus,
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub wind_direction: Option<String>,
    #[serde(default, with = "flexible_ts")]
    pub ts: Option<DateTime<Utc>>,
    #[serde(default)]
    pub seq: Option<u64>,
}

/// `command_status` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandStatusMessage {
    pub scope: String,
    pub device_id: u32,
    #[serde(default)]
    pub cmd: Option<LampState>,
    pub state: CommandState,
    #[serde(default, with = "flexible_ts")]
    pub ts: Option<DateTime<Utc>>,
}

/// `gateway_status` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayStatus {
    #[serde(default, alias = "connected")]
    pub online: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// `lamp_update` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LampUpdate {
    #[serde(default, alias = "device_id", alias = "lampId")]
    pub lamp_id: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A typed inbound WebSocket message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    StateSync(EmergencyState),
    ZoneState(ZoneStateMessage),
    CommandStatus(CommandStatusMessage),
    GatewayStatus(GatewayStatus),
    WeatherUpdate(serde_json::Value),
    LampUpdate(LampUpdate),
    Pong { ts: Option<DateTime<Utc>> },
}

impl InboundMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::StateSync(_) => MessageKind::StateSync,
            Self::ZoneState(_) => MessageKind::ZoneState,
            Self::CommandStatus(_) => MessageKind::CommandStatus,
            Self::GatewayStatus(_) => MessageKind::GatewayStatus,
            Self::WeatherUpdate(_) => MessageKind::WeatherUpdate,
            Self::LampUpdate(_) => MessageKind::LampUpdate,
            Self::Pong { .. } => MessageKind::Pong,
        }
    }
}

// ── Outbound ────────────────────────────────────────────────────────

/// Messages the client sends on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Ping { ts: i64 },
}

impl OutboundMessage {
    pub fn ping() -> Self {
        Self::Ping {
            ts: Utc::now().timestamp_millis(),
        }
    }
}

// ── Decoding ────────────────────────────────────────────────────────

/// Result of decoding one text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(InboundMessage),
    /// Well-formed envelope with a `type` this client does not know.
    Unknown(String),
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    payload: serde_json::Map<String, serde_json::Value>,
}

/// Decode a text frame into a typed message.
///
/// Unknown `type` values are not an error; malformed JSON or a known type
/// with an invalid payload is.
pub fn decode(text: &str) -> Result<Decoded, Error> {
    let envelope: RawEnvelope = serde_json::from_str(text).map_err(|e| deser_error(&e, text))?;

    let Ok(kind) = MessageKind::from_str(&envelope.kind) else {
        return Ok(Decoded::Unknown(envelope.kind));
    };

    let mut payload = envelope.payload;
    let body = match payload.remove("data") {
        Some(serde_json::Value::Object(inner)) => serde_json::Value::Object(inner),
        Some(other) => {
            payload.insert("data".into(), other);
            serde_json::Value::Object(payload)
        }
        None => serde_json::Value::Object(payload),
    };

    let message = match kind {
        MessageKind::StateSync => InboundMessage::StateSync(from_body(body, text)?),
        MessageKind::ZoneState => InboundMessage::ZoneState(from_body(body, text)?),
        MessageKind::CommandStatus => InboundMessage::CommandStatus(from_body(body, text)?),
        MessageKind::GatewayStatus => InboundMessage::GatewayStatus(from_body(body, text)?),
        MessageKind::WeatherUpdate => InboundMessage::WeatherUpdate(body),
        MessageKind::LampUpdate => InboundMessage::LampUpdate(from_body(body, text)?),
        MessageKind::Pong => {
            #[derive(Deserialize)]
            struct PongBody {
                #[serde(default, with = "flexible_ts")]
                ts: Option<DateTime<Utc>>,
            }
            let pong: PongBody = from_body(body, text)?;
            InboundMessage::Pong { ts: pong.ts }
        }
    };

    Ok(Decoded::Message(message))
}

fn from_body<T: serde::de::DeserializeOwned>(body: serde_json::Value, raw: &str) -> Result<T, Error> {
    serde_json::from_value(body).map_err(|e| deser_error(&e, raw))
}

fn deser_error(e: &serde_json::Error, body: &str) -> Error {
    let preview: String = body.chars().take(200).collect();
    Error::Deserialization {
        message: format!("{e} (body preview: {preview:?})"),
        body: body.to_owned(),
    }
}

// ── Timestamps ──────────────────────────────────────────────────────

/// Accepts RFC 3339 strings, epoch milliseconds (number or numeric
/// string), or null. Serializes as RFC 3339.
mod flexible_ts {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => s.serialize_str(&ts.to_rfc3339()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw = Option::<serde_json::Value>::deserialize(d)?;
        let parsed = match raw {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::Number(n)) => n.as_i64().and_then(DateTime::from_timestamp_millis),
            Some(serde_json::Value::String(s)) => match s.parse::<i64>() {
                Ok(ms) => DateTime::from_timestamp_millis(ms),
                Err(_) => DateTime::parse_from_rfc3339(&s)
                    .map(|t| t.with_timezone(&Utc))
                    .ok(),
            },
            Some(other) => {
                return Err(serde::de::Error::custom(format!(
                    "expected timestamp, got {other}"
                )));
            }
        };
        Ok(parsed)
    }
}

// ── Tests ────────────────────────────────────────────────────────────
