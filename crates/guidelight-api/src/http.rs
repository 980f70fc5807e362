// Backend HTTP client
//
// Wraps `reqwest::Client` with URL construction and status mapping for
// the handful of REST endpoints the sync subsystem consumes: per-lamp
// control and the fallback emergency state/action endpoints.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::messages::{EmergencyState, LampState};
use crate::transport::TransportConfig;

/// Sends per-lamp on/off commands.
///
/// The command tracker only needs to know whether the request itself was
/// accepted; execution is confirmed later over the WebSocket.
pub trait LampControl: Send + Sync + 'static {
    fn set_lamp(
        &self,
        lamp_id: u32,
        state: LampState,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

impl<T: LampControl> LampControl for Arc<T> {
    fn set_lamp(
        &self,
        lamp_id: u32,
        state: LampState,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        (**self).set_lamp(lamp_id, state)
    }
}

/// Raw HTTP client for the backend REST API.
#[derive(Clone)]
pub struct HttpClient {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpClient {
    /// Create a client from a `TransportConfig`.
    ///
    /// `base_url` is the backend root (e.g. `https://guidance.example`).
    pub fn new(base_url: Url, transport: &TransportConfig) -> Result<Self, Error> {
        Ok(Self::with_client(transport.build_client()?, base_url))
    }

    /// Create a client with a pre-built `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // ── Emergency endpoints ──────────────────────────────────────────

    /// Read the authoritative emergency state.
    ///
    /// `GET /api/emergency/state`
    pub async fn emergency_state(&self) -> Result<EmergencyState, Error> {
        let url = self.api_url("emergency/state")?;
        self.get(url).await
    }

    /// Activate an emergency for `zone_name`.
    ///
    /// `POST /api/emergency/activate`
    pub async fn activate_emergency(&self, zone_name: &str, wind_direction: &str) -> Result<(), Error> {
        let url = self.api_url("emergency/activate")?;
        debug!(zone = zone_name, wind = wind_direction, "activating emergency over HTTP");
        self.post_ignoring_body(
            url,
            &json!({ "zoneName": zone_name, "windDirection": wind_direction }),
        )
        .await
    }

    /// Deactivate the active emergency.
    ///
    /// `POST /api/emergency/deactivate`
    pub async fn deactivate_emergency(&self) -> Result<(), Error> {
        let url = self.api_url("emergency/deactivate")?;
        debug!("deactivating emergency over HTTP");
        self.post_ignoring_body(url, &json!({})).await
    }

    // ── URL builders ─────────────────────────────────────────────────

    /// `{base}/api/{path}`
    pub(crate) fn api_url(&self, path: &str) -> Result<Url, Error> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{base}/api/{path}"))?)
    }

    // ── Request helpers ──────────────────────────────────────────────

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T, Error> {
        debug!("GET {}", url);
        let resp = self.http.get(url).send().await?;
        let body = Self::checked_body(resp).await?;
        serde_json::from_str(&body).map_err(|e| {
            let preview: String = body.chars().take(200).collect();
            Error::Deserialization {
                message: format!("{e} (body preview: {preview:?})"),
                body: body.clone(),
            }
        })
    }

    async fn post_ignoring_body(&self, url: Url, body: &(impl Serialize + Sync)) -> Result<(), Error> {
        debug!("POST {}", url);
        let resp = self.http.post(url).json(body).send().await?;
        Self::checked_body(resp).await.map(|_| ())
    }

    /// Map non-success statuses to errors, returning the body text otherwise.
    async fn checked_body(resp: reqwest::Response) -> Result<String, Error> {
        let status = resp.status();

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::Authentication {
                message: format!("backend refused credentials (HTTP {})", status.as_u16()),
            });
        }

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = extract_message(&body);
            return Err(Error::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        Ok(resp.text().await?)
    }
}

impl LampControl for HttpClient {
    /// `POST /api/lamps/{id}/control` with `{"state": "on" | "off"}`
    async fn set_lamp(&self, lamp_id: u32, state: LampState) -> Result<(), Error> {
        let url = self.api_url(&format!("lamps/{lamp_id}/control"))?;
        debug!(lamp_id, %state, "sending lamp command");
        self.post_ignoring_body(url, &json!({ "state": state })).await
    }
}

/// Pull a human-readable message out of an error body.
///
/// Accepts `{"message": ...}`, `{"error": ...}`, or plain text.
fn extract_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["message", "error", "detail"] {
            if let Some(msg) = value.get(key).and_then(serde_json::Value::as_str) {
                return msg.to_owned();
            }
        }
    }
    body.chars().take(200).collect()
}
