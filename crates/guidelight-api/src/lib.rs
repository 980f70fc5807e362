// guidelight-api: Async wire client for the guidelight emergency-guidance backend (WebSocket + HTTP)

pub mod error;
pub mod http;
pub mod messages;
pub mod transport;
pub mod websocket;

pub use error::Error;
pub use http::{HttpClient, LampControl};
pub use messages::{
    CommandState, CommandStatusMessage, EmergencyState, GatewayStatus, InboundMessage, LampState,
    LampUpdate, MessageKind, OutboundMessage, ZoneStateMessage, ZoneStatus,
};
pub use transport::{TlsMode, TransportConfig};
pub use websocket::{ConnectionStatus, ReconnectConfig, WebSocketClient};
