//! Socket.IO v5 / Engine.IO v4 text framing for the websocket transport.
//!
//! Every websocket text frame carries one engine packet: a single type digit followed by
//! its data. Engine `message` packets wrap a socket packet, which adds an optional
//! namespace, an optional ack id and a JSON payload.

use crate::error::AppError;
use serde::Deserialize;
use simd_json::OwnedValue;
use std::time::Duration;

pub const DEFAULT_NAMESPACE: &str = "/";

/// Client frame requesting a connection to the default namespace.
pub const CONNECT_DEFAULT_NAMESPACE: &str = "40";

/// Client frame leaving the default namespace.
pub const DISCONNECT_DEFAULT_NAMESPACE: &str = "41";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePacket<'a> {
    Open(&'a str),
    Close,
    Ping(&'a str),
    Pong(&'a str),
    Message(&'a str),
    Upgrade,
    Noop,
}

pub fn decode_engine_packet(frame: &str) -> Result<EnginePacket<'_>, AppError> {
    let mut chars = frame.chars();
    let kind = chars
        .next()
        .ok_or_else(|| AppError::Connection("empty engine.io frame".to_string()))?;
    let data = chars.as_str();

    match kind {
        '0' => Ok(EnginePacket::Open(data)),
        '1' => Ok(EnginePacket::Close),
        '2' => Ok(EnginePacket::Ping(data)),
        '3' => Ok(EnginePacket::Pong(data)),
        '4' => Ok(EnginePacket::Message(data)),
        '5' => Ok(EnginePacket::Upgrade),
        '6' => Ok(EnginePacket::Noop),
        other => Err(AppError::Connection(format!(
            "unknown engine.io packet type '{other}'"
        ))),
    }
}

pub fn encode_pong(data: &str) -> String {
    format!("3{data}")
}

/// Payload of the engine `open` packet.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EngineHandshake {
    pub sid: String,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
}

impl EngineHandshake {
    /// Longest silence tolerated before the server counts as gone: one ping interval plus
    /// the ping timeout. `None` when the server advertised no heartbeat.
    pub fn heartbeat_window(&self) -> Option<Duration> {
        let window = self.ping_interval.saturating_add(self.ping_timeout);
        (window > 0).then(|| Duration::from_millis(window))
    }
}

pub fn decode_engine_handshake(data: &str) -> Result<EngineHandshake, AppError> {
    let mut payload = data.as_bytes().to_vec();
    Ok(simd_json::serde::from_slice(&mut payload)?)
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect {
        namespace: String,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        ack_id: Option<u64>,
        name: String,
        args: Vec<OwnedValue>,
    },
    Ack {
        namespace: String,
        ack_id: Option<u64>,
    },
    ConnectError {
        namespace: String,
        message: String,
    },
}

impl SocketPacket {
    pub fn namespace(&self) -> &str {
        match self {
            Self::Connect { namespace }
            | Self::Disconnect { namespace }
            | Self::Event { namespace, .. }
            | Self::Ack { namespace, .. }
            | Self::ConnectError { namespace, .. } => namespace,
        }
    }

    pub fn is_default_namespace(&self) -> bool {
        self.namespace() == DEFAULT_NAMESPACE
    }
}

#[derive(Debug, Deserialize)]
struct ConnectErrorWire {
    #[serde(default)]
    message: String,
}

pub fn decode_socket_packet(data: &str) -> Result<SocketPacket, AppError> {
    let mut chars = data.chars();
    let kind = chars
        .next()
        .ok_or_else(|| AppError::Connection("empty socket.io packet".to_string()))?;
    let mut rest = chars.as_str();

    if matches!(kind, '5' | '6') {
        if let Some(dash) = rest.find('-') {
            rest = &rest[dash + 1..];
        }
    }

    let namespace = if rest.starts_with('/') {
        match rest.find(',') {
            Some(comma) => {
                let namespace = rest[..comma].to_string();
                rest = &rest[comma + 1..];
                namespace
            }
            None => {
                let namespace = rest.to_string();
                rest = "";
                namespace
            }
        }
    } else {
        DEFAULT_NAMESPACE.to_string()
    };

    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    let ack_id = if digits > 0 {
        let parsed = rest[..digits].parse::<u64>().map_err(|error| {
            AppError::Connection(format!("invalid socket.io ack id: {error}"))
        })?;
        rest = &rest[digits..];
        Some(parsed)
    } else {
        None
    };

    match kind {
        '0' => Ok(SocketPacket::Connect { namespace }),
        '1' => Ok(SocketPacket::Disconnect { namespace }),
        '2' | '5' => {
            let mut args = decode_event_array(rest)?;
            if args.is_empty() {
                return Err(AppError::Connection(
                    "socket.io event without a name".to_string(),
                ));
            }
            let name: String = simd_json::serde::from_owned_value(args.remove(0)).map_err(
                |error| AppError::Connection(format!("socket.io event name must be a string: {error}")),
            )?;
            Ok(SocketPacket::Event {
                namespace,
                ack_id,
                name,
                args,
            })
        }
        '3' | '6' => Ok(SocketPacket::Ack { namespace, ack_id }),
        '4' => {
            let message = if rest.trim().is_empty() {
                String::new()
            } else {
                let mut payload = rest.as_bytes().to_vec();
                match simd_json::serde::from_slice::<ConnectErrorWire>(&mut payload) {
                    Ok(wire) => wire.message,
                    Err(_) => rest.to_string(),
                }
            };
            Ok(SocketPacket::ConnectError { namespace, message })
        }
        other => Err(AppError::Connection(format!(
            "unknown socket.io packet type '{other}'"
        ))),
    }
}

fn decode_event_array(payload: &str) -> Result<Vec<OwnedValue>, AppError> {
    let mut bytes = payload.as_bytes().to_vec();
    simd_json::serde::from_slice::<Vec<OwnedValue>>(&mut bytes).map_err(|error| {
        AppError::Connection(format!("socket.io event payload must be a JSON array: {error}"))
    })
}
