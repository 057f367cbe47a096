//! Text-frame codec for the chat channel.
//!
//! The backend speaks Socket.IO v4 over a raw WebSocket. Each text frame is
//! one Engine.IO packet; packet type `4` wraps one Socket.IO packet:
//!
//! ```text
//! 0{"sid":"..","pingInterval":25000}    engine open
//! 2 / 3                                 ping / pong
//! 40/chat,{"token":".."}                connect to namespace /chat
//! 44/chat,{"message":"..","data":{"status":401}}   connect error
//! 42/chat,["chat","{\"sequence\":1,..}"]           event
//! ```
//!
//! Decoding never fails: anything unrecognised becomes [`Frame::Unknown`].

use serde_json::Value;

/// Path the Engine.IO server listens on.
pub const ENGINE_PATH: &str = "/socket.io/";

/// One decoded channel frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Engine handshake carrying session parameters.
    Open(Value),
    Close,
    Ping,
    Pong,
    Connected { namespace: String },
    ConnectError {
        namespace: String,
        status: Option<u16>,
        message: String,
    },
    Disconnect { namespace: String },
    Event {
        namespace: String,
        name: String,
        payload: Value,
    },
    Unknown(String),
}

/// Decode one text frame.
pub fn decode(text: &str) -> Frame {
    let mut chars = text.chars();
    match chars.next() {
        Some('0') => Frame::Open(serde_json::from_str(chars.as_str()).unwrap_or(Value::Null)),
        Some('1') => Frame::Close,
        Some('2') => Frame::Ping,
        Some('3') => Frame::Pong,
        Some('4') => decode_packet(chars.as_str()).unwrap_or_else(|| Frame::Unknown(text.to_string())),
        _ => Frame::Unknown(text.to_string()),
    }
}

fn decode_packet(packet: &str) -> Option<Frame> {
    let kind = packet.chars().next()?;
    let rest = &packet[kind.len_utf8()..];

    let (namespace, rest) = match rest.strip_prefix('/') {
        Some(_) => match rest.find(',') {
            Some(comma) => (&rest[..comma], &rest[comma + 1..]),
            None => (rest, ""),
        },
        None => ("/", rest),
    };
    let namespace = namespace.to_string();
    // Optional ack id.
    let data = rest.trim_start_matches(|c: char| c.is_ascii_digit());

    match kind {
        '0' => Some(Frame::Connected { namespace }),
        '1' => Some(Frame::Disconnect { namespace }),
        '2' => {
            let mut items = match serde_json::from_str::<Value>(data).ok()? {
                Value::Array(items) => items.into_iter(),
                _ => return None,
            };
            let name = match items.next()? {
                Value::String(name) => name,
                _ => return None,
            };
            let payload = items.next().unwrap_or(Value::Null);
            Some(Frame::Event { namespace, name, payload })
        }
        '4' => {
            let body = serde_json::from_str::<Value>(data).unwrap_or(Value::Null);
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("connect error")
                .to_string();
            let status = body
                .pointer("/data/status")
                .or_else(|| body.get("status"))
                .and_then(Value::as_u64)
                .and_then(|s| u16::try_from(s).ok());
            Some(Frame::ConnectError { namespace, status, message })
        }
        _ => None,
    }
}

fn namespace_prefix(namespace: &str) -> String {
    if namespace == "/" {
        String::new()
    } else {
        format!("{},", namespace)
    }
}

/// Connect request for `namespace` carrying `auth`.
pub fn encode_connect(namespace: &str, auth: &Value) -> String {
    format!("40{}{}", namespace_prefix(namespace), auth)
}

pub fn encode_disconnect(namespace: &str) -> String {
    format!("41{}", namespace_prefix(namespace))
}

pub fn encode_pong() -> &'static str {
    "3"
}

/// WebSocket URL of the Engine.IO endpoint under `base` (`ws://host:port`).
pub fn engine_url(base: &str) -> String {
    format!("{}{}?EIO=4&transport=websocket", base.trim_end_matches('/'), ENGINE_PATH)
}
